//! Process environment: where state lives and how to reach the hub.
//!
//! An [`Env`] is resolved once at startup and threaded through the CLI, the
//! hub and the agents; nothing else in the crate reads environment variables.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

pub const DEFAULT_HUB_PORT: u16 = 7527;
pub const DEFAULT_AGENT_PORT: u16 = 6416;
pub const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_secs(3);

pub const CONFIG_FILE: &str = "config.json";
pub const STEPS_FILE: &str = "steps.json";
pub const SOURCE_CLUSTER_FILE: &str = "source_cluster_config.json";
pub const TARGET_CLUSTER_FILE: &str = "target_cluster_config.json";

const HOME_VAR: &str = "GPUPGRADE_HOME";
const HUB_PORT_VAR: &str = "GPUPGRADE_HUB_PORT";
const TIMEOUT_VAR: &str = "GPUPGRADE_CONNECTION_TIMEOUT";

#[derive(Debug, Clone)]
pub struct Env {
    /// State directory holding config.json, steps.json and cluster snapshots.
    pub state_dir: PathBuf,
    /// Directory receiving hub, agent and CLI log files.
    pub log_dir: PathBuf,
    pub hub_port: u16,
    pub connection_timeout: Duration,
}

impl Env {
    /// Resolve from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Resolve using `lookup` in place of the process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let home = lookup("HOME").map(PathBuf::from);

        let state_dir = match lookup(HOME_VAR) {
            Some(dir) => {
                let dir = PathBuf::from(dir);
                if !dir.is_absolute() {
                    return Err(Error::Config(format!(
                        "{} must be an absolute path, got {:?}",
                        HOME_VAR, dir
                    )));
                }
                dir
            }
            None => home
                .as_ref()
                .map(|h| h.join(".gpupgrade"))
                .ok_or_else(|| Error::Config(format!("neither {} nor HOME is set", HOME_VAR)))?,
        };

        let log_dir = home
            .map(|h| h.join("gpAdminLogs").join("gpupgrade"))
            .unwrap_or_else(|| state_dir.join("logs"));

        let hub_port = match lookup(HUB_PORT_VAR) {
            Some(port) => port.trim().parse::<u16>().map_err(|e| {
                Error::Config(format!("parsing {}={:?}: {}", HUB_PORT_VAR, port, e))
            })?,
            None => DEFAULT_HUB_PORT,
        };

        let connection_timeout = match lookup(TIMEOUT_VAR) {
            Some(secs) => parse_timeout(&secs)?,
            None => DEFAULT_CONNECTION_TIMEOUT,
        };

        Ok(Self {
            state_dir,
            log_dir,
            hub_port,
            connection_timeout,
        })
    }

    /// Environment rooted at `state_dir`, used by daemons started with an
    /// explicit state directory and by tests.
    pub fn with_state_dir(state_dir: impl Into<PathBuf>) -> Self {
        let state_dir = state_dir.into();
        Self {
            log_dir: state_dir.join("logs"),
            state_dir,
            hub_port: DEFAULT_HUB_PORT,
            connection_timeout: DEFAULT_CONNECTION_TIMEOUT,
        }
    }

    pub fn with_log_dir(mut self, log_dir: impl Into<PathBuf>) -> Self {
        self.log_dir = log_dir.into();
        self
    }

    pub fn with_hub_port(mut self, port: u16) -> Self {
        self.hub_port = port;
        self
    }

    pub fn config_path(&self) -> PathBuf {
        self.state_dir.join(CONFIG_FILE)
    }

    pub fn steps_path(&self) -> PathBuf {
        self.state_dir.join(STEPS_FILE)
    }

    pub fn source_cluster_path(&self) -> PathBuf {
        self.state_dir.join(SOURCE_CLUSTER_FILE)
    }

    pub fn target_cluster_path(&self) -> PathBuf {
        self.state_dir.join(TARGET_CLUSTER_FILE)
    }

    /// Scratch directory for the coordinator's rsync backups.
    pub fn master_backup_dir(&self) -> PathBuf {
        self.state_dir.join("master.bak")
    }

    /// Where the upgraded coordinator is staged on every primary host
    /// before the primaries are upgraded from it.
    pub fn upgraded_master_backup_dir(&self) -> PathBuf {
        self.state_dir.join("upgraded-master.bak")
    }

    pub fn gpinitsystem_config_path(&self) -> PathBuf {
        self.state_dir.join("gpinitsystem_config")
    }

    pub fn hub_address(&self) -> String {
        format!("127.0.0.1:{}", self.hub_port)
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }
}

fn parse_timeout(text: &str) -> Result<Duration> {
    let secs: f64 = text
        .trim()
        .parse()
        .map_err(|e| Error::Config(format!("parsing {}={:?}: {}", TIMEOUT_VAR, text, e)))?;

    if !secs.is_finite() || secs < 0.0 {
        return Err(Error::Config(format!(
            "{} must be a non-negative number of seconds, got {:?}",
            TIMEOUT_VAR, text
        )));
    }

    Ok(Duration::from_secs_f64(secs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let env = Env::from_lookup(lookup(&[("HOME", "/home/gpadmin")])).unwrap();
        assert_eq!(env.state_dir, PathBuf::from("/home/gpadmin/.gpupgrade"));
        assert_eq!(env.log_dir, PathBuf::from("/home/gpadmin/gpAdminLogs/gpupgrade"));
        assert_eq!(env.hub_port, DEFAULT_HUB_PORT);
        assert_eq!(env.connection_timeout, DEFAULT_CONNECTION_TIMEOUT);
    }

    #[test]
    fn test_overrides() {
        let env = Env::from_lookup(lookup(&[
            ("HOME", "/home/gpadmin"),
            ("GPUPGRADE_HOME", "/data/upgrade"),
            ("GPUPGRADE_HUB_PORT", "9000"),
            ("GPUPGRADE_CONNECTION_TIMEOUT", "1.5"),
        ]))
        .unwrap();

        assert_eq!(env.state_dir, PathBuf::from("/data/upgrade"));
        assert_eq!(env.config_path(), PathBuf::from("/data/upgrade/config.json"));
        assert_eq!(env.hub_port, 9000);
        assert_eq!(env.connection_timeout, Duration::from_millis(1500));
    }

    #[test]
    fn test_relative_home_is_rejected() {
        let result = Env::from_lookup(lookup(&[("GPUPGRADE_HOME", "relative/dir")]));
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_bad_port_and_timeout() {
        let result = Env::from_lookup(lookup(&[
            ("HOME", "/h"),
            ("GPUPGRADE_HUB_PORT", "70000"),
        ]));
        assert!(result.is_err());

        let result = Env::from_lookup(lookup(&[
            ("HOME", "/h"),
            ("GPUPGRADE_CONNECTION_TIMEOUT", "-1"),
        ]));
        assert!(result.is_err());
    }
}
