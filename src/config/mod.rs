//! The hub's persistent configuration (`config.json`).
//!
//! Created during initialize, mutated only by the hub and rewritten
//! atomically on every change.

pub mod file;
pub mod ports;

use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::cluster::target::TargetLayout;
use crate::cluster::Cluster;
use crate::env::{DEFAULT_AGENT_PORT, DEFAULT_HUB_PORT};
use crate::error::{Error, Result};
use crate::upgrade::UpgradeId;

pub const DEFAULT_LINK_DISK_FREE_RATIO: f64 = 0.2;
pub const DEFAULT_COPY_DISK_FREE_RATIO: f64 = 0.6;
pub const DEFAULT_TEMP_PORT_RANGE: &str = "50432-65535";

/// Keys understood by `gpupgrade config show`.
pub const CONFIG_KEYS: &[&str] = &[
    "id",
    "source-gphome",
    "target-gphome",
    "target-datadir",
    "target-port",
    "mode",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Copy,
    Link,
}

impl Mode {
    pub fn parse(text: &str) -> Result<Self> {
        match text.trim().to_ascii_lowercase().as_str() {
            "copy" => Ok(Mode::Copy),
            "link" => Ok(Mode::Link),
            other => Err(Error::Validation(format!(
                "invalid mode {:?}, expected \"copy\" or \"link\"",
                other
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Copy => "copy",
            Mode::Link => "link",
        }
    }

    pub fn default_disk_free_ratio(&self) -> f64 {
        match self {
            Mode::Copy => DEFAULT_COPY_DISK_FREE_RATIO,
            Mode::Link => DEFAULT_LINK_DISK_FREE_RATIO,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HubConfig {
    pub hub_port: u16,
    pub agent_port: u16,
    pub source_gphome: PathBuf,
    pub target_gphome: PathBuf,
    pub source_port: i32,
    pub mode: Mode,
    pub disk_free_ratio: f64,
    /// Temporary ports handed out to the target cluster.
    pub ports: Vec<u16>,
    pub use_hba_hostnames: bool,
    pub dynamic_library_path: String,
    pub upgrade_id: UpgradeId,

    /// Inspected from the live source coordinator during initialize.
    pub source: Option<Cluster>,
    /// Planned placement of every target segment.
    pub target_layout: Option<TargetLayout>,
    /// The target cluster at its temporary ports and directories, as
    /// created by gpinitsystem and upgraded by execute.
    pub intermediate: Option<Cluster>,
    /// The target cluster at the source's ports and directories; what
    /// `intermediate` becomes after finalize.
    pub target: Option<Cluster>,

    #[serde(default)]
    pub log_archive_dir: Option<PathBuf>,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            hub_port: DEFAULT_HUB_PORT,
            agent_port: DEFAULT_AGENT_PORT,
            source_gphome: PathBuf::new(),
            target_gphome: PathBuf::new(),
            source_port: 0,
            mode: Mode::Copy,
            disk_free_ratio: DEFAULT_COPY_DISK_FREE_RATIO,
            ports: Vec::new(),
            use_hba_hostnames: false,
            dynamic_library_path: String::new(),
            upgrade_id: UpgradeId::default(),
            source: None,
            target_layout: None,
            intermediate: None,
            target: None,
            log_archive_dir: None,
        }
    }
}

impl HubConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_hub_port(mut self, port: u16) -> Self {
        self.hub_port = port;
        self
    }

    pub fn with_agent_port(mut self, port: u16) -> Self {
        self.agent_port = port;
        self
    }

    pub fn with_gphomes(mut self, source: impl Into<PathBuf>, target: impl Into<PathBuf>) -> Self {
        self.source_gphome = source.into();
        self.target_gphome = target.into();
        self
    }

    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_upgrade_id(mut self, id: UpgradeId) -> Self {
        self.upgrade_id = id;
        self
    }

    pub fn with_source(mut self, source: Cluster) -> Self {
        self.source = Some(source);
        self
    }

    pub fn use_link_mode(&self) -> bool {
        self.mode == Mode::Link
    }

    pub fn source(&self) -> Result<&Cluster> {
        self.source
            .as_ref()
            .ok_or_else(|| Error::Config("source cluster has not been configured; run gpupgrade initialize".into()))
    }

    pub fn intermediate(&self) -> Result<&Cluster> {
        self.intermediate
            .as_ref()
            .ok_or_else(|| Error::Config("target cluster has not been created; run gpupgrade initialize".into()))
    }

    pub fn target(&self) -> Result<&Cluster> {
        self.target
            .as_ref()
            .ok_or_else(|| Error::Config("target cluster has not been configured; run gpupgrade initialize".into()))
    }

    pub fn target_layout(&self) -> Result<&TargetLayout> {
        self.target_layout
            .as_ref()
            .ok_or_else(|| Error::Config("target cluster layout has not been generated".into()))
    }

    /// The final target: the source's segments at their original ports and
    /// directories, running the target installation.
    pub fn final_target(&self, version: &str) -> Result<Cluster> {
        Ok(Cluster::new(self.source()?.segments())?
            .with_gphome(&self.target_gphome)
            .with_version(version))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read(path).map_err(|e| Error::io(format!("reading {:?}", path), e))?;
        serde_json::from_slice(&data).map_err(|e| Error::Config(format!("parsing {:?}: {}", path, e)))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let data = serde_json::to_vec_pretty(self)?;
        atomic_write(path, &data)
    }

    pub fn get(&self, key: &str) -> Result<Option<String>> {
        let coordinator = |c: &Option<Cluster>| c.as_ref().and_then(|c| c.coordinator().cloned());

        let value = match key {
            "id" => self.upgrade_id.to_string(),
            "source-gphome" => self.source_gphome.display().to_string(),
            "target-gphome" => self.target_gphome.display().to_string(),
            "target-datadir" => coordinator(&self.intermediate)
                .map(|c| c.data_dir.display().to_string())
                .unwrap_or_default(),
            "target-port" => coordinator(&self.intermediate)
                .map(|c| c.port.to_string())
                .unwrap_or_default(),
            "mode" => self.mode.as_str().to_string(),
            _ => return Ok(None),
        };

        Ok(Some(value))
    }

    /// Sets a writable key. Returns `false` for an unknown key.
    pub fn set(&mut self, key: &str, value: &str) -> Result<bool> {
        match key {
            "source-gphome" => {
                self.source_gphome = PathBuf::from(value);
                if let Some(source) = self.source.as_mut() {
                    source.gphome = PathBuf::from(value);
                }
            }
            "target-gphome" => {
                self.target_gphome = PathBuf::from(value);
                for cluster in [self.intermediate.as_mut(), self.target.as_mut()].into_iter().flatten() {
                    cluster.gphome = PathBuf::from(value);
                }
            }
            "id" | "target-datadir" | "target-port" | "mode" => {
                return Err(Error::Validation(format!("{} cannot be changed", key)));
            }
            _ => return Ok(false),
        }
        Ok(true)
    }
}

/// Writes `data` to `path` through a temporary file in the same directory
/// and an atomic rename, so readers never observe a partial file.
pub fn atomic_write(path: &Path, data: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));

    let mut tmp = tempfile::NamedTempFile::new_in(dir)
        .map_err(|e| Error::io(format!("creating temporary file in {:?}", dir), e))?;

    tmp.write_all(data)
        .and_then(|_| tmp.as_file().sync_all())
        .map_err(|e| Error::io(format!("writing {:?}", tmp.path()), e))?;

    tmp.persist(path)
        .map_err(|e| Error::io(format!("renaming into {:?}", path), e.error))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::tests::mirrored_cluster;

    #[test]
    fn test_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        let config = HubConfig::new()
            .with_gphomes("/usr/local/gpdb6", "/usr/local/gpdb7")
            .with_mode(Mode::Link)
            .with_upgrade_id(UpgradeId::from_raw(42))
            .with_source(mirrored_cluster());

        config.save(&path).unwrap();
        let loaded = HubConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
        assert!(loaded.use_link_mode());
    }

    #[test]
    fn test_get_and_set() {
        let mut config = HubConfig::new()
            .with_gphomes("/old", "/new")
            .with_source(mirrored_cluster());

        assert_eq!(config.get("mode").unwrap().unwrap(), "copy");
        assert_eq!(config.get("target-datadir").unwrap().unwrap(), "");
        assert!(config.get("nope").unwrap().is_none());

        assert!(config.set("source-gphome", "/opt/gpdb6").unwrap());
        assert_eq!(config.source().unwrap().gphome, PathBuf::from("/opt/gpdb6"));
        assert!(!config.set("nope", "x").unwrap());
        assert!(config.set("id", "x").is_err());
    }

    #[test]
    fn test_final_target_uses_source_layout() {
        let config = HubConfig::new()
            .with_gphomes("/old", "/new")
            .with_source(mirrored_cluster());

        let target = config.final_target("7.0.0").unwrap();
        assert_eq!(target.gphome, PathBuf::from("/new"));
        assert_eq!(target.coordinator_port().unwrap(), 15432);
        assert_eq!(target.version, "7.0.0");
    }

    #[test]
    fn test_atomic_write_replaces_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("steps.json");
        atomic_write(&path, b"first").unwrap();
        atomic_write(&path, b"second").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"second");
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_mode_parse() {
        assert_eq!(Mode::parse("LINK").unwrap(), Mode::Link);
        assert!(Mode::parse("hardlink").is_err());
        assert_eq!(Mode::Link.default_disk_free_ratio(), 0.2);
    }
}
