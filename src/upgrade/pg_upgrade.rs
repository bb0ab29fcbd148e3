//! Invocation of the external `pg_upgrade` binary.

use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::exec::{Command, CommandRunner};
use crate::step::stream::OutStreams;

/// Asks pg_upgrade to print per-stage timing.
const TIMING_ENV: (&str, &str) = ("__GPDB_PGUPGRADE_PRINT_TIMING__", "1");

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub bin_dir: PathBuf,
    pub data_dir: PathBuf,
    pub dbid: i32,
    pub port: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpgradeMode {
    /// Upgrades the coordinator catalog.
    Dispatcher,
    /// Upgrades a primary segment from the copied coordinator catalog.
    Segment,
}

impl UpgradeMode {
    fn as_str(&self) -> &'static str {
        match self {
            UpgradeMode::Dispatcher => "dispatcher",
            UpgradeMode::Segment => "segment",
        }
    }
}

#[derive(Debug, Clone)]
pub struct PgUpgrade {
    pub source: Segment,
    pub target: Segment,
    pub mode: UpgradeMode,
    pub check_only: bool,
    pub link_mode: bool,
    pub tablespaces_file: Option<PathBuf>,
    pub work_dir: PathBuf,
}

impl PgUpgrade {
    pub fn new(source: Segment, target: Segment, mode: UpgradeMode, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            source,
            target,
            mode,
            check_only: false,
            link_mode: false,
            tablespaces_file: None,
            work_dir: work_dir.into(),
        }
    }

    pub fn with_check_only(mut self, check_only: bool) -> Self {
        self.check_only = check_only;
        self
    }

    pub fn with_link_mode(mut self, link_mode: bool) -> Self {
        self.link_mode = link_mode;
        self
    }

    pub fn with_tablespaces_file(mut self, path: Option<PathBuf>) -> Self {
        self.tablespaces_file = path.filter(|p| !p.as_os_str().is_empty());
        self
    }

    pub fn command(&self) -> Command {
        let path = |p: &Path| p.display().to_string();

        let mut cmd = Command::new(path(&self.target.bin_dir.join("pg_upgrade")))
            .arg("--retain")
            .args(["--old-bindir".to_string(), path(&self.source.bin_dir)])
            .args(["--new-bindir".to_string(), path(&self.target.bin_dir)])
            .args(["--old-gp-dbid".to_string(), self.source.dbid.to_string()])
            .args(["--new-gp-dbid".to_string(), self.target.dbid.to_string()])
            .args(["--old-datadir".to_string(), path(&self.source.data_dir)])
            .args(["--new-datadir".to_string(), path(&self.target.data_dir)])
            .args(["--old-port".to_string(), self.source.port.to_string()])
            .args(["--new-port".to_string(), self.target.port.to_string()])
            .args(["--mode", self.mode.as_str()]);

        if self.check_only {
            cmd = cmd.arg("--check");
        }

        if self.link_mode {
            cmd = cmd.arg("--link");
        }

        if let Some(file) = &self.tablespaces_file {
            cmd = cmd.arg("--old-tablespaces-file").arg(path(file));
        }

        // PGPORT and friends must not leak into pg_upgrade.
        cmd.env_clear_with([TIMING_ENV]).current_dir(&self.work_dir)
    }

    pub async fn run(&self, runner: &dyn CommandRunner, streams: Option<&dyn OutStreams>) -> Result<()> {
        runner.run(&self.command(), streams).await?;
        Ok(())
    }
}
