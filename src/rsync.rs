//! Wrapper around the `rsync` binary.

use crate::error::{Error, Result};
use crate::exec::{Command, CommandRunner};
use crate::step::stream::OutStreams;

/// Options used when mirroring one data directory onto another.
pub const ARCHIVE_DELETE: &[&str] = &["--archive", "--delete"];

/// Options for copying data directories between segments: hard links are
/// preserved and only size differences trigger a transfer.
pub const MIRROR_OPTIONS: &[&str] = &[
    "--archive",
    "--delete",
    "--hard-links",
    "--size-only",
    "--no-inc-recursive",
];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Rsync {
    sources: Vec<String>,
    source_host: Option<String>,
    destination: String,
    destination_host: Option<String>,
    options: Vec<String>,
    excludes: Vec<String>,
}

impl Rsync {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sources<I, S>(mut self, sources: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.sources.extend(sources.into_iter().map(Into::into));
        self
    }

    /// Pull from `host`. Only valid with a single source path.
    pub fn source_host(mut self, host: impl Into<String>) -> Self {
        self.source_host = Some(host.into());
        self
    }

    pub fn destination(mut self, destination: impl Into<String>) -> Self {
        self.destination = destination.into();
        self
    }

    pub fn destination_host(mut self, host: impl Into<String>) -> Self {
        let host = host.into();
        self.destination_host = if host.is_empty() { None } else { Some(host) };
        self
    }

    pub fn options<I, S>(mut self, options: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.options.extend(options.into_iter().map(Into::into));
        self
    }

    pub fn excludes<I, S>(mut self, excludes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.excludes.extend(excludes.into_iter().map(Into::into));
        self
    }

    /// Arguments in rsync order: options, sources, destination, then one
    /// `--exclude` pair per excluded pattern.
    pub fn command(&self) -> Result<Command> {
        let sources = match &self.source_host {
            Some(host) => {
                if self.sources.len() != 1 {
                    return Err(Error::Validation(
                        "multiple remote source paths passed to rsync".to_string(),
                    ));
                }
                vec![format!("{}:{}", host, self.sources[0])]
            }
            None => self.sources.clone(),
        };

        let destination = match &self.destination_host {
            Some(host) => format!("{}:{}", host, self.destination),
            None => self.destination.clone(),
        };

        let mut cmd = Command::new("rsync")
            .args(self.options.iter().cloned())
            .args(sources)
            .arg(destination);

        for pattern in &self.excludes {
            cmd = cmd.arg("--exclude").arg(pattern.clone());
        }

        Ok(cmd)
    }

    /// Runs rsync. Without `streams`, a failure quotes rsync's stderr.
    pub async fn run(
        &self,
        runner: &dyn CommandRunner,
        streams: Option<&dyn OutStreams>,
    ) -> Result<()> {
        let cmd = self.command()?;
        runner.run(&cmd, streams).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::{MockRunner, Output};

    #[test]
    fn test_argument_order() {
        let cmd = Rsync::new()
            .options(ARCHIVE_DELETE.iter().copied())
            .sources(["/data/backup/", "/data/other"])
            .destination("/data/primary/gpseg0")
            .destination_host("sdw1")
            .excludes(["pg_hba.conf", "postmaster.opts"])
            .command()
            .unwrap();

        assert_eq!(cmd.program, "rsync");
        assert_eq!(
            cmd.args,
            vec![
                "--archive",
                "--delete",
                "/data/backup/",
                "/data/other",
                "sdw1:/data/primary/gpseg0",
                "--exclude",
                "pg_hba.conf",
                "--exclude",
                "postmaster.opts",
            ]
        );
    }

    #[test]
    fn test_empty_destination_host_is_local() {
        let cmd = Rsync::new()
            .sources(["/a/"])
            .destination("/b")
            .destination_host("")
            .command()
            .unwrap();
        assert_eq!(cmd.args, vec!["/a/", "/b"]);
    }

    #[test]
    fn test_source_host_requires_single_source() {
        let result = Rsync::new()
            .sources(["/a", "/b"])
            .source_host("mdw")
            .destination("/c")
            .command();
        assert!(result.is_err());

        let cmd = Rsync::new()
            .sources(["/a/"])
            .source_host("smdw")
            .destination("/c")
            .command()
            .unwrap();
        assert_eq!(cmd.args, vec!["smdw:/a/", "/c"]);
    }

    #[tokio::test]
    async fn test_failure_quotes_stderr() {
        let runner = MockRunner::new(|_| Output::failure(23, "rsync: link_stat failed\n"));
        let err = Rsync::new()
            .sources(["/missing"])
            .destination("/dst")
            .run(&runner, None)
            .await
            .unwrap_err();

        assert_eq!(err.exit_code(), Some(23));
        assert!(err.to_string().contains("link_stat failed"));
    }
}
