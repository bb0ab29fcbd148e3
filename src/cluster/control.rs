//! Starting, stopping and probing a cluster through its management
//! utilities. Every utility runs under `bash` after sourcing the
//! installation's `greenplum_path.sh`.

use std::path::Path;

use slog::{debug, Logger};

use crate::cluster::Cluster;
use crate::error::{Error, Result};
use crate::exec::{Command, CommandRunner};
use crate::step::stream::OutStreams;

/// Quotes `arg` for a POSIX shell when it contains anything unusual.
pub fn shell_quote(arg: &str) -> String {
    let safe = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,@%+".contains(c));

    if safe {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

/// `bash -c "source <gphome>/greenplum_path.sh && <gphome>/bin/<utility> <args>"`
/// with `PGPORT` and `MASTER_DATA_DIRECTORY` pointing at the coordinator.
pub fn greenplum_command(cluster: &Cluster, utility: &str, args: &[String]) -> Result<Command> {
    let gphome = cluster.gphome.display().to_string();
    let path = cluster.bin_dir().join(utility).display().to_string();

    let script = std::iter::once(path.as_str())
        .chain(args.iter().map(String::as_str))
        .map(shell_quote)
        .collect::<Vec<_>>()
        .join(" ");

    Ok(Command::new("bash")
        .arg("-c")
        .arg(format!("source {}/greenplum_path.sh && {}", shell_quote(&gphome), script))
        .env("MASTER_DATA_DIRECTORY", cluster.coordinator_data_dir()?.display().to_string())
        .env("PGPORT", cluster.coordinator_port()?.to_string()))
}

pub async fn run_greenplum(
    runner: &dyn CommandRunner,
    cluster: &Cluster,
    streams: &dyn OutStreams,
    utility: &str,
    args: &[&str],
) -> Result<()> {
    let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
    let cmd = greenplum_command(cluster, utility, &args)?;
    runner.run(&cmd, Some(streams)).await?;
    Ok(())
}

fn data_dir_arg(cluster: &Cluster) -> Result<String> {
    Ok(cluster.coordinator_data_dir()?.display().to_string())
}

pub async fn start(runner: &dyn CommandRunner, cluster: &Cluster, streams: &dyn OutStreams) -> Result<()> {
    let dir = data_dir_arg(cluster)?;
    run_greenplum(runner, cluster, streams, "gpstart", &["-a", "-d", &dir]).await
}

pub async fn start_coordinator_only(
    runner: &dyn CommandRunner,
    cluster: &Cluster,
    streams: &dyn OutStreams,
) -> Result<()> {
    let dir = data_dir_arg(cluster)?;
    run_greenplum(runner, cluster, streams, "gpstart", &["-m", "-a", "-d", &dir]).await
}

/// Stops the cluster. Fails if the coordinator is not running.
pub async fn stop(runner: &dyn CommandRunner, cluster: &Cluster, streams: &dyn OutStreams) -> Result<()> {
    ensure_running(runner, cluster).await?;
    let dir = data_dir_arg(cluster)?;
    run_greenplum(runner, cluster, streams, "gpstop", &["-a", "-d", &dir]).await
}

pub async fn stop_coordinator_only(
    runner: &dyn CommandRunner,
    cluster: &Cluster,
    streams: &dyn OutStreams,
) -> Result<()> {
    ensure_running(runner, cluster).await?;
    let dir = data_dir_arg(cluster)?;
    run_greenplum(runner, cluster, streams, "gpstop", &["-m", "-a", "-d", &dir]).await
}

async fn ensure_running(runner: &dyn CommandRunner, cluster: &Cluster) -> Result<()> {
    if !is_coordinator_running(runner, cluster.coordinator_data_dir()?).await? {
        return Err(Error::Validation("coordinator is already stopped".to_string()));
    }
    Ok(())
}

/// Whether a postmaster owns `<data_dir>/postmaster.pid`.
pub async fn is_coordinator_running(runner: &dyn CommandRunner, data_dir: &Path) -> Result<bool> {
    let pid_file = data_dir.join("postmaster.pid");
    if !pid_file.exists() {
        return Ok(false);
    }

    let cmd = Command::new("pgrep")
        .arg("-F")
        .arg(pid_file.display().to_string());

    let output = runner.output(&cmd, None).await?;
    match output.code {
        0 => Ok(true),
        // no process matched
        1 => Ok(false),
        _ => crate::exec::check_exit(&cmd, output)
            .map(|_| false)
            .map_err(|e| e.context("checking for postmaster process")),
    }
}

/// Appends `extra` to the cluster's `dynamic_library_path` and reloads.
pub async fn append_dynamic_library_path(
    runner: &dyn CommandRunner,
    cluster: &Cluster,
    extra: &str,
    logger: &Logger,
) -> Result<()> {
    let buffered = crate::step::stream::BufferedStreams::new();
    run_greenplum(runner, cluster, &buffered, "gpconfig", &["-s", "dynamic_library_path"]).await?;

    let output = String::from_utf8_lossy(&buffered.take_stdout()).into_owned();
    let current = output
        .lines()
        .find_map(|line| {
            line.strip_prefix("Master  value:")
                .or_else(|| line.strip_prefix("Coordinator value:"))
        })
        .map(str::trim)
        .unwrap_or_default()
        .to_string();

    if current.is_empty() {
        return Err(Error::Validation(format!(
            "Target cluster is missing value for dynamic_library_path. Expected \"$libdir\", but found {:?}",
            output
        )));
    }

    let value = format!("{}:{}", current, extra);
    debug!(logger, "setting dynamic_library_path"; "value" => &value);

    run_greenplum(runner, cluster, &buffered, "gpconfig", &["-c", "dynamic_library_path", "-v", &value]).await?;
    run_greenplum(runner, cluster, &buffered, "gpstop", &["-u"]).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::tests::mirrored_cluster;
    use crate::exec::{MockRunner, Output};
    use crate::step::stream::DevNullStream;

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("/usr/local/gpdb"), "/usr/local/gpdb");
        assert_eq!(shell_quote("a b"), "'a b'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote(""), "''");
    }

    #[tokio::test]
    async fn test_start_command() {
        let runner = MockRunner::succeeding();
        start(&runner, &mirrored_cluster(), &DevNullStream).await.unwrap();

        let calls = runner.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].program, "bash");
        assert_eq!(
            calls[0].args,
            vec![
                "-c",
                "source /usr/local/gpdb6/greenplum_path.sh && /usr/local/gpdb6/bin/gpstart -a -d /data/qddir/demoDataDir-1",
            ]
        );
        assert!(calls[0]
            .env
            .contains(&("PGPORT".to_string(), "15432".to_string())));
    }

    #[tokio::test]
    async fn test_stop_requires_running_coordinator() {
        let runner = MockRunner::succeeding();
        let err = stop(&runner, &mirrored_cluster(), &DevNullStream)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "coordinator is already stopped");
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_is_coordinator_running() {
        let tmp = tempfile::tempdir().unwrap();
        let runner = MockRunner::new(|_| Output::failure(1, ""));
        assert!(!is_coordinator_running(&runner, tmp.path()).await.unwrap());
        assert!(runner.calls().is_empty());

        std::fs::write(tmp.path().join("postmaster.pid"), "123\n").unwrap();
        assert!(!is_coordinator_running(&runner, tmp.path()).await.unwrap());

        let runner = MockRunner::succeeding();
        assert!(is_coordinator_running(&runner, tmp.path()).await.unwrap());

        let runner = MockRunner::new(|_| Output::failure(2, "pgrep: pidfile not valid"));
        assert!(is_coordinator_running(&runner, tmp.path()).await.is_err());
    }

    #[tokio::test]
    async fn test_append_dynamic_library_path() {
        let runner = MockRunner::new(|cmd| {
            if cmd.args[1].contains("gpconfig -s") {
                Output::success("Values on all segments are consistent\nMaster  value: $libdir\nSegment value: $libdir\n")
            } else {
                Output::default()
            }
        });

        append_dynamic_library_path(&runner, &mirrored_cluster(), "/ext/lib", &crate::logging::discard())
            .await
            .unwrap();

        assert_eq!(runner.calls_matching("-v '$libdir:/ext/lib'").len(), 1);
        assert_eq!(runner.calls_matching("gpstop -u").len(), 1);
    }
}
