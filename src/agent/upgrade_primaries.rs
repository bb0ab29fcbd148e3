//! Runs pg_upgrade for every primary on this host.

use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::exec::CommandRunner;
use crate::fanout;
use crate::grpc::idl::{DataDirPair, UpgradePrimariesRequest};
use crate::rsync::{Rsync, ARCHIVE_DELETE};
use crate::upgrade::pg_upgrade::{PgUpgrade, Segment, UpgradeMode};
use crate::upgrade::segment_working_directory;

/// Files in the coordinator backup that belong to the coordinator alone and
/// must not overwrite a segment's own copies.
pub const BACKUP_EXCLUDES: &[&str] = &[
    "internal.auto.conf",
    "postgresql.conf",
    "pg_hba.conf",
    "postmaster.opts",
    "gp_dbid",
    "gpssh.conf",
    "gpperfmon",
];

fn action(check_only: bool) -> &'static str {
    if check_only {
        "check"
    } else {
        "upgrade"
    }
}

pub async fn upgrade_primaries(
    runner: &dyn CommandRunner,
    state_dir: &Path,
    hostname: &str,
    request: UpgradePrimariesRequest,
) -> Result<()> {
    let mut work_dirs = Vec::with_capacity(request.data_dir_pairs.len());
    for pair in &request.data_dir_pairs {
        let dir = segment_working_directory(state_dir, pair.content);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| Error::io("creating pg_upgrade work directory", e))?;
        work_dirs.push(dir);
    }

    let request = &request;
    let segments = request.data_dir_pairs.iter().zip(work_dirs);

    fanout::for_each(segments, |(pair, work_dir)| async move {
        upgrade_segment(runner, hostname, request, pair, work_dir).await
    })
    .await
    .map_err(|e| e.context(format!("{} primaries", action(request.check_only))))
}

async fn upgrade_segment(
    runner: &dyn CommandRunner,
    hostname: &str,
    request: &UpgradePrimariesRequest,
    pair: &DataDirPair,
    work_dir: PathBuf,
) -> Result<()> {
    if !request.check_only {
        restore_backup(runner, request, pair).await.map_err(|e| {
            e.context(format!(
                "restore master data directory backup on host {} for content id {}",
                hostname, pair.content
            ))
        })?;
    }

    let source = Segment {
        bin_dir: PathBuf::from(&request.source_bin_dir),
        data_dir: PathBuf::from(&pair.source_data_dir),
        dbid: pair.dbid,
        port: pair.source_port,
    };
    let target = Segment {
        bin_dir: PathBuf::from(&request.target_bin_dir),
        data_dir: PathBuf::from(&pair.target_data_dir),
        dbid: pair.dbid,
        port: pair.target_port,
    };

    let mut upgrade = PgUpgrade::new(source, target, UpgradeMode::Segment, work_dir)
        .with_check_only(request.check_only)
        .with_link_mode(request.use_link_mode);

    if !request.check_only && !request.tablespaces_mapping_file_path.is_empty() {
        upgrade = upgrade.with_tablespaces_file(Some(PathBuf::from(&request.tablespaces_mapping_file_path)));
    }

    upgrade.run(runner, None).await.map_err(|e| {
        e.context(format!(
            "{} primary on host {} with content {}",
            action(request.check_only),
            hostname,
            pair.content
        ))
    })
}

/// Copies the upgraded coordinator catalog over the segment's target
/// directory, keeping the segment's own configuration files.
async fn restore_backup(
    runner: &dyn CommandRunner,
    request: &UpgradePrimariesRequest,
    pair: &DataDirPair,
) -> Result<()> {
    Rsync::new()
        .sources([format!("{}/", request.master_backup_dir.trim_end_matches('/'))])
        .destination(pair.target_data_dir.clone())
        .options(ARCHIVE_DELETE.iter().copied())
        .excludes(BACKUP_EXCLUDES.iter().copied())
        .run(runner, None)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::{MockRunner, Output};

    fn request(check_only: bool) -> UpgradePrimariesRequest {
        UpgradePrimariesRequest {
            source_bin_dir: "/usr/local/gpdb6/bin".into(),
            target_bin_dir: "/usr/local/gpdb7/bin".into(),
            data_dir_pairs: vec![
                DataDirPair {
                    source_data_dir: "/data/primary/gpseg0".into(),
                    target_data_dir: "/data/primary/gpseg.ID.0".into(),
                    source_port: 25432,
                    target_port: 50434,
                    content: 0,
                    dbid: 2,
                },
                DataDirPair {
                    source_data_dir: "/data/primary/gpseg1".into(),
                    target_data_dir: "/data/primary/gpseg.ID.1".into(),
                    source_port: 25433,
                    target_port: 50435,
                    content: 1,
                    dbid: 3,
                },
            ],
            check_only,
            use_link_mode: true,
            master_backup_dir: "/state/master.bak".into(),
            tablespaces_mapping_file_path: "/state/tablespaces.txt".into(),
        }
    }

    #[tokio::test]
    async fn test_upgrade_restores_backup_then_upgrades() {
        let state = tempfile::tempdir().unwrap();
        let runner = MockRunner::succeeding();

        upgrade_primaries(&runner, state.path(), "sdw1", request(false))
            .await
            .unwrap();

        assert!(state.path().join("pg_upgrade/seg0").is_dir());
        assert!(state.path().join("pg_upgrade/seg1").is_dir());

        let rsyncs = runner.calls_matching("rsync");
        assert_eq!(rsyncs.len(), 2);
        assert_eq!(rsyncs[0].args[2], "/state/master.bak/");
        assert!(rsyncs[0].args.contains(&"gp_dbid".to_string()));

        let upgrades = runner.calls_matching("pg_upgrade");
        assert_eq!(upgrades.len(), 2);
        for cmd in &upgrades {
            assert!(cmd.args.contains(&"--link".to_string()));
            assert!(cmd.args.contains(&"--old-tablespaces-file".to_string()));
            assert!(!cmd.args.contains(&"--check".to_string()));
        }
    }

    #[tokio::test]
    async fn test_check_only_skips_backup_and_tablespaces() {
        let state = tempfile::tempdir().unwrap();
        let runner = MockRunner::succeeding();

        upgrade_primaries(&runner, state.path(), "sdw1", request(true))
            .await
            .unwrap();

        assert!(runner.calls_matching("rsync").is_empty());
        for cmd in runner.calls_matching("pg_upgrade") {
            assert!(cmd.args.contains(&"--check".to_string()));
            assert!(!cmd.args.contains(&"--old-tablespaces-file".to_string()));
        }
    }

    #[tokio::test]
    async fn test_failures_name_host_and_content() {
        let state = tempfile::tempdir().unwrap();
        let runner = MockRunner::new(|cmd| {
            if cmd.args.iter().any(|a| a == "/data/primary/gpseg1") {
                Output::failure(1, "incompatible")
            } else {
                Output::default()
            }
        });

        let err = upgrade_primaries(&runner, state.path(), "sdw1", request(true))
            .await
            .unwrap_err();

        let text = err.to_string();
        assert!(text.starts_with("check primaries: check primary on host sdw1 with content 1"));
        assert!(text.contains("incompatible"));
        assert_eq!(runner.calls_matching("pg_upgrade").len(), 2);
    }
}
