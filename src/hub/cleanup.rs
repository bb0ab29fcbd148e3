//! Teardown shared by finalize, revert and re-running initialize.

use std::path::{Path, PathBuf};

use slog::info;
use tokio_util::sync::CancellationToken;

use crate::agent::directories::archive_log_directory;
use crate::cluster::SegConfig;
use crate::error::{Error, Result};
use crate::grpc::idl::{ArchiveLogDirectoryRequest, DeleteDataDirectoriesRequest, DeleteStateDirectoryRequest};
use crate::hub::fanout::{by_host, conns_for, on_agents};
use crate::hub::Hub;
use crate::step::stream::OutStreams;
use crate::upgrade::{archive_directory_name, delete_directories, POSTGRES_FILES};

fn postgres_files() -> Vec<String> {
    POSTGRES_FILES.iter().map(|f| f.to_string()).collect()
}

/// Has each agent delete the data directories of `segments` on its host.
/// Only directories that look like postgres data directories are removed.
pub(super) async fn delete_segment_datadirs(
    hub: &Hub,
    cancel: &CancellationToken,
    segments: &[SegConfig],
) -> Result<()> {
    let hosts = by_host(segments);
    let conns = conns_for(&hub.agent_conns().await?, &hosts);

    let hosts = &hosts;
    on_agents(&conns, cancel, |mut conn| async move {
        let datadirs = hosts
            .get(&conn.hostname)
            .map(|segs| segs.iter().map(|s| s.data_dir.display().to_string()).collect())
            .unwrap_or_default();

        conn.client
            .delete_data_directories(DeleteDataDirectoriesRequest {
                datadirs,
                required_files: postgres_files(),
            })
            .await?;
        Ok(())
    })
    .await
}

pub(super) fn delete_coordinator_datadir(hub: &Hub, data_dir: &Path, streams: &dyn OutStreams) -> Result<()> {
    delete_directories(&[data_dir.to_path_buf()], &postgres_files(), hub.hostname(), streams)
}

/// Moves the hub's log directory and every segment host's aside into a
/// directory named for this upgrade. The name is chosen once and reused
/// when the substep is retried.
pub(super) async fn archive_log_directories(hub: &Hub, cancel: &CancellationToken) -> Result<PathBuf> {
    let config = hub.config();
    let log_dir = hub.env().log_dir.clone();

    let archive = match &config.log_archive_dir {
        Some(dir) => dir.clone(),
        None => {
            let parent = log_dir
                .parent()
                .ok_or_else(|| Error::Config(format!("log directory {:?} has no parent", log_dir)))?;
            let dir = parent.join(archive_directory_name(config.upgrade_id, &chrono::Local::now()));

            hub.update_config(|c| {
                c.log_archive_dir = Some(dir.clone());
                Ok(())
            })?;
            dir
        }
    };

    let coordinator_host = config.source()?.coordinator_hostname()?.to_string();
    let conns: Vec<_> = hub
        .agent_conns()
        .await?
        .into_iter()
        .filter(|c| c.hostname != coordinator_host)
        .collect();

    let new_dir = archive.display().to_string();
    let new_dir = &new_dir;
    on_agents(&conns, cancel, |mut conn| async move {
        conn.client
            .archive_log_directory(ArchiveLogDirectoryRequest {
                new_dir: new_dir.clone(),
            })
            .await?;
        Ok(())
    })
    .await?;

    archive_log_directory(&log_dir, &archive).await?;
    info!(hub.logger(), "archived log directories"; "archive" => %archive.display());
    Ok(archive)
}

/// Removes the state directory on every segment host. The coordinator's is
/// left for the CLI, which still needs it.
pub(super) async fn delete_segment_statedirs(hub: &Hub, cancel: &CancellationToken) -> Result<()> {
    let config = hub.config();
    let coordinator_host = config.source()?.coordinator_hostname()?.to_string();
    let conns: Vec<_> = hub
        .agent_conns()
        .await?
        .into_iter()
        .filter(|c| c.hostname != coordinator_host)
        .collect();

    on_agents(&conns, cancel, |mut conn| async move {
        conn.client
            .delete_state_directory(DeleteStateDirectoryRequest {})
            .await?;
        Ok(())
    })
    .await
}
