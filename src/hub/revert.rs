//! REVERT: tear down the target cluster and bring the source back up as it
//! was before initialize.

use std::collections::HashMap;

use tokio_util::sync::CancellationToken;

use crate::cluster::inspect::major_version;
use crate::cluster::{control, Cluster};
use crate::error::{Error, ErrorList, Result};
use crate::grpc::idl::{rsync_request::RsyncOptions, RestorePgControlRequest, RsyncRequest, Substep};
use crate::hub::cleanup;
use crate::hub::fanout::{by_host, conns_for, on_agents};
use crate::hub::Hub;
use crate::rsync::Rsync;
use crate::step::stream::OutStreams;
use crate::step::Step;
use crate::upgrade::pg_control::restore_pg_control;

/// Options for copying a replica back over the instance it mirrors.
const RESTORE_OPTIONS: &[&str] = &["--archive", "--compress", "--stats"];

/// Per-instance files that must survive restoring from a replica.
const RESTORE_EXCLUDES: &[&str] = &[
    "pg_hba.conf",
    "postmaster.opts",
    "postgresql.auto.conf",
    "internal.auto.conf",
    "gp_dbid",
    "postgresql.conf",
    "backup_label.old",
    "postmaster.pid",
    "recovery.conf",
];

fn trailing_slash(path: &std::path::Path) -> String {
    format!("{}/", path.display().to_string().trim_end_matches('/'))
}

pub(super) async fn revert(hub: &Hub, step: &mut Step) -> Result<HashMap<String, String>> {
    let config = hub.config();
    let source = config.source()?.clone();
    let link_mode = config.use_link_mode();

    // Link mode rewrote the source primaries in place; only their replicas
    // still hold the pre-upgrade data.
    if link_mode && !source.has_all_mirrors_and_standby() {
        return Err(Error::Validation(
            "Source cluster does not have mirrors and/or standby. Cannot restore source cluster. Please contact support."
                .to_string(),
        ));
    }

    let target_running = match &config.intermediate {
        Some(intermediate) => {
            control::is_coordinator_running(hub.runner(), intermediate.coordinator_data_dir()?).await?
        }
        None => false,
    };

    step.run_conditionally(Substep::ShutdownTargetCluster, target_running, move |streams| async move {
        let config = hub.config();
        control::stop(hub.runner(), config.intermediate()?, streams.as_ref())
            .await
            .map_err(|e| e.context("stopping target cluster"))
    })
    .await;

    let source_running = control::is_coordinator_running(hub.runner(), source.coordinator_data_dir()?).await?;
    let restore = link_mode && !source_running;

    let cancel = step.cancel_token();
    let source_ref = &source;
    step.run_conditionally(Substep::RestorePgcontrol, restore, move |streams| async move {
        restore_pg_controls(hub, source_ref, streams.as_ref(), &cancel).await
    })
    .await;

    let cancel = step.cancel_token();
    step.run_conditionally(Substep::RestoreSourceCluster, restore, move |streams| async move {
        restore_source_cluster(hub, source_ref, streams.as_ref(), &cancel).await
    })
    .await;

    let has_target_primaries = config
        .target_layout
        .as_ref()
        .map(|layout| !layout.primaries.is_empty())
        .unwrap_or(false);

    let cancel = step.cancel_token();
    let config_ref = &config;
    step.run_conditionally(Substep::DeletePrimaryDatadirs, has_target_primaries, move |_| async move {
        let layout = config_ref.target_layout()?;
        cleanup::delete_segment_datadirs(hub, &cancel, &layout.primaries).await
    })
    .await;

    step.run_conditionally(Substep::DeleteMasterDatadir, has_target_primaries, move |streams| async move {
        let coordinator = config_ref
            .target_layout()?
            .coordinator
            .as_ref()
            .ok_or_else(|| Error::Config("target layout has no coordinator".to_string()))?;
        cleanup::delete_coordinator_datadir(hub, &coordinator.data_dir, streams.as_ref())
    })
    .await;

    let cancel = step.cancel_token();
    step.run(Substep::ArchiveLogDirectories, move |_| async move {
        cleanup::archive_log_directories(hub, &cancel).await.map(|_| ())
    })
    .await;

    let cancel = step.cancel_token();
    step.run(Substep::DeleteSegmentStatedirs, move |_| async move {
        cleanup::delete_segment_statedirs(hub, &cancel).await
    })
    .await;

    let source_running = control::is_coordinator_running(hub.runner(), source.coordinator_data_dir()?).await?;

    step.run_conditionally(Substep::StartSourceCluster, !source_running, move |streams| async move {
        start_source(hub, source_ref, link_mode, streams.as_ref()).await
    })
    .await;

    let recoverseg = !link_mode && needs_recoverseg(&source)?;
    step.run_conditionally(Substep::RecoversegSourceCluster, recoverseg, move |streams| async move {
        control::run_greenplum(hub.runner(), source_ref, streams.as_ref(), "gprecoverseg", &["-a"]).await
    })
    .await;

    Ok(response(hub, &source))
}

fn response(hub: &Hub, source: &Cluster) -> HashMap<String, String> {
    let archive = hub
        .config()
        .log_archive_dir
        .map(|d| d.display().to_string())
        .unwrap_or_default();

    let port = source.coordinator_port().map(|p| p.to_string()).unwrap_or_default();
    let datadir = source
        .coordinator_data_dir()
        .map(|d| d.display().to_string())
        .unwrap_or_default();

    HashMap::from([
        ("source_version".to_string(), source.version.clone()),
        ("source_port".to_string(), port),
        ("source_master_data_directory".to_string(), datadir),
        ("revert_log_archive_directory".to_string(), archive),
    ])
}

/// Copy-mode mirrors of a 5X source do not survive a primary being
/// upgraded, so they have to be rebuilt.
fn needs_recoverseg(source: &Cluster) -> Result<bool> {
    if !source.has_mirrors() {
        return Ok(false);
    }
    Ok(major_version(&source.version)? < 6)
}

async fn start_source(hub: &Hub, source: &Cluster, link_mode: bool, streams: &dyn OutStreams) -> Result<()> {
    match control::start(hub.runner(), source, streams).await {
        Ok(()) => Ok(()),
        // gpstart reports 1 when copy-mode mirrors of a 5X source fail to
        // come up; recoverseg fixes them next.
        Err(err) if !link_mode && err.exit_code() == Some(1) => Ok(()),
        Err(err) => Err(err.context("starting source cluster")),
    }
}

/// Link-mode pg_upgrade disables the source's `pg_control`; put it back on
/// the coordinator and every primary.
async fn restore_pg_controls(
    hub: &Hub,
    source: &Cluster,
    streams: &dyn OutStreams,
    cancel: &CancellationToken,
) -> Result<()> {
    let mut errs = ErrorList::new();
    errs.push_result(restore_pg_control(source.coordinator_data_dir()?, streams));

    let primaries: Vec<_> = source.primaries().values().filter(|s| s.is_primary()).cloned().collect();
    let hosts = by_host(&primaries);
    let conns = conns_for(&hub.agent_conns().await?, &hosts);

    let hosts = &hosts;
    errs.push_result(
        on_agents(&conns, cancel, |mut conn| async move {
            let datadirs = hosts
                .get(&conn.hostname)
                .map(|segs| segs.iter().map(|s| s.data_dir.display().to_string()).collect())
                .unwrap_or_default();

            conn.client
                .restore_pg_control(RestorePgControlRequest { datadirs })
                .await?;
            Ok(())
        })
        .await,
    );

    errs.into_result()
}

/// Rebuilds the coordinator from the standby and each primary from its
/// mirror. Both run at once; every failure is reported.
async fn restore_source_cluster(
    hub: &Hub,
    source: &Cluster,
    streams: &dyn OutStreams,
    cancel: &CancellationToken,
) -> Result<()> {
    let (coordinator, primaries) = tokio::join!(
        restore_coordinator(hub, source, streams),
        restore_primaries(hub, source, cancel)
    );

    let mut errs = ErrorList::new();
    errs.push_result(coordinator);
    errs.push_result(primaries);
    errs.into_result()
}

async fn restore_coordinator(hub: &Hub, source: &Cluster, streams: &dyn OutStreams) -> Result<()> {
    let standby = source
        .standby()
        .ok_or_else(|| Error::Config("source cluster has no standby".to_string()))?;

    Rsync::new()
        .sources([trailing_slash(&standby.data_dir)])
        .source_host(standby.hostname.clone())
        .destination(source.coordinator_data_dir()?.display().to_string())
        .options(RESTORE_OPTIONS.iter().copied())
        .excludes(RESTORE_EXCLUDES.iter().copied())
        .run(hub.runner(), Some(streams))
        .await
        .map_err(|e| e.context("restoring coordinator from standby"))
}

/// Requests grouped by mirror host: each agent pushes its mirrors' data
/// directories to the hosts of their primaries.
pub(super) fn primary_restore_requests(source: &Cluster) -> HashMap<String, RsyncRequest> {
    let mut requests: HashMap<String, RsyncRequest> = HashMap::new();

    for mirror in source.mirrors().values().filter(|s| s.is_mirror()) {
        let Some(primary) = source.primary(mirror.content_id) else {
            continue;
        };

        requests
            .entry(mirror.hostname.clone())
            .or_default()
            .options
            .push(RsyncOptions {
                sources: vec![trailing_slash(&mirror.data_dir)],
                destination: primary.data_dir.display().to_string(),
                destination_host: primary.hostname.clone(),
                options: RESTORE_OPTIONS.iter().map(|o| o.to_string()).collect(),
                exclude_patterns: RESTORE_EXCLUDES.iter().map(|e| e.to_string()).collect(),
            });
    }

    requests
}

async fn restore_primaries(hub: &Hub, source: &Cluster, cancel: &CancellationToken) -> Result<()> {
    let requests = primary_restore_requests(source);
    let conns: Vec<_> = hub
        .agent_conns()
        .await?
        .into_iter()
        .filter(|c| requests.contains_key(&c.hostname))
        .collect();

    let requests = &requests;
    on_agents(&conns, cancel, |mut conn| async move {
        let request = requests.get(&conn.hostname).cloned().unwrap_or_default();
        conn.client.rsync(request).await?;
        Ok(())
    })
    .await
}
