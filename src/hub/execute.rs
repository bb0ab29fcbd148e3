//! EXECUTE: stop the source, upgrade the coordinator, seed and upgrade every
//! primary, then start the target cluster at its temporary ports.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use tokio_util::sync::CancellationToken;

use crate::cluster::control;
use crate::config::HubConfig;
use crate::error::{Error, ErrorList, Result};
use crate::fanout;
use crate::grpc::idl::{DataDirPair, Substep, UpgradePrimariesRequest};
use crate::hub::fanout::on_agents;
use crate::hub::Hub;
use crate::rsync::{Rsync, ARCHIVE_DELETE};
use crate::step::stream::OutStreams;
use crate::step::Step;
use crate::upgrade::directories::coordinator_working_directory;
use crate::upgrade::pg_upgrade::{PgUpgrade, Segment, UpgradeMode};

/// Options used to ship the upgraded coordinator to segment hosts.
const COPY_COORDINATOR_OPTIONS: &[&str] = &["--archive", "--compress", "--delete", "--stats"];

pub(super) async fn execute(hub: &Hub, step: &mut Step) -> Result<HashMap<String, String>> {
    step.run(Substep::ShutdownSourceCluster, move |streams| async move {
        let config = hub.config();
        control::stop(hub.runner(), config.source()?, streams.as_ref())
            .await
            .map_err(|e| e.context("failed to stop source cluster"))
    })
    .await;

    step.run(Substep::UpgradeMaster, move |streams| async move {
        let config = hub.config();
        upgrade_coordinator(hub, &config, streams.as_ref(), false).await
    })
    .await;

    let cancel = step.cancel_token();
    step.run(Substep::CopyMaster, move |_| async move { copy_coordinator(hub, &cancel).await })
        .await;

    let cancel = step.cancel_token();
    step.run(Substep::UpgradePrimaries, move |_| async move {
        let config = hub.config();
        upgrade_primaries(hub, &config, &cancel, false).await
    })
    .await;

    step.run(Substep::StartTargetCluster, move |streams| async move {
        let config = hub.config();
        control::start(hub.runner(), config.intermediate()?, streams.as_ref()).await
    })
    .await;

    if step.err().is_some() {
        return Ok(HashMap::new());
    }

    let config = hub.config();
    let intermediate = config.intermediate()?;
    Ok(HashMap::from([
        ("target_port".to_string(), intermediate.coordinator_port()?.to_string()),
        (
            "target_master_data_directory".to_string(),
            intermediate.coordinator_data_dir()?.display().to_string(),
        ),
    ]))
}

fn coordinator_segment(cluster: &crate::cluster::Cluster) -> Result<Segment> {
    let coordinator = cluster
        .coordinator()
        .ok_or_else(|| Error::Config("cluster has no coordinator".to_string()))?;

    Ok(Segment {
        bin_dir: cluster.bin_dir(),
        data_dir: coordinator.data_dir.clone(),
        dbid: coordinator.dbid,
        port: coordinator.port,
    })
}

/// Copies `<from>/` over `to`, leaving coordinator logs behind.
pub(super) async fn rsync_coordinator_dir(
    hub: &Hub,
    from: &Path,
    to: &Path,
    streams: &dyn OutStreams,
) -> Result<()> {
    let from = format!("{}/", from.display().to_string().trim_end_matches('/'));
    Rsync::new()
        .sources([from.clone()])
        .destination(to.display().to_string())
        .options(ARCHIVE_DELETE.iter().copied())
        .excludes(["pg_log/*"])
        .run(hub.runner(), Some(streams))
        .await
        .map_err(|e| e.context(format!("rsync {:?} to {:?}", from, to)))
}

/// Runs pg_upgrade for the coordinator, first resetting the target
/// coordinator from the pristine backup so the run can be repeated.
pub(super) async fn upgrade_coordinator(
    hub: &Hub,
    config: &HubConfig,
    streams: &dyn OutStreams,
    check_only: bool,
) -> Result<()> {
    let source = config.source()?;
    let intermediate = config.intermediate()?;

    let work_dir = coordinator_working_directory(&hub.env().state_dir);
    tokio::fs::create_dir_all(&work_dir)
        .await
        .map_err(|e| Error::io(format!("creating {:?}", work_dir), e))?;

    rsync_coordinator_dir(
        hub,
        &hub.env().master_backup_dir(),
        intermediate.coordinator_data_dir()?,
        streams,
    )
    .await?;

    let upgrade = PgUpgrade::new(
        coordinator_segment(source)?,
        coordinator_segment(intermediate)?,
        UpgradeMode::Dispatcher,
        &work_dir,
    )
    .with_check_only(check_only)
    .with_link_mode(config.use_link_mode());

    let cmd = upgrade.command();
    let output = hub.runner().output(&cmd, Some(streams)).await?;
    let err = match crate::exec::check_exit(&cmd, output.clone()) {
        Ok(_) => return Ok(()),
        Err(err) => err,
    };

    let action = if check_only { "check" } else { "upgrade" };
    let mut errs = ErrorList::new();
    errs.push(err);
    let details = match work_dir_entries(&work_dir) {
        Ok(files) => failure_details(&output.stdout_text(), &work_dir, &files),
        Err(e) => {
            errs.push(e);
            failure_details(&output.stdout_text(), &work_dir, &[])
        }
    };

    let err = match errs.into_result() {
        Err(err) => err,
        Ok(()) => return Ok(()),
    };

    if details.is_empty() {
        Err(err.context(format!("{} master", action)))
    } else {
        Err(err.context(format!("{} master: {}", action, details)))
    }
}

fn work_dir_entries(dir: &Path) -> Result<Vec<String>> {
    let entries = std::fs::read_dir(dir).map_err(|e| Error::io(format!("reading {:?}", dir), e))?;

    let mut names = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| Error::io(format!("reading {:?}", dir), e))?;
        names.push(entry.file_name().to_string_lossy().into_owned());
    }
    Ok(names)
}

/// pg_upgrade's stdout from the first line mentioning "fatal" onwards, with
/// any file from its working directory expanded to a full path.
pub(super) fn failure_details(stdout: &str, work_dir: &Path, files: &[String]) -> String {
    let mut text = stdout
        .lines()
        .skip_while(|line| !line.contains("fatal"))
        .collect::<Vec<_>>()
        .join("\n");

    for file in files {
        let full = work_dir.join(file).display().to_string();
        text = text.replace(file.as_str(), &full);
    }
    text
}

/// Ships the upgraded coordinator to every primary host, where it seeds
/// each primary's catalog before pg_upgrade runs there.
async fn copy_coordinator(hub: &Hub, cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(Error::Canceled);
    }

    let config = hub.config();
    let intermediate = config.intermediate()?;
    let from = format!("{}/", intermediate.coordinator_data_dir()?.display());
    let to = hub.env().upgraded_master_backup_dir().display().to_string();

    let (from, to) = (&from, &to);
    fanout::for_each(intermediate.primary_hostnames(), |host| async move {
        Rsync::new()
            .sources([from.clone()])
            .destination(to.clone())
            .destination_host(host.clone())
            .options(COPY_COORDINATOR_OPTIONS.iter().copied())
            .run(hub.runner(), None)
            .await
            .map_err(|e| e.context(format!("copy master data directory to host {}", host)))
    })
    .await
}

/// Asks each agent to run pg_upgrade for the primaries on its host.
pub(super) async fn upgrade_primaries(
    hub: &Hub,
    config: &HubConfig,
    cancel: &CancellationToken,
    check_only: bool,
) -> Result<()> {
    let source = config.source()?;
    let intermediate = config.intermediate()?;

    let mut pairs: BTreeMap<String, Vec<DataDirPair>> = BTreeMap::new();
    for seg in source.primaries().values().filter(|s| s.is_primary()) {
        let target = intermediate.primary(seg.content_id).ok_or_else(|| {
            Error::Config(format!("target cluster has no primary for content {}", seg.content_id))
        })?;

        pairs.entry(seg.hostname.clone()).or_default().push(DataDirPair {
            source_data_dir: seg.data_dir.display().to_string(),
            target_data_dir: target.data_dir.display().to_string(),
            source_port: seg.port,
            target_port: target.port,
            content: seg.content_id,
            dbid: seg.dbid,
        });
    }

    let conns: Vec<_> = hub
        .agent_conns()
        .await?
        .into_iter()
        .filter(|c| pairs.contains_key(&c.hostname))
        .collect();

    let request = UpgradePrimariesRequest {
        source_bin_dir: source.bin_dir().display().to_string(),
        target_bin_dir: intermediate.bin_dir().display().to_string(),
        data_dir_pairs: Vec::new(),
        check_only,
        use_link_mode: config.use_link_mode(),
        master_backup_dir: hub.env().upgraded_master_backup_dir().display().to_string(),
        tablespaces_mapping_file_path: String::new(),
    };

    let (pairs, request) = (&pairs, &request);
    on_agents(&conns, cancel, |mut conn| async move {
        let mut request = request.clone();
        request.data_dir_pairs = pairs.get(&conn.hostname).cloned().unwrap_or_default();
        conn.client.upgrade_primaries(request).await?;
        Ok(())
    })
    .await
}
