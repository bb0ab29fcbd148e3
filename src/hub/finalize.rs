//! FINALIZE: give the target cluster a standby and mirrors, move it onto
//! the source cluster's ports and directories, and retire the source.
//!
//! After this phase starts there is no way back to the source cluster.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;

use slog::{debug, info};
use tokio_util::sync::CancellationToken;

use crate::cluster::inspect::{major_version, Psql};
use crate::cluster::{control, Cluster, SegConfig};
use crate::error::{Error, Result};
use crate::grpc::idl::{
    add_replication_entries_request::Entry, create_recovery_conf_request::Connection,
    rsync_request::RsyncOptions, AddReplicationEntriesRequest, CreateRecoveryConfRequest,
    DeleteDataDirectoriesRequest, RenameDirectories, RenameDirectoriesRequest, RsyncRequest, Substep,
    UpdateFileConfOptions, UpdatePostgresqlConfRequest, UpdateRecoveryConfRequest,
};
use crate::hub::cleanup;
use crate::hub::fanout::{conns_for, on_agents};
use crate::hub::Hub;
use crate::rsync::MIRROR_OPTIONS;
use crate::step::stream::OutStreams;
use crate::step::Step;
use crate::upgrade::conf::{update_port_in_file, REPLICATION_SLOT};
use crate::upgrade::{archive_source, current_user, with_suffix, OLD_SUFFIX, POSTGRES_FILES};

/// Files a primary's copy must not carry over to its new mirror.
const MIRROR_EXCLUDES: &[&str] = &["postmaster.pid", "postmaster.opts"];

pub(super) async fn finalize(hub: &Hub, step: &mut Step) -> Result<HashMap<String, String>> {
    let config = hub.config();
    let source = config.source()?.clone();

    step.run_conditionally(Substep::UpgradeStandby, source.has_standby(), move |streams| async move {
        upgrade_standby(hub, streams.as_ref()).await
    })
    .await;

    let cancel = step.cancel_token();
    step.run_conditionally(Substep::UpgradeMirrors, source.has_mirrors(), move |streams| async move {
        upgrade_mirrors(hub, streams.as_ref(), &cancel).await
    })
    .await;

    step.run(Substep::ShutdownTargetCluster, move |streams| async move {
        let config = hub.config();
        control::stop(hub.runner(), config.intermediate()?, streams.as_ref())
            .await
            .map_err(|e| e.context("failed to stop target cluster"))
    })
    .await;

    step.run(Substep::UpdateTargetCatalog, move |streams| async move {
        update_target_catalog(hub, streams.as_ref()).await
    })
    .await;

    let cancel = step.cancel_token();
    step.run(Substep::UpdateDataDirectories, move |_| async move {
        update_data_directories(hub, &cancel).await
    })
    .await;

    let cancel = step.cancel_token();
    step.run(Substep::UpdateTargetConfFiles, move |_| async move {
        update_conf_files(hub, &cancel).await
    })
    .await;

    step.run(Substep::StartTargetCluster, move |streams| async move {
        let config = hub.config();
        control::start(hub.runner(), config.target()?, streams.as_ref())
            .await
            .map_err(|e| e.context("failed to start target cluster"))
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

    if step.err().is_some() {
        return Ok(HashMap::new());
    }
    response(hub)
}

fn response(hub: &Hub) -> Result<HashMap<String, String>> {
    let config = hub.config();
    let target = config.target()?;
    let layout_coordinator = layout_coordinator(&config.target_layout()?.coordinator)?;

    Ok(HashMap::from([
        ("target_version".to_string(), target.version.clone()),
        ("target_port".to_string(), target.coordinator_port()?.to_string()),
        (
            "target_master_data_directory".to_string(),
            target.coordinator_data_dir()?.display().to_string(),
        ),
        (
            "archived_source_master_data_directory".to_string(),
            with_suffix(&layout_coordinator.data_dir, OLD_SUFFIX).display().to_string(),
        ),
        ("upgrade_id".to_string(), config.upgrade_id.to_string()),
        (
            "log_archive_directory".to_string(),
            config
                .log_archive_dir
                .as_ref()
                .map(|d| d.display().to_string())
                .unwrap_or_default(),
        ),
    ]))
}

fn layout_coordinator(coordinator: &Option<SegConfig>) -> Result<&SegConfig> {
    coordinator
        .as_ref()
        .ok_or_else(|| Error::Config("target layout has no coordinator".to_string()))
}

/// `cluster` with `extra` added. Segments it already has are kept as they
/// are, so a retried substep can record the same additions again.
fn with_segments(cluster: &Cluster, extra: &[SegConfig]) -> Result<Cluster> {
    let mut segments = cluster.segments();
    for seg in extra {
        if !segments.iter().any(|s| s.dbid == seg.dbid) {
            segments.push(seg.clone());
        }
    }

    Ok(Cluster::new(segments)?
        .with_gphome(cluster.gphome.clone())
        .with_version(cluster.version.clone()))
}

fn record_intermediate(hub: &Hub, extra: &[SegConfig]) -> Result<()> {
    hub.update_config(|config| {
        let updated = with_segments(config.intermediate()?, extra)?;
        updated.save(&hub.env().target_cluster_path())?;
        config.intermediate = Some(updated);
        Ok(())
    })
}

fn sql_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Replaces any standby gpinitsystem may have left, then creates the
/// target standby at its planned port and directory.
async fn upgrade_standby(hub: &Hub, streams: &dyn OutStreams) -> Result<()> {
    let config = hub.config();
    let intermediate = config.intermediate()?;
    let standby = config
        .target_layout()?
        .standby
        .clone()
        .ok_or_else(|| Error::Config("target layout has no standby".to_string()))?;

    // Fails when there is no standby to remove, which is the usual case.
    if let Err(err) =
        control::run_greenplum(hub.runner(), intermediate, streams, "gpinitstandby", &["-r", "-a"]).await
    {
        debug!(hub.logger(), "removing existing target standby"; "error" => %err);
    }

    let port = standby.port.to_string();
    let data_dir = standby.data_dir.display().to_string();
    let mut args = vec!["-P", port.as_str(), "-s", standby.hostname.as_str(), "-S", data_dir.as_str(), "-a"];
    if config.use_hba_hostnames {
        args.push("--hba-hostnames");
    }

    info!(hub.logger(), "creating target standby"; "host" => &standby.hostname, "port" => standby.port);
    control::run_greenplum(hub.runner(), intermediate, streams, "gpinitstandby", &args)
        .await
        .map_err(|e| e.context("creating target standby"))?;

    record_intermediate(hub, &[standby])
}

/// Builds each target mirror from a copy of its primary and registers it
/// in the catalog.
async fn upgrade_mirrors(hub: &Hub, streams: &dyn OutStreams, cancel: &CancellationToken) -> Result<()> {
    let config = hub.config();
    let intermediate = config.intermediate()?.clone();
    let mirrors = config.target_layout()?.mirrors.clone();

    let slots = format!(
        "SELECT pg_create_physical_replication_slot({}) FROM gp_dist_random('gp_id')",
        sql_literal(REPLICATION_SLOT)
    );
    Psql::new(&intermediate)?
        .execute(hub.runner(), &slots)
        .await
        .map_err(|e| e.context("creating replication slots"))?;

    control::stop(hub.runner(), &intermediate, streams).await?;

    let conns = hub.agent_conns().await?;

    let copies = mirror_copy_requests(&intermediate, &mirrors)?;
    let copies = &copies;
    on_agents(&conns_for(&conns, copies), cancel, |mut conn| async move {
        let request = copies.get(&conn.hostname).cloned().unwrap_or_default();
        conn.client.rsync(request).await?;
        Ok(())
    })
    .await
    .map_err(|e| e.context("copying primaries to mirrors"))?;

    let recovery = recovery_conf_requests(&intermediate, &mirrors, &current_user())?;
    let recovery = &recovery;
    on_agents(&conns_for(&conns, recovery), cancel, |mut conn| async move {
        let request = recovery.get(&conn.hostname).cloned().unwrap_or_default();
        conn.client.create_recovery_conf(request).await?;
        Ok(())
    })
    .await?;

    let hba = replication_entry_requests(&intermediate, &mirrors, &current_user(), config.use_hba_hostnames).await?;
    let hba = &hba;
    on_agents(&conns_for(&conns, hba), cancel, |mut conn| async move {
        let request = hba.get(&conn.hostname).cloned().unwrap_or_default();
        conn.client.add_replication_entries(request).await?;
        Ok(())
    })
    .await?;

    control::start_coordinator_only(hub.runner(), &intermediate, streams).await?;
    add_mirrors_to_catalog(hub, &intermediate, &mirrors).await?;
    control::stop_coordinator_only(hub.runner(), &intermediate, streams).await?;

    let upgraded = with_segments(&intermediate, &mirrors)?;
    control::start(hub.runner(), &upgraded, streams).await?;

    record_intermediate(hub, &mirrors)
}

fn primary_for<'a>(cluster: &'a Cluster, mirror: &SegConfig) -> Result<&'a SegConfig> {
    cluster.primary(mirror.content_id).ok_or_else(|| {
        Error::Config(format!("target cluster has no primary for content {}", mirror.content_id))
    })
}

/// Requests grouped by primary host: each agent copies its primaries onto
/// the hosts of their new mirrors.
pub(super) fn mirror_copy_requests(
    intermediate: &Cluster,
    mirrors: &[SegConfig],
) -> Result<BTreeMap<String, RsyncRequest>> {
    let mut requests: BTreeMap<String, RsyncRequest> = BTreeMap::new();

    for mirror in mirrors {
        let primary = primary_for(intermediate, mirror)?;
        requests
            .entry(primary.hostname.clone())
            .or_default()
            .options
            .push(RsyncOptions {
                sources: vec![format!("{}/", primary.data_dir.display().to_string().trim_end_matches('/'))],
                destination: mirror.data_dir.display().to_string(),
                destination_host: mirror.hostname.clone(),
                options: MIRROR_OPTIONS.iter().map(|o| o.to_string()).collect(),
                exclude_patterns: MIRROR_EXCLUDES.iter().map(|e| e.to_string()).collect(),
            });
    }

    Ok(requests)
}

/// Requests grouped by mirror host pointing each mirror at its primary.
pub(super) fn recovery_conf_requests(
    intermediate: &Cluster,
    mirrors: &[SegConfig],
    user: &str,
) -> Result<BTreeMap<String, CreateRecoveryConfRequest>> {
    let mut requests: BTreeMap<String, CreateRecoveryConfRequest> = BTreeMap::new();

    for mirror in mirrors {
        let primary = primary_for(intermediate, mirror)?;
        requests
            .entry(mirror.hostname.clone())
            .or_default()
            .connections
            .push(Connection {
                mirror_data_dir: mirror.data_dir.display().to_string(),
                user: user.to_string(),
                primary_host: primary.hostname.clone(),
                primary_port: primary.port,
            });
    }

    Ok(requests)
}

/// Addresses a mirror host connects from, in `pg_hba.conf` form.
async fn host_addrs(host: &str, use_hostnames: bool) -> Result<Vec<String>> {
    if use_hostnames {
        return Ok(vec![host.to_string()]);
    }

    let addrs = tokio::net::lookup_host((host, 0))
        .await
        .map_err(|e| Error::io(format!("resolving host {:?}", host), e))?;

    let cidrs: BTreeSet<String> = addrs
        .map(|addr| match addr.ip() {
            std::net::IpAddr::V4(ip) => format!("{}/32", ip),
            std::net::IpAddr::V6(ip) => format!("{}/128", ip),
        })
        .collect();
    Ok(cidrs.into_iter().collect())
}

/// Requests grouped by primary host allowing each primary's mirror to
/// replicate from it.
pub(super) async fn replication_entry_requests(
    intermediate: &Cluster,
    mirrors: &[SegConfig],
    user: &str,
    use_hostnames: bool,
) -> Result<BTreeMap<String, AddReplicationEntriesRequest>> {
    let mut requests: BTreeMap<String, AddReplicationEntriesRequest> = BTreeMap::new();

    for mirror in mirrors {
        let primary = primary_for(intermediate, mirror)?;
        requests
            .entry(primary.hostname.clone())
            .or_default()
            .entries
            .push(Entry {
                data_dir: primary.data_dir.display().to_string(),
                user: user.to_string(),
                host_addrs: host_addrs(&mirror.hostname, use_hostnames).await?,
            });
    }

    Ok(requests)
}

/// Runs `sql`, which must return exactly one row.
async fn execute_one(hub: &Hub, psql: &Psql<'_>, sql: &str, dbid: i32, verb: &str) -> Result<()> {
    let rows = psql.query(hub.runner(), sql).await?;
    if rows.len() != 1 {
        return Err(Error::Validation(format!(
            "Expected 1 row to be {} for segment dbid {}, but {} {} rows instead.",
            verb,
            dbid,
            verb,
            rows.len()
        )));
    }
    Ok(())
}

pub(super) fn add_mirror_sql(seg: &SegConfig) -> String {
    format!(
        "INSERT INTO gp_segment_configuration \
         (dbid, content, role, preferred_role, mode, status, port, hostname, address, datadir) \
         VALUES ({}, {}, '{role}', '{role}', 'n', 'u', {}, {host}, {host}, {}) RETURNING dbid",
        seg.dbid,
        seg.content_id,
        seg.port,
        sql_literal(&seg.data_dir.display().to_string()),
        role = seg.role.as_str(),
        host = sql_literal(&seg.hostname),
    )
}

async fn add_mirrors_to_catalog(hub: &Hub, intermediate: &Cluster, mirrors: &[SegConfig]) -> Result<()> {
    let psql = Psql::new(intermediate)?.with_utility_mode().with_system_table_mods();
    for seg in mirrors {
        execute_one(hub, &psql, &add_mirror_sql(seg), seg.dbid, "added")
            .await
            .map_err(|e| e.context("insert into gp_segment_configuration"))?;
    }
    Ok(())
}

pub(super) fn update_segment_sql(seg: &SegConfig) -> String {
    format!(
        "UPDATE gp_segment_configuration SET port = {}, datadir = {} \
         WHERE content = {} AND role = '{}' RETURNING dbid",
        seg.port,
        sql_literal(&seg.data_dir.display().to_string()),
        seg.content_id,
        seg.role.as_str(),
    )
}

/// Points the catalog at the source cluster's ports and directories and
/// records the final target.
async fn update_target_catalog(hub: &Hub, streams: &dyn OutStreams) -> Result<()> {
    let config = hub.config();
    let intermediate = config.intermediate()?;
    let target = config.final_target(&intermediate.version)?;

    control::start_coordinator_only(hub.runner(), intermediate, streams).await?;

    let psql = Psql::new(intermediate)?.with_utility_mode().with_system_table_mods();
    for seg in target.segments() {
        execute_one(hub, &psql, &update_segment_sql(&seg), seg.dbid, "updated")
            .await
            .map_err(|e| e.context("update gp_segment_configuration"))?;
    }

    control::stop_coordinator_only(hub.runner(), intermediate, streams).await?;

    hub.update_config(|c| {
        c.target = Some(target);
        Ok(())
    })
}

/// Renames requested of each segment host. Every source primary is archived
/// and its upgraded directory moved into place. Mirrors and the standby are
/// only archived since they are recreated at the source location later; in
/// link mode they are already gone and are left out.
pub(super) fn rename_requests(
    source: &Cluster,
    intermediate: &Cluster,
    link_mode: bool,
) -> BTreeMap<String, RenameDirectoriesRequest> {
    let mut pairs: Vec<(&SegConfig, Option<&SegConfig>, bool)> = intermediate
        .primaries()
        .values()
        .filter(|s| s.is_primary())
        .map(|seg| (seg, source.primary(seg.content_id), true))
        .collect();

    if !link_mode {
        // Keyed by content, so the standby comes along with content -1.
        pairs.extend(
            intermediate
                .mirrors()
                .values()
                .map(|seg| (seg, source.mirror(seg.content_id), false)),
        );
    }

    let mut requests: BTreeMap<String, RenameDirectoriesRequest> = BTreeMap::new();
    for (seg, source_seg, rename_target) in pairs {
        let Some(source_seg) = source_seg else {
            continue;
        };
        requests
            .entry(seg.hostname.clone())
            .or_default()
            .dirs
            .push(RenameDirectories {
                source: source_seg.data_dir.display().to_string(),
                target: seg.data_dir.display().to_string(),
                rename_target,
            });
    }

    requests
}

async fn update_data_directories(hub: &Hub, cancel: &CancellationToken) -> Result<()> {
    let config = hub.config();
    let source = config.source()?.clone();
    let intermediate = config.intermediate()?.clone();

    let source_dir = source.coordinator_data_dir()?.to_path_buf();
    let target_dir = intermediate.coordinator_data_dir()?.to_path_buf();
    tokio::task::spawn_blocking(move || archive_source(&source_dir, &target_dir, true))
        .await?
        .map_err(|e| e.context("renaming master data directories"))?;

    let conns = hub.agent_conns().await?;

    // Link-mode replicas share files with the upgraded primaries and are
    // useless now.
    if config.use_link_mode() {
        let replicas = crate::hub::fanout::by_host(
            source.segments().iter().filter(|s| s.is_mirror()),
        );
        let replicas = &replicas;
        on_agents(&conns_for(&conns, replicas), cancel, |mut conn| async move {
            let datadirs = replicas
                .get(&conn.hostname)
                .map(|segs| segs.iter().map(|s| s.data_dir.display().to_string()).collect())
                .unwrap_or_default();

            conn.client
                .delete_data_directories(DeleteDataDirectoriesRequest {
                    datadirs,
                    required_files: POSTGRES_FILES.iter().map(|f| f.to_string()).collect(),
                })
                .await?;
            Ok(())
        })
        .await
        .map_err(|e| e.context("removing source cluster standby and mirror segment data directories"))?;
    }

    let renames = rename_requests(&source, &intermediate, config.use_link_mode());
    let renames = &renames;
    on_agents(&conns_for(&conns, renames), cancel, |mut conn| async move {
        let request = renames.get(&conn.hostname).cloned().unwrap_or_default();
        conn.client.rename_directories(request).await?;
        Ok(())
    })
    .await
    .map_err(|e| e.context("renaming segment data directories"))
}

/// The file holding a replica's `primary_conninfo` for a given major
/// version.
fn recovery_file(version: &str) -> Result<&'static str> {
    Ok(if major_version(version)? < 7 {
        "recovery.conf"
    } else {
        "postgresql.auto.conf"
    })
}

fn port_change(dir: &Path, file: &str, current: i32, updated: i32) -> UpdateFileConfOptions {
    UpdateFileConfOptions {
        path: dir.join(file).display().to_string(),
        current_value: current,
        updated_value: updated,
    }
}

/// `postgresql.conf` and replication-file port rewrites for each segment
/// host, moving every instance from its temporary port to its final one.
pub(super) fn conf_requests(
    intermediate: &Cluster,
    target: &Cluster,
) -> Result<BTreeMap<String, (UpdatePostgresqlConfRequest, UpdateRecoveryConfRequest)>> {
    let recovery = recovery_file(&intermediate.version)?;
    let mut requests: BTreeMap<String, (UpdatePostgresqlConfRequest, UpdateRecoveryConfRequest)> = BTreeMap::new();

    for seg in target.segments().into_iter().filter(|s| !s.is_coordinator()) {
        let (postgresql, replication) = requests.entry(seg.hostname.clone()).or_default();

        if seg.is_standby() {
            let temp = intermediate
                .standby()
                .ok_or_else(|| Error::Config("target cluster has no standby".to_string()))?;
            postgresql
                .options
                .push(port_change(&seg.data_dir, "postgresql.conf", temp.port, seg.port));
            replication.options.push(port_change(
                &seg.data_dir,
                recovery,
                intermediate.coordinator_port()?,
                target.coordinator_port()?,
            ));
            continue;
        }

        // A mirror started life as a copy of its primary, so it still
        // carries the primary's temporary port.
        let temp_primary = primary_for(intermediate, &seg)?;
        postgresql
            .options
            .push(port_change(&seg.data_dir, "postgresql.conf", temp_primary.port, seg.port));

        if seg.is_mirror() {
            replication.options.push(port_change(
                &seg.data_dir,
                recovery,
                temp_primary.port,
                primary_for(target, &seg)?.port,
            ));
        }
    }

    Ok(requests)
}

async fn update_conf_files(hub: &Hub, cancel: &CancellationToken) -> Result<()> {
    let config = hub.config();
    let intermediate = config.intermediate()?.clone();
    let target = config.target()?.clone();

    let conf = target.coordinator_data_dir()?.join("postgresql.conf");
    let (old, new) = (intermediate.coordinator_port()?, target.coordinator_port()?);
    tokio::task::spawn_blocking(move || update_port_in_file(&conf, old, new)).await??;

    let requests = conf_requests(&intermediate, &target)?;
    let requests = &requests;
    on_agents(&conns_for(&hub.agent_conns().await?, requests), cancel, |mut conn| async move {
        let (postgresql, replication) = requests.get(&conn.hostname).cloned().unwrap_or_default();

        conn.client.update_postgresql_conf(postgresql).await?;
        if !replication.options.is_empty() {
            conn.client.update_recovery_conf(replication).await?;
        }
        Ok(())
    })
    .await
}
