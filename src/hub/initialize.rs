//! INITIALIZE, in two RPCs. The first inspects the source cluster, plans the
//! target and starts the agents. The second creates the target cluster and
//! runs pg_upgrade's checks against it.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use slog::info;
use tokio_util::sync::CancellationToken;

use crate::cluster::inspect::{check_versions, cluster_from_db, gp_version, major_version, Psql};
use crate::cluster::target::{assign_datadirs_and_ports, TargetLayout};
use crate::cluster::{control, SegConfig};
use crate::config::{HubConfig, Mode};
use crate::disk::{check_usage, DiskSpaceError, SpaceFailures};
use crate::error::{Error, ErrorList, Result};
use crate::exec::Command;
use crate::grpc::idl::{CheckDiskSpaceRequest, InitializeRequest, Mode as RequestedMode, Substep};
use crate::hub::fanout::{by_host, collect_from_agents, conns_for};
use crate::hub::{cleanup, execute, restart_agents, Hub};
use crate::step::stream::OutStreams;
use crate::step::Step;
use crate::upgrade::directories::coordinator_seg_prefix;
use crate::upgrade::UpgradeId;

pub(super) async fn initialize(hub: &Hub, step: &mut Step, req: InitializeRequest) -> Result<HashMap<String, String>> {
    let req = &req;

    step.run_internal_substep(move || async move {
        let (source, target) = tokio::try_join!(
            gp_version(hub.runner(), Path::new(&req.source_gphome)),
            gp_version(hub.runner(), Path::new(&req.target_gphome)),
        )?;
        check_versions(&source, &target)
    })
    .await;

    step.run(Substep::SavingSourceClusterConfig, move |_| async move {
        save_source_cluster_config(hub, req).await
    })
    .await;

    step.run(Substep::StartAgents, move |_| async move {
        restart_agents(hub).await.map(|_| ())
    })
    .await;

    let cancel = step.cancel_token();
    let ratio = req.disk_free_ratio;
    step.run_conditionally(Substep::CheckDiskSpace, ratio > 0.0, move |_| async move {
        check_disk_space(hub, ratio, &cancel).await
    })
    .await;

    Ok(HashMap::new())
}

fn requested_mode(req: &InitializeRequest) -> Mode {
    match req.mode() {
        RequestedMode::Link => Mode::Link,
        _ => Mode::Copy,
    }
}

fn requested_ports(req: &InitializeRequest) -> Result<Vec<u16>> {
    req.ports
        .iter()
        .map(|&port| {
            u16::try_from(port).map_err(|_| Error::Validation(format!("port {} is out of range", port)))
        })
        .collect()
}

/// Snapshots the source cluster and plans where every target segment will
/// live. Anything left over from an earlier initialize is forgotten.
async fn save_source_cluster_config(hub: &Hub, req: &InitializeRequest) -> Result<()> {
    if !(0.0..=1.0).contains(&req.disk_free_ratio) {
        return Err(Error::Validation(format!(
            "disk free ratio {} is not between 0.0 and 1.0",
            req.disk_free_ratio
        )));
    }

    let ports = requested_ports(req)?;
    let agent_port = match req.agent_port {
        0 => None,
        port => Some(
            u16::try_from(port).map_err(|_| Error::Validation(format!("agent port {} is out of range", port)))?,
        ),
    };

    let source_gphome = PathBuf::from(&req.source_gphome);
    let source = cluster_from_db(hub.runner(), &source_gphome, req.source_port).await?;

    let id = UpgradeId::new();
    let layout = assign_datadirs_and_ports(&source, &ports, id)?;
    source.save(&hub.env().source_cluster_path())?;

    hub.update_config(|c| {
        c.source_gphome = source_gphome.clone();
        c.target_gphome = PathBuf::from(&req.target_gphome);
        c.source_port = req.source_port;
        c.mode = requested_mode(req);
        c.disk_free_ratio = req.disk_free_ratio;
        c.ports = ports.clone();
        if let Some(port) = agent_port {
            c.agent_port = port;
        }
        c.use_hba_hostnames = req.use_hba_hostnames;
        c.dynamic_library_path = req.dynamic_library_path.clone();
        c.upgrade_id = id;
        c.source = Some(source.clone());
        c.target_layout = Some(layout.clone());
        c.intermediate = None;
        c.target = None;
        c.log_archive_dir = None;
        Ok(())
    })?;

    // The agent set may have changed with the new source.
    hub.forget_agents().await;
    info!(hub.logger(), "saved source cluster configuration"; "upgrade_id" => %id, "segments" => source.segments().len());
    Ok(())
}

/// Checks the coordinator's filesystem locally and every other segment's
/// through the agent on its host.
async fn check_disk_space(hub: &Hub, ratio: f64, cancel: &CancellationToken) -> Result<()> {
    let config = hub.config();
    let source = config.source()?;
    let coordinator_host = source.coordinator_hostname()?.to_string();
    let coordinator_dir = source.coordinator_data_dir()?.to_path_buf();

    let disk = hub.disk();
    let local = tokio::task::spawn_blocking(move || check_usage(disk.as_ref(), ratio, &[coordinator_dir]));

    let segments: Vec<SegConfig> = source.segments().into_iter().filter(|s| !s.is_coordinator()).collect();
    let hosts = by_host(&segments);
    let conns = conns_for(&hub.agent_conns().await?, &hosts);

    let hosts = &hosts;
    let remote = collect_from_agents(&conns, cancel, |mut conn| async move {
        let dirs = hosts
            .get(&conn.hostname)
            .map(|segs| segs.iter().map(|s| s.data_dir.display().to_string()).collect())
            .unwrap_or_default();

        let reply = conn
            .client
            .check_disk_space(CheckDiskSpaceRequest { ratio, dirs })
            .await?
            .into_inner();
        Ok(reply.failed.into_iter().collect::<SpaceFailures>())
    });

    let (local, remote) = tokio::join!(local, remote);

    let mut failures: Vec<(String, SpaceFailures)> =
        remote?.into_iter().filter(|(_, failed)| !failed.is_empty()).collect();
    let local = local??;
    if !local.is_empty() {
        failures.push((coordinator_host, local));
    }

    if failures.is_empty() {
        return Ok(());
    }
    Err(DiskSpaceError::from_host_failures(failures).into())
}

pub(super) async fn create_cluster(hub: &Hub, step: &mut Step) -> Result<HashMap<String, String>> {
    step.run(Substep::GenerateTargetConfig, move |_| async move {
        generate_target_config(hub).await
    })
    .await;

    let cancel = step.cancel_token();
    step.run(Substep::InitTargetCluster, move |streams| async move {
        init_target_cluster(hub, streams.as_ref(), &cancel).await
    })
    .await;

    step.run(Substep::ShutdownTargetCluster, move |streams| async move {
        let config = hub.config();
        control::stop(hub.runner(), config.intermediate()?, streams.as_ref())
            .await
            .map_err(|e| e.context("stop target cluster"))
    })
    .await;

    step.run(Substep::BackupTargetMaster, move |streams| async move {
        let config = hub.config();
        execute::rsync_coordinator_dir(
            hub,
            config.intermediate()?.coordinator_data_dir()?,
            &hub.env().master_backup_dir(),
            streams.as_ref(),
        )
        .await
    })
    .await;

    let cancel = step.cancel_token();
    step.always_run(Substep::CheckUpgrade, move |streams| async move {
        check_upgrade(hub, streams.as_ref(), &cancel).await
    })
    .await;

    if step.err().is_some() {
        return Ok(HashMap::new());
    }

    let config = hub.config();
    let source = config.source()?;
    Ok(HashMap::from([
        ("has_mirrors".to_string(), source.has_mirrors().to_string()),
        ("has_standby".to_string(), source.has_standby().to_string()),
    ]))
}

/// Renders the gpinitsystem configuration for the coordinator and primaries
/// of `layout`.
pub(super) fn gpinitsystem_config(
    layout: &TargetLayout,
    use_hba_hostnames: bool,
    checkpoint_segments: &str,
    encoding: &str,
) -> Result<String> {
    let coordinator = layout
        .coordinator
        .as_ref()
        .ok_or_else(|| Error::Validation("source cluster contains no master segment".to_string()))?;

    let seg_prefix = coordinator_seg_prefix(&coordinator.data_dir)
        .map_err(|e| e.context("determine master segment prefix"))?;

    let entry = |seg: &SegConfig| {
        format!(
            "{}~{}~{}~{}~{}",
            seg.hostname,
            seg.port,
            seg.data_dir.display(),
            seg.dbid,
            seg.content_id
        )
    };

    let mut lines = vec![
        r#"ARRAY_NAME="gp_upgrade cluster""#.to_string(),
        format!("SEG_PREFIX={}", seg_prefix),
        "TRUSTED_SHELL=ssh".to_string(),
        format!("HBA_HOSTNAMES={}", if use_hba_hostnames { 1 } else { 0 }),
        format!("CHECK_POINT_SEGMENTS={}", checkpoint_segments),
        format!("ENCODING={}", encoding),
        format!("QD_PRIMARY_ARRAY={}", entry(coordinator)),
        "declare -a PRIMARY_ARRAY=(".to_string(),
    ];
    lines.extend(layout.primaries.iter().map(|seg| format!("\t{}", entry(seg))));
    lines.push(")".to_string());

    Ok(lines.join("\n"))
}

async fn select_string(hub: &Hub, psql: &Psql<'_>, sql: &str) -> Result<String> {
    psql.query(hub.runner(), sql)
        .await?
        .into_iter()
        .next()
        .and_then(|row| row.into_iter().next())
        .ok_or_else(|| Error::Validation(format!("query returned no rows: {}", sql)))
}

async fn generate_target_config(hub: &Hub) -> Result<()> {
    let config = hub.config();
    let psql = Psql::new(config.source()?)?;

    let checkpoint_segments = select_string(hub, &psql, "SELECT current_setting('checkpoint_segments') AS string")
        .await
        .map_err(|e| e.context("retrieve checkpoint segments"))?;
    let encoding = select_string(hub, &psql, "SELECT current_setting('server_encoding') AS string")
        .await
        .map_err(|e| e.context("retrieve server encoding"))?;

    let text = gpinitsystem_config(
        config.target_layout()?,
        config.use_hba_hostnames,
        &checkpoint_segments,
        &encoding,
    )?;

    let path = hub.env().gpinitsystem_config_path();
    tokio::fs::write(&path, text)
        .await
        .map_err(|e| Error::io("write gpinitsystem_config file", e))
}

/// Clears out a target cluster left by an earlier attempt so gpinitsystem
/// can start from empty directories.
async fn remove_intermediate(
    hub: &Hub,
    config: &HubConfig,
    streams: &dyn OutStreams,
    cancel: &CancellationToken,
) -> Result<()> {
    let Some(intermediate) = &config.intermediate else {
        return Ok(());
    };

    if control::is_coordinator_running(hub.runner(), intermediate.coordinator_data_dir()?).await? {
        control::stop(hub.runner(), intermediate, streams).await?;
    }

    let primaries: Vec<SegConfig> = intermediate
        .primaries()
        .values()
        .filter(|s| s.is_primary())
        .cloned()
        .collect();

    let mut errs = ErrorList::new();
    errs.push_result(cleanup::delete_segment_datadirs(hub, cancel, &primaries).await);
    errs.push_result(cleanup::delete_coordinator_datadir(
        hub,
        intermediate.coordinator_data_dir()?,
        streams,
    ));
    errs.into_result()?;

    hub.update_config(|c| {
        c.intermediate = None;
        Ok(())
    })
}

fn gpinitsystem_command(gphome: &Path, config_path: &Path, target_major: u32) -> Command {
    let gphome = control::shell_quote(&gphome.display().to_string());
    let mut script = format!(
        "source {0}/greenplum_path.sh && {0}/bin/gpinitsystem -a -I {1}",
        gphome,
        control::shell_quote(&config_path.display().to_string())
    );
    if target_major < 7 {
        script.push_str(" --ignore-warnings");
    }

    let env: Vec<(String, String)> = ["HOME", "USER", "LOGNAME"]
        .iter()
        .filter_map(|key| std::env::var(key).ok().map(|value| (key.to_string(), value)))
        .collect();

    Command::new("bash").arg("-c").arg(script).env_clear_with(env)
}

async fn init_target_cluster(hub: &Hub, streams: &dyn OutStreams, cancel: &CancellationToken) -> Result<()> {
    let config = hub.config();
    remove_intermediate(hub, &config, streams, cancel).await?;

    let version = gp_version(hub.runner(), &config.target_gphome).await?;
    let cmd = gpinitsystem_command(
        &config.target_gphome,
        &hub.env().gpinitsystem_config_path(),
        major_version(&version)?,
    );
    hub.runner()
        .run(&cmd, Some(streams))
        .await
        .map_err(|e| e.context("gpinitsystem"))?;

    let intermediate = config
        .target_layout()?
        .initial_cluster()?
        .with_gphome(&config.target_gphome)
        .with_version(version);
    intermediate.save(&hub.env().target_cluster_path())?;

    hub.update_config(|c| {
        c.intermediate = Some(intermediate.clone());
        Ok(())
    })?;

    if !config.dynamic_library_path.is_empty() {
        control::append_dynamic_library_path(
            hub.runner(),
            &intermediate,
            &config.dynamic_library_path,
            hub.logger(),
        )
        .await?;
    }

    Ok(())
}

/// Runs pg_upgrade in check mode on the coordinator and every primary at
/// once.
async fn check_upgrade(hub: &Hub, streams: &dyn OutStreams, cancel: &CancellationToken) -> Result<()> {
    let config = hub.config();
    let (coordinator, primaries) = tokio::join!(
        execute::upgrade_coordinator(hub, &config, streams, true),
        execute::upgrade_primaries(hub, &config, cancel, true),
    );

    let mut errs = ErrorList::new();
    errs.push_result(coordinator);
    errs.push_result(primaries);
    errs.into_result()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::Cluster;
    use crate::disk::{Disk, FsUsage};
    use crate::exec::{MockRunner, Output};
    use crate::hub::tests::{source_config, Fixture};
    use std::sync::Arc;

    const SEGMENT_ROWS: &str = "\
1|-1|15432|mdw|/data/qddir/demoDataDir-1|p
2|0|25432|sdw1|/data/primary/demoDataDir0|p
3|1|25433|sdw2|/data/primary/demoDataDir1|p
";

    fn database_runner(target_version: &'static str) -> MockRunner {
        MockRunner::new(move |cmd| {
            let text = cmd.to_string();
            if text.contains("gp_segment_configuration") {
                Output::success(SEGMENT_ROWS)
            } else if text.contains("checkpoint_segments") {
                Output::success("8\n")
            } else if text.contains("server_encoding") {
                Output::success("UTF8\n")
            } else if cmd.program.ends_with("gpdb6/bin/postgres") {
                Output::success("postgres (Greenplum Database) 6.20.0 build commit:abc")
            } else if cmd.program.ends_with("gpdb7/bin/postgres") {
                Output::success(format!("postgres (Greenplum Database) {} build commit:def", target_version))
            } else {
                Output::default()
            }
        })
    }

    fn request() -> InitializeRequest {
        InitializeRequest {
            source_gphome: "/usr/local/gpdb6".into(),
            target_gphome: "/usr/local/gpdb7".into(),
            source_port: 15432,
            mode: RequestedMode::Link as i32,
            disk_free_ratio: 0.2,
            ports: vec![50432, 50433, 50434],
            agent_port: 6420,
            use_hba_hostnames: true,
            dynamic_library_path: String::new(),
        }
    }

    #[test]
    fn test_gpinitsystem_config() {
        let source = crate::cluster::tests::mirrored_cluster();
        let layout = assign_datadirs_and_ports(&source, &[50432, 50433, 50434, 50435], UpgradeId::from_raw(1)).unwrap();
        let text = gpinitsystem_config(&layout, false, "8", "UTF8").unwrap();

        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], r#"ARRAY_NAME="gp_upgrade cluster""#);
        // Target directories carry the upgrade ID so they never collide
        // with the source's.
        assert_eq!(lines[1], format!("SEG_PREFIX=demoDataDir.{}.", UpgradeId::from_raw(1)));
        assert_eq!(&lines[2..6], &["TRUSTED_SHELL=ssh", "HBA_HOSTNAMES=0", "CHECK_POINT_SEGMENTS=8", "ENCODING=UTF8"]);

        let coordinator = layout.coordinator.as_ref().unwrap();
        assert_eq!(
            lines[6],
            format!("QD_PRIMARY_ARRAY=mdw~50432~{}~1~-1", coordinator.data_dir.display())
        );
        assert_eq!(lines[7], "declare -a PRIMARY_ARRAY=(");
        assert_eq!(lines.len(), 8 + layout.primaries.len() + 1);
        assert!(lines[8].starts_with("\tsdw1~"));
        assert!(lines[8].ends_with("~2~0"));
        assert_eq!(*lines.last().unwrap(), ")");
    }

    #[test]
    fn test_gpinitsystem_config_needs_coordinator() {
        let err = gpinitsystem_config(&TargetLayout::default(), true, "8", "UTF8").unwrap_err();
        assert_eq!(err.to_string(), "source cluster contains no master segment");
    }

    #[test]
    fn test_gpinitsystem_command() {
        let cmd = gpinitsystem_command(Path::new("/usr/local/gpdb6"), Path::new("/state/gpinitsystem_config"), 6);
        assert_eq!(
            cmd.args[1],
            "source /usr/local/gpdb6/greenplum_path.sh && /usr/local/gpdb6/bin/gpinitsystem -a -I /state/gpinitsystem_config --ignore-warnings"
        );

        let cmd = gpinitsystem_command(Path::new("/usr/local/gpdb7"), Path::new("/state/gpinitsystem_config"), 7);
        assert!(!cmd.args[1].contains("--ignore-warnings"));
    }

    #[tokio::test]
    async fn test_save_source_cluster_config() {
        let f = Fixture::new(database_runner("7.1.0"), HubConfig::new());
        save_source_cluster_config(&f.hub, &request()).await.unwrap();

        let config = HubConfig::load(&f.hub.env().config_path()).unwrap();
        assert_eq!(config.mode, Mode::Link);
        assert_eq!(config.agent_port, 6420);
        assert_eq!(config.ports, vec![50432, 50433, 50434]);
        assert!(config.use_hba_hostnames);
        assert_eq!(config.source().unwrap().version, "6.20.0");
        assert_eq!(config.target_layout().unwrap().primaries.len(), 2);
        assert_eq!(config.target_layout().unwrap().coordinator.as_ref().unwrap().port, 50432);
        assert!(f.hub.env().source_cluster_path().exists());
    }

    #[tokio::test]
    async fn test_save_source_cluster_config_validates_request() {
        let f = Fixture::new(database_runner("7.1.0"), HubConfig::new());

        let mut req = request();
        req.ports = vec![70000];
        let err = save_source_cluster_config(&f.hub, &req).await.unwrap_err();
        assert_eq!(err.to_string(), "port 70000 is out of range");

        let mut req = request();
        req.disk_free_ratio = 1.5;
        let err = save_source_cluster_config(&f.hub, &req).await.unwrap_err();
        assert!(err.to_string().contains("not between 0.0 and 1.0"));
        assert!(f.runner.calls().is_empty());
    }

    struct FullDisk;

    impl Disk for FullDisk {
        fn filesystems(&self) -> Result<Vec<PathBuf>> {
            Ok(vec![PathBuf::from("/")])
        }

        fn usage(&self, _path: &Path) -> Result<FsUsage> {
            Ok(FsUsage { used: 90, avail: 10 })
        }

        fn device(&self, _path: &Path) -> Result<u64> {
            Ok(1)
        }
    }

    #[tokio::test]
    async fn test_check_disk_space_reports_coordinator_host() {
        let coordinator = crate::cluster::tests::mirrored_cluster().coordinator().unwrap().clone();
        let source = Cluster::new(vec![coordinator]).unwrap().with_gphome("/usr/local/gpdb6");
        let config = HubConfig::new().with_source(source);

        let mut f = Fixture::new(MockRunner::succeeding(), config);
        f.hub = f.hub.clone().with_disk(Arc::new(FullDisk));

        let err = check_disk_space(&f.hub, 0.5, &CancellationToken::new()).await.unwrap_err();
        match err {
            Error::DiskSpace(err) => {
                assert_eq!(err.failures().len(), 1);
                assert_eq!(err.failures()[0].host, "mdw");
                assert_eq!(err.failures()[0].filesystem, "/");
                assert_eq!(err.failures()[0].required, 50);
            }
            other => panic!("unexpected error {:?}", other),
        }

        check_disk_space(&f.hub, 0.05, &CancellationToken::new()).await.unwrap();
    }

    #[tokio::test]
    async fn test_init_target_cluster_records_intermediate() {
        let mut config = source_config().with_upgrade_id(UpgradeId::from_raw(9));
        config.target_layout =
            Some(assign_datadirs_and_ports(config.source().unwrap(), &[], config.upgrade_id).unwrap());
        let f = Fixture::new(database_runner("7.1.0"), config);

        init_target_cluster(&f.hub, &crate::step::stream::DevNullStream, &CancellationToken::new())
            .await
            .unwrap();

        let init = f.runner.calls_matching("gpinitsystem");
        assert_eq!(init.len(), 1);
        assert!(init[0].clear_env);
        assert!(!init[0].args[1].contains("--ignore-warnings"));

        let intermediate = f.hub.config().intermediate.unwrap();
        assert_eq!(intermediate.version, "7.1.0");
        assert_eq!(intermediate.gphome, PathBuf::from("/usr/local/gpdb7"));
        assert!(!intermediate.has_mirrors());
        assert!(!intermediate.has_standby());
        assert!(f.hub.env().target_cluster_path().exists());

        // No dynamic library path was requested.
        assert!(f.runner.calls_matching("gpconfig").is_empty());
    }

    #[tokio::test]
    async fn test_generate_target_config_writes_file() {
        let mut config = source_config().with_upgrade_id(UpgradeId::from_raw(9));
        config.target_layout =
            Some(assign_datadirs_and_ports(config.source().unwrap(), &[], config.upgrade_id).unwrap());
        let f = Fixture::new(database_runner("7.1.0"), config);

        generate_target_config(&f.hub).await.unwrap();

        let text = std::fs::read_to_string(f.hub.env().gpinitsystem_config_path()).unwrap();
        assert!(text.contains("CHECK_POINT_SEGMENTS=8\nENCODING=UTF8\n"));
    }
}
