use std::path::PathBuf;
use std::sync::Arc;

use slog::{info, warn, Logger};
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status};

use crate::agent::conf::{self, PortChange, RecoveryConnection, ReplicationEntry};
use crate::agent::directories::{self, RenamePair};
use crate::agent::upgrade_primaries::upgrade_primaries;
use crate::disk::{check_usage, Disk};
use crate::env::Env;
use crate::error::{Error, Result};
use crate::exec::SharedRunner;
use crate::fanout;
use crate::grpc::idl::agent_server::Agent;
use crate::grpc::idl::*;
use crate::rsync::Rsync;

/// Handlers for the `Agent` service on one segment host.
pub struct AgentService {
    env: Env,
    hostname: String,
    runner: SharedRunner,
    disk: Arc<dyn Disk>,
    logger: Logger,
    shutdown: CancellationToken,
}

impl AgentService {
    pub fn new(
        env: Env,
        hostname: impl Into<String>,
        runner: SharedRunner,
        disk: Arc<dyn Disk>,
        logger: Logger,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            env,
            hostname: hostname.into(),
            runner,
            disk,
            logger,
            shutdown,
        }
    }

    /// Logs a failed handler before it becomes a gRPC status.
    fn reply<T>(&self, rpc: &str, result: Result<()>, reply: T) -> std::result::Result<Response<T>, Status> {
        match result {
            Ok(()) => Ok(Response::new(reply)),
            Err(err) => {
                warn!(self.logger, "request failed"; "rpc" => rpc, "error" => %err);
                Err(err.into())
            }
        }
    }
}

fn paths(dirs: Vec<String>) -> Vec<PathBuf> {
    dirs.into_iter().map(PathBuf::from).collect()
}

fn port_changes(options: Vec<UpdateFileConfOptions>) -> Vec<PortChange> {
    options
        .into_iter()
        .map(|o| PortChange {
            path: PathBuf::from(o.path),
            current: o.current_value,
            updated: o.updated_value,
        })
        .collect()
}

#[tonic::async_trait]
impl Agent for AgentService {
    async fn check_disk_space(
        &self,
        request: Request<CheckDiskSpaceRequest>,
    ) -> std::result::Result<Response<CheckDiskSpaceReply>, Status> {
        let req = request.into_inner();
        info!(self.logger, "checking disk space"; "ratio" => req.ratio, "dirs" => req.dirs.len());

        if !(0.0..=1.0).contains(&req.ratio) {
            return Err(Status::invalid_argument(format!(
                "disk free ratio {} is not between 0.0 and 1.0",
                req.ratio
            )));
        }

        let disk = self.disk.clone();
        let dirs = paths(req.dirs);
        let result = tokio::task::spawn_blocking(move || check_usage(disk.as_ref(), req.ratio, &dirs))
            .await
            .map_err(Error::from)
            .and_then(|r| r);

        match result {
            Ok(failed) => Ok(Response::new(CheckDiskSpaceReply {
                failed: failed.into_iter().collect(),
            })),
            Err(err) => {
                warn!(self.logger, "request failed"; "rpc" => "CheckDiskSpace", "error" => %err);
                Err(err.into())
            }
        }
    }

    async fn create_data_directories(
        &self,
        request: Request<CreateDataDirectoriesRequest>,
    ) -> std::result::Result<Response<CreateDataDirectoriesReply>, Status> {
        let req = request.into_inner();
        info!(self.logger, "creating data directories"; "count" => req.datadirs.len());

        let result = directories::create_data_directories(paths(req.datadirs)).await;
        self.reply("CreateDataDirectories", result, CreateDataDirectoriesReply {})
    }

    async fn delete_data_directories(
        &self,
        request: Request<DeleteDataDirectoriesRequest>,
    ) -> std::result::Result<Response<DeleteDataDirectoriesReply>, Status> {
        let req = request.into_inner();
        info!(self.logger, "deleting data directories"; "count" => req.datadirs.len());

        let result =
            directories::delete_data_directories(paths(req.datadirs), req.required_files, self.hostname.clone())
                .await;
        self.reply("DeleteDataDirectories", result, DeleteDataDirectoriesReply {})
    }

    async fn delete_state_directory(
        &self,
        _request: Request<DeleteStateDirectoryRequest>,
    ) -> std::result::Result<Response<DeleteStateDirectoryReply>, Status> {
        info!(self.logger, "deleting state directory"; "dir" => %self.env.state_dir.display());

        let result =
            directories::delete_state_directory(self.env.state_dir.clone(), self.hostname.clone()).await;
        self.reply("DeleteStateDirectory", result, DeleteStateDirectoryReply {})
    }

    async fn rename_directories(
        &self,
        request: Request<RenameDirectoriesRequest>,
    ) -> std::result::Result<Response<RenameDirectoriesReply>, Status> {
        let pairs: Vec<RenamePair> = request
            .into_inner()
            .dirs
            .into_iter()
            .map(|d| RenamePair {
                source: PathBuf::from(d.source),
                target: PathBuf::from(d.target),
                rename_target: d.rename_target,
            })
            .collect();
        info!(self.logger, "renaming directories"; "count" => pairs.len());

        let result = directories::rename_directories(pairs).await;
        self.reply("RenameDirectories", result, RenameDirectoriesReply {})
    }

    async fn archive_log_directory(
        &self,
        request: Request<ArchiveLogDirectoryRequest>,
    ) -> std::result::Result<Response<ArchiveLogDirectoryReply>, Status> {
        let new_dir = PathBuf::from(request.into_inner().new_dir);
        info!(self.logger, "archiving log directory"; "new_dir" => %new_dir.display());

        let result = directories::archive_log_directory(&self.env.log_dir, &new_dir).await;
        self.reply("ArchiveLogDirectory", result, ArchiveLogDirectoryReply {})
    }

    async fn rename_tablespaces(
        &self,
        request: Request<RenameTablespacesRequest>,
    ) -> std::result::Result<Response<RenameTablespacesReply>, Status> {
        let pairs = request
            .into_inner()
            .pairs
            .into_iter()
            .map(|p| (PathBuf::from(p.source), PathBuf::from(p.destination)))
            .collect();

        let result = directories::rename_tablespaces(&self.hostname, pairs).await;
        self.reply("RenameTablespaces", result, RenameTablespacesReply {})
    }

    async fn add_replication_entries(
        &self,
        request: Request<AddReplicationEntriesRequest>,
    ) -> std::result::Result<Response<AddReplicationEntriesReply>, Status> {
        let entries = request
            .into_inner()
            .entries
            .into_iter()
            .map(|e| ReplicationEntry {
                data_dir: PathBuf::from(e.data_dir),
                user: e.user,
                host_addrs: e.host_addrs,
            })
            .collect();

        let result = conf::add_replication_entries(entries).await;
        self.reply("AddReplicationEntries", result, AddReplicationEntriesReply {})
    }

    async fn create_recovery_conf(
        &self,
        request: Request<CreateRecoveryConfRequest>,
    ) -> std::result::Result<Response<CreateRecoveryConfReply>, Status> {
        let connections = request
            .into_inner()
            .connections
            .into_iter()
            .map(|c| RecoveryConnection {
                mirror_data_dir: PathBuf::from(c.mirror_data_dir),
                user: c.user,
                primary_host: c.primary_host,
                primary_port: c.primary_port,
            })
            .collect();

        let result = conf::create_recovery_conf(connections).await;
        self.reply("CreateRecoveryConf", result, CreateRecoveryConfReply {})
    }

    async fn update_postgresql_conf(
        &self,
        request: Request<UpdatePostgresqlConfRequest>,
    ) -> std::result::Result<Response<UpdatePostgresqlConfReply>, Status> {
        let changes = port_changes(request.into_inner().options);
        let result = conf::update_postgresql_conf(changes).await;
        self.reply("UpdatePostgresqlConf", result, UpdatePostgresqlConfReply {})
    }

    async fn update_recovery_conf(
        &self,
        request: Request<UpdateRecoveryConfRequest>,
    ) -> std::result::Result<Response<UpdateRecoveryConfReply>, Status> {
        let changes = port_changes(request.into_inner().options);
        let result = conf::update_recovery_conf(changes).await;
        self.reply("UpdateRecoveryConf", result, UpdateRecoveryConfReply {})
    }

    async fn restore_pg_control(
        &self,
        request: Request<RestorePgControlRequest>,
    ) -> std::result::Result<Response<RestorePgControlReply>, Status> {
        let dirs = paths(request.into_inner().datadirs);
        let result = conf::restore_pg_controls(dirs).await;
        self.reply("RestorePgControl", result, RestorePgControlReply {})
    }

    async fn upgrade_primaries(
        &self,
        request: Request<UpgradePrimariesRequest>,
    ) -> std::result::Result<Response<UpgradePrimariesReply>, Status> {
        let req = request.into_inner();
        let substep = if req.check_only {
            Substep::CheckUpgrade
        } else {
            Substep::UpgradePrimaries
        };
        info!(self.logger, "agent starting substep"; "substep" => substep.as_str_name());

        let result = upgrade_primaries(self.runner.as_ref(), &self.env.state_dir, &self.hostname, req).await;
        self.reply("UpgradePrimaries", result, UpgradePrimariesReply {})
    }

    async fn rsync(
        &self,
        request: Request<RsyncRequest>,
    ) -> std::result::Result<Response<RsyncReply>, Status> {
        let options = request.into_inner().options;
        let runner = self.runner.as_ref();
        let hostname = self.hostname.as_str();

        let result = fanout::for_each(options, |opts| async move {
            let destination = opts.destination.clone();
            Rsync::new()
                .sources(opts.sources)
                .destination(opts.destination)
                .destination_host(opts.destination_host)
                .options(opts.options)
                .excludes(opts.exclude_patterns)
                .run(runner, None)
                .await
                .map_err(|e| e.context(format!("rsync on host {} to {}", hostname, destination)))
        })
        .await;

        self.reply("Rsync", result, RsyncReply {})
    }

    async fn stop_agent(
        &self,
        _request: Request<StopAgentRequest>,
    ) -> std::result::Result<Response<StopAgentReply>, Status> {
        info!(self.logger, "stopping agent");
        self.shutdown.cancel();
        Ok(Response::new(StopAgentReply {}))
    }
}
