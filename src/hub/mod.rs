//! The hub daemon. Runs on the coordinator host, drives each phase of the
//! upgrade and fans host-local work out to the agents.

mod agents;
mod cleanup;
mod execute;
mod fanout;
mod finalize;
mod initialize;
mod revert;
mod server;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use slog::{info, Logger};
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;
use tonic_reflection::server::Builder as ReflectionBuilder;

use crate::config::HubConfig;
use crate::disk::{Disk, LocalDisk};
use crate::env::Env;
use crate::error::{Error, Result};
use crate::exec::{CommandRunner, SharedRunner};
use crate::grpc::idl::{self, cli_to_hub_server::CliToHubServer};
use crate::grpc::server::{self as grpc_server, ServerHandle};
use crate::grpc::{AgentConn, AgentConnector, TcpAgentConnector};

pub use agents::{restart_agents, stop_agents};
pub use server::HubService;

/// Shared hub state. Cloning is cheap; every clone sees the same
/// configuration and agent connections.
#[derive(Clone)]
pub struct Hub {
    env: Env,
    config: Arc<RwLock<HubConfig>>,
    runner: SharedRunner,
    disk: Arc<dyn Disk>,
    connector: Option<Arc<dyn AgentConnector>>,
    agents: Arc<tokio::sync::Mutex<Option<Vec<AgentConn>>>>,
    hostname: String,
    gpupgrade_path: PathBuf,
    logger: Logger,
    shutdown: CancellationToken,
}

impl Hub {
    pub fn new(env: Env, config: HubConfig, runner: SharedRunner, logger: Logger) -> Result<Self> {
        let gpupgrade_path =
            std::env::current_exe().map_err(|e| Error::io("locating the gpupgrade executable", e))?;

        Ok(Self {
            env,
            config: Arc::new(RwLock::new(config)),
            runner,
            disk: Arc::new(LocalDisk),
            connector: None,
            agents: Arc::new(tokio::sync::Mutex::new(None)),
            hostname: crate::upgrade::hostname()?,
            gpupgrade_path,
            logger,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn with_disk(mut self, disk: Arc<dyn Disk>) -> Self {
        self.disk = disk;
        self
    }

    /// Overrides how agent hostnames resolve to connections. Without one,
    /// agents are dialed at `<hostname>:<agent_port>`.
    pub fn with_connector(mut self, connector: Arc<dyn AgentConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = hostname.into();
        self
    }

    /// Binary launched on segment hosts by `RestartAgents`.
    pub fn with_gpupgrade_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.gpupgrade_path = path.into();
        self
    }

    pub fn env(&self) -> &Env {
        &self.env
    }

    pub fn runner(&self) -> &dyn CommandRunner {
        self.runner.as_ref()
    }

    pub fn disk(&self) -> Arc<dyn Disk> {
        self.disk.clone()
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn logger(&self) -> &Logger {
        &self.logger
    }

    /// Fires when the hub has been asked to stop.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// A snapshot of the current configuration.
    pub fn config(&self) -> HubConfig {
        self.config
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Applies `f` to a copy of the configuration, persists the copy and
    /// only then makes it current. A failed save leaves the old
    /// configuration in place.
    pub fn update_config<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut HubConfig) -> Result<()>,
    {
        let mut updated = self.config();
        f(&mut updated)?;
        updated.save(&self.env.config_path())?;

        *self
            .config
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = updated;
        Ok(())
    }

    pub(crate) fn connector(&self, config: &HubConfig) -> Arc<dyn AgentConnector> {
        match &self.connector {
            Some(connector) => connector.clone(),
            None => Arc::new(TcpAgentConnector::new(
                config.agent_port,
                self.env.connection_timeout,
            )),
        }
    }

    /// Connections to the agents on every segment host, established on
    /// first use and cached until [`Hub::forget_agents`].
    pub async fn agent_conns(&self) -> Result<Vec<AgentConn>> {
        let mut cached = self.agents.lock().await;
        if let Some(conns) = cached.as_ref() {
            return Ok(conns.clone());
        }

        let config = self.config();
        let hosts = config.source()?.agent_hosts();
        let conns = self.connector(&config).connect_all(&hosts).await?;

        info!(self.logger, "connected to agents"; "hosts" => hosts.join(","));
        *cached = Some(conns.clone());
        Ok(conns)
    }

    /// Drops cached agent connections, as after agents are restarted or
    /// stopped.
    pub async fn forget_agents(&self) {
        self.agents.lock().await.take();
    }
}

/// Reads `config.json`, or starts from defaults before the first
/// initialize has written one.
pub fn load_config(env: &Env) -> Result<HubConfig> {
    let path = env.config_path();
    if !path.exists() {
        return Ok(HubConfig::default().with_hub_port(env.hub_port));
    }
    HubConfig::load(&path)
}

/// Binds `address` and serves the hub in the background. The server stops
/// on `StopServices` or [`ServerHandle::shutdown`].
pub async fn start(address: SocketAddr, hub: Hub) -> Result<ServerHandle> {
    let listener = grpc_server::listen(address).await?;

    let reflection = ReflectionBuilder::configure()
        .register_encoded_file_descriptor_set(idl::FILE_DESCRIPTOR_SET)
        .build_v1()
        .map_err(|e| Error::Config(format!("building reflection service: {}", e)))?;

    let logger = hub.logger.clone();
    let shutdown = hub.shutdown.clone();

    let router = Server::builder()
        .add_service(CliToHubServer::new(HubService::new(hub)))
        .add_service(reflection);

    grpc_server::spawn(listener, router, shutdown, logger)
}
