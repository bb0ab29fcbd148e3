//! The agent daemon: a stateless gRPC server on every segment host that
//! performs filesystem and subprocess work for the hub.

pub mod conf;
pub mod directories;
mod handlers;
pub mod upgrade_primaries;

use std::net::SocketAddr;
use std::sync::Arc;

use slog::Logger;
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;
use tonic_reflection::server::Builder as ReflectionBuilder;

use crate::disk::Disk;
use crate::env::Env;
use crate::error::{Error, Result};
use crate::exec::SharedRunner;
use crate::grpc::idl::{self, agent_server::AgentServer};
use crate::grpc::server::{self, ServerHandle};

pub use handlers::AgentService;

/// Binds `address` and serves the agent in the background. Binding happens
/// before this returns, so a port already in use is reported here.
pub async fn start(
    address: SocketAddr,
    env: Env,
    runner: SharedRunner,
    disk: Arc<dyn Disk>,
    logger: Logger,
) -> Result<ServerHandle> {
    // Agents start before anything else has touched the state directory
    // on their host.
    tokio::fs::create_dir_all(&env.state_dir)
        .await
        .map_err(|e| Error::io(format!("failed to create state directory {:?}", env.state_dir), e))?;

    let listener = server::listen(address).await?;

    let hostname = crate::upgrade::hostname()?;
    let shutdown = CancellationToken::new();
    let service = AgentService::new(env, hostname, runner, disk, logger.clone(), shutdown.clone());

    let reflection = ReflectionBuilder::configure()
        .register_encoded_file_descriptor_set(idl::FILE_DESCRIPTOR_SET)
        .build_v1()
        .map_err(|e| Error::Config(format!("building reflection service: {}", e)))?;

    let router = Server::builder()
        .add_service(AgentServer::new(service))
        .add_service(reflection);

    server::spawn(listener, router, shutdown, logger)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::FsUsage;
    use crate::exec::MockRunner;
    use crate::grpc::connect_channel;
    use crate::grpc::idl::agent_client::AgentClient;
    use crate::grpc::idl::*;
    use std::path::{Path, PathBuf};
    use std::time::Duration;

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

    async fn start_agent(state: &Path) -> (ServerHandle, AgentClient<tonic::transport::Channel>) {
        let port = port_check::free_local_port().unwrap();
        let address: SocketAddr = format!("127.0.0.1:{}", port).parse().unwrap();

        let handle = start(
            address,
            Env::with_state_dir(state),
            Arc::new(MockRunner::succeeding()),
            Arc::new(FullDisk),
            crate::logging::discard(),
        )
        .await
        .unwrap();

        let channel = connect_channel(&address.to_string(), Duration::from_secs(2))
            .await
            .unwrap();
        (handle, AgentClient::new(channel))
    }

    #[tokio::test]
    async fn test_start_creates_state_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let state = tmp.path().join("state");
        let (handle, _client) = start_agent(&state).await;

        assert!(state.is_dir());
        handle.shutdown();
        handle.wait().await.unwrap();
    }

    #[tokio::test]
    async fn test_port_in_use() {
        let tmp = tempfile::tempdir().unwrap();
        let (handle, _client) = start_agent(tmp.path()).await;

        let err = start(
            handle.address(),
            Env::with_state_dir(tmp.path()),
            Arc::new(MockRunner::succeeding()),
            Arc::new(FullDisk),
            crate::logging::discard(),
        )
        .await
        .err()
        .unwrap();
        assert!(err.to_string().starts_with("failed to listen on"));
    }

    #[tokio::test]
    async fn test_check_disk_space_over_rpc() {
        let tmp = tempfile::tempdir().unwrap();
        let (_handle, mut client) = start_agent(tmp.path()).await;

        let reply = client
            .check_disk_space(CheckDiskSpaceRequest {
                ratio: 0.5,
                dirs: vec!["/data/primary".into()],
            })
            .await
            .unwrap()
            .into_inner();

        let usage = &reply.failed["/"];
        assert_eq!(usage.available, 10);
        assert_eq!(usage.required, 50);

        let status = client
            .check_disk_space(CheckDiskSpaceRequest {
                ratio: 1.5,
                dirs: vec![],
            })
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);
    }

    #[tokio::test]
    async fn test_errors_become_statuses() {
        let tmp = tempfile::tempdir().unwrap();
        let (_handle, mut client) = start_agent(tmp.path()).await;

        let status = client
            .rename_tablespaces(RenameTablespacesRequest {
                pairs: vec![rename_tablespaces_request::RenamePair {
                    source: "/does/not/exist".into(),
                    destination: "/dev/null/ts".into(),
                }],
            })
            .await
            .unwrap_err();

        assert_eq!(status.code(), tonic::Code::Internal);
        assert!(status.message().starts_with("2 errors occurred"));
    }

    #[tokio::test]
    async fn test_stop_agent() {
        let tmp = tempfile::tempdir().unwrap();
        let (handle, mut client) = start_agent(tmp.path()).await;

        client.stop_agent(StopAgentRequest {}).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle.wait())
            .await
            .unwrap()
            .unwrap();
    }
}
