//! Listening and graceful shutdown shared by the hub and agent daemons.

use std::net::SocketAddr;

use slog::{info, Logger};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::server::Router;

use crate::error::{Error, Result};

/// A running gRPC server. Dropping the handle leaves the server running.
pub struct ServerHandle {
    address: SocketAddr,
    shutdown: CancellationToken,
    task: JoinHandle<Result<()>>,
}

impl ServerHandle {
    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// Trigger graceful shutdown of the server
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Resolves once the server stops, either through
    /// [`ServerHandle::shutdown`] or the token it was spawned with.
    pub async fn wait(self) -> Result<()> {
        self.task.await?
    }
}

/// Binds `address`. A port already in use is reported here, before any
/// service state is built.
pub async fn listen(address: SocketAddr) -> Result<TcpListener> {
    TcpListener::bind(address)
        .await
        .map_err(|e| Error::io(format!("failed to listen on {}", address), e))
}

/// Serves `router` on `listener` until `shutdown` fires.
pub fn spawn(
    listener: TcpListener,
    router: Router,
    shutdown: CancellationToken,
    logger: Logger,
) -> Result<ServerHandle> {
    let address = listener
        .local_addr()
        .map_err(|e| Error::io("reading listener address", e))?;

    info!(logger, "listening"; "address" => %address);

    let signal = shutdown.clone();
    let task = tokio::spawn(async move {
        router
            .serve_with_incoming_shutdown(TcpListenerStream::new(listener), signal.cancelled_owned())
            .await?;

        info!(logger, "server stopped"; "address" => %address);
        Ok(())
    });

    Ok(ServerHandle {
        address,
        shutdown,
        task,
    })
}
