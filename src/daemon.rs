//! Backgrounding the hub and agent.
//!
//! `--daemonize` re-executes the current binary with `--daemon` and relays
//! the child's output until the child closes its standard streams. The
//! child does that once it is listening, so by the time the parent exits
//! the server either accepts connections or has already failed.
//!
//! The child writes to stderr only when it is about to exit without
//! detaching. Any stderr output makes the parent wait for the child's exit
//! status before reporting.

use std::fs::OpenOptions;
use std::io::IsTerminal;
use std::os::fd::AsRawFd;
use std::process::Stdio;
use std::time::Duration;

use nix::unistd::{dup2, setsid};
use slog::{info, Logger};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::Command;
use tokio::signal::unix::{signal, SignalKind};

use crate::error::{Error, Result};
use crate::grpc::ServerHandle;

pub const DAEMONIZE_FLAG: &str = "--daemonize";
pub const DAEMON_FLAG: &str = "--daemon";

/// How long the parent waits for a child that reported an error to exit.
pub const DAEMON_EXIT_TIMEOUT: Duration = Duration::from_secs(2);

/// The child's arguments: the parent's, with `--daemonize` swapped for
/// `--daemon`.
pub fn daemon_args<I>(args: I) -> Vec<String>
where
    I: IntoIterator<Item = String>,
{
    args.into_iter()
        .map(|arg| if arg == DAEMONIZE_FLAG { DAEMON_FLAG.to_string() } else { arg })
        .collect()
}

/// Re-executes this binary as a daemon and relays its startup output.
/// Returns once the daemon is serving.
pub async fn daemonize() -> Result<()> {
    let exe = std::env::current_exe().map_err(|e| Error::io("locating the gpupgrade executable", e))?;
    let args = daemon_args(std::env::args().skip(1));

    let mut command = Command::new(exe);
    command.args(args);

    wait_for_daemon(command, tokio::io::stdout(), tokio::io::stderr(), DAEMON_EXIT_TIMEOUT).await
}

async fn relay<R, W>(mut from: R, mut to: W) -> Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    tokio::io::copy(&mut from, &mut to)
        .await
        .map_err(|e| Error::io("Could not copy from child pipe", e))
}

/// Starts `command` and copies its stdout and stderr to `out` and `err`
/// until both close.
pub async fn wait_for_daemon<O, E>(mut command: Command, out: O, err: E, timeout: Duration) -> Result<()>
where
    O: AsyncWrite + Unpin,
    E: AsyncWrite + Unpin,
{
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = command
        .spawn()
        .map_err(|e| Error::io("starting daemon process", e))?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| Error::Validation("daemon stdout not captured".to_string()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| Error::Validation("daemon stderr not captured".to_string()))?;

    let (_, errput) = tokio::try_join!(relay(stdout, out), relay(stderr, err))?;
    if errput == 0 {
        return Ok(());
    }

    match tokio::time::timeout(timeout, child.wait()).await {
        Ok(status) => {
            let status = status.map_err(|e| Error::io("waiting for daemon process", e))?;
            if status.success() {
                Ok(())
            } else {
                Err(Error::subprocess("gpupgrade", status.code().unwrap_or(1), ""))
            }
        }
        Err(_) => Err(Error::Validation(
            "the daemon process reported an error but did not immediately exit. Review the logs before continuing"
                .to_string(),
        )),
    }
}

/// Refuses `--daemon` when run by hand from a terminal.
pub fn check_daemon_flag() -> Result<()> {
    if std::io::stdout().is_terminal() {
        return Err(Error::Validation(
            "--daemon is an internal option (did you mean --daemonize?)".to_string(),
        ));
    }
    Ok(())
}

/// Child side: leaves the parent's session and points stdout and stderr
/// at `/dev/null`, which lets the waiting parent exit.
pub fn detach() -> Result<()> {
    // Fails only for a process group leader, which a spawned child is not.
    let _ = setsid();

    let null = OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/null")
        .map_err(|e| Error::io("opening /dev/null", e))?;

    for target in [std::io::stdout().as_raw_fd(), std::io::stderr().as_raw_fd()] {
        dup2(null.as_raw_fd(), target)
            .map_err(|e| Error::io("redirecting standard streams", e.into()))?;
    }
    Ok(())
}

/// Serves until the server stops on its own or the process receives
/// SIGTERM or SIGINT.
pub async fn serve_until_signal(handle: ServerHandle, logger: Logger) -> Result<()> {
    let mut term = signal(SignalKind::terminate()).map_err(|e| Error::io("installing SIGTERM handler", e))?;
    let mut interrupt = signal(SignalKind::interrupt()).map_err(|e| Error::io("installing SIGINT handler", e))?;

    let shutdown = handle.shutdown_token();
    tokio::spawn(async move {
        tokio::select! {
            _ = term.recv() => {}
            _ = interrupt.recv() => {}
            _ = shutdown.cancelled() => return,
        }
        info!(logger, "received shutdown signal");
        shutdown.cancel();
    });

    handle.wait().await
}
