//! Starting and stopping the agent daemons on the segment hosts.

use futures::future::join_all;
use slog::{debug, info};
use tonic::Code;

use crate::cluster::control::shell_quote;
use crate::error::{Error, ErrorList, Result};
use crate::exec::Command;
use crate::grpc::idl::StopAgentRequest;
use crate::hub::Hub;

/// `<gpupgrade> agent --daemonize ...`, quoted for the remote shell.
fn agent_command_line(hub: &Hub, port: u16) -> String {
    let gpupgrade = hub.gpupgrade_path.display().to_string();
    let state_dir = hub.env().state_dir.display().to_string();
    let port = port.to_string();

    [
        gpupgrade.as_str(),
        "agent",
        "--daemonize",
        "--port",
        port.as_str(),
        "--state-directory",
        state_dir.as_str(),
    ]
    .iter()
    .map(|arg| shell_quote(arg))
    .collect::<Vec<_>>()
    .join(" ")
}

/// Starts an agent over ssh on every segment host whose agent does not
/// already answer. Returns the hosts that were started.
pub async fn restart_agents(hub: &Hub) -> Result<Vec<String>> {
    let config = hub.config();
    let hosts = config.source()?.agent_hosts();
    let connector = hub.connector(&config);
    let remote = format!("bash -c {}", shell_quote(&agent_command_line(hub, config.agent_port)));

    let connector = &connector;
    let remote = &remote;
    let attempts = join_all(hosts.iter().map(|host| async move {
        if connector.connect(host).await.is_ok() {
            debug!(hub.logger(), "agent already running"; "host" => host);
            return Ok(None);
        }

        let cmd = Command::new("ssh").arg("-n").arg(host.clone()).arg(remote.clone());
        hub.runner()
            .run(&cmd, None)
            .await
            .map_err(|e| Error::agent(host.clone(), e.context("starting agent")))?;

        info!(hub.logger(), "started agent"; "host" => host);
        Ok(Some(host.clone()))
    }))
    .await;

    let mut errs = ErrorList::new();
    let mut restarted = Vec::new();
    for attempt in attempts {
        if let Some(Some(host)) = errs.push_result(attempt) {
            restarted.push(host);
        }
    }
    errs.into_result()?;

    hub.forget_agents().await;
    Ok(restarted)
}

/// Asks every reachable agent to exit. Hosts whose agent is already gone
/// are not errors.
pub async fn stop_agents(hub: &Hub) -> Result<()> {
    let config = hub.config();
    let hosts = match config.source() {
        Ok(source) => source.agent_hosts(),
        // Nothing was initialized, so no agents were started.
        Err(_) => return Ok(()),
    };
    let connector = hub.connector(&config);

    let connector = &connector;
    let results = join_all(hosts.iter().map(|host| async move {
        let mut conn = match connector.connect(host).await {
            Ok(conn) => conn,
            Err(err) => {
                debug!(hub.logger(), "agent not reachable"; "host" => host, "error" => %err);
                return Ok(());
            }
        };

        match conn.client.stop_agent(StopAgentRequest {}).await {
            Ok(_) => Ok(()),
            Err(status) if status.code() == Code::Unavailable => Ok(()),
            Err(status) => Err(Error::agent(host.clone(), status.into())),
        }
    }))
    .await;

    hub.forget_agents().await;
    results
        .into_iter()
        .filter_map(Result::err)
        .collect::<ErrorList>()
        .into_result()
}
