//! Hub-side connections to the per-host agents.

use std::collections::HashMap;
use std::time::Duration;

use tonic::transport::Channel;

use crate::error::{Error, Result};
use crate::grpc::client::connect_channel;
use crate::grpc::idl::agent_client::AgentClient;

/// A live connection to the agent on one host.
#[derive(Debug, Clone)]
pub struct AgentConn {
    pub hostname: String,
    pub client: AgentClient<Channel>,
}

/// Resolves a segment hostname to a connected agent client.
#[tonic::async_trait]
pub trait AgentConnector: Send + Sync {
    async fn connect(&self, hostname: &str) -> Result<AgentConn>;

    /// Connects to every host; any failure fails the whole set.
    async fn connect_all(&self, hostnames: &[String]) -> Result<Vec<AgentConn>> {
        let attempts = futures::future::join_all(hostnames.iter().map(|h| self.connect(h))).await;
        attempts.into_iter().collect()
    }
}

/// Agents listening on `<hostname>:<port>`.
#[derive(Debug, Clone)]
pub struct TcpAgentConnector {
    port: u16,
    timeout: Duration,
}

impl TcpAgentConnector {
    pub fn new(port: u16, timeout: Duration) -> Self {
        Self { port, timeout }
    }
}

#[tonic::async_trait]
impl AgentConnector for TcpAgentConnector {
    async fn connect(&self, hostname: &str) -> Result<AgentConn> {
        let address = format!("{}:{}", hostname, self.port);
        let channel = connect_channel(&address, self.timeout)
            .await
            .map_err(|e| Error::agent(hostname, e.context(format!("connecting to agent at {}", address))))?;

        Ok(AgentConn {
            hostname: hostname.to_string(),
            client: AgentClient::new(channel),
        })
    }
}

/// Resolves hosts through a fixed table, for agents that do not listen on
/// their segment hostname (single-machine demo clusters and tests).
#[derive(Debug, Clone, Default)]
pub struct MappedAgentConnector {
    addresses: HashMap<String, String>,
    timeout: Duration,
}

impl MappedAgentConnector {
    pub fn new(timeout: Duration) -> Self {
        Self {
            addresses: HashMap::new(),
            timeout,
        }
    }

    pub fn with_host(mut self, hostname: impl Into<String>, address: impl Into<String>) -> Self {
        self.addresses.insert(hostname.into(), address.into());
        self
    }
}

#[tonic::async_trait]
impl AgentConnector for MappedAgentConnector {
    async fn connect(&self, hostname: &str) -> Result<AgentConn> {
        let address = self.addresses.get(hostname).ok_or_else(|| {
            Error::agent(hostname, Error::Config("no agent address known for host".to_string()))
        })?;

        let channel = connect_channel(address, self.timeout)
            .await
            .map_err(|e| Error::agent(hostname, e))?;

        Ok(AgentConn {
            hostname: hostname.to_string(),
            client: AgentClient::new(channel),
        })
    }
}
