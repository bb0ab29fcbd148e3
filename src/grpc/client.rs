use std::time::Duration;

use tonic::transport::{Channel, Endpoint};

use crate::env::Env;
use crate::error::{Error, Result};
use crate::grpc::idl::cli_to_hub_client::CliToHubClient;

/// Dial `address` (`host:port`) over plaintext HTTP/2, giving up after
/// `timeout`.
pub async fn connect_channel(address: &str, timeout: Duration) -> Result<Channel> {
    let endpoint = Endpoint::from_shared(format!("http://{}", address))
        .map_err(|e| Error::Config(format!("invalid address {:?}: {}", address, e)))?
        .connect_timeout(timeout);

    Ok(endpoint.connect().await?)
}

/// Client for the hub listening on this host.
pub async fn connect_hub(env: &Env) -> Result<CliToHubClient<Channel>> {
    let channel = connect_channel(&env.hub_address(), env.connection_timeout)
        .await
        .map_err(|e| {
            Error::Config(format!(
                "could not connect to the upgrade hub (did you run 'gpupgrade initialize'?): {}",
                e
            ))
        })?;

    Ok(CliToHubClient::new(channel))
}
