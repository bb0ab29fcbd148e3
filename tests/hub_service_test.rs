use std::sync::Arc;
use std::time::Duration;

use gpupgrade::cli::ui::ui_loop;
use gpupgrade::config::HubConfig;
use gpupgrade::disk::LocalDisk;
use gpupgrade::env::Env;
use gpupgrade::exec::MockRunner;
use gpupgrade::grpc::idl::agent_client::AgentClient;
use gpupgrade::grpc::idl::{
    ExecuteRequest, GetConfigRequest, SetConfigRequest, StopAgentRequest, StopServicesRequest,
};
use gpupgrade::grpc::{connect_channel, connect_hub, ServerHandle};
use gpupgrade::hub::{self, Hub};
use gpupgrade::step::stream::BufferedStreams;
use gpupgrade::logging;

/// A hub on a free local port over a temporary state directory.
async fn start_hub(config: HubConfig) -> (tempfile::TempDir, Env, ServerHandle) {
    let port = port_check::free_local_port().expect("free port");
    let dir = tempfile::tempdir().unwrap();
    let env = Env::with_state_dir(dir.path().join("state"))
        .with_log_dir(dir.path().join("logs"))
        .with_hub_port(port);
    std::fs::create_dir_all(&env.state_dir).unwrap();

    let config = config.with_hub_port(port);
    config.save(&env.config_path()).unwrap();

    let hub = Hub::new(env.clone(), config, Arc::new(MockRunner::succeeding()), logging::discard()).unwrap();
    let handle = hub::start(format!("127.0.0.1:{}", port).parse().unwrap(), hub)
        .await
        .unwrap();

    (dir, env, handle)
}

#[tokio::test]
async fn test_config_round_trip() {
    let config = HubConfig::new().with_gphomes("/usr/local/gpdb6", "/usr/local/gpdb7");
    let (_dir, env, handle) = start_hub(config).await;

    let mut client = connect_hub(&env).await.unwrap();

    let value = client
        .get_config(GetConfigRequest {
            name: "source-gphome".into(),
        })
        .await
        .unwrap()
        .into_inner()
        .value;
    assert_eq!(value, "/usr/local/gpdb6");

    client
        .set_config(SetConfigRequest {
            name: "target-gphome".into(),
            value: "/opt/gpdb7".into(),
        })
        .await
        .unwrap();

    let saved = HubConfig::load(&env.config_path()).unwrap();
    assert_eq!(saved.target_gphome, std::path::PathBuf::from("/opt/gpdb7"));

    let unknown = client
        .get_config(GetConfigRequest { name: "bogus".into() })
        .await;
    assert!(unknown.is_err());

    handle.shutdown();
    handle.wait().await.unwrap();
}

#[tokio::test]
async fn test_failed_phase_surfaces_through_ui() {
    let (_dir, env, handle) = start_hub(HubConfig::new()).await;

    let mut client = connect_hub(&env).await.unwrap();
    let stream = client.execute(ExecuteRequest {}).await.unwrap().into_inner();

    let console = BufferedStreams::new();
    let (data, result) = ui_loop(Box::pin(stream), false, &console).await;

    assert!(result.is_err());
    assert!(data.is_empty());

    handle.shutdown();
    handle.wait().await.unwrap();
}

#[tokio::test]
async fn test_stop_services_stops_the_hub() {
    let (_dir, env, handle) = start_hub(HubConfig::new()).await;

    let mut client = connect_hub(&env).await.unwrap();
    client.stop_services(StopServicesRequest {}).await.unwrap();

    tokio::time::timeout(Duration::from_secs(5), handle.wait())
        .await
        .expect("hub did not stop")
        .unwrap();

    assert!(connect_hub(&env).await.is_err());
}

#[tokio::test]
async fn test_agent_stops_on_request() {
    let dir = tempfile::tempdir().unwrap();
    let env = Env::with_state_dir(dir.path().join("state")).with_log_dir(dir.path().join("logs"));

    let handle = gpupgrade::agent::start(
        "127.0.0.1:0".parse().unwrap(),
        env.clone(),
        Arc::new(MockRunner::succeeding()),
        Arc::new(LocalDisk),
        logging::discard(),
    )
    .await
    .unwrap();

    // The agent creates its state directory before listening.
    assert!(env.state_dir.is_dir());

    let channel = connect_channel(&handle.address().to_string(), Duration::from_secs(2))
        .await
        .unwrap();
    AgentClient::new(channel)
        .stop_agent(StopAgentRequest {})
        .await
        .unwrap();

    tokio::time::timeout(Duration::from_secs(5), handle.wait())
        .await
        .expect("agent did not stop")
        .unwrap();
}
