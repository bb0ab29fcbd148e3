//! The `CliToHub` service.
//!
//! Each phase RPC spawns a driver task that walks the phase's substeps and
//! streams progress frames back over an unbounded channel. When the CLI
//! hangs up the receiver is dropped, which cancels the phase.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

use futures::Stream;
use slog::{info, warn};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status};

use crate::config::CONFIG_KEYS;
use crate::error::{Error, ErrorList, Result};
use crate::grpc::idl::cli_to_hub_server::CliToHub;
use crate::grpc::idl::*;
use crate::hub::{agents, execute, finalize, initialize, revert, Hub};
use crate::step::stream::MessageSender;
use crate::step::Step as PhaseStep;

type MessageStream = Pin<Box<dyn Stream<Item = std::result::Result<Message, Status>> + Send>>;

/// Forwards frames to the CLI's response stream.
struct StreamSender(mpsc::UnboundedSender<std::result::Result<Message, Status>>);

impl MessageSender for StreamSender {
    fn send(&self, message: Message) -> Result<()> {
        self.0.send(Ok(message)).map_err(|_| Error::Canceled)
    }
}

enum PhaseRequest {
    Initialize(InitializeRequest),
    CreateCluster,
    Execute,
    Finalize,
    Revert,
}

impl PhaseRequest {
    fn phase(&self) -> Step {
        match self {
            PhaseRequest::Initialize(_) | PhaseRequest::CreateCluster => Step::Initialize,
            PhaseRequest::Execute => Step::Execute,
            PhaseRequest::Finalize => Step::Finalize,
            PhaseRequest::Revert => Step::Revert,
        }
    }
}

pub struct HubService {
    hub: Hub,
}

impl HubService {
    pub fn new(hub: Hub) -> Self {
        Self { hub }
    }

    fn stream_phase(&self, request: PhaseRequest) -> MessageStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let finished = CancellationToken::new();

        let watch_tx = tx.clone();
        let watch_cancel = cancel.clone();
        let watch_finished = finished.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = watch_tx.closed() => watch_cancel.cancel(),
                _ = watch_finished.cancelled() => {}
            }
        });

        let hub = self.hub.clone();
        tokio::spawn(async move {
            let phase = request.phase();
            let sender = Arc::new(StreamSender(tx.clone()));

            if let Err(err) = drive(&hub, request, sender, cancel).await {
                warn!(hub.logger(), "phase failed"; "phase" => phase.as_str_name(), "error" => %err);
                // The CLI may already be gone.
                let _ = tx.send(Err(err.into()));
            }
            finished.cancel();
        });

        Box::pin(UnboundedReceiverStream::new(rx))
    }
}

async fn drive(
    hub: &Hub,
    request: PhaseRequest,
    sender: Arc<dyn MessageSender>,
    cancel: CancellationToken,
) -> Result<()> {
    let mut step = PhaseStep::begin(request.phase(), hub.env(), sender, cancel, hub.logger().clone())?;
    info!(step.logger(), "starting phase");

    let result: Result<HashMap<String, String>> = match request {
        PhaseRequest::Initialize(req) => initialize::initialize(hub, &mut step, req).await,
        PhaseRequest::CreateCluster => initialize::create_cluster(hub, &mut step).await,
        PhaseRequest::Execute => execute::execute(hub, &mut step).await,
        PhaseRequest::Finalize => finalize::finalize(hub, &mut step).await,
        PhaseRequest::Revert => revert::revert(hub, &mut step).await,
    };

    let mut errs = ErrorList::new();
    match result {
        Ok(data) => {
            if step.err().is_none() {
                errs.push_result(step.send_response(data));
            }
        }
        Err(err) => errs.push(err),
    }
    errs.push_result(step.finish());
    errs.into_result()
}

#[tonic::async_trait]
impl CliToHub for HubService {
    type InitializeStream = MessageStream;
    type InitializeCreateClusterStream = MessageStream;
    type ExecuteStream = MessageStream;
    type FinalizeStream = MessageStream;
    type RevertStream = MessageStream;

    async fn initialize(
        &self,
        request: Request<InitializeRequest>,
    ) -> std::result::Result<Response<Self::InitializeStream>, Status> {
        Ok(Response::new(self.stream_phase(PhaseRequest::Initialize(request.into_inner()))))
    }

    async fn initialize_create_cluster(
        &self,
        _request: Request<InitializeCreateClusterRequest>,
    ) -> std::result::Result<Response<Self::InitializeCreateClusterStream>, Status> {
        Ok(Response::new(self.stream_phase(PhaseRequest::CreateCluster)))
    }

    async fn execute(
        &self,
        _request: Request<ExecuteRequest>,
    ) -> std::result::Result<Response<Self::ExecuteStream>, Status> {
        Ok(Response::new(self.stream_phase(PhaseRequest::Execute)))
    }

    async fn finalize(
        &self,
        _request: Request<FinalizeRequest>,
    ) -> std::result::Result<Response<Self::FinalizeStream>, Status> {
        Ok(Response::new(self.stream_phase(PhaseRequest::Finalize)))
    }

    async fn revert(
        &self,
        _request: Request<RevertRequest>,
    ) -> std::result::Result<Response<Self::RevertStream>, Status> {
        Ok(Response::new(self.stream_phase(PhaseRequest::Revert)))
    }

    async fn get_config(
        &self,
        request: Request<GetConfigRequest>,
    ) -> std::result::Result<Response<GetConfigReply>, Status> {
        let name = request.into_inner().name;

        match self.hub.config().get(&name)? {
            Some(value) => Ok(Response::new(GetConfigReply { value })),
            None => Err(Status::not_found(format!("{} is not a valid configuration key", name))),
        }
    }

    async fn set_config(
        &self,
        request: Request<SetConfigRequest>,
    ) -> std::result::Result<Response<SetConfigReply>, Status> {
        let SetConfigRequest { name, value } = request.into_inner();

        if !CONFIG_KEYS.contains(&name.as_str()) {
            return Err(Status::not_found(format!("{} is not a valid configuration key", name)));
        }

        self.hub.update_config(|config| config.set(&name, &value).map(|_| ()))?;
        info!(self.hub.logger(), "configuration changed"; "key" => &name, "value" => &value);
        Ok(Response::new(SetConfigReply {}))
    }

    async fn restart_agents(
        &self,
        _request: Request<RestartAgentsRequest>,
    ) -> std::result::Result<Response<RestartAgentsReply>, Status> {
        let agent_hosts = agents::restart_agents(&self.hub).await?;
        Ok(Response::new(RestartAgentsReply { agent_hosts }))
    }

    async fn stop_services(
        &self,
        _request: Request<StopServicesRequest>,
    ) -> std::result::Result<Response<StopServicesReply>, Status> {
        agents::stop_agents(&self.hub).await?;

        info!(self.hub.logger(), "stopping hub");
        self.hub.shutdown_token().cancel();
        Ok(Response::new(StopServicesReply {}))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::MockRunner;
    use crate::grpc::idl::message::Contents;
    use crate::hub::tests::{source_config, Fixture};
    use crate::step::store::FileStore;
    use futures::StreamExt;

    async fn collect(stream: MessageStream) -> Vec<std::result::Result<Message, Status>> {
        stream.collect().await
    }

    #[tokio::test]
    async fn test_config_rpcs() {
        let f = Fixture::new(MockRunner::succeeding(), source_config());
        let service = HubService::new(f.hub.clone());

        let reply = service
            .get_config(Request::new(GetConfigRequest {
                name: "target-gphome".into(),
            }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(reply.value, "/usr/local/gpdb7");

        service
            .set_config(Request::new(SetConfigRequest {
                name: "target-gphome".into(),
                value: "/opt/gpdb7".into(),
            }))
            .await
            .unwrap();
        assert_eq!(f.hub.config().target_gphome.to_str(), Some("/opt/gpdb7"));

        let status = service
            .get_config(Request::new(GetConfigRequest { name: "bogus".into() }))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::NotFound);

        let status = service
            .set_config(Request::new(SetConfigRequest {
                name: "id".into(),
                value: "x".into(),
            }))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);
    }

    #[tokio::test]
    async fn test_failed_phase_ends_stream_with_error() {
        // Nothing was initialized, so execute fails before its first substep
        // can find a source cluster.
        let f = Fixture::new(MockRunner::succeeding(), crate::config::HubConfig::new());
        let service = HubService::new(f.hub.clone());

        let frames = collect(service.stream_phase(PhaseRequest::Execute)).await;
        let last = frames.last().unwrap();
        assert!(last.is_err());

        let statuses: Vec<(Substep, crate::grpc::idl::Status)> = frames
            .iter()
            .filter_map(|f| match f {
                Ok(Message {
                    contents: Some(Contents::Status(s)),
                }) => Some((s.substep(), s.status())),
                _ => None,
            })
            .collect();
        assert_eq!(
            statuses,
            vec![
                (Substep::ShutdownSourceCluster, crate::grpc::idl::Status::Running),
                (Substep::ShutdownSourceCluster, crate::grpc::idl::Status::Failed)
            ]
        );

        let store = FileStore::new(f.hub.env().steps_path());
        assert_eq!(
            store.read(Step::Execute, Substep::ShutdownSourceCluster).unwrap(),
            crate::grpc::idl::Status::Failed
        );
    }

    #[tokio::test]
    async fn test_dropped_client_cancels_phase() {
        let f = Fixture::new(MockRunner::succeeding(), crate::config::HubConfig::new());
        let service = HubService::new(f.hub.clone());

        drop(service.stream_phase(PhaseRequest::Execute));

        // The driver records the canceled phase once it notices.
        // The driver creates steps.json once it begins the phase.
        let store = FileStore::new(f.hub.env().steps_path());
        for _ in 0..100 {
            let failed = store.path().exists()
                && store.read(Step::Execute, Substep::StepStatus).unwrap() == crate::grpc::idl::Status::Failed;
            if failed {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        panic!("canceled phase was never marked failed");
    }
}
