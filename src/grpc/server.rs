use std::net::SocketAddr;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tonic::transport::Server;

use crate::coordinator::Coordinator;
use crate::grpc::broker_service::BrokerService;
use crate::grpc::orchestration_service::OrchestrationService;
use crate::proto::broker_server::BrokerServer;
use crate::proto::orchestration_server::OrchestrationServer;
use crate::transport::MemoryTransport;

/// One listener serving the broker, the orchestration API, or both.
pub struct GrpcServer {
    addr: SocketAddr,
    broker: Option<MemoryTransport>,
    coordinator: Option<Arc<Coordinator>>,
}

impl GrpcServer {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            broker: None,
            coordinator: None,
        }
    }

    pub fn with_broker(mut self, log: MemoryTransport) -> Self {
        self.broker = Some(log);
        self
    }

    pub fn with_orchestration(mut self, coordinator: Arc<Coordinator>) -> Self {
        self.coordinator = Some(coordinator);
        self
    }

    pub async fn run(self, shutdown: CancellationToken) -> Result<(), tonic::transport::Error> {
        let broker = self.broker.map(|log| BrokerServer::new(BrokerService::new(log)));
        let orchestration = self
            .coordinator
            .map(|c| OrchestrationServer::new(OrchestrationService::new(c)));

        tracing::info!(
            addr = %self.addr,
            broker = broker.is_some(),
            orchestration = orchestration.is_some(),
            "Starting gRPC server"
        );

        Server::builder()
            .add_optional_service(broker)
            .add_optional_service(orchestration)
            .serve_with_shutdown(self.addr, shutdown.cancelled_owned())
            .await
    }
}
