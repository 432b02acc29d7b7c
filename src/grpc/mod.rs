pub mod broker_service;
pub mod orchestration_service;
pub mod server;

pub use broker_service::BrokerService;
pub use orchestration_service::OrchestrationService;
pub use server::GrpcServer;
