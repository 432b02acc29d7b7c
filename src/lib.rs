pub mod agent;
pub mod config;
pub mod coordinator;
pub mod dispatch;
pub mod error;
pub mod grpc;
pub mod protocol;
pub mod shutdown;
pub mod transport;

// Re-export generated protobuf types
pub mod proto {
    tonic::include_proto!("orca");
}
