use thiserror::Error;

use crate::protocol::{ErrorBody, JobState};

/// Wire error codes carried in `response.error.code`.
pub mod codes {
    pub const INVALID_ARGUMENT: u32 = 40001;
    pub const JOB_NOT_FOUND: u32 = 40406;
    pub const JOB_DATA_NOT_FOUND: u32 = 40407;
    pub const REQUEST_TIMEOUT: u32 = 40800;
    pub const JOB_ALREADY_EXECUTED: u32 = 40905;
    pub const JOB_NOT_CANCELLABLE: u32 = 40906;
    pub const UNSUPPORTED_COMMAND: u32 = 41501;
    pub const INTERNAL_ERROR: u32 = 50000;
}

#[derive(Error, Debug)]
pub enum OrcaError {
    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Data for job {0} not found")]
    JobDataNotFound(String),

    #[error("Job {0} has already been executed")]
    JobAlreadyExecuted(String),

    #[error("Job {job} can not be cancelled, it is {state}")]
    JobNotCancellable { job: String, state: JobState },

    #[error("Request timeout")]
    RequestTimeout,

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Unsupported command: {0}")]
    UnsupportedCommand(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("gRPC error: {0}")]
    GrpcError(#[from] tonic::Status),

    #[error("gRPC transport error: {0}")]
    GrpcTransportError(#[from] tonic::transport::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl OrcaError {
    /// The wire code reported to remote peers for this error.
    pub fn code(&self) -> u32 {
        match self {
            OrcaError::JobNotFound(_) => codes::JOB_NOT_FOUND,
            OrcaError::JobDataNotFound(_) => codes::JOB_DATA_NOT_FOUND,
            OrcaError::JobAlreadyExecuted(_) => codes::JOB_ALREADY_EXECUTED,
            OrcaError::JobNotCancellable { .. } => codes::JOB_NOT_CANCELLABLE,
            OrcaError::RequestTimeout => codes::REQUEST_TIMEOUT,
            OrcaError::InvalidArgument(_) => codes::INVALID_ARGUMENT,
            OrcaError::UnsupportedCommand(_) => codes::UNSUPPORTED_COMMAND,
            _ => codes::INTERNAL_ERROR,
        }
    }
}

impl From<&OrcaError> for ErrorBody {
    fn from(error: &OrcaError) -> Self {
        ErrorBody {
            code: error.code(),
            message: error.to_string(),
        }
    }
}

impl From<OrcaError> for tonic::Status {
    fn from(error: OrcaError) -> Self {
        match error {
            OrcaError::JobNotFound(_) => tonic::Status::not_found(error.to_string()),
            OrcaError::JobNotCancellable { .. } => {
                tonic::Status::failed_precondition(error.to_string())
            }
            OrcaError::InvalidArgument(_) => tonic::Status::invalid_argument(error.to_string()),
            OrcaError::GrpcError(status) => status,
            _ => tonic::Status::internal(error.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, OrcaError>;
