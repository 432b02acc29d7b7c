use std::sync::Arc;

use tonic::{Request, Response, Status};

use crate::coordinator::{Coordinator, Job, JobStatus, NewJob, NodeResult};
use crate::proto::node_output::Outcome;
use crate::proto::orchestration_server::Orchestration;
use crate::proto::{
    CancelJobResponse, CreateJobRequest, CreateJobResponse, ErrorInfo, JobInfo, JobRequest,
    JobState as ProtoJobState, JobStateInfo, ListJobsRequest, ListJobsResponse,
    NodeOutput, NodeResultInfo, NodeState as ProtoNodeState, TeeJobResponse,
};
use crate::protocol::{ErrorBody, JobState, NodeState};

/// Client-facing job API backed by a [`Coordinator`].
pub struct OrchestrationService {
    coordinator: Arc<Coordinator>,
}

impl OrchestrationService {
    pub fn new(coordinator: Arc<Coordinator>) -> Self {
        Self { coordinator }
    }
}

impl From<JobState> for ProtoJobState {
    fn from(state: JobState) -> Self {
        match state {
            JobState::Running => ProtoJobState::Running,
            JobState::Cancelling => ProtoJobState::Cancelling,
            JobState::Cancelled => ProtoJobState::Cancelled,
            JobState::Done => ProtoJobState::Done,
        }
    }
}

impl From<NodeState> for ProtoNodeState {
    fn from(state: NodeState) -> Self {
        match state {
            NodeState::Running => ProtoNodeState::Running,
            NodeState::Exited => ProtoNodeState::Exited,
            NodeState::Killed => ProtoNodeState::Killed,
            NodeState::Timeout => ProtoNodeState::Timeout,
            NodeState::Cancelled => ProtoNodeState::Cancelled,
            NodeState::Failed => ProtoNodeState::Failed,
        }
    }
}

fn error_to_proto(error: ErrorBody) -> ErrorInfo {
    ErrorInfo {
        code: error.code,
        message: error.message,
    }
}

fn node_result_to_proto(result: NodeResult) -> NodeResultInfo {
    NodeResultInfo {
        name: result.name,
        state: ProtoNodeState::from(result.state) as i32,
        code: result.code,
        signal: result.signal,
        error: result.error.map(error_to_proto),
    }
}

fn status_to_proto(job_id: String, status: JobStatus) -> JobStateInfo {
    JobStateInfo {
        job_id,
        state: ProtoJobState::from(status.job) as i32,
        nodes: status.nodes.into_iter().map(node_result_to_proto).collect(),
    }
}

fn job_to_proto(job: Job) -> JobInfo {
    JobInfo {
        job_id: job.id,
        command: job.command,
        arguments: job.arguments,
        nodes: job.nodes,
        timeout_ms: job.timeout,
        state: ProtoJobState::from(job.state.job) as i32,
        created_at_ms: job.created_at.timestamp_millis(),
    }
}

#[tonic::async_trait]
impl Orchestration for OrchestrationService {
    async fn create_job(
        &self,
        request: Request<CreateJobRequest>,
    ) -> Result<Response<CreateJobResponse>, Status> {
        let req = request.into_inner();
        let mut new_job = NewJob::new(req.command, req.nodes).with_arguments(req.arguments);
        if req.timeout_ms > 0 {
            new_job = new_job.with_timeout(req.timeout_ms);
        }

        let job_id = self.coordinator.create(new_job).await?;
        Ok(Response::new(CreateJobResponse { job_id }))
    }

    async fn stat_job(
        &self,
        request: Request<JobRequest>,
    ) -> Result<Response<JobStateInfo>, Status> {
        let job_id = request.into_inner().job_id;
        let status = self.coordinator.stat(&job_id).await?;
        Ok(Response::new(status_to_proto(job_id, status)))
    }

    async fn tee_job(
        &self,
        request: Request<JobRequest>,
    ) -> Result<Response<TeeJobResponse>, Status> {
        let job_id = request.into_inner().job_id;
        let outputs = self
            .coordinator
            .tee(&job_id)
            .await?
            .into_iter()
            .map(|(node, outcome)| NodeOutput {
                node,
                outcome: Some(match outcome {
                    Ok(output) => Outcome::Output(output),
                    Err(error) => Outcome::Error(error_to_proto(error)),
                }),
            })
            .collect();
        Ok(Response::new(TeeJobResponse { job_id, outputs }))
    }

    async fn cancel_job(
        &self,
        request: Request<JobRequest>,
    ) -> Result<Response<CancelJobResponse>, Status> {
        let job_id = request.into_inner().job_id;
        self.coordinator.cancel(&job_id).await?;
        Ok(Response::new(CancelJobResponse {}))
    }

    async fn list_jobs(
        &self,
        _request: Request<ListJobsRequest>,
    ) -> Result<Response<ListJobsResponse>, Status> {
        let jobs = self
            .coordinator
            .list()
            .await?
            .into_iter()
            .map(job_to_proto)
            .collect();
        Ok(Response::new(ListJobsResponse { jobs }))
    }
}
