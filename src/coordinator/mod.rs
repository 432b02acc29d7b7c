//! Job lifecycle on the coordinator side.
//!
//! The coordinator owns job records, turns client calls into dispatches and
//! folds per-node STAT answers into the aggregate job state.
//!
//! # Lifecycle
//!
//! ```text
//! RUNNING ──cancel──> CANCELLING ──all nodes settled──> CANCELLED
//!    └──────────all nodes settled──────────> DONE
//! ```
//!
//! State only moves forward when a `stat` call observes every node in a
//! settled state; there is no background polling.

pub mod job;
pub mod store;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::config::CoordinatorConfig;
use crate::dispatch::{Dispatcher, Pending};
use crate::error::{OrcaError, Result};
use crate::protocol::{
    CommandKind, ErrorBody, ExecParams, JobId, JobState, Message, NodeId, Response,
};
use crate::transport::{consume, Delivery, DeliveryHandler, OffsetCheckpoint, Transport};

pub use job::{Job, JobStatus, NewJob, NodeResult};
pub use store::{FileJobStore, JobStore, MemoryJobStore};

/// Per-node TEE outcome.
pub type TeeOutput = BTreeMap<NodeId, std::result::Result<String, ErrorBody>>;

pub struct Coordinator {
    config: CoordinatorConfig,
    store: Arc<dyn JobStore>,
    dispatcher: Dispatcher,
    transport: Arc<dyn Transport>,
}

impl Coordinator {
    pub fn new(
        config: CoordinatorConfig,
        transport: Arc<dyn Transport>,
        store: Arc<dyn JobStore>,
    ) -> Self {
        Self {
            config,
            store,
            dispatcher: Dispatcher::new(transport.clone()),
            transport,
        }
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Persist a new job and send EXEC to its nodes without waiting for them.
    pub async fn create(&self, request: NewJob) -> Result<JobId> {
        let command = request.command.trim().to_string();
        if command.is_empty() {
            return Err(OrcaError::InvalidArgument("Command is empty".to_string()));
        }

        let mut nodes: Vec<NodeId> = Vec::with_capacity(request.nodes.len());
        for node in request.nodes {
            if node.is_empty() {
                return Err(OrcaError::InvalidArgument("Empty node name".to_string()));
            }
            if !nodes.contains(&node) {
                nodes.push(node);
            }
        }
        if nodes.is_empty() {
            return Err(OrcaError::InvalidArgument("No nodes given".to_string()));
        }

        let timeout = request
            .timeout
            .filter(|t| *t > 0)
            .unwrap_or(self.config.default_job_timeout_ms);
        let job = Job::new(command, request.arguments, nodes, timeout);
        self.store.create(&job).await?;

        tracing::info!(
            job_id = %job.id,
            command = %job.command,
            nodes = ?job.nodes,
            timeout_ms = job.timeout,
            "Job created"
        );

        let message = Message::exec(
            &self.config.id,
            &job.id,
            ExecParams {
                command: job.command.clone(),
                arguments: job.arguments.clone(),
                timeout: job.timeout,
            },
        );
        let pending = self.send(&job, &message).await?;
        log_failures(pending, job.id.clone(), CommandKind::Exec);

        Ok(job.id)
    }

    /// Current state of a job, refreshed from its nodes unless it is already
    /// terminal.
    pub async fn stat(&self, id: &str) -> Result<JobStatus> {
        let mut job = self.store.read(id).await?;
        if job.is_terminal() {
            return Ok(job.state);
        }

        let message = Message::new(&self.config.id, &job.id, CommandKind::Stat);
        let responses = self.send(&job, &message).await?.wait().await?;
        job.merge(&responses);

        // Concurrent stats on one job race here; the last writer wins.
        if let Err(e) = self.store.update(&job).await {
            tracing::warn!(job_id = %job.id, error = %e, "Failed to persist job state");
        }

        Ok(job.state)
    }

    /// Move a running job to CANCELLING and ask its nodes to stop.
    pub async fn cancel(&self, id: &str) -> Result<()> {
        let mut job = self.store.read(id).await?;
        if job.state.job != JobState::Running {
            return Err(OrcaError::JobNotCancellable {
                job: job.id,
                state: job.state.job,
            });
        }

        job.state.job = JobState::Cancelling;
        self.store.update(&job).await?;
        tracing::info!(job_id = %job.id, "Job cancelling");

        let message = Message::new(&self.config.id, &job.id, CommandKind::Cancel);
        let pending = self.send(&job, &message).await?;
        log_failures(pending, job.id, CommandKind::Cancel);
        Ok(())
    }

    /// Tail of each node's output. Does not touch the job state.
    pub async fn tee(&self, id: &str) -> Result<TeeOutput> {
        let job = self.store.read(id).await?;
        let message = Message::new(&self.config.id, &job.id, CommandKind::Tee);
        let mut responses = self.send(&job, &message).await?.wait().await?;

        Ok(job
            .nodes
            .iter()
            .map(|node| {
                let outcome = match responses.remove(node) {
                    Some(response) => response.outcome::<String>(),
                    None => Err(ErrorBody::request_timeout()),
                };
                (node.clone(), outcome)
            })
            .collect())
    }

    /// Every job, oldest first.
    pub async fn list(&self) -> Result<Vec<Job>> {
        self.store.list().await
    }

    /// Consume responses addressed to this coordinator until `shutdown`.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> Result<()> {
        let checkpoint = Arc::new(match &self.config.offset_file {
            Some(path) => OffsetCheckpoint::load(path.clone()).await,
            None => OffsetCheckpoint::in_memory(),
        });
        let flusher = checkpoint
            .clone()
            .spawn_flusher(self.config.checkpoint_interval(), shutdown.clone());

        tracing::info!(id = %self.config.id, "Coordinator started");
        consume(
            self.transport.as_ref(),
            &self.config.id,
            &checkpoint,
            &*self,
            shutdown,
        )
        .await;

        flusher
            .await
            .map_err(|e| OrcaError::Internal(format!("Offset flusher failed: {}", e)))?;
        tracing::info!(id = %self.config.id, "Coordinator stopped");
        Ok(())
    }

    async fn send(&self, job: &Job, message: &Message) -> Result<Pending> {
        self.dispatcher
            .dispatch(&job.nodes, message, self.config.dispatch_timeout())
            .await
    }
}

/// Detach a fire-and-forget dispatch, logging the nodes that reported errors.
fn log_failures(pending: Pending, job: JobId, kind: CommandKind) {
    tokio::spawn(async move {
        let Ok(responses) = pending.wait().await else {
            return;
        };
        for (node, response) in responses {
            if let Some(error) = response.error {
                tracing::warn!(
                    job_id = %job,
                    node = %node,
                    command = %kind,
                    error = %error,
                    "Node rejected command"
                );
            }
        }
    });
}

#[async_trait]
impl DeliveryHandler for Coordinator {
    async fn on_delivery(&self, delivery: &Delivery) {
        match Response::decode(&delivery.payload) {
            Ok(response) => self.dispatcher.on_response(response).await,
            Err(e) => {
                tracing::warn!(
                    offset = delivery.offset,
                    error = %e,
                    "Dropping malformed response"
                );
            }
        }
    }
}
