use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::dispatch::Responses;
use crate::protocol::{ErrorBody, JobId, JobState, NodeId, NodeState, NodeStatus, Response};

/// Client request to start a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewJob {
    pub command: String,
    pub arguments: Vec<String>,
    pub nodes: Vec<NodeId>,
    /// Milliseconds; `None` selects the coordinator default.
    pub timeout: Option<u64>,
}

impl NewJob {
    pub fn new(command: impl Into<String>, nodes: Vec<NodeId>) -> Self {
        Self {
            command: command.into(),
            arguments: Vec::new(),
            nodes,
            timeout: None,
        }
    }

    pub fn with_arguments(mut self, arguments: Vec<String>) -> Self {
        self.arguments = arguments;
        self
    }

    pub fn with_timeout(mut self, timeout_ms: u64) -> Self {
        self.timeout = Some(timeout_ms);
        self
    }
}

/// Last known outcome of a job on one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeResult {
    pub name: NodeId,
    pub state: NodeState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl NodeResult {
    /// Interpret one STAT response.
    pub fn from_response(name: &str, response: &Response) -> Self {
        match response.outcome::<NodeStatus>() {
            Ok(status) => {
                let (code, signal) = match &status {
                    NodeStatus::Exited { code } => (*code, None),
                    NodeStatus::Killed { signal } => (None, Some(signal.clone())),
                    _ => (None, None),
                };
                Self {
                    name: name.to_string(),
                    state: status.state(),
                    code,
                    signal,
                    error: None,
                }
            }
            Err(error) => Self::failed(name, error),
        }
    }

    pub fn failed(name: &str, error: ErrorBody) -> Self {
        Self {
            name: name.to_string(),
            state: NodeState::Failed,
            code: None,
            signal: None,
            error: Some(error),
        }
    }

    /// The node did not answer in time; its real state is unknown.
    pub fn is_unanswered(&self) -> bool {
        self.error.as_ref().is_some_and(ErrorBody::is_request_timeout)
    }

    /// The node reached an outcome that will not change any more.
    pub fn is_settled(&self) -> bool {
        self.state != NodeState::Running && !self.is_unanswered()
    }
}

/// Aggregate state of a job across its nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStatus {
    pub job: JobState,
    pub nodes: Vec<NodeResult>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub nodes: Vec<NodeId>,
    pub command: String,
    #[serde(default)]
    pub arguments: Vec<String>,
    /// Milliseconds.
    pub timeout: u64,
    pub created_at: DateTime<Utc>,
    pub state: JobStatus,
}

impl Job {
    pub fn new(
        command: String,
        arguments: Vec<String>,
        nodes: Vec<NodeId>,
        timeout: u64,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            nodes,
            command,
            arguments,
            timeout,
            created_at: Utc::now(),
            state: JobStatus {
                job: JobState::Running,
                nodes: Vec::new(),
            },
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.job.is_terminal()
    }

    /// Fold a round of STAT responses into the job state.
    ///
    /// An unanswered node keeps its previous entry when there is one. The job
    /// settles (RUNNING to DONE, CANCELLING to CANCELLED) once every node
    /// entry is settled.
    pub fn merge(&mut self, responses: &Responses) {
        let mut merged = Vec::with_capacity(self.nodes.len());
        for node in &self.nodes {
            let fresh = match responses.get(node) {
                Some(response) => NodeResult::from_response(node, response),
                None => NodeResult::failed(node, ErrorBody::request_timeout()),
            };
            let prior = self.state.nodes.iter().find(|r| &r.name == node);
            let entry = match prior {
                Some(prior) if fresh.is_unanswered() => prior.clone(),
                _ => fresh,
            };
            merged.push(entry);
        }

        let complete = merged.iter().all(NodeResult::is_settled);
        self.state.nodes = merged;
        if complete {
            self.state.job = self.state.job.settled();
        }
    }
}
