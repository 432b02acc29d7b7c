use serde::{Deserialize, Serialize};

/// Aggregate lifecycle of a job as tracked by the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Running,
    Cancelling,
    Cancelled,
    Done,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Done | JobState::Cancelled)
    }

    /// The state a job settles into once every node reported a terminal result.
    pub fn settled(self) -> JobState {
        match self {
            JobState::Running => JobState::Done,
            JobState::Cancelling => JobState::Cancelled,
            other => other,
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobState::Running => write!(f, "running"),
            JobState::Cancelling => write!(f, "cancelling"),
            JobState::Cancelled => write!(f, "cancelled"),
            JobState::Done => write!(f, "done"),
        }
    }
}

/// Per-node execution state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeState {
    Running,
    Exited,
    Killed,
    Timeout,
    Cancelled,
    /// The node answered with an error, or its execution record was lost.
    Failed,
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeState::Running => write!(f, "running"),
            NodeState::Exited => write!(f, "exited"),
            NodeState::Killed => write!(f, "killed"),
            NodeState::Timeout => write!(f, "timeout"),
            NodeState::Cancelled => write!(f, "cancelled"),
            NodeState::Failed => write!(f, "failed"),
        }
    }
}

/// The `result` payload of a successful STAT response.
///
/// Serialized with the state as tag, e.g. `{"state":"EXITED","code":0}` or
/// `{"state":"KILLED","signal":"SIGTERM"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeStatus {
    Running,
    Exited {
        #[serde(default)]
        code: Option<i32>,
    },
    Killed {
        signal: String,
    },
    Timeout,
    Cancelled,
}

impl NodeStatus {
    pub fn state(&self) -> NodeState {
        match self {
            NodeStatus::Running => NodeState::Running,
            NodeStatus::Exited { .. } => NodeState::Exited,
            NodeStatus::Killed { .. } => NodeState::Killed,
            NodeStatus::Timeout => NodeState::Timeout,
            NodeStatus::Cancelled => NodeState::Cancelled,
        }
    }
}
