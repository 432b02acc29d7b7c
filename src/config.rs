use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::transport::memory::DEFAULT_RETENTION;

/// Configuration of a node-side agent.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Node identity; also the destination the agent consumes.
    pub node_id: String,
    /// Directory holding one sub-directory per executed job.
    pub root: PathBuf,
    /// Time a cancelled process gets to exit after SIGTERM before SIGKILL.
    pub kill_grace_ms: u64,
    /// Where the consumed offset is checkpointed. `None` keeps it in memory.
    pub offset_file: Option<PathBuf>,
    pub checkpoint_interval_ms: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            node_id: "agent-1".to_string(),
            root: PathBuf::from("/var/lib/orca/jobs"),
            kill_grace_ms: 5000,
            offset_file: None,
            checkpoint_interval_ms: 2000,
        }
    }
}

impl AgentConfig {
    pub fn new(node_id: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            node_id: node_id.into(),
            root: root.into(),
            ..Default::default()
        }
    }

    pub fn with_kill_grace_ms(mut self, kill_grace_ms: u64) -> Self {
        self.kill_grace_ms = kill_grace_ms;
        self
    }

    pub fn with_offset_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.offset_file = Some(path.into());
        self
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }

    pub fn checkpoint_interval(&self) -> Duration {
        Duration::from_millis(self.checkpoint_interval_ms)
    }
}

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Identity used as `sender` on dispatched messages and as the
    /// destination responses are read from.
    pub id: String,
    /// Address of the orchestration gRPC API.
    pub listen_addr: SocketAddr,
    /// How long STAT, TEE, EXEC and CANCEL dispatches wait for node answers.
    pub dispatch_timeout_ms: u64,
    /// Job timeout applied when a request does not carry one.
    pub default_job_timeout_ms: u64,
    /// Directory for JSON job records. `None` keeps jobs in memory.
    pub store_dir: Option<PathBuf>,
    pub offset_file: Option<PathBuf>,
    pub checkpoint_interval_ms: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            id: "coordinator".to_string(),
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 50061)),
            dispatch_timeout_ms: 5000,
            default_job_timeout_ms: 60_000,
            store_dir: None,
            offset_file: None,
            checkpoint_interval_ms: 2000,
        }
    }
}

impl CoordinatorConfig {
    pub fn new(id: impl Into<String>, listen_addr: SocketAddr) -> Self {
        Self {
            id: id.into(),
            listen_addr,
            ..Default::default()
        }
    }

    pub fn with_dispatch_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.dispatch_timeout_ms = timeout_ms;
        self
    }

    pub fn with_default_job_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.default_job_timeout_ms = timeout_ms;
        self
    }

    pub fn with_store_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.store_dir = Some(dir.into());
        self
    }

    pub fn with_offset_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.offset_file = Some(path.into());
        self
    }

    pub fn dispatch_timeout(&self) -> Duration {
        Duration::from_millis(self.dispatch_timeout_ms)
    }

    pub fn checkpoint_interval(&self) -> Duration {
        Duration::from_millis(self.checkpoint_interval_ms)
    }
}

/// Configuration of the standalone message broker.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub listen_addr: SocketAddr,
    /// Messages kept per destination; older ones can no longer be replayed.
    pub retention: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 50060)),
            retention: DEFAULT_RETENTION,
        }
    }
}

impl BrokerConfig {
    pub fn new(listen_addr: SocketAddr) -> Self {
        Self {
            listen_addr,
            ..Default::default()
        }
    }

    pub fn with_retention(mut self, retention: usize) -> Self {
        self.retention = retention;
        self
    }
}
