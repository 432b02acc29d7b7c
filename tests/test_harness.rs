//! Test harness for coordinator and agent integration tests.
//!
//! Provides an in-process cluster: one coordinator and any number of agents
//! sharing a [`MemoryTransport`], each agent rooted in its own temp dir.

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use orca_lite::agent::{Agent, Supervisor};
use orca_lite::config::{AgentConfig, CoordinatorConfig};
use orca_lite::coordinator::{Coordinator, JobStatus, JobStore, MemoryJobStore};
use orca_lite::protocol::JobState;
use orca_lite::transport::MemoryTransport;

pub const COORDINATOR_ID: &str = "coordinator";

/// Agent config with a short kill grace for faster tests
pub fn test_agent_config(node_id: &str, root: &TempDir) -> AgentConfig {
    AgentConfig::new(node_id, root.path().join("jobs")).with_kill_grace_ms(200)
}

/// Coordinator config with a short dispatch timeout for faster tests
pub fn test_coordinator_config(dispatch_timeout_ms: u64) -> CoordinatorConfig {
    CoordinatorConfig::default().with_dispatch_timeout_ms(dispatch_timeout_ms)
}

/// Handle to a running agent
pub struct TestAgent {
    pub agent: Arc<Agent>,
    pub root: TempDir,
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

impl TestAgent {
    /// Start an agent consuming its destination on `transport`
    pub fn start(transport: &MemoryTransport, node_id: &str, root: TempDir) -> Self {
        let config = test_agent_config(node_id, &root);
        let agent = Arc::new(Agent::new(config, Arc::new(transport.clone())));
        let shutdown = CancellationToken::new();

        let runner = agent.clone();
        let token = shutdown.clone();
        let handle = tokio::spawn(async move {
            let _ = runner.run(token).await;
        });

        Self {
            agent,
            root,
            shutdown,
            handle,
        }
    }

    pub fn supervisor(&self) -> &Supervisor {
        self.agent.supervisor()
    }

    /// Directory holding the records of `job` on this agent
    pub fn job_dir(&self, job: &str) -> PathBuf {
        self.root.path().join("jobs").join(job)
    }

    /// Stop consuming and hand back the root so a new agent can reuse it
    pub async fn stop(mut self) -> TempDir {
        self.shutdown.cancel();
        let _ = (&mut self.handle).await;
        let root = tempfile::tempdir().expect("temp dir");
        std::mem::replace(&mut self.root, root)
    }
}

impl Drop for TestAgent {
    fn drop(&mut self) {
        self.shutdown.cancel();
        self.handle.abort();
    }
}

/// Coordinator plus agents wired through one in-memory transport
pub struct TestCluster {
    pub transport: MemoryTransport,
    pub coordinator: Arc<Coordinator>,
    pub agents: HashMap<String, TestAgent>,
    shutdown: CancellationToken,
    coordinator_handle: JoinHandle<()>,
}

impl TestCluster {
    /// Start a cluster whose dispatches wait 500ms for answers
    pub async fn new(nodes: &[&str]) -> Self {
        Self::with_dispatch_timeout(nodes, 500).await
    }

    pub async fn with_dispatch_timeout(nodes: &[&str], dispatch_timeout_ms: u64) -> Self {
        Self::with_store(nodes, dispatch_timeout_ms, Arc::new(MemoryJobStore::new())).await
    }

    pub async fn with_store(
        nodes: &[&str],
        dispatch_timeout_ms: u64,
        store: Arc<dyn JobStore>,
    ) -> Self {
        let transport = MemoryTransport::new();
        let coordinator = Arc::new(Coordinator::new(
            test_coordinator_config(dispatch_timeout_ms),
            Arc::new(transport.clone()),
            store,
        ));

        let shutdown = CancellationToken::new();
        let runner = coordinator.clone();
        let token = shutdown.clone();
        let coordinator_handle = tokio::spawn(async move {
            let _ = runner.run(token).await;
        });

        let mut agents = HashMap::new();
        for node in nodes {
            let root = tempfile::tempdir().expect("temp dir");
            agents.insert(node.to_string(), TestAgent::start(&transport, node, root));
        }

        Self {
            transport,
            coordinator,
            agents,
            shutdown,
            coordinator_handle,
        }
    }

    pub fn agent(&self, node: &str) -> &TestAgent {
        self.agents.get(node).expect("unknown agent")
    }

    /// Remove an agent from the cluster, returning its root directory
    #[allow(dead_code)]
    pub async fn stop_agent(&mut self, node: &str) -> TempDir {
        let agent = self.agents.remove(node).expect("unknown agent");
        agent.stop().await
    }

    /// Start an agent reusing an existing root directory
    #[allow(dead_code)]
    pub fn restart_agent(&mut self, node: &str, root: TempDir) {
        let agent = TestAgent::start(&self.transport, node, root);
        self.agents.insert(node.to_string(), agent);
    }

    /// Poll `stat` until the job reaches `state`
    pub async fn wait_for_job_state(
        &self,
        job_id: &str,
        state: JobState,
        timeout_duration: Duration,
    ) -> Option<JobStatus> {
        let start = tokio::time::Instant::now();
        while start.elapsed() < timeout_duration {
            if let Ok(status) = self.coordinator.stat(job_id).await {
                if status.job == state {
                    return Some(status);
                }
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        None
    }
}

impl Drop for TestCluster {
    fn drop(&mut self) {
        self.shutdown.cancel();
        self.coordinator_handle.abort();
    }
}

/// Wait for a condition to become true with timeout
pub async fn wait_for<F, Fut>(
    condition: F,
    timeout_duration: Duration,
    poll_interval: Duration,
) -> bool
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = tokio::time::Instant::now();
    while start.elapsed() < timeout_duration {
        if condition().await {
            return true;
        }
        tokio::time::sleep(poll_interval).await;
    }
    false
}

/// Assert a condition eventually becomes true
#[allow(dead_code)]
pub async fn assert_eventually<F, Fut>(condition: F, timeout_duration: Duration, message: &str)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let result = wait_for(condition, timeout_duration, Duration::from_millis(50)).await;
    assert!(result, "{}", message);
}
