//! Agent supervisor tests.
//!
//! Messages are handed to `Agent::handle` directly; the transport is only
//! involved where delivery filtering is under test.

mod test_harness;

use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::kill;
use nix::unistd::Pid;
use orca_lite::agent::{Agent, StatRecord};
use orca_lite::error::codes;
use orca_lite::protocol::{CommandKind, ExecParams, Message, NodeStatus, Response};
use orca_lite::transport::{Delivery, DeliveryHandler, MemoryTransport};
use tempfile::TempDir;
use test_harness::{test_agent_config, wait_for};

struct Fixture {
    agent: Agent,
    transport: MemoryTransport,
    root: TempDir,
}

impl Fixture {
    fn new() -> Self {
        let root = tempfile::tempdir().unwrap();
        let transport = MemoryTransport::new();
        let agent = Agent::new(
            test_agent_config("n1", &root),
            Arc::new(transport.clone()),
        );
        Self {
            agent,
            transport,
            root,
        }
    }

    fn job_dir(&self, job: &str) -> std::path::PathBuf {
        self.root.path().join("jobs").join(job)
    }

    async fn exec(&self, job: &str, command: &str, args: &[&str], timeout_ms: u64) -> Response {
        let message = Message::exec(
            "coordinator",
            job,
            ExecParams {
                command: command.to_string(),
                arguments: args.iter().map(|a| a.to_string()).collect(),
                timeout: timeout_ms,
            },
        );
        self.agent.handle(&message).await
    }

    async fn send(&self, job: &str, kind: CommandKind) -> Response {
        self.agent
            .handle(&Message::new("coordinator", job, kind))
            .await
    }

    async fn stat(&self, job: &str) -> Result<NodeStatus, u32> {
        self.send(job, CommandKind::Stat)
            .await
            .outcome::<NodeStatus>()
            .map_err(|e| e.code)
    }

    async fn tee(&self, job: &str) -> Result<String, u32> {
        self.send(job, CommandKind::Tee)
            .await
            .outcome::<String>()
            .map_err(|e| e.code)
    }

    /// Wait until the job leaves RUNNING and return its final status
    async fn wait_finished(&self, job: &str, timeout: Duration) -> NodeStatus {
        let finished = wait_for(
            || async { !matches!(self.stat(job).await, Ok(NodeStatus::Running)) },
            timeout,
            Duration::from_millis(20),
        )
        .await;
        assert!(finished, "job {} did not finish in {:?}", job, timeout);
        self.stat(job).await.expect("finished job has a status")
    }
}

fn error_code(response: &Response) -> Option<u32> {
    response.error.as_ref().map(|e| e.code)
}

#[tokio::test]
async fn test_true_exits_zero_with_empty_output() {
    let fx = Fixture::new();
    let response = fx.exec("j1", "true", &[], 5000).await;
    assert!(response.error.is_none());
    assert_eq!(response.result, Some(serde_json::json!({})));
    assert_eq!(response.sender, "n1");

    let status = fx.wait_finished("j1", Duration::from_secs(5)).await;
    assert_eq!(status, NodeStatus::Exited { code: Some(0) });
    assert_eq!(fx.tee("j1").await.unwrap(), "");
}

#[tokio::test]
async fn test_running_job_reports_running() {
    let fx = Fixture::new();
    fx.exec("j1", "sleep", &["10"], 30_000).await;

    assert_eq!(fx.stat("j1").await.unwrap(), NodeStatus::Running);
    assert!(fx.agent.supervisor().is_running("j1").await);

    fx.send("j1", CommandKind::Cancel).await;
}

#[tokio::test]
async fn test_timeout_kills_the_process() {
    let fx = Fixture::new();
    fx.exec("j1", "sleep", &["10"], 100).await;

    let pid: i32 = tokio::fs::read_to_string(fx.job_dir("j1").join("pid"))
        .await
        .unwrap()
        .trim()
        .parse()
        .unwrap();

    let status = fx.wait_finished("j1", Duration::from_secs(5)).await;
    assert_eq!(status, NodeStatus::Timeout);
    assert!(
        kill(Pid::from_raw(pid), None).is_err(),
        "process {} should be gone",
        pid
    );
    assert_eq!(fx.agent.supervisor().running_count().await, 0);
}

#[tokio::test]
async fn test_duplicate_exec_is_rejected_and_leaves_files_untouched() {
    let fx = Fixture::new();
    fx.exec("j1", "echo", &["first"], 5000).await;
    fx.wait_finished("j1", Duration::from_secs(5)).await;
    let stat_before = tokio::fs::read(fx.job_dir("j1").join("stat")).await.unwrap();

    let response = fx.exec("j1", "echo", &["second"], 5000).await;
    assert_eq!(error_code(&response), Some(codes::JOB_ALREADY_EXECUTED));

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(fx.tee("j1").await.unwrap(), "first\n");
    let stat_after = tokio::fs::read(fx.job_dir("j1").join("stat")).await.unwrap();
    assert_eq!(stat_before, stat_after);
}

#[tokio::test]
async fn test_exit_code_and_signal_are_recorded() {
    let fx = Fixture::new();
    fx.exec("exit3", "sh", &["-c", "exit 3"], 5000).await;
    fx.exec("killed", "sh", &["-c", "kill -9 $$"], 5000).await;

    assert_eq!(
        fx.wait_finished("exit3", Duration::from_secs(5)).await,
        NodeStatus::Exited { code: Some(3) }
    );
    assert_eq!(
        fx.wait_finished("killed", Duration::from_secs(5)).await,
        NodeStatus::Killed {
            signal: "SIGKILL".to_string()
        }
    );
}

#[tokio::test]
async fn test_stdout_and_stderr_share_the_output_file() {
    let fx = Fixture::new();
    fx.exec("j1", "sh", &["-c", "echo out; echo err 1>&2"], 5000)
        .await;
    fx.wait_finished("j1", Duration::from_secs(5)).await;

    let output = fx.tee("j1").await.unwrap();
    assert!(output.contains("out\n"));
    assert!(output.contains("err\n"));
}

#[tokio::test]
async fn test_tee_returns_only_the_trailing_10k() {
    let fx = Fixture::new();
    fx.exec("j1", "seq", &["1", "10000"], 5000).await;
    fx.wait_finished("j1", Duration::from_secs(5)).await;

    let output = fx.tee("j1").await.unwrap();
    assert_eq!(output.len(), 10 * 1024);
    assert!(output.ends_with("9999\n10000\n"));
}

#[tokio::test]
async fn test_cancel_running_job() {
    let fx = Fixture::new();
    fx.exec("j1", "sleep", &["10"], 30_000).await;

    let response = fx.send("j1", CommandKind::Cancel).await;
    assert!(response.error.is_none());

    let status = fx.wait_finished("j1", Duration::from_secs(5)).await;
    assert_eq!(status, NodeStatus::Cancelled);

    let raw = tokio::fs::read(fx.job_dir("j1").join("stat")).await.unwrap();
    let record: StatRecord = serde_json::from_slice(&raw).unwrap();
    assert!(record.cancelled);
    assert!(!record.timeout);
    assert_eq!(record.signal.as_deref(), Some("SIGTERM"));
}

#[tokio::test]
async fn test_cancel_escalates_when_sigterm_is_ignored() {
    let fx = Fixture::new();
    fx.exec("j1", "sh", &["-c", "trap '' TERM; sleep 10"], 30_000)
        .await;
    // Give the shell time to install the trap
    tokio::time::sleep(Duration::from_millis(200)).await;

    fx.send("j1", CommandKind::Cancel).await;
    let status = fx.wait_finished("j1", Duration::from_secs(5)).await;
    assert_eq!(status, NodeStatus::Cancelled);

    let raw = tokio::fs::read(fx.job_dir("j1").join("stat")).await.unwrap();
    let record: StatRecord = serde_json::from_slice(&raw).unwrap();
    assert_eq!(record.signal.as_deref(), Some("SIGKILL"));
}

#[tokio::test]
async fn test_cancel_missing_and_finished_jobs() {
    let fx = Fixture::new();
    let response = fx.send("nope", CommandKind::Cancel).await;
    assert_eq!(error_code(&response), Some(codes::JOB_NOT_FOUND));

    fx.exec("j1", "true", &[], 5000).await;
    fx.wait_finished("j1", Duration::from_secs(5)).await;
    let response = fx.send("j1", CommandKind::Cancel).await;
    assert!(response.error.is_none());
    // A late cancel does not rewrite the outcome
    assert_eq!(
        fx.stat("j1").await.unwrap(),
        NodeStatus::Exited { code: Some(0) }
    );
}

#[tokio::test]
async fn test_missing_records_map_to_distinct_errors() {
    let fx = Fixture::new();
    assert_eq!(fx.stat("nope").await, Err(codes::JOB_NOT_FOUND));
    assert_eq!(fx.tee("nope").await, Err(codes::JOB_NOT_FOUND));

    tokio::fs::create_dir_all(fx.job_dir("orphan")).await.unwrap();
    assert_eq!(fx.stat("orphan").await, Err(codes::JOB_DATA_NOT_FOUND));
    assert_eq!(fx.tee("orphan").await, Err(codes::JOB_DATA_NOT_FOUND));
}

#[tokio::test]
async fn test_spawn_failure_cleans_up() {
    let fx = Fixture::new();
    let response = fx.exec("j1", "/nonexistent/orca-binary", &[], 5000).await;
    assert_eq!(error_code(&response), Some(codes::INVALID_ARGUMENT));
    assert!(!fx.job_dir("j1").exists());
    assert_eq!(fx.agent.supervisor().running_count().await, 0);

    // The id is free again
    let response = fx.exec("j1", "true", &[], 5000).await;
    assert!(response.error.is_none());
}

#[tokio::test]
async fn test_unsafe_job_id_is_rejected() {
    let fx = Fixture::new();
    let response = fx.exec("../escape", "true", &[], 5000).await;
    assert_eq!(error_code(&response), Some(codes::INVALID_ARGUMENT));
}

#[tokio::test]
async fn test_exec_without_params_is_invalid() {
    let fx = Fixture::new();
    let response = fx.send("j1", CommandKind::Exec).await;
    assert_eq!(error_code(&response), Some(codes::INVALID_ARGUMENT));
}

#[tokio::test]
async fn test_unknown_command_is_answered() {
    let fx = Fixture::new();
    let mut message = Message::new("coordinator", "j1", CommandKind::Stat);
    message.command = "REBOOT".to_string();

    let response = fx.agent.handle(&message).await;
    assert_eq!(error_code(&response), Some(codes::UNSUPPORTED_COMMAND));
    assert_eq!(response.id, message.id);
}

#[tokio::test]
async fn test_delivery_replies_to_sender() {
    let fx = Fixture::new();
    let message = Message::new("coordinator-7", "nope", CommandKind::Stat);
    fx.agent
        .on_delivery(&Delivery {
            offset: 0,
            payload: message.encode().unwrap(),
        })
        .await;

    let replies = fx.transport.published("coordinator-7").await;
    assert_eq!(replies.len(), 1);
    let response = Response::decode(&replies[0]).unwrap();
    assert_eq!(response.id, message.id);
    assert_eq!(error_code(&response), Some(codes::JOB_NOT_FOUND));
}

#[tokio::test]
async fn test_stale_and_malformed_deliveries_are_dropped() {
    let fx = Fixture::new();

    let mut stale = Message::exec(
        "coordinator",
        "j1",
        ExecParams {
            command: "true".to_string(),
            arguments: vec![],
            timeout: 5000,
        },
    );
    stale.timestamp -= 3600;
    fx.agent
        .on_delivery(&Delivery {
            offset: 0,
            payload: stale.encode().unwrap(),
        })
        .await;
    fx.agent
        .on_delivery(&Delivery {
            offset: 1,
            payload: b"not a message".to_vec(),
        })
        .await;

    assert_eq!(fx.transport.len("coordinator").await, 0);
    assert!(!fx.job_dir("j1").exists());
}
