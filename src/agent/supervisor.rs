use std::collections::HashMap;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::agent::record::{JobDir, StatRecord, TEE_LIMIT};
use crate::error::{OrcaError, Result};
use crate::protocol::{ExecParams, JobId, NodeStatus};

/// In-memory handle on a live child process.
#[derive(Debug)]
struct RunningJob {
    pid: u32,
    cancel: CancellationToken,
}

enum Ended {
    Exited(std::io::Result<ExitStatus>),
    TimedOut,
    Cancelled,
}

/// Runs job processes on this node and keeps their records on disk.
///
/// A job is RUNNING exactly while its handle is in the table. The handle is
/// dropped by the supervising task only after the stat file is written, so a
/// STAT always finds one or the other.
#[derive(Debug, Clone)]
pub struct Supervisor {
    root: PathBuf,
    kill_grace: Duration,
    running: Arc<Mutex<HashMap<JobId, RunningJob>>>,
}

impl Supervisor {
    pub fn new(root: impl Into<PathBuf>, kill_grace: Duration) -> Self {
        Self {
            root: root.into(),
            kill_grace,
            running: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Start `params.command` for `job` and return once it is spawned.
    pub async fn exec(&self, job: &str, params: &ExecParams) -> Result<()> {
        let dir = JobDir::new(&self.root, job)?;

        tokio::fs::create_dir_all(&self.root).await?;
        if let Err(e) = tokio::fs::create_dir(dir.path()).await {
            if e.kind() == std::io::ErrorKind::AlreadyExists {
                return Err(OrcaError::JobAlreadyExecuted(job.to_string()));
            }
            return Err(e.into());
        }

        let child = match spawn(&dir, params).await {
            Ok(child) => child,
            Err(e) => {
                if let Err(rm) = tokio::fs::remove_dir_all(dir.path()).await {
                    tracing::warn!(job_id = %job, error = %rm, "Failed to remove job directory");
                }
                tracing::warn!(job_id = %job, error = %e, "Failed to start job");
                return Err(e);
            }
        };

        let pid = child.id().unwrap_or_default();
        if let Err(e) = dir.write_pid(pid).await {
            tracing::warn!(job_id = %job, pid, error = %e, "Failed to write pid file");
        }

        let cancel = CancellationToken::new();
        self.running.lock().await.insert(
            job.to_string(),
            RunningJob {
                pid,
                cancel: cancel.clone(),
            },
        );

        tracing::info!(
            job_id = %job,
            pid,
            command = %params.command,
            timeout_ms = params.timeout,
            "Job started"
        );

        tokio::spawn(supervise(
            child,
            dir,
            pid,
            Duration::from_millis(params.timeout),
            cancel,
            self.kill_grace,
            self.running.clone(),
        ));

        Ok(())
    }

    pub async fn stat(&self, job: &str) -> Result<NodeStatus> {
        let dir = JobDir::new(&self.root, job)?;
        if self.running.lock().await.contains_key(job) {
            return Ok(NodeStatus::Running);
        }
        dir.read_status().await
    }

    pub async fn tee(&self, job: &str) -> Result<String> {
        JobDir::new(&self.root, job)?.tail_output(TEE_LIMIT).await
    }

    /// Ask a running job to stop. Acknowledged before the process exits.
    pub async fn cancel(&self, job: &str) -> Result<()> {
        let dir = JobDir::new(&self.root, job)?;
        if let Some(handle) = self.running.lock().await.get(job) {
            tracing::info!(job_id = %job, pid = handle.pid, "Cancelling job");
            handle.cancel.cancel();
            return Ok(());
        }
        if dir.has_stat().await? {
            return Ok(());
        }
        Err(OrcaError::JobNotFound(job.to_string()))
    }

    pub async fn is_running(&self, job: &str) -> bool {
        self.running.lock().await.contains_key(job)
    }

    pub async fn running_count(&self) -> usize {
        self.running.lock().await.len()
    }
}

/// Spawn the job's process in its own process group with stdout and stderr
/// appended to the output file.
async fn spawn(dir: &JobDir, params: &ExecParams) -> Result<Child> {
    let output = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.output_path())
        .await?
        .into_std()
        .await;
    let stderr = output.try_clone()?;

    Command::new(&params.command)
        .args(&params.arguments)
        .stdin(Stdio::null())
        .stdout(Stdio::from(output))
        .stderr(Stdio::from(stderr))
        .process_group(0)
        .kill_on_drop(false)
        .spawn()
        .map_err(|e| {
            OrcaError::InvalidArgument(format!("Can not run {}: {}", params.command, e))
        })
}

async fn supervise(
    mut child: Child,
    dir: JobDir,
    pid: u32,
    timeout: Duration,
    cancel: CancellationToken,
    kill_grace: Duration,
    running: Arc<Mutex<HashMap<JobId, RunningJob>>>,
) {
    let ended = tokio::select! {
        status = child.wait() => Ended::Exited(status),
        _ = tokio::time::sleep(timeout) => Ended::TimedOut,
        _ = cancel.cancelled() => Ended::Cancelled,
    };

    let mut record = StatRecord::default();
    let status = match ended {
        Ended::Exited(status) => status,
        Ended::TimedOut => {
            tracing::info!(job_id = %dir.job(), pid, "Job timed out, killing");
            record.timeout = true;
            signal_group(pid, Signal::SIGKILL);
            child.wait().await
        }
        Ended::Cancelled => {
            record.cancelled = true;
            signal_group(pid, Signal::SIGTERM);
            match tokio::time::timeout(kill_grace, child.wait()).await {
                Ok(status) => status,
                Err(_) => {
                    tracing::info!(job_id = %dir.job(), pid, "Job ignored SIGTERM, killing");
                    signal_group(pid, Signal::SIGKILL);
                    child.wait().await
                }
            }
        }
    };

    match status {
        Ok(status) => {
            record.code = status.code();
            record.signal = status.signal().map(signal_name);
        }
        Err(e) => {
            tracing::error!(job_id = %dir.job(), pid, error = %e, "Failed to reap job process");
        }
    }

    if let Err(e) = dir.write_stat(&record).await {
        tracing::error!(job_id = %dir.job(), error = %e, "Failed to write stat file");
    }
    running.lock().await.remove(dir.job());

    tracing::info!(
        job_id = %dir.job(),
        pid,
        code = ?record.code,
        signal = ?record.signal,
        timeout = record.timeout,
        cancelled = record.cancelled,
        "Job finished"
    );
}

fn signal_group(pid: u32, signal: Signal) {
    if pid == 0 {
        return;
    }
    if let Err(e) = killpg(Pid::from_raw(pid as i32), signal) {
        tracing::debug!(pid, signal = %signal, error = %e, "Failed to signal process group");
    }
}

fn signal_name(signal: i32) -> String {
    Signal::try_from(signal)
        .map(|s| s.as_str().to_string())
        .unwrap_or_else(|_| format!("SIG{}", signal))
}
