use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::error::{OrcaError, Result};
use crate::protocol::NodeStatus;

/// Number of trailing output bytes returned by TEE.
pub const TEE_LIMIT: u64 = 10 * 1024;

const PID_FILE: &str = "pid";
const OUTPUT_FILE: &str = "output";
const STAT_FILE: &str = "stat";

/// Terminal outcome of a job's process, written once when it exits.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatRecord {
    #[serde(default)]
    pub code: Option<i32>,
    #[serde(default)]
    pub signal: Option<String>,
    #[serde(default)]
    pub cancelled: bool,
    #[serde(default)]
    pub timeout: bool,
}

impl StatRecord {
    /// A timeout wins over a cancel, a cancel over the raw signal.
    pub fn status(&self) -> NodeStatus {
        if self.timeout {
            NodeStatus::Timeout
        } else if self.cancelled {
            NodeStatus::Cancelled
        } else if let Some(signal) = &self.signal {
            NodeStatus::Killed {
                signal: signal.clone(),
            }
        } else {
            NodeStatus::Exited { code: self.code }
        }
    }
}

/// On-disk layout of one job: `<root>/<job>/{pid, output, stat}`.
#[derive(Debug, Clone)]
pub struct JobDir {
    job: String,
    dir: PathBuf,
}

impl JobDir {
    /// Fails with `InvalidArgument` unless `job` is a single plain path
    /// component.
    pub fn new(root: &Path, job: &str) -> Result<Self> {
        let valid = !job.is_empty()
            && job != "."
            && job != ".."
            && !job.contains(['/', '\\', '\0']);
        if !valid {
            return Err(OrcaError::InvalidArgument(format!("Invalid job id: {:?}", job)));
        }
        Ok(Self {
            job: job.to_string(),
            dir: root.join(job),
        })
    }

    pub fn job(&self) -> &str {
        &self.job
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    pub fn pid_path(&self) -> PathBuf {
        self.dir.join(PID_FILE)
    }

    pub fn output_path(&self) -> PathBuf {
        self.dir.join(OUTPUT_FILE)
    }

    pub fn stat_path(&self) -> PathBuf {
        self.dir.join(STAT_FILE)
    }

    pub async fn exists(&self) -> Result<bool> {
        Ok(tokio::fs::try_exists(&self.dir).await?)
    }

    pub async fn write_pid(&self, pid: u32) -> Result<()> {
        tokio::fs::write(self.pid_path(), pid.to_string()).await?;
        Ok(())
    }

    /// Replace the stat file atomically so readers never see a partial record.
    pub async fn write_stat(&self, record: &StatRecord) -> Result<()> {
        let tmp = self.dir.join(format!("{}.tmp", STAT_FILE));
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(record)?).await?;
        tokio::fs::rename(&tmp, self.stat_path()).await?;
        Ok(())
    }

    pub async fn has_stat(&self) -> Result<bool> {
        Ok(tokio::fs::try_exists(self.stat_path()).await?)
    }

    /// Terminal status from the stat file.
    pub async fn read_status(&self) -> Result<NodeStatus> {
        if !self.exists().await? {
            return Err(OrcaError::JobNotFound(self.job.clone()));
        }
        let bytes = match tokio::fs::read(self.stat_path()).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(OrcaError::JobDataNotFound(self.job.clone()));
            }
            Err(e) => return Err(e.into()),
        };
        let record: StatRecord = serde_json::from_slice(&bytes).map_err(|e| {
            OrcaError::Internal(format!("Corrupt stat file for job {}: {}", self.job, e))
        })?;
        Ok(record.status())
    }

    /// The last `limit` bytes of output, decoded lossily.
    pub async fn tail_output(&self, limit: u64) -> Result<String> {
        if !self.exists().await? {
            return Err(OrcaError::JobNotFound(self.job.clone()));
        }
        let mut file = match tokio::fs::File::open(self.output_path()).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(OrcaError::JobDataNotFound(self.job.clone()));
            }
            Err(e) => return Err(e.into()),
        };

        let len = file.metadata().await?.len();
        file.seek(SeekFrom::Start(len.saturating_sub(limit))).await?;
        let mut buf = Vec::with_capacity(len.min(limit) as usize);
        // A writer may still be appending; never return more than `limit`.
        file.take(limit).read_to_end(&mut buf).await?;

        Ok(String::from_utf8_lossy(&buf).into_owned())
    }
}
