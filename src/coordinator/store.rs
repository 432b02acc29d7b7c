use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::coordinator::job::Job;
use crate::error::{OrcaError, Result};

const DEFAULT_MAX_JOBS: usize = 10_000;

/// Persistence of coordinator job records.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn create(&self, job: &Job) -> Result<()>;

    /// Fails with `JobNotFound` for an unknown id.
    async fn read(&self, id: &str) -> Result<Job>;

    async fn update(&self, job: &Job) -> Result<()>;

    /// Every stored job, oldest first.
    async fn list(&self) -> Result<Vec<Job>>;
}

/// Job store held in process memory.
#[derive(Debug)]
pub struct MemoryJobStore {
    jobs: RwLock<HashMap<String, Job>>,
    max_jobs: usize,
}

impl Default for MemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_JOBS)
    }

    pub fn with_capacity(max_jobs: usize) -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            max_jobs,
        }
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create(&self, job: &Job) -> Result<()> {
        let mut jobs = self.jobs.write().await;
        if jobs.len() >= self.max_jobs {
            return Err(OrcaError::Internal(format!(
                "Job store is full ({} jobs)",
                self.max_jobs
            )));
        }
        jobs.insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn read(&self, id: &str) -> Result<Job> {
        self.jobs
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| OrcaError::JobNotFound(id.to_string()))
    }

    async fn update(&self, job: &Job) -> Result<()> {
        let mut jobs = self.jobs.write().await;
        match jobs.get_mut(&job.id) {
            Some(stored) => {
                *stored = job.clone();
                Ok(())
            }
            None => Err(OrcaError::JobNotFound(job.id.clone())),
        }
    }

    async fn list(&self) -> Result<Vec<Job>> {
        let mut jobs: Vec<Job> = self.jobs.read().await.values().cloned().collect();
        jobs.sort_by_key(|j| j.created_at);
        Ok(jobs)
    }
}

/// Job store keeping one JSON document per job under a directory.
#[derive(Debug, Clone)]
pub struct FileJobStore {
    root: PathBuf,
}

impl FileJobStore {
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    fn path(&self, id: &str) -> Result<PathBuf> {
        if id.is_empty() || id.contains(['/', '\\']) || id == "." || id == ".." {
            return Err(OrcaError::InvalidArgument(format!("Invalid job id: {:?}", id)));
        }
        Ok(self.root.join(format!("{}.json", id)))
    }

    async fn write(&self, job: &Job) -> Result<()> {
        let path = self.path(&job.id)?;
        // One temp file per write; overlapping writers must never share it
        let tmp = self
            .root
            .join(format!("{}.json.{}.tmp", job.id, Uuid::new_v4().simple()));
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(job)?).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }
}

#[async_trait]
impl JobStore for FileJobStore {
    async fn create(&self, job: &Job) -> Result<()> {
        self.write(job).await
    }

    async fn read(&self, id: &str) -> Result<Job> {
        // No record can exist under an id that is not a valid file name
        let Ok(path) = self.path(id) else {
            return Err(OrcaError::JobNotFound(id.to_string()));
        };
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(OrcaError::JobNotFound(id.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn update(&self, job: &Job) -> Result<()> {
        if !tokio::fs::try_exists(self.path(&job.id)?).await? {
            return Err(OrcaError::JobNotFound(job.id.clone()));
        }
        self.write(job).await
    }

    async fn list(&self) -> Result<Vec<Job>> {
        let mut jobs = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let bytes = tokio::fs::read(&path).await?;
            match serde_json::from_slice::<Job>(&bytes) {
                Ok(job) => jobs.push(job),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable job record");
                }
            }
        }
        jobs.sort_by_key(|j| j.created_at);
        Ok(jobs)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::coordinator::job::NodeResult;
    use crate::protocol::{JobState, NodeState};

    fn job() -> Job {
        Job::new("echo".into(), vec!["hi".into()], vec!["n1".into()], 1000)
    }

    #[tokio::test]
    async fn memory_store_respects_capacity() {
        let store = MemoryJobStore::with_capacity(1);
        store.create(&job()).await.unwrap();
        assert!(store.create(&job()).await.is_err());
    }

    #[tokio::test]
    async fn memory_store_update_requires_existing_job() {
        let store = MemoryJobStore::new();
        assert!(matches!(
            store.update(&job()).await,
            Err(OrcaError::JobNotFound(_))
        ));
    }

    #[tokio::test]
    async fn file_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileJobStore::open(dir.path()).await.unwrap();

        let mut job = job();
        store.create(&job).await.unwrap();
        job.state.job = JobState::Cancelling;
        store.update(&job).await.unwrap();

        assert_eq!(store.read(&job.id).await.unwrap(), job);
        assert_eq!(store.list().await.unwrap(), vec![job]);
    }

    #[tokio::test]
    async fn file_store_reports_missing_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileJobStore::open(dir.path()).await.unwrap();

        assert!(matches!(
            store.read("nope").await,
            Err(OrcaError::JobNotFound(_))
        ));
        assert!(matches!(
            store.read("../escape").await,
            Err(OrcaError::JobNotFound(_))
        ));

        let mut bad = job();
        bad.id = "../escape".to_string();
        assert!(matches!(
            store.create(&bad).await,
            Err(OrcaError::InvalidArgument(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn file_store_survives_overlapping_updates() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FileJobStore::open(dir.path()).await.unwrap());

        let small = job();
        let mut large = small.clone();
        large.state.nodes = (0..50)
            .map(|i| NodeResult {
                name: format!("node-{}", i),
                state: NodeState::Exited,
                code: Some(0),
                signal: None,
                error: None,
            })
            .collect();
        store.create(&small).await.unwrap();

        for _ in 0..50 {
            let writers: Vec<_> = (0..4)
                .map(|i| {
                    let store = store.clone();
                    let job = if i % 2 == 0 { small.clone() } else { large.clone() };
                    tokio::spawn(async move { store.update(&job).await })
                })
                .collect();
            for writer in writers {
                writer.await.unwrap().unwrap();
            }

            let read = store.read(&small.id).await.unwrap();
            assert!(read == small || read == large);
        }

        assert_eq!(store.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn list_is_oldest_first() {
        let store = MemoryJobStore::new();
        let first = job();
        let mut second = job();
        second.created_at = first.created_at + chrono::Duration::seconds(1);
        store.create(&second).await.unwrap();
        store.create(&first).await.unwrap();

        let ids: Vec<String> = store.list().await.unwrap().into_iter().map(|j| j.id).collect();
        assert_eq!(ids, vec![first.id, second.id]);
    }
}
