use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::Result;

/// Read position of a consumer, persisted periodically rather than per
/// message.
///
/// The stored value is the offset of the next delivery to read. After a
/// crash, everything handled since the last flush is delivered again.
#[derive(Debug)]
pub struct OffsetCheckpoint {
    path: Option<PathBuf>,
    next: AtomicU64,
    flushed: AtomicU64,
}

impl OffsetCheckpoint {
    /// A checkpoint that is never persisted.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            next: AtomicU64::new(0),
            flushed: AtomicU64::new(0),
        }
    }

    /// Load the checkpoint stored at `path`, starting from 0 when the file is
    /// missing or unreadable.
    pub async fn load(path: PathBuf) -> Self {
        let start = match tokio::fs::read_to_string(&path).await {
            Ok(content) => match content.trim().parse::<u64>() {
                Ok(offset) => offset,
                Err(e) => {
                    tracing::error!(path = %path.display(), error = %e, "Malformed offset file, using 0");
                    0
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => {
                tracing::error!(path = %path.display(), error = %e, "Can not read offset file, using 0");
                0
            }
        };
        tracing::debug!(path = %path.display(), offset = start, "Offset checkpoint loaded");

        Self {
            path: Some(path),
            next: AtomicU64::new(start),
            flushed: AtomicU64::new(start),
        }
    }

    /// Offset of the next delivery to read.
    pub fn position(&self) -> u64 {
        self.next.load(Ordering::SeqCst)
    }

    /// Record that the delivery at `offset` has been handled.
    pub fn advance(&self, offset: u64) {
        self.next.fetch_max(offset + 1, Ordering::SeqCst);
    }

    /// Persist the current position if it moved since the last flush.
    pub async fn flush(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let position = self.position();
        if position == self.flushed.load(Ordering::SeqCst) {
            return Ok(());
        }

        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, position.to_string()).await?;
        tokio::fs::rename(&tmp, path).await?;
        self.flushed.store(position, Ordering::SeqCst);
        Ok(())
    }

    /// Flush every `interval` until `shutdown`, then flush one last time.
    pub fn spawn_flusher(
        self: Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = self.flush().await {
                            tracing::warn!(error = %e, "Failed to flush offset checkpoint");
                        }
                    }
                }
            }
            if let Err(e) = self.flush().await {
                tracing::warn!(error = %e, "Failed to flush offset checkpoint on shutdown");
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advance_never_moves_backwards() {
        let checkpoint = OffsetCheckpoint::in_memory();
        checkpoint.advance(4);
        checkpoint.advance(2);
        assert_eq!(checkpoint.position(), 5);
    }

    #[tokio::test]
    async fn flush_and_reload_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("offset");

        let checkpoint = OffsetCheckpoint::load(path.clone()).await;
        assert_eq!(checkpoint.position(), 0);
        checkpoint.advance(41);
        checkpoint.flush().await.unwrap();

        let reloaded = OffsetCheckpoint::load(path).await;
        assert_eq!(reloaded.position(), 42);
    }

    #[tokio::test]
    async fn malformed_file_starts_from_zero() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("offset");
        std::fs::write(&path, "not-a-number").unwrap();

        assert_eq!(OffsetCheckpoint::load(path).await.position(), 0);
    }
}
