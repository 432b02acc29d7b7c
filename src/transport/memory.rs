use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};

use crate::error::Result;
use crate::transport::{Delivery, Subscription, Transport};

/// Messages kept per destination unless configured otherwise.
pub const DEFAULT_RETENTION: usize = 100_000;

#[derive(Debug, Default)]
struct Topic {
    /// Absolute offset of `log[0]`.
    base: u64,
    log: VecDeque<Vec<u8>>,
    subscribers: Vec<mpsc::UnboundedSender<Delivery>>,
}

impl Topic {
    fn next_offset(&self) -> u64 {
        self.base + self.log.len() as u64
    }
}

/// In-process transport keeping a bounded log of every destination.
///
/// Offsets are absolute and keep growing; only the newest `retention`
/// messages of each destination can be replayed. Cloning shares the
/// underlying log, so one instance can be handed to a coordinator and any
/// number of agents in the same process.
#[derive(Debug, Clone)]
pub struct MemoryTransport {
    topics: Arc<Mutex<HashMap<String, Topic>>>,
    retention: usize,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::with_retention(DEFAULT_RETENTION)
    }

    pub fn with_retention(retention: usize) -> Self {
        Self {
            topics: Arc::new(Mutex::new(HashMap::new())),
            retention: retention.max(1),
        }
    }

    /// Number of messages ever published to `destination`.
    pub async fn len(&self, destination: &str) -> usize {
        self.topics
            .lock()
            .await
            .get(destination)
            .map(|t| t.next_offset() as usize)
            .unwrap_or(0)
    }

    /// Copy of every retained payload of `destination`, in order.
    pub async fn published(&self, destination: &str) -> Vec<Vec<u8>> {
        self.topics
            .lock()
            .await
            .get(destination)
            .map(|t| t.log.iter().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn publish(&self, destination: &str, payload: Vec<u8>) -> Result<u64> {
        let mut topics = self.topics.lock().await;
        let topic = topics.entry(destination.to_string()).or_default();
        let offset = topic.next_offset();

        // Closed subscribers are pruned as a side effect of delivery
        topic.subscribers.retain(|tx| {
            tx.send(Delivery {
                offset,
                payload: payload.clone(),
            })
            .is_ok()
        });
        topic.log.push_back(payload);
        while topic.log.len() > self.retention {
            topic.log.pop_front();
            topic.base += 1;
        }

        Ok(offset)
    }

    async fn subscribe(&self, destination: &str, from_offset: u64) -> Result<Subscription> {
        let (tx, rx) = mpsc::unbounded_channel();

        // Backlog and registration happen under one lock so no publish can
        // slip in between them.
        let mut topics = self.topics.lock().await;
        let topic = topics.entry(destination.to_string()).or_default();
        if from_offset < topic.base {
            tracing::warn!(
                destination,
                from_offset,
                oldest = topic.base,
                "Requested offset is no longer retained, replaying from the oldest message"
            );
        }
        let start = from_offset.max(topic.base);
        let skip = (start - topic.base) as usize;
        for (i, payload) in topic.log.iter().enumerate().skip(skip) {
            let _ = tx.send(Delivery {
                offset: topic.base + i as u64,
                payload: payload.clone(),
            });
        }
        topic.subscribers.push(tx);

        Ok(Subscription::new(rx))
    }
}
