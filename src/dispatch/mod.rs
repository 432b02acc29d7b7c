//! Fan-out of one command to many nodes, fan-in of their responses.
//!
//! A dispatch registers a correlation entry keyed by the message id, publishes
//! the message to every target's destination and arms a deadline. Responses
//! are fed back through [`Dispatcher::on_response`]. The entry completes
//! exactly once: either every target answered, or the deadline fired and the
//! missing targets were filled in with synthesized `RequestTimeout` errors.
//! Whichever path removes the entry from the table first wins.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::error::{OrcaError, Result};
use crate::protocol::{JobId, Message, NodeId, Response};
use crate::transport::Transport;

/// Responses of one dispatch keyed by node.
pub type Responses = HashMap<NodeId, Response>;

type PendingTable = Arc<Mutex<HashMap<Uuid, PendingDispatch>>>;

struct PendingDispatch {
    targets: Vec<NodeId>,
    job: JobId,
    responses: Responses,
    completion: oneshot::Sender<Responses>,
    timer: JoinHandle<()>,
}

/// Handle on an in-flight dispatch.
///
/// Awaiting [`Pending::wait`] yields the merged responses. Dropping it turns
/// the dispatch into fire-and-forget; the entry is still tracked until it
/// completes or expires.
#[derive(Debug)]
pub struct Pending {
    id: Uuid,
    rx: oneshot::Receiver<Responses>,
}

impl Pending {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub async fn wait(self) -> Result<Responses> {
        self.rx
            .await
            .map_err(|_| OrcaError::Internal(format!("Dispatch {} was dropped", self.id)))
    }
}

pub struct Dispatcher {
    transport: Arc<dyn Transport>,
    pending: PendingTable,
}

impl Dispatcher {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Send `message` to every node in `targets` and collect their answers
    /// for at most `timeout`.
    ///
    /// Duplicate targets are collapsed. An empty target set completes
    /// immediately with no responses.
    pub async fn dispatch(
        &self,
        targets: &[NodeId],
        message: &Message,
        timeout: Duration,
    ) -> Result<Pending> {
        let mut unique: Vec<NodeId> = Vec::with_capacity(targets.len());
        for target in targets {
            if !unique.contains(target) {
                unique.push(target.clone());
            }
        }

        let payload = message.encode()?;
        let id = message.id;
        let (completion, rx) = oneshot::channel();

        if unique.is_empty() {
            let _ = completion.send(Responses::new());
            return Ok(Pending { id, rx });
        }

        {
            let mut table = self.pending.lock().await;
            if table.contains_key(&id) {
                return Err(OrcaError::InvalidArgument(format!(
                    "Dispatch {} is already in flight",
                    id
                )));
            }

            // Spawned under the lock so the deadline can never observe the
            // table before this entry is in it.
            let timer_table = self.pending.clone();
            let timer = tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                expire(&timer_table, id).await;
            });

            table.insert(
                id,
                PendingDispatch {
                    targets: unique.clone(),
                    job: message.job.clone(),
                    responses: Responses::new(),
                    completion,
                    timer,
                },
            );
        }

        tracing::debug!(
            dispatch_id = %id,
            job_id = %message.job,
            command = %message.command,
            targets = unique.len(),
            "Dispatching"
        );

        for target in &unique {
            if let Err(e) = self.transport.publish(target, payload.clone()).await {
                tracing::warn!(
                    dispatch_id = %id,
                    node = %target,
                    error = %e,
                    "Failed to publish, node will time out"
                );
            }
        }

        Ok(Pending { id, rx })
    }

    /// Record one node's answer.
    pub async fn on_response(&self, response: Response) {
        let mut table = self.pending.lock().await;

        let Some(entry) = table.get_mut(&response.id) else {
            tracing::debug!(
                dispatch_id = %response.id,
                node = %response.sender,
                "Response for unknown or finished dispatch, dropping"
            );
            return;
        };

        if !entry.targets.contains(&response.sender) {
            tracing::warn!(
                dispatch_id = %response.id,
                node = %response.sender,
                "Response from a node outside the target set, ignoring"
            );
            return;
        }
        if entry.responses.contains_key(&response.sender) {
            tracing::debug!(
                dispatch_id = %response.id,
                node = %response.sender,
                "Duplicate response, ignoring"
            );
            return;
        }

        let id = response.id;
        entry.responses.insert(response.sender.clone(), response);
        if entry.responses.len() < entry.targets.len() {
            return;
        }

        if let Some(entry) = table.remove(&id) {
            entry.timer.abort();
            let _ = entry.completion.send(entry.responses);
        }
    }

    /// Number of dispatches still waiting for responses.
    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }
}

async fn expire(table: &PendingTable, id: Uuid) {
    let Some(mut entry) = table.lock().await.remove(&id) else {
        return;
    };

    let missing: Vec<NodeId> = entry
        .targets
        .iter()
        .filter(|t| !entry.responses.contains_key(*t))
        .cloned()
        .collect();
    tracing::debug!(
        dispatch_id = %id,
        job_id = %entry.job,
        missing = ?missing,
        "Dispatch timed out"
    );
    for node in missing {
        let response = Response::request_timeout(id, &node, &entry.job);
        entry.responses.insert(node, response);
    }

    let _ = entry.completion.send(entry.responses);
}
