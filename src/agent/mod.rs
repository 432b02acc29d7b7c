//! Node-side execution of dispatched commands.
//!
//! An agent consumes the destination named after its node id, runs each
//! command through a handler table and publishes the response to the
//! message's sender.
//!
//! # Components
//!
//! - [`Supervisor`]: spawns and supervises job processes, answers from the
//!   live handle or the on-disk record
//! - [`record`]: the `<root>/<job>/{pid, output, stat}` layout
//! - [`handlers`]: EXEC, STAT, TEE and CANCEL handlers

pub mod handlers;
pub mod record;
pub mod supervisor;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::config::AgentConfig;
use crate::error::{OrcaError, Result};
use crate::protocol::{Message, Response};
use crate::transport::{consume, Delivery, DeliveryHandler, OffsetCheckpoint, Transport};

pub use handlers::{handler_table, CommandHandler, HandlerTable};
pub use record::{JobDir, StatRecord, TEE_LIMIT};
pub use supervisor::Supervisor;

pub struct Agent {
    config: AgentConfig,
    transport: Arc<dyn Transport>,
    supervisor: Supervisor,
    handlers: HandlerTable,
    /// Epoch seconds; messages issued before this are not acted upon.
    started_at: i64,
}

impl Agent {
    pub fn new(config: AgentConfig, transport: Arc<dyn Transport>) -> Self {
        let supervisor = Supervisor::new(config.root.clone(), config.kill_grace());
        let handlers = handler_table(&supervisor);
        Self {
            config,
            transport,
            supervisor,
            handlers,
            started_at: Utc::now().timestamp(),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.config.node_id
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    /// Run one message through the handler table.
    pub async fn handle(&self, message: &Message) -> Response {
        let outcome = match message.kind() {
            Ok(kind) => match self.handlers.get(&kind) {
                Some(handler) => handler.handle(message).await,
                None => Err(OrcaError::UnsupportedCommand(message.command.clone())),
            },
            Err(e) => Err(e),
        };

        if let Err(e) = &outcome {
            tracing::debug!(
                node = %self.config.node_id,
                job_id = %message.job,
                command = %message.command,
                error = %e,
                "Command failed"
            );
        }

        Response::reply(message, &self.config.node_id, outcome)
    }

    /// Consume this node's destination until `shutdown` fires.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> Result<()> {
        let checkpoint = Arc::new(match &self.config.offset_file {
            Some(path) => OffsetCheckpoint::load(path.clone()).await,
            None => OffsetCheckpoint::in_memory(),
        });
        let flusher = checkpoint
            .clone()
            .spawn_flusher(self.config.checkpoint_interval(), shutdown.clone());

        tracing::info!(
            node = %self.config.node_id,
            root = %self.config.root.display(),
            "Agent started"
        );

        consume(
            self.transport.as_ref(),
            &self.config.node_id,
            &checkpoint,
            &*self,
            shutdown,
        )
        .await;

        flusher
            .await
            .map_err(|e| OrcaError::Internal(format!("Offset flusher failed: {}", e)))?;
        tracing::info!(node = %self.config.node_id, "Agent stopped");
        Ok(())
    }
}

#[async_trait]
impl DeliveryHandler for Agent {
    async fn on_delivery(&self, delivery: &Delivery) {
        let message = match Message::decode(&delivery.payload) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(
                    node = %self.config.node_id,
                    offset = delivery.offset,
                    error = %e,
                    "Dropping malformed message"
                );
                return;
            }
        };

        if message.timestamp < self.started_at {
            tracing::debug!(
                node = %self.config.node_id,
                job_id = %message.job,
                command = %message.command,
                "Dropping message issued before agent start"
            );
            return;
        }

        let response = self.handle(&message).await;
        let payload = match response.encode() {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!(job_id = %message.job, error = %e, "Failed to encode response");
                return;
            }
        };
        if let Err(e) = self.transport.publish(&message.sender, payload).await {
            tracing::warn!(
                node = %self.config.node_id,
                job_id = %message.job,
                destination = %message.sender,
                error = %e,
                "Failed to publish response"
            );
        }
    }
}
