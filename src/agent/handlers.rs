use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::agent::supervisor::Supervisor;
use crate::error::{OrcaError, Result};
use crate::protocol::{CommandKind, Message};

/// Handles one command kind on behalf of an agent.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn handle(&self, message: &Message) -> Result<Value>;
}

pub type HandlerTable = HashMap<CommandKind, Box<dyn CommandHandler>>;

/// Handler table wiring every command to `supervisor`.
pub fn handler_table(supervisor: &Supervisor) -> HandlerTable {
    let mut table: HandlerTable = HashMap::new();
    table.insert(CommandKind::Exec, Box::new(ExecHandler(supervisor.clone())));
    table.insert(CommandKind::Stat, Box::new(StatHandler(supervisor.clone())));
    table.insert(CommandKind::Tee, Box::new(TeeHandler(supervisor.clone())));
    table.insert(CommandKind::Cancel, Box::new(CancelHandler(supervisor.clone())));
    table
}

pub struct ExecHandler(pub Supervisor);

#[async_trait]
impl CommandHandler for ExecHandler {
    async fn handle(&self, message: &Message) -> Result<Value> {
        let params = message
            .params
            .as_ref()
            .ok_or_else(|| OrcaError::InvalidArgument("EXEC without params".to_string()))?;
        self.0.exec(&message.job, params).await?;
        Ok(json!({}))
    }
}

pub struct StatHandler(pub Supervisor);

#[async_trait]
impl CommandHandler for StatHandler {
    async fn handle(&self, message: &Message) -> Result<Value> {
        let status = self.0.stat(&message.job).await?;
        Ok(serde_json::to_value(status)?)
    }
}

pub struct TeeHandler(pub Supervisor);

#[async_trait]
impl CommandHandler for TeeHandler {
    async fn handle(&self, message: &Message) -> Result<Value> {
        Ok(Value::String(self.0.tee(&message.job).await?))
    }
}

pub struct CancelHandler(pub Supervisor);

#[async_trait]
impl CommandHandler for CancelHandler {
    async fn handle(&self, message: &Message) -> Result<Value> {
        self.0.cancel(&message.job).await?;
        Ok(json!({}))
    }
}
