use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{codes, OrcaError, Result};

/// Identity of a node; doubles as its transport destination.
pub type NodeId = String;

/// Opaque job token.
pub type JobId = String;

/// Commands understood by agents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    Exec,
    Stat,
    Tee,
    Cancel,
}

impl CommandKind {
    pub fn as_str(self) -> &'static str {
        match self {
            CommandKind::Exec => "EXEC",
            CommandKind::Stat => "STAT",
            CommandKind::Tee => "TEE",
            CommandKind::Cancel => "CANCEL",
        }
    }
}

impl std::fmt::Display for CommandKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for CommandKind {
    type Err = OrcaError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "EXEC" => Ok(CommandKind::Exec),
            "STAT" => Ok(CommandKind::Stat),
            "TEE" => Ok(CommandKind::Tee),
            "CANCEL" => Ok(CommandKind::Cancel),
            other => Err(OrcaError::UnsupportedCommand(other.to_string())),
        }
    }
}

/// Parameters of an EXEC command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecParams {
    pub command: String,
    #[serde(default)]
    pub arguments: Vec<String>,
    /// Wall-clock limit in milliseconds.
    pub timeout: u64,
}

/// A command sent from the coordinator to an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub sender: NodeId,
    pub job: JobId,
    /// Kept as the raw name so unknown commands can still be answered.
    pub command: String,
    /// Epoch seconds at which the message was issued.
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<ExecParams>,
}

impl Message {
    pub fn new(sender: &str, job: &str, kind: CommandKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            sender: sender.to_string(),
            job: job.to_string(),
            command: kind.as_str().to_string(),
            timestamp: Utc::now().timestamp(),
            params: None,
        }
    }

    pub fn exec(sender: &str, job: &str, params: ExecParams) -> Self {
        Self {
            params: Some(params),
            ..Self::new(sender, job, CommandKind::Exec)
        }
    }

    pub fn kind(&self) -> Result<CommandKind> {
        self.command.parse()
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Wire form of an error reported by a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: u32,
    pub message: String,
}

impl ErrorBody {
    pub fn request_timeout() -> Self {
        ErrorBody::from(&OrcaError::RequestTimeout)
    }

    pub fn is_request_timeout(&self) -> bool {
        self.code == codes::REQUEST_TIMEOUT
    }
}

impl std::fmt::Display for ErrorBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

/// An agent's answer to one [`Message`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: Uuid,
    pub sender: NodeId,
    pub job: JobId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl Response {
    /// Build the reply of `sender` to `message`.
    pub fn reply(message: &Message, sender: &str, outcome: Result<serde_json::Value>) -> Self {
        let (result, error) = match outcome {
            Ok(value) => (Some(value), None),
            Err(e) => (None, Some(ErrorBody::from(&e))),
        };
        Self {
            id: message.id,
            sender: sender.to_string(),
            job: message.job.clone(),
            result,
            error,
        }
    }

    /// A stand-in for a node that did not answer before the deadline.
    pub fn request_timeout(id: Uuid, sender: &str, job: &str) -> Self {
        Self {
            id,
            sender: sender.to_string(),
            job: job.to_string(),
            result: None,
            error: Some(ErrorBody::request_timeout()),
        }
    }

    /// Decode the result payload, or hand back the reported error.
    pub fn outcome<T: DeserializeOwned>(&self) -> std::result::Result<T, ErrorBody> {
        if let Some(error) = &self.error {
            return Err(error.clone());
        }
        let value = self.result.clone().unwrap_or(serde_json::Value::Null);
        serde_json::from_value(value).map_err(|e| ErrorBody {
            code: codes::INTERNAL_ERROR,
            message: format!("Malformed result from {}: {}", self.sender, e),
        })
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::NodeStatus;

    #[test]
    fn exec_message_wire_format() {
        let message = Message::exec(
            "coordinator",
            "job-1",
            ExecParams {
                command: "echo".to_string(),
                arguments: vec!["hi".to_string()],
                timeout: 5000,
            },
        );
        let value: serde_json::Value = serde_json::from_slice(&message.encode().unwrap()).unwrap();
        assert_eq!(value["command"], "EXEC");
        assert_eq!(value["sender"], "coordinator");
        assert_eq!(value["params"]["arguments"][0], "hi");
        assert_eq!(value["params"]["timeout"], 5000);
    }

    #[test]
    fn stat_message_omits_params() {
        let message = Message::new("coordinator", "job-1", CommandKind::Stat);
        let value: serde_json::Value = serde_json::from_slice(&message.encode().unwrap()).unwrap();
        assert!(value.get("params").is_none());
        assert_eq!(message.kind().unwrap(), CommandKind::Stat);
    }

    #[test]
    fn unknown_command_is_reported_not_rejected() {
        let raw = format!(
            r#"{{"id":"{}","sender":"c","job":"j","command":"REBOOT","timestamp":0}}"#,
            Uuid::new_v4()
        );
        let message = Message::decode(raw.as_bytes()).unwrap();
        assert!(matches!(
            message.kind(),
            Err(OrcaError::UnsupportedCommand(name)) if name == "REBOOT"
        ));
    }

    #[test]
    fn reply_carries_error_body() {
        let message = Message::new("coordinator", "job-1", CommandKind::Stat);
        let response = Response::reply(
            &message,
            "n1",
            Err(OrcaError::JobNotFound("job-1".to_string())),
        );
        assert_eq!(response.id, message.id);
        assert_eq!(response.sender, "n1");
        let error = response.outcome::<NodeStatus>().unwrap_err();
        assert_eq!(error.code, codes::JOB_NOT_FOUND);
    }

    #[test]
    fn synthesized_timeout_is_recognisable() {
        let response = Response::request_timeout(Uuid::new_v4(), "n2", "job-1");
        assert!(response.error.as_ref().unwrap().is_request_timeout());
    }
}
