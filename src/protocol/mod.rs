//! Wire vocabulary shared by the coordinator and its agents.
//!
//! Commands travel as JSON [`Message`]s addressed to a node's destination and
//! are answered with a [`Response`] addressed back to the message sender.

pub mod message;
pub mod state;

pub use message::{CommandKind, ErrorBody, ExecParams, JobId, Message, NodeId, Response};
pub use state::{JobState, NodeState, NodeStatus};
