//! Command and answer payloads carried inside frames.
//!
//! Payloads are bincode-encoded `Vec<Command>` (requests) or `Vec<Answer>`
//! (responses). The routing core only interprets the cluster commands; host
//! commands travel as `Command::Opaque`.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Result, TransportError};
use crate::types::{HostId, NodeId};

/// Serialize a message to bytes using bincode.
pub fn serialize_message<T: Serialize>(msg: &T) -> Result<Vec<u8>> {
    bincode::serialize(msg).map_err(|e| TransportError::SerializationError(e.to_string()))
}

/// Deserialize a message from bytes using bincode.
pub fn deserialize_message<T: DeserializeOwned>(data: &[u8]) -> Result<T> {
    bincode::deserialize(data).map_err(|e| TransportError::SerializationError(e.to_string()))
}

/// Host lifecycle events exchanged between nodes and recorded in the host store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AgentEvent {
    /// A node established a direct connection to the host.
    AgentConnected,
    /// The host's agent connection went away.
    AgentDisconnected,
    /// Force the host to reconnect to whichever node claims it next.
    ShutdownRequested,
    /// Owning node's peer went down.
    ManagementServerDown,
    /// Ask the owning node to queue the host for transfer.
    RequestAgentRebalance,
    /// Ask a node to take over (or give away) the host now.
    StartAgentRebalance,
    /// The transfer finished and the new owner holds the connection.
    RebalanceCompleted,
    /// The transfer failed and the host must be re-adopted.
    RebalanceFailed,
}

/// A command carried in a request frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    /// Abort a pending sequence on the receiving attache.
    Cancel {
        /// Sequence number to abort.
        sequence: u64,
        /// Human readable reason.
        reason: String,
    },
    /// Rebalance control exchanged between nodes.
    TransferAgent {
        /// Host being moved.
        host_id: HostId,
        /// Node currently owning the host connection.
        current_owner: NodeId,
        /// Node that should own it afterwards.
        future_owner: NodeId,
        /// Which rebalance phase this is.
        event: AgentEvent,
    },
    /// Notify peers about a host status change.
    ChangeAgent {
        /// Affected host.
        host_id: HostId,
        /// What happened.
        event: AgentEvent,
    },
    /// A host command the routing core does not interpret.
    Opaque {
        /// Command name, for logging.
        name: String,
        /// Encoded command body.
        body: Vec<u8>,
    },
}

impl Command {
    /// Short name used in log lines.
    pub fn name(&self) -> &str {
        match self {
            Command::Cancel { .. } => "Cancel",
            Command::TransferAgent { .. } => "TransferAgent",
            Command::ChangeAgent { .. } => "ChangeAgent",
            Command::Opaque { name, .. } => name,
        }
    }
}

/// The answer to one command of a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Answer {
    /// Whether the command succeeded.
    pub result: bool,
    /// Free-form details.
    pub details: String,
}

impl Answer {
    /// A successful answer.
    pub fn success(details: impl Into<String>) -> Self {
        Self { result: true, details: details.into() }
    }

    /// A failed answer.
    pub fn failure(details: impl Into<String>) -> Self {
        Self { result: false, details: details.into() }
    }
}
