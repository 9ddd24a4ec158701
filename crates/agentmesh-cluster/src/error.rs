//! Error types for the clustered agent manager.

use agentmesh_transport::{HostId, NodeId, TransportError};
use thiserror::Error;

/// Errors raised by the external host / transfer record stores.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The record does not exist.
    #[error("record not found: {0}")]
    NotFound(String),

    /// A concurrent writer got there first.
    #[error("conflicting record: {0}")]
    Conflict(String),

    /// The store refused the write.
    #[error("record store unavailable: {0}")]
    Unavailable(String),
}

/// Errors surfaced to callers sending work to a host's agent.
#[derive(Debug, Error)]
pub enum AgentError {
    /// No live or forwardable attache exists for the host.
    #[error("agent {host_id} unavailable: {reason}")]
    AgentUnavailable {
        /// Host that could not be reached.
        host_id: HostId,
        /// Why.
        reason: String,
    },

    /// The node believed to own the host could not be reached. Another
    /// attempt may succeed once ownership or the link changes.
    #[error("unable to route request for agent {host_id} to node {peer}")]
    RouteFailed {
        /// Host the request was for.
        host_id: HostId,
        /// Node the request was routed to.
        peer: NodeId,
    },

    /// A request stayed outstanding past its deadline.
    #[error("operation on agent {host_id} timed out (seq {seq})")]
    OperationTimedOut {
        /// Host the request was sent to.
        host_id: HostId,
        /// Sequence of the timed out request.
        seq: u64,
    },

    /// A pending request was cancelled before it completed.
    #[error("request {seq} on agent {host_id} cancelled: {reason}")]
    Cancelled {
        /// Host the request was sent to.
        host_id: HostId,
        /// Sequence of the cancelled request.
        seq: u64,
        /// Cancellation reason.
        reason: String,
    },

    /// Link-level failure.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Record store failure.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl AgentError {
    pub(crate) fn unavailable(host_id: HostId, reason: impl Into<String>) -> Self {
        AgentError::AgentUnavailable { host_id, reason: reason.into() }
    }

    /// True when retrying, possibly against a different owner, may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AgentError::RouteFailed { .. })
    }
}

/// Reasons a rebalance step could not be carried out.
#[derive(Debug, Error)]
pub enum RebalanceError {
    /// The host record is gone or removed.
    #[error("host {0} not found")]
    HostNotFound(HostId),

    /// There is no local attache for the host on this node.
    #[error("no local attache for host {0}")]
    AttacheMissing(HostId),

    /// The attache still has work outstanding.
    #[error("attache for host {host_id} busy: queue {queue}, listeners {listeners}")]
    AttacheBusy {
        /// Host being transferred.
        host_id: HostId,
        /// Requests waiting or in flight.
        queue: usize,
        /// Callers waiting for answers.
        listeners: usize,
    },

    /// The future owner refused or failed to take the host.
    #[error("node {target} rejected host {host_id}")]
    TargetRejected {
        /// Host being transferred.
        host_id: HostId,
        /// Node that was asked to take it.
        target: NodeId,
    },

    /// Record store failure.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Result alias for agent operations.
pub type AgentResult<T> = std::result::Result<T, AgentError>;

/// Result alias for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;
