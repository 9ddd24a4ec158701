//! Records shared by the directory, the scanners and the record stores.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use agentmesh_transport::{AgentEvent, HostId, NodeId};
use serde::{Deserialize, Serialize};

/// Wall-clock instant in milliseconds since the Unix epoch.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Creates a timestamp from milliseconds since the epoch.
    pub fn from_millis(millis: u64) -> Self {
        Timestamp(millis)
    }

    /// Milliseconds since the epoch.
    pub fn as_millis(&self) -> u64 {
        self.0
    }

    /// `self - d`, clamped at the epoch.
    pub fn saturating_sub(&self, d: Duration) -> Self {
        Timestamp(self.0.saturating_sub(d.as_millis() as u64))
    }

    /// `self + d`.
    pub fn saturating_add(&self, d: Duration) -> Self {
        Timestamp(self.0.saturating_add(d.as_millis() as u64))
    }
}

/// Source of wall-clock time for deadlines kept in records.
pub trait Clock: Send + Sync {
    /// Current time.
    fn now(&self) -> Timestamp;
}

/// The system clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Timestamp(millis)
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock(AtomicU64);

impl ManualClock {
    /// Starts at `at`.
    pub fn new(at: Timestamp) -> Self {
        ManualClock(AtomicU64::new(at.as_millis()))
    }

    /// Moves the clock forward.
    pub fn advance(&self, d: Duration) {
        self.0.fetch_add(d.as_millis() as u64, Ordering::SeqCst);
    }

    /// Jumps to `at`.
    pub fn set(&self, at: Timestamp) {
        self.0.store(at.as_millis(), Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        Timestamp(self.0.load(Ordering::SeqCst))
    }
}

/// Lifecycle status of a managed host.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HostStatus {
    /// Connected to its owning node.
    Up,
    /// No node holds a connection.
    Disconnected,
    /// Connected but administratively in maintenance.
    Maintenance,
    /// Being handed from one node to another.
    Rebalancing,
    /// Deleted; never loaded again.
    Removed,
}

impl HostStatus {
    /// Status after `event` is applied.
    pub fn apply(self, event: AgentEvent) -> HostStatus {
        use AgentEvent::*;
        match (self, event) {
            (HostStatus::Removed, _) => HostStatus::Removed,
            (HostStatus::Maintenance, AgentConnected) => HostStatus::Maintenance,
            (_, AgentConnected) | (_, RebalanceCompleted) => HostStatus::Up,
            (_, StartAgentRebalance) => HostStatus::Rebalancing,
            (_, AgentDisconnected) | (_, ShutdownRequested) | (_, ManagementServerDown) | (_, RebalanceFailed) => {
                HostStatus::Disconnected
            }
            (status, RequestAgentRebalance) => status,
        }
    }

    /// Whether a node holds the host's live connection in this status.
    pub fn is_connected(self) -> bool {
        matches!(self, HostStatus::Up | HostStatus::Maintenance)
    }
}

/// Liveness of a management node.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeState {
    /// Reachable and serving.
    Up,
    /// Gone.
    Down,
}

/// A managed host as the record store sees it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostRecord {
    /// Host id.
    pub id: HostId,
    /// Display name.
    pub name: String,
    /// Grouping key (failure domain) used to spread direct-host loads.
    pub cluster_id: Option<u64>,
    /// Node holding the live connection, if any.
    pub owner: Option<NodeId>,
    /// Lifecycle status.
    pub status: HostStatus,
    /// Last heartbeat seen from the host.
    pub last_ping: Timestamp,
}

impl HostRecord {
    /// A disconnected, unowned host.
    pub fn new(id: HostId, name: impl Into<String>, cluster_id: Option<u64>) -> Self {
        Self {
            id,
            name: name.into(),
            cluster_id,
            owner: None,
            status: HostStatus::Disconnected,
            last_ping: Timestamp::default(),
        }
    }

    /// Builder-style owner/status override.
    pub fn owned_by(mut self, node: NodeId, status: HostStatus) -> Self {
        self.owner = Some(node);
        self.status = status;
        self
    }

    /// Applies `event` reported by `node`; a connecting node becomes the owner.
    pub fn apply_event(&mut self, event: AgentEvent, node: NodeId) {
        self.status = self.status.apply(event);
        self.owner = match event {
            AgentEvent::RequestAgentRebalance => self.owner,
            _ if self.status.is_connected() => Some(node),
            _ => None,
        };
    }
}

/// A management node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    /// Node id.
    pub id: NodeId,
    /// `host:port` peers dial.
    pub address: String,
    /// Liveness.
    pub state: NodeState,
}

impl NodeRecord {
    /// An `Up` node at `address`.
    pub fn up(id: NodeId, address: impl Into<String>) -> Self {
        Self { id, address: address.into(), state: NodeState::Up }
    }
}

/// Phase of a host transfer.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransferState {
    /// A node asked for the host; the owner has not started yet.
    Requested,
    /// The owner swapped in a forwarding attache and is handing off.
    InTransfer,
    /// Finished, successfully or not.
    Completed,
}

/// Persisted state of one host transfer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRecord {
    /// Host being moved.
    pub host_id: HostId,
    /// Owner when the transfer was requested.
    pub initial_owner: NodeId,
    /// Node taking the host.
    pub future_owner: NodeId,
    /// Phase.
    pub state: TransferState,
    /// Last time the record changed.
    pub updated_at: Timestamp,
}

impl TransferRecord {
    /// A freshly requested transfer of `host_id` from `initial_owner` to `future_owner`.
    pub fn requested(host_id: HostId, initial_owner: NodeId, future_owner: NodeId, now: Timestamp) -> Self {
        Self { host_id, initial_owner, future_owner, state: TransferState::Requested, updated_at: now }
    }
}
