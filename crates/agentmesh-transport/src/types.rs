use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a management node in the cluster
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(u64);

impl NodeId {
    /// Wire value used when the origin node of a frame is not known
    pub const UNKNOWN: NodeId = NodeId(u64::MAX);

    /// Creates a new NodeId from a raw u64 value
    pub const fn new(id: u64) -> Self {
        NodeId(id)
    }

    /// Returns the raw u64 value of this node ID
    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    /// Returns true unless this is the `UNKNOWN` sentinel
    pub fn is_known(&self) -> bool {
        *self != Self::UNKNOWN
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_known() {
            write!(f, "{}", self.0)
        } else {
            write!(f, "-1")
        }
    }
}

/// Identifier of a managed host; doubles as the agent id carried in frames
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HostId(u64);

impl HostId {
    /// Creates a new HostId from a raw u64 value
    pub const fn new(id: u64) -> Self {
        HostId(id)
    }

    /// Returns the raw u64 value of this host ID
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for HostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
