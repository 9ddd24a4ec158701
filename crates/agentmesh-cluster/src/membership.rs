//! Reacting to management nodes joining, leaving and being cut off.

use std::sync::Arc;

use tracing::{info, warn};

use crate::attache::PeerRouting;
use crate::error::AgentResult;
use crate::lifecycle::AgentLifecycle;
use crate::nodes::NodeDirectory;
use crate::rebalance::RebalanceCoordinator;
use crate::types::{NodeRecord, NodeState};

/// Membership change reported by the cluster manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipEvent {
    /// Nodes came up.
    NodesJoined(Vec<NodeRecord>),
    /// Nodes went away.
    NodesLeft(Vec<NodeRecord>),
    /// This node lost contact with the rest of the cluster.
    NodeIsolated,
}

/// Applies membership events to the host records and peer links.
pub struct MembershipHandler {
    lifecycle: Arc<AgentLifecycle>,
    coordinator: Arc<RebalanceCoordinator>,
    nodes: Arc<dyn NodeDirectory>,
    peers: Arc<dyn PeerRouting>,
}

impl MembershipHandler {
    /// Creates the handler.
    pub fn new(
        lifecycle: Arc<AgentLifecycle>,
        coordinator: Arc<RebalanceCoordinator>,
        nodes: Arc<dyn NodeDirectory>,
        peers: Arc<dyn PeerRouting>,
    ) -> Self {
        Self { lifecycle, coordinator, nodes, peers }
    }

    /// Handles one event.
    pub async fn on_event(&self, event: MembershipEvent) -> AgentResult<()> {
        match event {
            MembershipEvent::NodesJoined(nodes) => {
                for node in nodes {
                    info!(node_id = %node.id, peer = %node.address, "management node joined");
                }
            }
            MembershipEvent::NodesLeft(nodes) => {
                for node in nodes {
                    if node.id == self.lifecycle.local() {
                        continue;
                    }
                    self.lifecycle.on_node_left(node.id).await?;
                    let removed = self.coordinator.cleanup_transfer_map(node.id).await?;
                    if removed > 0 {
                        info!(node_id = %node.id, removed, "dropped transfers involving departed node");
                    }
                }
            }
            MembershipEvent::NodeIsolated => {
                warn!(node_id = %self.lifecycle.local(), "node isolated from the cluster, closing peer links");
                for state in [NodeState::Up, NodeState::Down] {
                    for node in self.nodes.list_nodes_by_state(state).await? {
                        if node.id != self.lifecycle.local() {
                            self.peers.close_peer(node.id).await;
                        }
                    }
                }
            }
        }
        Ok(())
    }
}
