//! Management node directory.

use std::collections::BTreeMap;
use std::sync::Arc;

use agentmesh_transport::{NodeId, PeerResolver};
use async_trait::async_trait;
use parking_lot::RwLock;

use crate::error::StoreResult;
use crate::types::{NodeRecord, NodeState};

/// Known management nodes and their liveness.
#[async_trait]
pub trait NodeDirectory: Send + Sync {
    /// Looks a node up by id.
    async fn find_node(&self, node: NodeId) -> StoreResult<Option<NodeRecord>>;

    /// Nodes currently in `state`.
    async fn list_nodes_by_state(&self, state: NodeState) -> StoreResult<Vec<NodeRecord>>;
}

/// In-memory [`NodeDirectory`].
#[derive(Debug, Default)]
pub struct MemoryNodeDirectory {
    nodes: RwLock<BTreeMap<NodeId, NodeRecord>>,
}

impl MemoryNodeDirectory {
    /// Creates an empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces a node.
    pub fn upsert(&self, node: NodeRecord) {
        self.nodes.write().insert(node.id, node);
    }

    /// Changes a node's liveness; no-op for unknown nodes.
    pub fn set_state(&self, node: NodeId, state: NodeState) {
        if let Some(record) = self.nodes.write().get_mut(&node) {
            record.state = state;
        }
    }
}

#[async_trait]
impl NodeDirectory for MemoryNodeDirectory {
    async fn find_node(&self, node: NodeId) -> StoreResult<Option<NodeRecord>> {
        Ok(self.nodes.read().get(&node).cloned())
    }

    async fn list_nodes_by_state(&self, state: NodeState) -> StoreResult<Vec<NodeRecord>> {
        Ok(self.nodes.read().values().filter(|n| n.state == state).cloned().collect())
    }
}

/// Resolves peer addresses for the connector from a [`NodeDirectory`].
pub struct DirectoryResolver(pub Arc<dyn NodeDirectory>);

#[async_trait]
impl PeerResolver for DirectoryResolver {
    async fn resolve(&self, peer: NodeId) -> Option<String> {
        match self.0.find_node(peer).await {
            Ok(Some(node)) => Some(node.address),
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(node_id = %peer, error = %e, "node lookup failed");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_directory_and_resolver() {
        let nodes = Arc::new(MemoryNodeDirectory::new());
        nodes.upsert(NodeRecord::up(NodeId::new(1), "10.0.0.1:9090"));
        nodes.upsert(NodeRecord::up(NodeId::new(2), "10.0.0.2:9090"));
        nodes.set_state(NodeId::new(2), NodeState::Down);

        let up = nodes.list_nodes_by_state(NodeState::Up).await.unwrap();
        assert_eq!(up.len(), 1);
        assert_eq!(up[0].id, NodeId::new(1));

        let resolver = DirectoryResolver(nodes.clone());
        assert_eq!(resolver.resolve(NodeId::new(2)).await.as_deref(), Some("10.0.0.2:9090"));
        assert_eq!(resolver.resolve(NodeId::new(9)).await, None);
    }
}
