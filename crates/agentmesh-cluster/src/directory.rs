//! Ownership directory: which attache represents each host on this node.
//!
//! One map, one lock. The lock is never held across an await, so nothing
//! that touches the network runs while it is taken.

use std::collections::HashMap;
use std::sync::Arc;

use agentmesh_transport::{HostId, NodeId};
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::attache::{AgentAttache, PeerRouting};
use crate::error::{AgentError, AgentResult, RebalanceError};
use crate::store::HostStore;
use crate::types::HostStatus;

/// Host id to attache table.
#[derive(Default)]
pub struct OwnershipDirectory {
    agents: Mutex<HashMap<HostId, Arc<AgentAttache>>>,
}

impl OwnershipDirectory {
    /// Creates an empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// The attache currently representing `host`.
    pub fn lookup(&self, host: HostId) -> Option<Arc<AgentAttache>> {
        self.agents.lock().get(&host).cloned()
    }

    /// Installs `attache` and returns whatever it replaced. The caller must
    /// disconnect the previous attache.
    #[must_use = "a superseded attache must be disconnected"]
    pub fn install(&self, attache: Arc<AgentAttache>) -> Option<Arc<AgentAttache>> {
        self.agents.lock().insert(attache.host_id(), attache)
    }

    /// Installs `attache` and disconnects whatever it replaced with `Removed`.
    pub async fn install_and_retire(&self, attache: Arc<AgentAttache>) {
        let host = attache.host_id();
        if let Some(previous) = self.install(attache) {
            debug!(host_id = %host, "retiring superseded attache");
            previous.disconnect(HostStatus::Removed).await;
        }
    }

    /// Drops the entry for `host`.
    pub fn remove(&self, host: HostId) -> Option<Arc<AgentAttache>> {
        self.agents.lock().remove(&host)
    }

    /// Drops the entry for the attache's host only if it is still `attache`.
    pub fn remove_if_same(&self, attache: &Arc<AgentAttache>) -> bool {
        let mut agents = self.agents.lock();
        match agents.get(&attache.host_id()) {
            Some(current) if Arc::ptr_eq(current, attache) => {
                agents.remove(&attache.host_id());
                true
            }
            _ => false,
        }
    }

    /// Replaces an idle local attache with `forwarding` in one step.
    ///
    /// Fails without touching the table when there is no local attache or it
    /// still has requests queued or callers waiting. Returns the local
    /// attache, which the caller disconnects.
    pub fn swap_if_idle(&self, forwarding: Arc<AgentAttache>) -> Result<Arc<AgentAttache>, RebalanceError> {
        let host = forwarding.host_id();
        let mut agents = self.agents.lock();
        let current = match agents.get(&host) {
            Some(current) if current.is_local() && !current.is_closed() => current.clone(),
            _ => return Err(RebalanceError::AttacheMissing(host)),
        };
        if !current.is_idle() {
            return Err(RebalanceError::AttacheBusy {
                host_id: host,
                queue: current.queue_size(),
                listeners: current.pending_listener_count(),
            });
        }
        agents.insert(host, forwarding);
        Ok(current)
    }

    /// The attache for `host`, synthesizing a forwarding one when another
    /// node holds the live connection.
    pub async fn get_or_create_forwarding<S: HostStore + ?Sized>(
        &self,
        host: HostId,
        hosts: &S,
        local: NodeId,
        peers: Arc<dyn PeerRouting>,
    ) -> AgentResult<Arc<AgentAttache>> {
        if let Some(attache) = self.lookup(host) {
            return Ok(attache);
        }
        let record = hosts
            .find_host(host)
            .await?
            .ok_or_else(|| AgentError::unavailable(host, "host not found"))?;
        let owner = match record.owner {
            Some(owner) if owner != local && record.status.is_connected() => owner,
            _ => return Err(AgentError::unavailable(host, "host is not connected to any node")),
        };

        let mut agents = self.agents.lock();
        if let Some(existing) = agents.get(&host) {
            return Ok(existing.clone());
        }
        let attache = Arc::new(AgentAttache::forwarding(host, local, peers));
        agents.insert(host, attache.clone());
        info!(host_id = %host, owner = %owner, "created forwarding attache");
        Ok(attache)
    }

    /// Number of installed attaches.
    pub fn len(&self) -> usize {
        self.agents.lock().len()
    }

    /// True when no attache is installed.
    pub fn is_empty(&self) -> bool {
        self.agents.lock().is_empty()
    }

    /// Hosts with an installed attache, sorted.
    pub fn hosts(&self) -> Vec<HostId> {
        let mut hosts: Vec<HostId> = self.agents.lock().keys().copied().collect();
        hosts.sort();
        hosts
    }

    /// Removes every entry and returns the attaches.
    pub fn drain(&self) -> Vec<Arc<AgentAttache>> {
        self.agents.lock().drain().map(|(_, a)| a).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attache::tests::{request, RecordingChannel, RecordingPeers};
    use crate::store::MemoryRecordStore;
    use crate::types::{HostRecord, ManualClock, Timestamp};

    const HOST: HostId = HostId::new(42);
    const NODE: NodeId = NodeId::new(1);

    fn local_attache() -> Arc<AgentAttache> {
        Arc::new(AgentAttache::local(HOST, NODE, Arc::new(RecordingChannel::default()), false))
    }

    #[tokio::test]
    async fn test_install_retires_previous() {
        let directory = OwnershipDirectory::new();
        let first = local_attache();
        directory.install_and_retire(first.clone()).await;
        let second = local_attache();
        directory.install_and_retire(second.clone()).await;

        assert!(first.is_closed());
        assert!(!second.is_closed());
        assert_eq!(directory.len(), 1);
        assert!(Arc::ptr_eq(&directory.lookup(HOST).unwrap(), &second));
    }

    #[tokio::test]
    async fn test_remove_if_same_ignores_replaced() {
        let directory = OwnershipDirectory::new();
        let first = local_attache();
        directory.install_and_retire(first.clone()).await;
        let second = local_attache();
        directory.install_and_retire(second.clone()).await;

        assert!(!directory.remove_if_same(&first));
        assert!(directory.remove_if_same(&second));
        assert!(directory.is_empty());
    }

    #[tokio::test]
    async fn test_swap_requires_idle_local() {
        let directory = OwnershipDirectory::new();
        let peers: Arc<RecordingPeers> = Arc::new(RecordingPeers::default());
        let forwarding = || Arc::new(AgentAttache::forwarding(HOST, NODE, peers.clone()));

        assert!(matches!(directory.swap_if_idle(forwarding()), Err(RebalanceError::AttacheMissing(_))));

        let local = local_attache();
        directory.install_and_retire(local.clone()).await;
        local.send(request(1, true)).await.unwrap();
        let busy = directory.swap_if_idle(forwarding());
        assert!(matches!(busy, Err(RebalanceError::AttacheBusy { queue: 1, listeners: 0, .. })));
        assert!(Arc::ptr_eq(&directory.lookup(HOST).unwrap(), &local));

        local.send_next(1).await;
        let old = directory.swap_if_idle(forwarding()).unwrap();
        assert!(Arc::ptr_eq(&old, &local));
        assert!(directory.lookup(HOST).unwrap().is_forwarding());
    }

    #[tokio::test]
    async fn test_get_or_create_forwarding() {
        let store = MemoryRecordStore::new(Arc::new(ManualClock::new(Timestamp::from_millis(0))));
        let directory = OwnershipDirectory::new();
        let peers: Arc<dyn PeerRouting> = Arc::new(RecordingPeers::default());

        let missing = directory.get_or_create_forwarding(HOST, &store, NODE, peers.clone()).await;
        assert!(matches!(missing, Err(AgentError::AgentUnavailable { .. })));

        store.put_host(HostRecord::new(HOST, "h42", None).owned_by(NODE, HostStatus::Up));
        let own = directory.get_or_create_forwarding(HOST, &store, NODE, peers.clone()).await;
        assert!(own.is_err());

        store.put_host(HostRecord::new(HOST, "h42", None).owned_by(NodeId::new(2), HostStatus::Up));
        let created = directory.get_or_create_forwarding(HOST, &store, NODE, peers.clone()).await.unwrap();
        assert!(created.is_forwarding());
        let again = directory.get_or_create_forwarding(HOST, &store, NODE, peers).await.unwrap();
        assert!(Arc::ptr_eq(&created, &again));
    }
}
