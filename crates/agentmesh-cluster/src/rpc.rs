//! Node-to-node command channel used by rebalancing and status propagation.
//!
//! This is the cluster manager's request/response path, separate from the
//! frame links that carry host traffic. `LoopbackCluster` connects managers
//! living in one process.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};

use agentmesh_transport::{AgentEvent, Answer, Command, HostId, NodeId};
use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::error::{AgentError, AgentResult};
use crate::store::HostStore;

/// Sends cluster commands to peer nodes.
#[async_trait]
pub trait PeerRpc: Send + Sync {
    /// Runs `commands` on `peer` and returns its answers.
    async fn execute(&self, peer: NodeId, host: HostId, commands: Vec<Command>) -> AgentResult<Vec<Answer>>;

    /// Asks the node owning `host` to handle `event`. `None` means no other
    /// node owns it and the caller handles the event itself.
    async fn propagate_event(&self, host: HostId, event: AgentEvent) -> AgentResult<Option<bool>>;

    /// Sends `commands` to every other node, ignoring failures.
    async fn broadcast(&self, host: HostId, commands: Vec<Command>);
}

/// Receives commands sent through [`PeerRpc`].
#[async_trait]
pub trait ClusterCommandHandler: Send + Sync {
    /// Handles commands sent by `from`; one answer per command.
    async fn on_peer_commands(&self, from: NodeId, commands: Vec<Command>) -> Vec<Answer>;
}

/// In-process hub connecting the command handlers of several nodes.
#[derive(Default)]
pub struct LoopbackCluster {
    handlers: RwLock<HashMap<NodeId, Weak<dyn ClusterCommandHandler>>>,
    isolated: RwLock<HashSet<NodeId>>,
}

impl LoopbackCluster {
    /// Creates an empty hub.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers the handler for `node`.
    pub fn register(&self, node: NodeId, handler: Weak<dyn ClusterCommandHandler>) {
        self.handlers.write().insert(node, handler);
    }

    /// Makes `node` unreachable (or reachable again).
    pub fn set_isolated(&self, node: NodeId, isolated: bool) {
        let mut set = self.isolated.write();
        if isolated {
            set.insert(node);
        } else {
            set.remove(&node);
        }
    }

    /// The [`PeerRpc`] view of the hub for `node`.
    pub fn endpoint(self: &Arc<Self>, node: NodeId, hosts: Arc<dyn HostStore>) -> Arc<LoopbackEndpoint> {
        Arc::new(LoopbackEndpoint { hub: self.clone(), local: node, hosts })
    }

    fn handler(&self, node: NodeId) -> Option<Arc<dyn ClusterCommandHandler>> {
        if self.isolated.read().contains(&node) {
            return None;
        }
        self.handlers.read().get(&node).and_then(Weak::upgrade)
    }

    fn nodes(&self) -> Vec<NodeId> {
        let mut nodes: Vec<NodeId> = self.handlers.read().keys().copied().collect();
        nodes.sort();
        nodes
    }
}

/// One node's connection to a [`LoopbackCluster`].
pub struct LoopbackEndpoint {
    hub: Arc<LoopbackCluster>,
    local: NodeId,
    hosts: Arc<dyn HostStore>,
}

#[async_trait]
impl PeerRpc for LoopbackEndpoint {
    async fn execute(&self, peer: NodeId, host: HostId, commands: Vec<Command>) -> AgentResult<Vec<Answer>> {
        let handler = self
            .hub
            .handler(peer)
            .ok_or(AgentError::RouteFailed { host_id: host, peer })?;
        debug!(host_id = %host, peer = %peer, commands = commands.len(), "executing on peer");
        Ok(handler.on_peer_commands(self.local, commands).await)
    }

    async fn propagate_event(&self, host: HostId, event: AgentEvent) -> AgentResult<Option<bool>> {
        let owner = match self.hosts.find_host(host).await? {
            Some(record) => record.owner,
            None => None,
        };
        let owner = match owner {
            Some(owner) if owner != self.local => owner,
            _ => return Ok(None),
        };
        let answers = self.execute(owner, host, vec![Command::ChangeAgent { host_id: host, event }]).await?;
        Ok(Some(answers.first().map(|a| a.result).unwrap_or(false)))
    }

    async fn broadcast(&self, host: HostId, commands: Vec<Command>) {
        for peer in self.hub.nodes() {
            if peer == self.local {
                continue;
            }
            if let Err(e) = self.execute(peer, host, commands.clone()).await {
                warn!(host_id = %host, peer = %peer, error = %e, "broadcast failed");
            }
        }
    }
}
