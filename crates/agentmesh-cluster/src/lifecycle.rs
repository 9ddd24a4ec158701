//! Attaching, detaching and reconnecting hosts on this node.

use std::sync::Arc;

use agentmesh_transport::{AgentEvent, Command, Frame, HostId, LinkContext, NodeId, PeerConnector};
use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::attache::{AgentAttache, PeerRouting};
use crate::directory::OwnershipDirectory;
use crate::error::{AgentError, AgentResult};
use crate::loader::{AnswerSink, HostLoader, LinkChannel, LoadedAgent};
use crate::rpc::PeerRpc;
use crate::store::RecordStore;
use crate::types::{HostRecord, HostStatus};

/// [`PeerRouting`] backed by the host records and the peer connector.
pub struct ClusterRoute {
    records: Arc<dyn RecordStore>,
    connector: Arc<PeerConnector>,
}

impl ClusterRoute {
    /// Creates the route.
    pub fn new(records: Arc<dyn RecordStore>, connector: Arc<PeerConnector>) -> Self {
        Self { records, connector }
    }
}

#[async_trait]
impl PeerRouting for ClusterRoute {
    async fn owner_of(&self, host: HostId) -> Option<NodeId> {
        match self.records.find_host(host).await {
            Ok(record) => record.and_then(|r| r.owner),
            Err(e) => {
                warn!(host_id = %host, error = %e, "owner lookup failed");
                None
            }
        }
    }

    async fn route(&self, peer: NodeId, frame: &Frame) -> bool {
        self.connector.route(peer, frame).await
    }

    async fn close_peer(&self, peer: NodeId) {
        self.connector.close(peer).await;
    }
}

/// Creates and retires this node's attaches and keeps the host records in step.
pub struct AgentLifecycle {
    local: NodeId,
    directory: Arc<OwnershipDirectory>,
    records: Arc<dyn RecordStore>,
    loader: Arc<dyn HostLoader>,
    peers: Arc<dyn PeerRouting>,
    rpc: Arc<dyn PeerRpc>,
    sink: AnswerSink,
}

impl AgentLifecycle {
    /// Wires the lifecycle to its collaborators.
    pub fn new(
        local: NodeId,
        directory: Arc<OwnershipDirectory>,
        records: Arc<dyn RecordStore>,
        loader: Arc<dyn HostLoader>,
        peers: Arc<dyn PeerRouting>,
        rpc: Arc<dyn PeerRpc>,
        sink: AnswerSink,
    ) -> Self {
        Self { local, directory, records, loader, peers, rpc, sink }
    }

    /// This node.
    pub fn local(&self) -> NodeId {
        self.local
    }

    /// The attache for `host`, forwarding to its owner when that is another node.
    pub async fn attache_for(&self, host: HostId) -> AgentResult<Arc<AgentAttache>> {
        self.directory
            .get_or_create_forwarding(host, self.records.as_ref(), self.local, self.peers.clone())
            .await
    }

    /// Opens a direct connection to the host's backend and takes ownership.
    pub async fn load_direct_host(&self, record: &HostRecord, for_rebalance: bool) -> AgentResult<Arc<AgentAttache>> {
        let host = record.id;
        let loaded = match self.loader.load(record, self.sink.clone()).await {
            Ok(loaded) => loaded,
            Err(e) => {
                warn!(host_id = %host, for_rebalance, error = %e, "unable to load host");
                if !for_rebalance {
                    if let Err(se) = self.records.update_status(host, AgentEvent::AgentDisconnected, self.local).await {
                        warn!(host_id = %host, error = %se, "unable to record disconnect");
                    }
                }
                return Err(e);
            }
        };
        let attache = Arc::new(match loaded {
            LoadedAgent::Channel(channel) => {
                AgentAttache::local(host, self.local, channel, record.status == HostStatus::Maintenance)
            }
            LoadedAgent::Placeholder => AgentAttache::dummy(host, self.local),
        });
        self.adopt(attache).await
    }

    /// Binds a host that dialled in on `link` to a local attache.
    pub async fn connect_agent(&self, link: &Arc<LinkContext>, host: HostId) -> AgentResult<Arc<AgentAttache>> {
        let record = self
            .records
            .find_host(host)
            .await?
            .filter(|r| r.status != HostStatus::Removed)
            .ok_or_else(|| AgentError::unavailable(host, "host not found"))?;
        let channel = Arc::new(LinkChannel(link.clone()));
        let attache = Arc::new(AgentAttache::local(
            host,
            self.local,
            channel,
            record.status == HostStatus::Maintenance,
        ));
        link.attach(host);
        debug!(host_id = %host, peer_addr = link.peer_addr(), "host link attached");
        self.adopt(attache).await
    }

    async fn adopt(&self, attache: Arc<AgentAttache>) -> AgentResult<Arc<AgentAttache>> {
        let host = attache.host_id();
        self.directory.install_and_retire(attache.clone()).await;
        match self.records.update_status(host, AgentEvent::AgentConnected, self.local).await {
            Ok(status) => {
                info!(host_id = %host, node_id = %self.local, ?status, "host connected");
                Ok(attache)
            }
            Err(e) => {
                self.directory.remove_if_same(&attache);
                attache.disconnect(HostStatus::Disconnected).await;
                Err(e.into())
            }
        }
    }

    /// Retires `attache`, records `event` when it held the live connection
    /// and optionally tells every other node.
    pub async fn handle_disconnect(&self, attache: &Arc<AgentAttache>, event: AgentEvent, broadcast: bool) {
        let host = attache.host_id();
        self.directory.remove_if_same(attache);
        attache.disconnect(HostStatus::Disconnected).await;
        if !attache.is_forwarding() {
            if let Err(e) = self.records.update_status(host, event, self.local).await {
                warn!(host_id = %host, ?event, error = %e, "unable to record disconnect");
            }
        }
        if broadcast {
            let command = Command::ChangeAgent { host_id: host, event: AgentEvent::AgentDisconnected };
            self.rpc.broadcast(host, vec![command]).await;
        }
    }

    /// Removes and closes whatever attache represents `host`.
    pub async fn remove_agent(&self, host: HostId, status: HostStatus) -> bool {
        match self.directory.remove(host) {
            Some(attache) => {
                attache.disconnect(status).await;
                true
            }
            None => false,
        }
    }

    /// Handles a status change another node asked this one to apply.
    pub async fn execute_user_request(&self, host: HostId, event: AgentEvent) -> AgentResult<bool> {
        match event {
            AgentEvent::AgentDisconnected => {
                if let Some(attache) = self.directory.lookup(host) {
                    self.handle_disconnect(&attache, event, false).await;
                }
                Ok(true)
            }
            AgentEvent::ShutdownRequested => self.reconnect(host).await,
            other => {
                debug!(host_id = %host, event = ?other, "ignoring user request");
                Ok(false)
            }
        }
    }

    /// Forces `host` to drop its connection so the next claimant re-adopts it.
    ///
    /// The owning node handles it when that is another node; otherwise the
    /// local attache is closed and the host is left unowned.
    pub async fn reconnect(&self, host: HostId) -> AgentResult<bool> {
        match self.rpc.propagate_event(host, AgentEvent::ShutdownRequested).await {
            Ok(Some(result)) => return Ok(result),
            Ok(None) => {}
            Err(e) if e.is_retryable() => warn!(host_id = %host, error = %e, "owner unreachable, reconnecting locally"),
            Err(e) => return Err(e),
        }
        if let Some(attache) = self.directory.remove(host) {
            attache.disconnect(HostStatus::Disconnected).await;
        }
        if self.records.find_host(host).await?.is_none() {
            return Err(AgentError::unavailable(host, "host not found"));
        }
        self.records.update_status(host, AgentEvent::ShutdownRequested, self.local).await?;
        info!(host_id = %host, "host reconnect requested");
        Ok(true)
    }

    /// Marks every host `node` owned as disconnected.
    pub async fn on_node_left(&self, node: NodeId) -> AgentResult<usize> {
        let changed = self.records.mark_hosts_disconnected(node).await?;
        self.peers.close_peer(node).await;
        info!(node_id = %node, hosts = changed, "management node left");
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attache::tests::RecordingPeers;
    use crate::loader::SimulatedHostLoader;
    use crate::store::{HostStore, MemoryRecordStore};
    use crate::types::{ManualClock, Timestamp};
    use parking_lot::Mutex;
    use tokio::sync::mpsc;

    const HOST: HostId = HostId::new(42);
    const NODE: NodeId = NodeId::new(1);

    #[derive(Default)]
    struct RecordingRpc {
        owner_answer: Mutex<Option<bool>>,
        broadcasts: Mutex<Vec<Vec<Command>>>,
    }

    #[async_trait]
    impl PeerRpc for RecordingRpc {
        async fn execute(&self, _peer: NodeId, _host: HostId, _commands: Vec<Command>) -> AgentResult<Vec<agentmesh_transport::Answer>> {
            Ok(vec![])
        }

        async fn propagate_event(&self, _host: HostId, _event: AgentEvent) -> AgentResult<Option<bool>> {
            Ok(*self.owner_answer.lock())
        }

        async fn broadcast(&self, _host: HostId, commands: Vec<Command>) {
            self.broadcasts.lock().push(commands);
        }
    }

    struct Fixture {
        store: Arc<MemoryRecordStore>,
        loader: Arc<SimulatedHostLoader>,
        directory: Arc<OwnershipDirectory>,
        rpc: Arc<RecordingRpc>,
        lifecycle: AgentLifecycle,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryRecordStore::new(Arc::new(ManualClock::new(Timestamp::from_millis(0)))));
        store.put_host(HostRecord::new(HOST, "h42", Some(7)));
        let loader = Arc::new(SimulatedHostLoader::new());
        let directory = Arc::new(OwnershipDirectory::new());
        let rpc = Arc::new(RecordingRpc::default());
        let (tx, _rx) = mpsc::unbounded_channel();
        let lifecycle = AgentLifecycle::new(
            NODE,
            directory.clone(),
            store.clone(),
            loader.clone(),
            Arc::new(RecordingPeers::default()),
            rpc.clone(),
            AnswerSink::new(tx),
        );
        Fixture { store, loader, directory, rpc, lifecycle }
    }

    #[tokio::test]
    async fn test_load_direct_host_takes_ownership() {
        let f = fixture();
        let record = f.store.host(HOST).unwrap();
        let attache = f.lifecycle.load_direct_host(&record, false).await.unwrap();
        assert!(attache.is_local());
        assert!(Arc::ptr_eq(&f.directory.lookup(HOST).unwrap(), &attache));
        let stored = f.store.host(HOST).unwrap();
        assert_eq!(stored.owner, Some(NODE));
        assert_eq!(stored.status, HostStatus::Up);

        // Loading again retires the first attache.
        let again = f.lifecycle.load_direct_host(&record, false).await.unwrap();
        assert!(attache.is_closed());
        assert!(!again.is_closed());
    }

    #[tokio::test]
    async fn test_placeholder_and_maintenance() {
        let f = fixture();
        f.loader.placeholder(HOST);
        let record = f.store.host(HOST).unwrap();
        let dummy = f.lifecycle.load_direct_host(&record, false).await.unwrap();
        assert!(matches!(dummy.kind(), crate::attache::AttacheKind::Dummy));

        let f = fixture();
        let mut record = f.store.host(HOST).unwrap();
        record.status = HostStatus::Maintenance;
        let local = f.lifecycle.load_direct_host(&record, false).await.unwrap();
        assert!(local.is_local());
        assert!(local.in_maintenance());
    }

    #[tokio::test]
    async fn test_failed_load_marks_disconnected() {
        let f = fixture();
        f.store.put_host(HostRecord::new(HOST, "h42", Some(7)).owned_by(NodeId::new(9), HostStatus::Up));
        f.loader.refuse(HOST);
        let record = f.store.host(HOST).unwrap();

        assert!(f.lifecycle.load_direct_host(&record, true).await.is_err());
        assert_eq!(f.store.host(HOST).unwrap().owner, Some(NodeId::new(9)));

        assert!(f.lifecycle.load_direct_host(&record, false).await.is_err());
        let stored = f.store.host(HOST).unwrap();
        assert_eq!(stored.status, HostStatus::Disconnected);
        assert_eq!(stored.owner, None);
        assert!(f.directory.lookup(HOST).is_none());
    }

    #[tokio::test]
    async fn test_handle_disconnect_broadcasts() {
        let f = fixture();
        let record = f.store.host(HOST).unwrap();
        let attache = f.lifecycle.load_direct_host(&record, false).await.unwrap();
        f.lifecycle.handle_disconnect(&attache, AgentEvent::AgentDisconnected, true).await;

        assert!(attache.is_closed());
        assert!(f.directory.lookup(HOST).is_none());
        assert_eq!(f.store.host(HOST).unwrap().status, HostStatus::Disconnected);
        assert_eq!(
            f.rpc.broadcasts.lock().clone(),
            vec![vec![Command::ChangeAgent { host_id: HOST, event: AgentEvent::AgentDisconnected }]]
        );

        // Handling the broadcast on another node does not re-broadcast.
        assert!(f.lifecycle.execute_user_request(HOST, AgentEvent::AgentDisconnected).await.unwrap());
        assert_eq!(f.rpc.broadcasts.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_reconnect_local_and_remote() {
        let f = fixture();
        let record = f.store.host(HOST).unwrap();
        let attache = f.lifecycle.load_direct_host(&record, false).await.unwrap();

        *f.rpc.owner_answer.lock() = Some(false);
        assert!(!f.lifecycle.reconnect(HOST).await.unwrap());
        assert!(!attache.is_closed());

        *f.rpc.owner_answer.lock() = None;
        assert!(f.lifecycle.reconnect(HOST).await.unwrap());
        assert!(attache.is_closed());
        let stored = f.store.host(HOST).unwrap();
        assert_eq!(stored.status, HostStatus::Disconnected);
        assert_eq!(stored.owner, None);

        assert!(f.lifecycle.reconnect(HostId::new(999)).await.is_err());
    }

    #[tokio::test]
    async fn test_node_left_disconnects_its_hosts() {
        let f = fixture();
        f.store.put_host(HostRecord::new(HostId::new(1), "a", None).owned_by(NodeId::new(2), HostStatus::Up));
        f.store.put_host(HostRecord::new(HostId::new(2), "b", None).owned_by(NodeId::new(2), HostStatus::Up));
        assert_eq!(f.lifecycle.on_node_left(NodeId::new(2)).await.unwrap(), 2);
        assert!(f.store.list_hosts_by_owner(NodeId::new(2)).await.unwrap().is_empty());
    }
}
