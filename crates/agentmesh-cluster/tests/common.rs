//! In-process multi-node cluster over real loopback TCP links.

#![allow(dead_code)]

use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use agentmesh_cluster::{
    ClusterAgentManager, ClusterConfig, ClusterServices, FrameSource, GenericDispatch, HostRecord, LocalLockService,
    LoopbackCluster, ManualClock, MemoryNodeDirectory, MemoryRecordStore, NodeRecord, SimulatedHostLoader,
    StaticPlanner, Timestamp,
};
use agentmesh_transport::{Frame, HostId, NodeId, TcpTransport, TcpTransportConfig, Transport};
use async_trait::async_trait;

/// Binds host links that announce themselves with a request.
#[derive(Default)]
pub struct HostStartup {
    manager: OnceLock<Weak<ClusterAgentManager>>,
}

#[async_trait]
impl GenericDispatch for HostStartup {
    async fn dispatch(&self, source: FrameSource<'_>, frame: Frame) {
        let FrameSource::Link(link) = source else {
            return;
        };
        if !frame.is_request() {
            return;
        }
        let Some(manager) = self.manager.get().and_then(Weak::upgrade) else {
            return;
        };
        if let Err(e) = manager.connect_agent(link, frame.agent_id()).await {
            tracing::warn!(error = %e, "host startup failed");
        }
    }
}

/// One node of a [`TestCluster`].
pub struct TestNode {
    pub id: NodeId,
    pub addr: String,
    pub manager: Arc<ClusterAgentManager>,
    pub loader: Arc<SimulatedHostLoader>,
    pub planner: Arc<StaticPlanner>,
}

/// Nodes sharing one record store, node directory, lock service and
/// command hub, as they would share the external services.
pub struct TestCluster {
    pub clock: Arc<ManualClock>,
    pub store: Arc<MemoryRecordStore>,
    pub directory: Arc<MemoryNodeDirectory>,
    pub hub: Arc<LoopbackCluster>,
    pub nodes: Vec<TestNode>,
}

impl TestCluster {
    /// Starts `count` nodes with ids `1..=count`.
    pub async fn new(count: u64) -> Self {
        let clock = Arc::new(ManualClock::new(Timestamp::from_millis(10_000_000)));
        let store = Arc::new(MemoryRecordStore::new(clock.clone()));
        let directory = Arc::new(MemoryNodeDirectory::new());
        let lock = Arc::new(LocalLockService::new());
        let hub = LoopbackCluster::new();
        let transport: Arc<dyn Transport> = Arc::new(TcpTransport::new(TcpTransportConfig::default()));

        let mut listeners = Vec::new();
        for id in 1..=count {
            let listener = transport.listen("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            directory.upsert(NodeRecord::up(NodeId::new(id), addr.clone()));
            listeners.push((NodeId::new(id), addr, listener));
        }

        let mut nodes = Vec::new();
        for (id, addr, listener) in listeners {
            let loader = Arc::new(SimulatedHostLoader::new());
            let planner = Arc::new(StaticPlanner::new());
            let startup = Arc::new(HostStartup::default());
            let config = ClusterConfig {
                node_id: id.as_u64(),
                listen_addr: addr.clone(),
                request_timeout_secs: 5,
                connect_timeout_ms: 500,
                ..ClusterConfig::default()
            };
            let services = ClusterServices {
                records: store.clone(),
                nodes: directory.clone(),
                lock: lock.clone(),
                loader: loader.clone(),
                rpc: hub.endpoint(id, store.clone()),
                generic: startup.clone(),
                planners: vec![planner.clone()],
                clock: clock.clone(),
            };
            let manager = ClusterAgentManager::new(config, transport.clone(), services).unwrap();
            let _ = startup.manager.set(Arc::downgrade(&manager));
            hub.register(id, manager.command_handler());
            tokio::spawn(manager.clone().serve(listener));
            nodes.push(TestNode { id, addr, manager, loader, planner });
        }

        Self { clock, store, directory, hub, nodes }
    }

    /// Node with id `id`.
    pub fn node(&self, id: u64) -> &TestNode {
        &self.nodes[(id - 1) as usize]
    }

    /// Registers an unowned host.
    pub fn add_host(&self, id: u64, cluster_id: u64) -> HostRecord {
        let record = HostRecord::new(HostId::new(id), format!("h{}", id), Some(cluster_id));
        self.store.put_host(record.clone());
        record
    }

    /// Loads `host` directly on node `node`.
    pub async fn load_on(&self, node: u64, host: u64) {
        let record = self.store.host(HostId::new(host)).unwrap();
        self.node(node).manager.load_direct_host(&record).await.unwrap();
    }

    /// Stops every node.
    pub async fn shutdown(&self) {
        for node in &self.nodes {
            node.manager.stop().await;
        }
    }
}

/// Polls `check` until it holds or two seconds pass.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
