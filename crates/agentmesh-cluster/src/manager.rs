//! The clustered agent manager.
//!
//! `ClusterAgentManager` wires the ownership directory, router, rebalance
//! coordinator and scanners of one management node to its collaborators
//! and exposes the operations the surrounding management API calls.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Weak};

use agentmesh_transport::{
    AgentEvent, Answer, Command, Frame, HostId, LinkContext, LinkServer, Listener, NodeId, PeerConnector,
    TcpTransport, TlsTcpTransport, Transport,
};
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::attache::{AgentAttache, PeerRouting};
use crate::config::ClusterConfig;
use crate::directory::OwnershipDirectory;
use crate::error::{AgentError, AgentResult};
use crate::lifecycle::{AgentLifecycle, ClusterRoute};
use crate::loader::{AnswerSink, HostLoader};
use crate::lock::ClusterLock;
use crate::membership::{MembershipEvent, MembershipHandler};
use crate::nodes::{DirectoryResolver, NodeDirectory};
use crate::planner::LoadBalancerPlanner;
use crate::rebalance::{RebalanceCoordinator, TransferScanReport};
use crate::router::{FrameSource, GenericDispatch, RequestRouter};
use crate::rpc::{ClusterCommandHandler, PeerRpc};
use crate::scanner::{DirectHostScanner, DirectScanReport, TransferScanner};
use crate::scheduler::{Scheduler, TaskLock};
use crate::store::RecordStore;
use crate::types::{Clock, HostRecord, HostStatus};

/// Lock serializing direct-host scans across nodes.
pub const DIRECT_SCAN_LOCK: &str = "agentmesh.direct-scan";
/// Lock serializing transfer scans across nodes.
pub const TRANSFER_SCAN_LOCK: &str = "agentmesh.transfer-scan";
/// Hosts whose backend frames are routed at the same time.
const ANSWER_ROUTES_IN_FLIGHT: usize = 64;

/// External collaborators a node runs against.
pub struct ClusterServices {
    /// Host and transfer records.
    pub records: Arc<dyn RecordStore>,
    /// Management nodes.
    pub nodes: Arc<dyn NodeDirectory>,
    /// Cluster-wide scan lock.
    pub lock: Arc<dyn ClusterLock>,
    /// Direct host connections.
    pub loader: Arc<dyn HostLoader>,
    /// Node-to-node command channel.
    pub rpc: Arc<dyn PeerRpc>,
    /// Non-clustered frame handling.
    pub generic: Arc<dyn GenericDispatch>,
    /// Load-balance planners, highest priority first.
    pub planners: Vec<Arc<dyn LoadBalancerPlanner>>,
    /// Time source for record deadlines.
    pub clock: Arc<dyn Clock>,
}

/// Plain TCP, or TLS over TCP when the config names certificates.
pub fn build_transport(config: &ClusterConfig) -> anyhow::Result<Arc<dyn Transport>> {
    match config.tls_config()? {
        Some(tls) => Ok(Arc::new(TlsTcpTransport::new(config.tcp_transport(), &tls)?)),
        None => Ok(Arc::new(TcpTransport::new(config.tcp_transport()))),
    }
}

/// One management node's agent manager.
pub struct ClusterAgentManager {
    config: ClusterConfig,
    local: NodeId,
    lock: Arc<dyn ClusterLock>,
    directory: Arc<OwnershipDirectory>,
    connector: Arc<PeerConnector>,
    peers: Arc<dyn PeerRouting>,
    lifecycle: Arc<AgentLifecycle>,
    coordinator: Arc<RebalanceCoordinator>,
    router: Arc<RequestRouter>,
    direct_scanner: Arc<DirectHostScanner>,
    transfer_scanner: Arc<TransferScanner>,
    membership: MembershipHandler,
    scheduler: Scheduler,
}

impl ClusterAgentManager {
    /// Builds the node. Must run inside a Tokio runtime: frames from directly
    /// loaded hosts are pumped into the router by a background task.
    pub fn new(
        config: ClusterConfig,
        transport: Arc<dyn Transport>,
        services: ClusterServices,
    ) -> anyhow::Result<Arc<Self>> {
        config.validate()?;
        let local = config.node();
        let ClusterServices { records, nodes, lock, loader, rpc, generic, planners, clock } = services;

        let resolver = Arc::new(DirectoryResolver(nodes.clone()));
        let connector = Arc::new(PeerConnector::new(transport, resolver, config.connector()));
        let peers: Arc<dyn PeerRouting> = Arc::new(ClusterRoute::new(records.clone(), connector.clone()));
        let directory = Arc::new(OwnershipDirectory::new());

        let (answers_tx, answers_rx) = mpsc::unbounded_channel();
        let lifecycle = Arc::new(AgentLifecycle::new(
            local,
            directory.clone(),
            records.clone(),
            loader,
            peers.clone(),
            rpc.clone(),
            AnswerSink::new(answers_tx),
        ));
        let coordinator = Arc::new(RebalanceCoordinator::new(
            local,
            config.rebalance_timeout(),
            clock.clone(),
            directory.clone(),
            lifecycle.clone(),
            records.clone(),
            nodes.clone(),
            peers.clone(),
            rpc,
            planners,
        ));
        let router = Arc::new(RequestRouter::new(
            local,
            directory.clone(),
            lifecycle.clone(),
            peers.clone(),
            generic,
        ));
        let direct_scanner = Arc::new(DirectHostScanner::new(
            local,
            config.load_size,
            config.host_dead_after(),
            clock,
            records,
            directory.clone(),
            lifecycle.clone(),
        ));
        let transfer_scanner = Arc::new(TransferScanner::new(coordinator.clone()));
        let membership = MembershipHandler::new(lifecycle.clone(), coordinator.clone(), nodes, peers.clone());

        let scheduler = Scheduler::new();
        let pump_router = Arc::downgrade(&router);
        scheduler.spawn(
            "answer-pump",
            pump_answers(move |host, frame| route_answer(pump_router.clone(), host, frame), answers_rx),
        );

        info!(node_id = %local, "cluster agent manager created");
        Ok(Arc::new(Self {
            config,
            local,
            lock,
            directory,
            connector,
            peers,
            lifecycle,
            coordinator,
            router,
            direct_scanner,
            transfer_scanner,
            membership,
            scheduler,
        }))
    }

    /// This node's id.
    pub fn node_id(&self) -> NodeId {
        self.local
    }

    /// Starts the periodic scans and, when enabled, the one-shot load balancer.
    pub fn start(&self) {
        let direct = self.direct_scanner.clone();
        self.scheduler.spawn_periodic(
            "direct-host-scan",
            secs(self.config.startup_delay_secs),
            secs(self.config.direct_scan_interval_secs),
            Some(self.task_lock(DIRECT_SCAN_LOCK)),
            move || {
                let direct = direct.clone();
                async move {
                    if let Err(e) = direct.scan_once().await {
                        warn!(error = %e, "direct host scan failed");
                    }
                }
            },
        );

        let transfers = self.transfer_scanner.clone();
        self.scheduler.spawn_periodic(
            "transfer-scan",
            secs(self.config.transfer_scan_initial_delay_secs),
            secs(self.config.transfer_check_interval_secs),
            Some(self.task_lock(TRANSFER_SCAN_LOCK)),
            move || {
                let transfers = transfers.clone();
                async move {
                    transfers.scan_once().await;
                }
            },
        );

        if self.config.rebalance_enabled {
            self.schedule_rebalance_agents();
        }
        info!(node_id = %self.local, rebalance = self.config.rebalance_enabled, "cluster agent manager started");
    }

    fn task_lock(&self, name: &str) -> TaskLock {
        TaskLock { service: self.lock.clone(), name: name.to_string(), timeout: secs(self.config.lock_timeout_secs) }
    }

    /// Accepts host and peer links on `listener` until [`Self::stop`].
    pub async fn serve(self: Arc<Self>, listener: Box<dyn Listener>) -> agentmesh_transport::Result<()> {
        let token = self.scheduler.token();
        let handler = self.router.clone();
        LinkServer::new(listener, handler).serve_until(async move { token.cancelled().await }).await
    }

    /// Stops background work, clears this node's transfers and closes every
    /// attache and peer link.
    pub async fn stop(&self) {
        if let Err(e) = self.coordinator.cleanup_transfer_map(self.local).await {
            warn!(node_id = %self.local, error = %e, "unable to clean transfer map");
        }
        self.scheduler.shutdown().await;
        for attache in self.directory.drain() {
            attache.disconnect(HostStatus::Disconnected).await;
        }
        self.connector.close_all().await;
        info!(node_id = %self.local, "cluster agent manager stopped");
    }

    /// Runs `commands` on `host` wherever its connection lives.
    ///
    /// A request the owner could not be reached for is retried once when the
    /// host has moved to another node in the meantime.
    pub async fn execute(&self, host: HostId, commands: Vec<Command>, sequential: bool) -> AgentResult<Vec<Answer>> {
        let attache = self.lifecycle.attache_for(host).await?;
        match attache.execute(&commands, sequential, self.config.request_timeout()).await {
            Err(AgentError::RouteFailed { peer, .. }) if self.owner_moved(host, peer).await => {
                info!(host_id = %host, from = %peer, "owner changed, retrying request");
                let attache = self.lifecycle.attache_for(host).await?;
                attache.execute(&commands, sequential, self.config.request_timeout()).await
            }
            result => result,
        }
    }

    async fn owner_moved(&self, host: HostId, failed: NodeId) -> bool {
        matches!(self.peers.owner_of(host).await, Some(owner) if owner != failed)
    }

    /// Tells `peer` to abort request `seq` on `host`.
    pub async fn cancel(&self, peer: NodeId, host: HostId, seq: u64, reason: &str) -> AgentResult<bool> {
        let frame = Frame::cancel(host, self.local, seq, reason)?;
        Ok(self.peers.route(peer, &frame).await)
    }

    /// The attache representing `host` on this node, if any.
    pub fn attache(&self, host: HostId) -> Option<Arc<AgentAttache>> {
        self.directory.lookup(host)
    }

    /// Hosts with an attache on this node.
    pub fn hosts(&self) -> Vec<HostId> {
        self.directory.hosts()
    }

    /// Connects directly to `record`'s backend and takes ownership.
    pub async fn load_direct_host(&self, record: &HostRecord) -> AgentResult<Arc<AgentAttache>> {
        self.lifecycle.load_direct_host(record, false).await
    }

    /// Binds a host that dialled in on `link`.
    pub async fn connect_agent(&self, link: &Arc<LinkContext>, host: HostId) -> AgentResult<Arc<AgentAttache>> {
        self.lifecycle.connect_agent(link, host).await
    }

    /// Forces `host` to reconnect.
    pub async fn reconnect(&self, host: HostId) -> AgentResult<bool> {
        self.lifecycle.reconnect(host).await
    }

    /// Retires `attache` and records `event`.
    pub async fn handle_disconnect(&self, attache: &Arc<AgentAttache>, event: AgentEvent, broadcast: bool) {
        self.lifecycle.handle_disconnect(attache, event, broadcast).await
    }

    /// Applies a status change requested by another node.
    pub async fn execute_user_request(&self, host: HostId, event: AgentEvent) -> AgentResult<bool> {
        self.lifecycle.execute_user_request(host, event).await
    }

    /// Peer-side entry for rebalance commands.
    pub async fn execute_rebalance_request(
        &self,
        host: HostId,
        current: NodeId,
        future: NodeId,
        event: AgentEvent,
    ) -> bool {
        self.coordinator.execute_rebalance_request(host, current, future, event).await
    }

    /// Asks busier nodes for hosts now.
    pub async fn start_rebalance_agents(&self) -> AgentResult<usize> {
        self.coordinator.start_rebalance_agents().await
    }

    /// Runs [`Self::start_rebalance_agents`] once after the configured delay.
    pub fn schedule_rebalance_agents(&self) {
        let coordinator = self.coordinator.clone();
        self.scheduler.spawn_once("load-balancer", secs(self.config.load_balance_delay_secs), async move {
            match coordinator.start_rebalance_agents().await {
                Ok(requested) => info!(requested, "load balancer run finished"),
                Err(e) => warn!(error = %e, "load balancer run failed"),
            }
        });
    }

    /// Applies a membership change.
    pub async fn on_membership_event(&self, event: MembershipEvent) -> AgentResult<()> {
        self.membership.on_event(event).await
    }

    /// One direct-host scan, outside the schedule.
    pub async fn scan_direct_hosts(&self) -> AgentResult<DirectScanReport> {
        self.direct_scanner.scan_once().await
    }

    /// One transfer scan, outside the schedule.
    pub async fn scan_transfers(&self) -> TransferScanReport {
        self.transfer_scanner.scan_once().await
    }

    /// The rebalance coordinator.
    pub fn coordinator(&self) -> &Arc<RebalanceCoordinator> {
        &self.coordinator
    }

    /// The frame router, for wiring additional links.
    pub fn router(&self) -> &Arc<RequestRouter> {
        &self.router
    }

    /// Handle to register with a [`crate::rpc::LoopbackCluster`].
    pub fn command_handler(self: &Arc<Self>) -> Weak<dyn ClusterCommandHandler> {
        let handler: Arc<dyn ClusterCommandHandler> = self.clone();
        Arc::downgrade(&handler)
    }
}

#[async_trait]
impl ClusterCommandHandler for ClusterAgentManager {
    async fn on_peer_commands(&self, from: NodeId, commands: Vec<Command>) -> Vec<Answer> {
        let mut answers = Vec::with_capacity(commands.len());
        for command in commands {
            debug!(node_id = %self.local, from = %from, command = command.name(), "peer command");
            let answer = match command {
                Command::TransferAgent { host_id, current_owner, future_owner, event } => {
                    let ok = self.execute_rebalance_request(host_id, current_owner, future_owner, event).await;
                    if ok {
                        Answer::success(format!("{:?} accepted", event))
                    } else {
                        Answer::failure(format!("{:?} refused", event))
                    }
                }
                Command::ChangeAgent { host_id, event } => match self.execute_user_request(host_id, event).await {
                    Ok(true) => Answer::success(format!("{:?} applied", event)),
                    Ok(false) => Answer::failure(format!("{:?} not applied", event)),
                    Err(e) => Answer::failure(e.to_string()),
                },
                other => Answer::failure(format!("unsupported cluster command {}", other.name())),
            };
            answers.push(answer);
        }
        answers
    }
}

/// Routes frames from directly connected backends. Frames of one host are
/// routed in arrival order; different hosts do not wait on each other.
async fn pump_answers<R, F>(route: R, mut frames: mpsc::UnboundedReceiver<(HostId, Frame)>)
where
    R: Fn(HostId, Frame) -> F,
    F: Future<Output = ()> + Send + 'static,
{
    let mut routing = JoinSet::new();
    // Hosts with a frame being routed, and what arrived for them since.
    let mut backlog: HashMap<HostId, VecDeque<Frame>> = HashMap::new();
    let spawn = |routing: &mut JoinSet<HostId>, host: HostId, frame: Frame| {
        let routed = route(host, frame);
        routing.spawn(async move {
            routed.await;
            host
        });
    };

    loop {
        tokio::select! {
            received = frames.recv(), if routing.len() < ANSWER_ROUTES_IN_FLIGHT => {
                let Some((host, frame)) = received else {
                    break;
                };
                match backlog.get_mut(&host) {
                    Some(waiting) => waiting.push_back(frame),
                    None => {
                        backlog.insert(host, VecDeque::new());
                        spawn(&mut routing, host, frame);
                    }
                }
            }
            Some(done) = routing.join_next(), if !routing.is_empty() => {
                let host = match done {
                    Ok(host) => host,
                    Err(e) => {
                        warn!(error = %e, "answer routing task failed");
                        continue;
                    }
                };
                match backlog.get_mut(&host).and_then(VecDeque::pop_front) {
                    Some(frame) => spawn(&mut routing, host, frame),
                    None => {
                        backlog.remove(&host);
                    }
                }
            }
        }
    }
    while routing.join_next().await.is_some() {}
}

async fn route_answer(router: Weak<RequestRouter>, host: HostId, frame: Frame) {
    if let Some(router) = router.upgrade() {
        router.route(FrameSource::Direct(host), frame).await;
    }
}

fn secs(n: u64) -> std::time::Duration {
    std::time::Duration::from_secs(n)
}
