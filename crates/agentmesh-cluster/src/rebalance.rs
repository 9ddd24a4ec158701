//! Moving a host's live connection from one node to another.
//!
//! A node that wants hosts asks each owner to queue them (`RequestAgentRebalance`).
//! The owner parks the host in its pending set; the transfer scan starts the
//! move once the host's attache is idle:
//!
//! 1. `start_transfer` swaps the idle local attache for a forwarding one in
//!    transfer mode, so new requests are parked instead of sent.
//! 2. The future owner is told to load the host (`StartAgentRebalance`).
//! 3. `finish_transfer` either drains the parked requests to the new owner or
//!    forces the host to reconnect so whichever node claims it next adopts it.
//!
//! Transfers that never get going are abandoned by the scan.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use agentmesh_transport::{AgentEvent, Command, HostId, NodeId};
use parking_lot::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::attache::{AgentAttache, PeerRouting};
use crate::directory::OwnershipDirectory;
use crate::error::{AgentResult, RebalanceError};
use crate::lifecycle::AgentLifecycle;
use crate::nodes::NodeDirectory;
use crate::planner::{average_load, LoadBalancerPlanner};
use crate::rpc::PeerRpc;
use crate::store::{RecordMutation, RecordStore};
use crate::types::{Clock, HostStatus, NodeState, TransferState};

/// Result of inspecting one pending host during the transfer scan.
#[derive(Debug, Clone, PartialEq, Eq)]
enum PendingCheck {
    Ready(NodeId),
    Busy,
    Abandon(&'static str),
}

/// What one transfer scan did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TransferScanReport {
    /// Hosts whose transfer was started, with whether it succeeded.
    pub started: Vec<(HostId, bool)>,
    /// Hosts dropped from the pending set.
    pub abandoned: Vec<HostId>,
    /// Hosts left pending because their attache was busy.
    pub waiting: Vec<HostId>,
}

/// Drives host transfers in and out of this node.
pub struct RebalanceCoordinator {
    local: NodeId,
    timeout: Duration,
    clock: Arc<dyn Clock>,
    directory: Arc<OwnershipDirectory>,
    lifecycle: Arc<AgentLifecycle>,
    records: Arc<dyn RecordStore>,
    nodes: Arc<dyn NodeDirectory>,
    peers: Arc<dyn PeerRouting>,
    rpc: Arc<dyn PeerRpc>,
    planners: Vec<Arc<dyn LoadBalancerPlanner>>,
    pending: Mutex<HashSet<HostId>>,
}

impl RebalanceCoordinator {
    /// Wires the coordinator. `timeout` bounds how long a requested transfer
    /// may wait to start.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        local: NodeId,
        timeout: Duration,
        clock: Arc<dyn Clock>,
        directory: Arc<OwnershipDirectory>,
        lifecycle: Arc<AgentLifecycle>,
        records: Arc<dyn RecordStore>,
        nodes: Arc<dyn NodeDirectory>,
        peers: Arc<dyn PeerRouting>,
        rpc: Arc<dyn PeerRpc>,
        planners: Vec<Arc<dyn LoadBalancerPlanner>>,
    ) -> Self {
        Self {
            local,
            timeout,
            clock,
            directory,
            lifecycle,
            records,
            nodes,
            peers,
            rpc,
            planners,
            pending: Mutex::new(HashSet::new()),
        }
    }

    /// Hosts waiting for the transfer scan, sorted.
    pub fn pending_hosts(&self) -> Vec<HostId> {
        let mut hosts: Vec<HostId> = self.pending.lock().iter().copied().collect();
        hosts.sort();
        hosts
    }

    /// Queues `host` for transfer to `future`. Only its current owner accepts.
    pub fn request_transfer(&self, host: HostId, current: NodeId, future: NodeId) -> bool {
        if current != self.local {
            warn!(host_id = %host, current = %current, "transfer requested from a node that does not own the host");
            return false;
        }
        self.pending.lock().insert(host);
        info!(host_id = %host, future = %future, "host queued for transfer");
        true
    }

    /// Peer-side entry for the two rebalance commands.
    pub async fn execute_rebalance_request(
        &self,
        host: HostId,
        current: NodeId,
        future: NodeId,
        event: AgentEvent,
    ) -> bool {
        match event {
            AgentEvent::RequestAgentRebalance => self.request_transfer(host, current, future),
            AgentEvent::StartAgentRebalance => self.rebalance_host(host, current, future).await,
            other => {
                warn!(host_id = %host, event = ?other, "unexpected rebalance event");
                false
            }
        }
    }

    /// Moves `host` from `current` to `future`; runs the side that belongs to this node.
    pub async fn rebalance_host(&self, host: HostId, current: NodeId, future: NodeId) -> bool {
        if current == self.local {
            if let Err(e) = self.start_transfer(host, future).await {
                warn!(host_id = %host, error = %e, "unable to start transfer");
                self.recover_failed_start(host, e).await;
                return false;
            }
            let command = Command::TransferAgent {
                host_id: host,
                current_owner: current,
                future_owner: future,
                event: AgentEvent::StartAgentRebalance,
            };
            let accepted = match self.rpc.execute(future, host, vec![command]).await {
                Ok(answers) => answers.first().map(|a| a.result).unwrap_or(false),
                Err(e) => {
                    warn!(host_id = %host, future = %future, error = %e, "future owner unreachable");
                    false
                }
            };
            if let Err(e) = self.finish_transfer(host, future, accepted).await {
                warn!(host_id = %host, error = %e, "transfer finished with errors");
            }
            accepted
        } else if future == self.local {
            let record = match self.records.find_host(host).await {
                Ok(Some(record)) if record.status != HostStatus::Removed => record,
                Ok(_) => {
                    warn!(host_id = %host, "cannot take over unknown host");
                    return false;
                }
                Err(e) => {
                    warn!(host_id = %host, error = %e, "host lookup failed");
                    return false;
                }
            };
            match self.lifecycle.load_direct_host(&record, true).await {
                Ok(_) => {
                    info!(host_id = %host, from = %current, "took over host");
                    true
                }
                Err(e) => {
                    warn!(host_id = %host, from = %current, error = %e, "unable to take over host");
                    false
                }
            }
        } else {
            warn!(host_id = %host, current = %current, future = %future, "rebalance for a host this node is not part of");
            false
        }
    }

    /// First phase on the current owner.
    ///
    /// Fails without changing anything when the host is gone, there is no
    /// local attache, or the attache has requests queued or callers waiting.
    pub async fn start_transfer(&self, host: HostId, future: NodeId) -> Result<(), RebalanceError> {
        match self.records.find_host(host).await? {
            Some(record) if record.status != HostStatus::Removed => {}
            _ => return Err(RebalanceError::HostNotFound(host)),
        }

        let forwarding = Arc::new(AgentAttache::forwarding(host, self.local, self.peers.clone()));
        forwarding.set_transfer_mode(true);
        let old = self.directory.swap_if_idle(forwarding)?;
        old.disconnect(HostStatus::Rebalancing).await;

        let mut mutations =
            vec![RecordMutation::HostEvent { host, event: AgentEvent::StartAgentRebalance, node: self.local }];
        if self.records.find_active(host).await?.is_none() {
            mutations.push(RecordMutation::StartTransfer { host, initial: self.local, future });
        }
        mutations.push(RecordMutation::TransferState { host, state: TransferState::InTransfer });
        self.records.commit(mutations).await?;
        info!(host_id = %host, future = %future, "transfer started, host in transfer mode");
        Ok(())
    }

    /// Last phase on the former owner.
    pub async fn finish_transfer(&self, host: HostId, future: NodeId, success: bool) -> Result<(), RebalanceError> {
        if self.records.find_host(host).await?.is_none() {
            self.fail_transfer(host).await;
            return Err(RebalanceError::HostNotFound(host));
        }
        let attache = match self.directory.lookup(host) {
            Some(attache) if attache.is_forwarding() => attache,
            _ => {
                warn!(host_id = %host, "no forwarding attache, assuming the host disconnected already");
                self.records.complete_transfer(host).await?;
                return Err(RebalanceError::AttacheMissing(host));
            }
        };

        if !success {
            self.fail_transfer(host).await;
            return Err(RebalanceError::TargetRejected { host_id: host, target: future });
        }

        attache.set_transfer_mode(false);
        let mut drained = 0usize;
        while let Some(frame) = attache.take_buffered_request() {
            drained += 1;
            if !self.peers.route(future, &frame).await {
                debug!("Seq {}-{}: failed to route parked request to node {}", host, frame.sequence(), future);
            }
        }
        self.records.complete_transfer(host).await?;
        info!(host_id = %host, node_id = %self.local, future = %future, drained, "transfer completed");
        Ok(())
    }

    async fn fail_transfer(&self, host: HostId) {
        if let Err(e) = self.records.complete_transfer(host).await {
            warn!(host_id = %host, error = %e, "unable to complete transfer record");
        }
        match self.lifecycle.reconnect(host).await {
            Ok(_) => info!(host_id = %host, "transfer failed, host reconnecting"),
            Err(e) => warn!(host_id = %host, error = %e, "transfer failed and reconnect did not go through"),
        }
    }

    async fn recover_failed_start(&self, host: HostId, error: RebalanceError) {
        match error {
            RebalanceError::AttacheBusy { .. } | RebalanceError::AttacheMissing(_) => {
                if let Err(e) = self.records.complete_transfer(host).await {
                    warn!(host_id = %host, error = %e, "unable to complete transfer record");
                }
            }
            _ => self.fail_transfer(host).await,
        }
    }

    /// One pass of the transfer scan over every pending host.
    pub async fn scan_transfers(self: &Arc<Self>) -> TransferScanReport {
        let cutoff = self.clock.now().saturating_sub(self.timeout);
        let mut report = TransferScanReport::default();
        let mut running = JoinSet::new();

        for host in self.pending_hosts() {
            match self.check_pending(host, cutoff).await {
                Ok(PendingCheck::Ready(future)) => {
                    self.pending.lock().remove(&host);
                    let this = self.clone();
                    running.spawn(async move {
                        let done = this.rebalance_host(host, this.local, future).await;
                        (host, done)
                    });
                }
                Ok(PendingCheck::Busy) => {
                    debug!(host_id = %host, "host cannot be transferred yet, attache busy");
                    report.waiting.push(host);
                }
                Ok(PendingCheck::Abandon(reason)) => {
                    self.abandon(host, reason).await;
                    report.abandoned.push(host);
                }
                Err(e) => {
                    warn!(host_id = %host, error = %e, "unable to inspect pending transfer");
                    report.waiting.push(host);
                }
            }
        }

        while let Some(joined) = running.join_next().await {
            match joined {
                Ok(outcome) => report.started.push(outcome),
                Err(e) => warn!(error = %e, "rebalance task failed"),
            }
        }
        report.started.sort();
        report
    }

    async fn check_pending(&self, host: HostId, cutoff: crate::types::Timestamp) -> AgentResult<PendingCheck> {
        if self.records.is_stale(host, cutoff).await? {
            return Ok(PendingCheck::Abandon("timed out waiting for the host to be ready"));
        }
        let Some(transfer) = self.records.find_by_current_owner(host, self.local).await? else {
            return Ok(PendingCheck::Abandon("no transfer record owned by this node"));
        };
        let attache = match self.directory.lookup(host) {
            Some(attache) if !attache.is_forwarding() && !attache.is_closed() => attache,
            _ => return Ok(PendingCheck::Abandon("this node no longer holds the host")),
        };
        match self.nodes.find_node(transfer.future_owner).await? {
            Some(node) if node.state == NodeState::Up => {}
            _ => return Ok(PendingCheck::Abandon("future owner is not up")),
        }
        if attache.is_idle() {
            Ok(PendingCheck::Ready(transfer.future_owner))
        } else {
            Ok(PendingCheck::Busy)
        }
    }

    async fn abandon(&self, host: HostId, reason: &str) {
        self.pending.lock().remove(&host);
        match self.records.remove(host).await {
            Ok(_) => info!(host_id = %host, reason, "transfer abandoned"),
            Err(e) => warn!(host_id = %host, reason, error = %e, "transfer abandoned, record not removed"),
        }
    }

    /// Asks busier nodes for hosts so this node carries about the average.
    /// Returns how many transfers were requested.
    pub async fn start_rebalance_agents(&self) -> AgentResult<usize> {
        let up = self.nodes.list_nodes_by_state(NodeState::Up).await?;
        let managed = self.records.list_managed_hosts().await?;
        if up.is_empty() || managed.is_empty() {
            debug!(nodes = up.len(), hosts = managed.len(), "nothing to rebalance");
            return Ok(0);
        }
        let average = average_load(managed.len(), up.len());
        debug!(nodes = up.len(), hosts = managed.len(), average, "starting agent rebalance");

        let mut requested = 0;
        for node in up.iter().filter(|n| n.id != self.local) {
            let mut hosts = Vec::new();
            for planner in &self.planners {
                hosts = planner.hosts_to_rebalance(node.id, average).await?;
                if !hosts.is_empty() {
                    debug!(planner = planner.name(), node_id = %node.id, hosts = hosts.len(), "planner picked hosts");
                    break;
                }
            }
            for host in hosts {
                if self.records.find_active(host).await?.is_some() {
                    debug!(host_id = %host, "host already in transfer, skipping");
                    continue;
                }
                match self.request_from(node.id, host).await {
                    Ok(true) => requested += 1,
                    Ok(false) => {}
                    Err(e) => warn!(host_id = %host, owner = %node.id, error = %e, "unable to request host"),
                }
            }
        }
        Ok(requested)
    }

    async fn request_from(&self, owner: NodeId, host: HostId) -> AgentResult<bool> {
        self.records.start_transfer(host, owner, self.local).await?;
        let command = Command::TransferAgent {
            host_id: host,
            current_owner: owner,
            future_owner: self.local,
            event: AgentEvent::RequestAgentRebalance,
        };
        let accepted = match self.rpc.execute(owner, host, vec![command]).await {
            Ok(answers) => answers.first().map(|a| a.result).unwrap_or(false),
            Err(e) => {
                warn!(host_id = %host, owner = %owner, error = %e, "unable to request transfer");
                false
            }
        };
        if !accepted {
            if let Some(transfer) = self.records.find_active(host).await? {
                if transfer.state == TransferState::Requested {
                    self.records.remove(host).await?;
                }
            }
        }
        Ok(accepted)
    }

    /// Deletes transfer records joining or leaving `node`.
    pub async fn cleanup_transfer_map(&self, node: NodeId) -> AgentResult<usize> {
        let mut hosts: Vec<HostId> = self.records.list_pending_joining(node).await?.iter().map(|t| t.host_id).collect();
        hosts.extend(self.records.list_pending_leaving(node).await?.iter().map(|t| t.host_id));
        hosts.sort();
        hosts.dedup();
        for host in &hosts {
            self.records.remove(*host).await?;
        }
        if node == self.local {
            self.pending.lock().clear();
        }
        debug!(node_id = %node, removed = hosts.len(), "transfer map cleaned");
        Ok(hosts.len())
    }
}
