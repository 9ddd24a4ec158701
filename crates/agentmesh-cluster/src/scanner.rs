//! Periodic scans: adopting orphaned hosts and driving pending transfers.

use std::sync::Arc;
use std::time::Duration;

use agentmesh_transport::{AgentEvent, HostId, NodeId};
use tracing::{debug, info, warn};

use crate::directory::OwnershipDirectory;
use crate::error::AgentResult;
use crate::lifecycle::AgentLifecycle;
use crate::rebalance::{RebalanceCoordinator, TransferScanReport};
use crate::store::RecordStore;
use crate::types::{Clock, HostRecord};

/// Drops trailing entries of a full batch that share the last entry's
/// grouping key, so one large group cannot occupy every scan. The first
/// entry always stays; a batch ending in ungrouped hosts is left alone.
pub fn trim_trailing_group(mut batch: Vec<HostRecord>, limit: usize) -> Vec<HostRecord> {
    if limit == 0 || batch.len() != limit {
        return batch;
    }
    let Some(last_key) = batch.last().and_then(|h| h.cluster_id) else {
        return batch;
    };
    let keep = batch[1..].iter().rposition(|h| h.cluster_id != Some(last_key)).map_or(1, |i| i + 2);
    batch.truncate(keep);
    batch
}

/// Hosts handled by one direct-host scan.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DirectScanReport {
    /// Hosts adopted by this node.
    pub loaded: Vec<HostId>,
    /// Hosts that failed to load.
    pub failed: Vec<HostId>,
    /// Hosts already held locally.
    pub skipped: Vec<HostId>,
}

/// Loads hosts no node has claimed for three missed heartbeats.
pub struct DirectHostScanner {
    local: NodeId,
    load_size: usize,
    dead_after: Duration,
    clock: Arc<dyn Clock>,
    records: Arc<dyn RecordStore>,
    directory: Arc<OwnershipDirectory>,
    lifecycle: Arc<AgentLifecycle>,
}

impl DirectHostScanner {
    /// Creates the scanner. `dead_after` is three heartbeat intervals.
    pub fn new(
        local: NodeId,
        load_size: usize,
        dead_after: Duration,
        clock: Arc<dyn Clock>,
        records: Arc<dyn RecordStore>,
        directory: Arc<OwnershipDirectory>,
        lifecycle: Arc<AgentLifecycle>,
    ) -> Self {
        Self { local, load_size, dead_after, clock, records, directory, lifecycle }
    }

    /// One scan.
    pub async fn scan_once(&self) -> AgentResult<DirectScanReport> {
        let cutoff = self.clock.now().saturating_sub(self.dead_after);
        let batch = self.records.find_hosts_ready_to_load(cutoff, self.load_size).await?;
        let batch = trim_trailing_group(batch, self.load_size);
        debug!(node_id = %self.local, hosts = batch.len(), "direct host scan");

        let mut report = DirectScanReport::default();
        for record in batch {
            if let Some(attache) = self.directory.lookup(record.id) {
                if attache.is_forwarding() {
                    debug!(host_id = %record.id, "dropping stale forwarding attache before load");
                    self.lifecycle.handle_disconnect(&attache, AgentEvent::AgentDisconnected, false).await;
                } else if !attache.is_closed() {
                    report.skipped.push(record.id);
                    continue;
                }
            }
            match self.lifecycle.load_direct_host(&record, false).await {
                Ok(_) => report.loaded.push(record.id),
                Err(e) => {
                    warn!(host_id = %record.id, error = %e, "direct host load failed");
                    report.failed.push(record.id);
                }
            }
        }
        if !report.loaded.is_empty() {
            info!(node_id = %self.local, loaded = report.loaded.len(), "adopted orphaned hosts");
        }
        Ok(report)
    }
}

/// Runs the pending-transfer check on a timer.
pub struct TransferScanner {
    coordinator: Arc<RebalanceCoordinator>,
}

impl TransferScanner {
    /// Wraps the coordinator.
    pub fn new(coordinator: Arc<RebalanceCoordinator>) -> Self {
        Self { coordinator }
    }

    /// One scan.
    pub async fn scan_once(&self) -> TransferScanReport {
        let report = self.coordinator.scan_transfers().await;
        if !report.started.is_empty() || !report.abandoned.is_empty() {
            info!(
                started = report.started.len(),
                abandoned = report.abandoned.len(),
                waiting = report.waiting.len(),
                "transfer scan"
            );
        }
        report
    }
}
