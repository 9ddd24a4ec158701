//! Host and transfer record stores.
//!
//! The records live outside this process in production. `MemoryRecordStore`
//! keeps them in memory for the single-node binary and for tests.

use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use agentmesh_transport::{AgentEvent, HostId, NodeId};
use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use crate::error::{StoreError, StoreResult};
use crate::types::{Clock, HostRecord, HostStatus, Timestamp, TransferRecord, TransferState};

/// Host records.
#[async_trait]
pub trait HostStore: Send + Sync {
    /// Looks a host up by id.
    async fn find_host(&self, host: HostId) -> StoreResult<Option<HostRecord>>;

    /// Hosts in a grouping key.
    async fn list_hosts_by_cluster(&self, cluster_id: u64) -> StoreResult<Vec<HostRecord>>;

    /// Hosts whose live connection is held by `node`.
    async fn list_hosts_by_owner(&self, node: NodeId) -> StoreResult<Vec<HostRecord>>;

    /// Every host that is not removed.
    async fn list_managed_hosts(&self) -> StoreResult<Vec<HostRecord>>;

    /// Applies `event` reported by `node` and returns the resulting status.
    async fn update_status(&self, host: HostId, event: AgentEvent, node: NodeId) -> StoreResult<HostStatus>;

    /// Marks every host owned by `node` disconnected; returns how many changed.
    async fn mark_hosts_disconnected(&self, node: NodeId) -> StoreResult<usize>;

    /// Unowned hosts whose last ping is at or before `cutoff`, ordered by
    /// grouping key then id, at most `limit`.
    async fn find_hosts_ready_to_load(&self, cutoff: Timestamp, limit: usize) -> StoreResult<Vec<HostRecord>>;
}

/// Transfer records. At most one active record per host.
#[async_trait]
pub trait TransferStore: Send + Sync {
    /// Creates a `Requested` record; `Conflict` when one is already active.
    async fn start_transfer(&self, host: HostId, initial: NodeId, future: NodeId) -> StoreResult<TransferRecord>;

    /// The active record for `host`.
    async fn find_active(&self, host: HostId) -> StoreResult<Option<TransferRecord>>;

    /// The active record for `host` if `node` is its initial owner.
    async fn find_by_current_owner(&self, host: HostId, node: NodeId) -> StoreResult<Option<TransferRecord>>;

    /// The active record for `host` if `node` is its future owner.
    async fn find_by_future_owner(&self, host: HostId, node: NodeId) -> StoreResult<Option<TransferRecord>>;

    /// True when a `Requested` record exists that has not changed since `cutoff`.
    async fn is_stale(&self, host: HostId, cutoff: Timestamp) -> StoreResult<bool>;

    /// Marks the record completed and retires it.
    async fn complete_transfer(&self, host: HostId) -> StoreResult<()>;

    /// Deletes the active record; returns whether one existed.
    async fn remove(&self, host: HostId) -> StoreResult<bool>;

    /// Active records moving hosts to `node`.
    async fn list_pending_joining(&self, node: NodeId) -> StoreResult<Vec<TransferRecord>>;

    /// Active records moving hosts away from `node`.
    async fn list_pending_leaving(&self, node: NodeId) -> StoreResult<Vec<TransferRecord>>;
}

/// One change inside a [`RecordStore::commit`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordMutation {
    /// Apply a host event, as [`HostStore::update_status`] does.
    HostEvent {
        /// Host.
        host: HostId,
        /// Event.
        event: AgentEvent,
        /// Reporting node.
        node: NodeId,
    },
    /// Create the active transfer record, as [`TransferStore::start_transfer`] does.
    StartTransfer {
        /// Host.
        host: HostId,
        /// Current owner.
        initial: NodeId,
        /// Node taking the host over.
        future: NodeId,
    },
    /// Move the active transfer record to `state`.
    TransferState {
        /// Host.
        host: HostId,
        /// New phase.
        state: TransferState,
    },
}

impl RecordMutation {
    /// Host the mutation writes to.
    pub fn host(&self) -> HostId {
        match self {
            RecordMutation::HostEvent { host, .. }
            | RecordMutation::StartTransfer { host, .. }
            | RecordMutation::TransferState { host, .. } => *host,
        }
    }
}

/// Both stores plus an all-or-nothing commit across them.
#[async_trait]
pub trait RecordStore: HostStore + TransferStore {
    /// Applies every mutation or none.
    async fn commit(&self, mutations: Vec<RecordMutation>) -> StoreResult<()>;
}

#[derive(Default)]
struct Records {
    hosts: BTreeMap<HostId, HostRecord>,
    transfers: HashMap<HostId, TransferRecord>,
}

/// Copies of the records a commit touches, written back only when every
/// mutation applied.
#[derive(Default)]
struct Staged {
    hosts: HashMap<HostId, HostRecord>,
    transfers: HashMap<HostId, TransferRecord>,
}

impl Staged {
    fn apply(&mut self, records: &Records, mutation: &RecordMutation, now: Timestamp) -> StoreResult<()> {
        match mutation {
            RecordMutation::HostEvent { host, event, node } => {
                let record = match self.hosts.entry(*host) {
                    Entry::Occupied(staged) => staged.into_mut(),
                    Entry::Vacant(slot) => {
                        let current = records
                            .hosts
                            .get(host)
                            .ok_or_else(|| StoreError::NotFound(format!("host {}", host)))?;
                        slot.insert(current.clone())
                    }
                };
                record.apply_event(*event, *node);
            }
            RecordMutation::StartTransfer { host, initial, future } => {
                if self.transfers.contains_key(host) || records.transfers.contains_key(host) {
                    return Err(StoreError::Conflict(format!("host {} already has an active transfer", host)));
                }
                self.transfers.insert(*host, TransferRecord::requested(*host, *initial, *future, now));
            }
            RecordMutation::TransferState { host, state } => {
                let record = match self.transfers.entry(*host) {
                    Entry::Occupied(staged) => staged.into_mut(),
                    Entry::Vacant(slot) => {
                        let current = records
                            .transfers
                            .get(host)
                            .ok_or_else(|| StoreError::NotFound(format!("transfer for host {}", host)))?;
                        slot.insert(current.clone())
                    }
                };
                record.state = *state;
                record.updated_at = now;
            }
        }
        Ok(())
    }

    fn write_to(self, records: &mut Records) {
        records.hosts.extend(self.hosts);
        records.transfers.extend(self.transfers);
    }
}

/// In-memory [`RecordStore`].
pub struct MemoryRecordStore {
    records: Mutex<Records>,
    completed: Mutex<Vec<TransferRecord>>,
    clock: Arc<dyn Clock>,
    refused: Mutex<HashSet<HostId>>,
}

impl MemoryRecordStore {
    /// Creates an empty store stamping records with `clock`.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            records: Mutex::new(Records::default()),
            completed: Mutex::new(Vec::new()),
            clock,
            refused: Mutex::new(HashSet::new()),
        }
    }

    /// While refused, transfer writes and commits touching `host` fail with
    /// [`StoreError::Unavailable`] and change nothing.
    pub fn refuse_writes(&self, host: HostId, refuse: bool) {
        let mut refused = self.refused.lock();
        if refuse {
            refused.insert(host);
        } else {
            refused.remove(&host);
        }
    }

    fn check_writable(&self, host: HostId) -> StoreResult<()> {
        if self.refused.lock().contains(&host) {
            return Err(StoreError::Unavailable(format!("writes for host {} refused", host)));
        }
        Ok(())
    }

    /// Inserts or replaces a host record.
    pub fn put_host(&self, host: HostRecord) {
        self.records.lock().hosts.insert(host.id, host);
    }

    /// Snapshot of a host record.
    pub fn host(&self, host: HostId) -> Option<HostRecord> {
        self.records.lock().hosts.get(&host).cloned()
    }

    /// Snapshot of the active transfer record for `host`.
    pub fn transfer(&self, host: HostId) -> Option<TransferRecord> {
        self.records.lock().transfers.get(&host).cloned()
    }

    /// Completed transfers, oldest first.
    pub fn completed_transfers(&self) -> Vec<TransferRecord> {
        self.completed.lock().clone()
    }

    fn active_matching(&self, host: HostId, pred: impl Fn(&TransferRecord) -> bool) -> Option<TransferRecord> {
        self.records.lock().transfers.get(&host).filter(|t| pred(t)).cloned()
    }

    fn list_transfers(&self, pred: impl Fn(&TransferRecord) -> bool) -> Vec<TransferRecord> {
        let mut found: Vec<TransferRecord> =
            self.records.lock().transfers.values().filter(|t| pred(t)).cloned().collect();
        found.sort_by_key(|t| t.host_id);
        found
    }
}

#[async_trait]
impl HostStore for MemoryRecordStore {
    async fn find_host(&self, host: HostId) -> StoreResult<Option<HostRecord>> {
        Ok(self.host(host))
    }

    async fn list_hosts_by_cluster(&self, cluster_id: u64) -> StoreResult<Vec<HostRecord>> {
        let records = self.records.lock();
        Ok(records.hosts.values().filter(|h| h.cluster_id == Some(cluster_id)).cloned().collect())
    }

    async fn list_hosts_by_owner(&self, node: NodeId) -> StoreResult<Vec<HostRecord>> {
        let records = self.records.lock();
        Ok(records.hosts.values().filter(|h| h.owner == Some(node)).cloned().collect())
    }

    async fn list_managed_hosts(&self) -> StoreResult<Vec<HostRecord>> {
        let records = self.records.lock();
        Ok(records.hosts.values().filter(|h| h.status != HostStatus::Removed).cloned().collect())
    }

    async fn update_status(&self, host: HostId, event: AgentEvent, node: NodeId) -> StoreResult<HostStatus> {
        let mut records = self.records.lock();
        let record = records.hosts.get_mut(&host).ok_or_else(|| StoreError::NotFound(format!("host {}", host)))?;
        record.apply_event(event, node);
        debug!(host_id = %host, ?event, status = ?record.status, "host status updated");
        Ok(record.status)
    }

    async fn mark_hosts_disconnected(&self, node: NodeId) -> StoreResult<usize> {
        let mut records = self.records.lock();
        let mut changed = 0;
        for record in records.hosts.values_mut().filter(|h| h.owner == Some(node)) {
            record.apply_event(AgentEvent::ManagementServerDown, node);
            changed += 1;
        }
        Ok(changed)
    }

    async fn find_hosts_ready_to_load(&self, cutoff: Timestamp, limit: usize) -> StoreResult<Vec<HostRecord>> {
        let records = self.records.lock();
        let mut ready: Vec<HostRecord> = records
            .hosts
            .values()
            .filter(|h| h.owner.is_none() && h.status != HostStatus::Removed && h.last_ping <= cutoff)
            .cloned()
            .collect();
        ready.sort_by_key(|h| (h.cluster_id, h.id));
        ready.truncate(limit);
        Ok(ready)
    }
}

#[async_trait]
impl TransferStore for MemoryRecordStore {
    async fn start_transfer(&self, host: HostId, initial: NodeId, future: NodeId) -> StoreResult<TransferRecord> {
        self.check_writable(host)?;
        let now = self.clock.now();
        let mut records = self.records.lock();
        if records.transfers.contains_key(&host) {
            return Err(StoreError::Conflict(format!("host {} already has an active transfer", host)));
        }
        let record = TransferRecord::requested(host, initial, future, now);
        records.transfers.insert(host, record.clone());
        Ok(record)
    }

    async fn find_active(&self, host: HostId) -> StoreResult<Option<TransferRecord>> {
        Ok(self.transfer(host))
    }

    async fn find_by_current_owner(&self, host: HostId, node: NodeId) -> StoreResult<Option<TransferRecord>> {
        Ok(self.active_matching(host, |t| t.initial_owner == node))
    }

    async fn find_by_future_owner(&self, host: HostId, node: NodeId) -> StoreResult<Option<TransferRecord>> {
        Ok(self.active_matching(host, |t| t.future_owner == node))
    }

    async fn is_stale(&self, host: HostId, cutoff: Timestamp) -> StoreResult<bool> {
        Ok(self
            .active_matching(host, |t| t.state == TransferState::Requested && t.updated_at <= cutoff)
            .is_some())
    }

    async fn complete_transfer(&self, host: HostId) -> StoreResult<()> {
        let now = self.clock.now();
        let removed = self.records.lock().transfers.remove(&host);
        if let Some(mut record) = removed {
            record.state = TransferState::Completed;
            record.updated_at = now;
            self.completed.lock().push(record);
        }
        Ok(())
    }

    async fn remove(&self, host: HostId) -> StoreResult<bool> {
        Ok(self.records.lock().transfers.remove(&host).is_some())
    }

    async fn list_pending_joining(&self, node: NodeId) -> StoreResult<Vec<TransferRecord>> {
        Ok(self.list_transfers(|t| t.future_owner == node))
    }

    async fn list_pending_leaving(&self, node: NodeId) -> StoreResult<Vec<TransferRecord>> {
        Ok(self.list_transfers(|t| t.initial_owner == node))
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn commit(&self, mutations: Vec<RecordMutation>) -> StoreResult<()> {
        for mutation in &mutations {
            self.check_writable(mutation.host())?;
        }
        let now = self.clock.now();
        let mut records = self.records.lock();
        let mut staged = Staged::default();
        for mutation in &mutations {
            staged.apply(&records, mutation, now)?;
        }
        staged.write_to(&mut records);
        Ok(())
    }
}
