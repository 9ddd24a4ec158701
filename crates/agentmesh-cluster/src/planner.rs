//! Load-balance planners: which hosts a busy node should hand over.

use std::collections::BTreeMap;
use std::sync::Arc;

use agentmesh_transport::{HostId, NodeId};
use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::StoreResult;
use crate::store::RecordStore;

/// Picks hosts `owner` should hand over so that it keeps about `average`.
#[async_trait]
pub trait LoadBalancerPlanner: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Hosts `owner` should give up; empty when this planner has no opinion.
    async fn hosts_to_rebalance(&self, owner: NodeId, average: usize) -> StoreResult<Vec<HostId>>;
}

/// Average hosts per node, never below one.
pub fn average_load(managed_hosts: usize, up_nodes: usize) -> usize {
    if up_nodes == 0 {
        return 1;
    }
    (managed_hosts / up_nodes).max(1)
}

/// Gives away the surplus above the average, whole grouping keys first so
/// that hosts sharing a key stay on one node.
pub struct ClusterBasedPlanner {
    records: Arc<dyn RecordStore>,
}

impl ClusterBasedPlanner {
    /// Plans over the given records.
    pub fn new(records: Arc<dyn RecordStore>) -> Self {
        Self { records }
    }
}

#[async_trait]
impl LoadBalancerPlanner for ClusterBasedPlanner {
    fn name(&self) -> &str {
        "cluster-based"
    }

    async fn hosts_to_rebalance(&self, owner: NodeId, average: usize) -> StoreResult<Vec<HostId>> {
        let owned: Vec<_> = self
            .records
            .list_hosts_by_owner(owner)
            .await?
            .into_iter()
            .filter(|h| h.status.is_connected())
            .collect();
        if owned.len() <= average {
            return Ok(Vec::new());
        }
        let mut surplus = owned.len() - average;

        let mut groups: BTreeMap<Option<u64>, Vec<HostId>> = BTreeMap::new();
        for host in &owned {
            groups.entry(host.cluster_id).or_default().push(host.id);
        }
        let mut groups: Vec<Vec<HostId>> = groups.into_values().collect();
        groups.sort_by_key(|g| g.len());

        let mut picked = Vec::new();
        // Whole groups that fit, smallest first.
        for group in groups.iter_mut() {
            if group.len() <= surplus {
                surplus -= group.len();
                picked.append(group);
            }
        }
        // Then fill the remainder from the largest remaining group.
        if surplus > 0 {
            if let Some(group) = groups.iter_mut().rev().find(|g| !g.is_empty()) {
                group.sort();
                picked.extend(group.iter().rev().take(surplus));
            }
        }
        Ok(picked)
    }
}

/// Planner returning a fixed answer per owner.
#[derive(Default)]
pub struct StaticPlanner {
    plans: Mutex<BTreeMap<NodeId, Vec<HostId>>>,
}

impl StaticPlanner {
    /// Creates a planner with no plans.
    pub fn new() -> Self {
        Self::default()
    }

    /// Hosts `owner` gives up whenever it is asked.
    pub fn plan(&self, owner: NodeId, hosts: Vec<HostId>) {
        self.plans.lock().insert(owner, hosts);
    }
}

#[async_trait]
impl LoadBalancerPlanner for StaticPlanner {
    fn name(&self) -> &str {
        "static"
    }

    async fn hosts_to_rebalance(&self, owner: NodeId, _average: usize) -> StoreResult<Vec<HostId>> {
        Ok(self.plans.lock().get(&owner).cloned().unwrap_or_default())
    }
}
