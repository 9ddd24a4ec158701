//! Cooperative cluster-wide locks used to keep periodic scans single-runner.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

/// Held lock; released on drop.
pub struct LockLease {
    _guard: Box<dyn Send + Sync>,
}

impl LockLease {
    /// Wraps whatever keeps the lock held.
    pub fn new(guard: impl Send + Sync + 'static) -> Self {
        Self { _guard: Box::new(guard) }
    }
}

impl std::fmt::Debug for LockLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("LockLease")
    }
}

/// Named mutual exclusion across nodes.
#[async_trait]
pub trait ClusterLock: Send + Sync {
    /// Waits up to `timeout` for `name`; `None` when someone else holds it.
    async fn try_lock(&self, name: &str, timeout: Duration) -> Option<LockLease>;
}

/// Process-local [`ClusterLock`]; nodes sharing one instance exclude each other.
#[derive(Default)]
pub struct LocalLockService {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl LocalLockService {
    /// Creates an empty lock table.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ClusterLock for LocalLockService {
    async fn try_lock(&self, name: &str, timeout: Duration) -> Option<LockLease> {
        let lock = self.locks.lock().entry(name.to_string()).or_default().clone();
        match tokio::time::timeout(timeout, lock.lock_owned()).await {
            Ok(guard) => Some(LockLease::new(guard)),
            Err(_) => None,
        }
    }
}
