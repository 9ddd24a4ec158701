//! Background task runner for the periodic scans.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::lock::ClusterLock;

/// Cluster-wide lock a periodic task takes before each run.
#[derive(Clone)]
pub struct TaskLock {
    /// Lock service.
    pub service: Arc<dyn ClusterLock>,
    /// Lock name.
    pub name: String,
    /// How long to wait for it.
    pub timeout: Duration,
}

/// Owns the node's background tasks and stops them together.
pub struct Scheduler {
    shutdown: CancellationToken,
    tasks: Mutex<Vec<(String, JoinHandle<()>)>>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    /// Creates a scheduler with nothing running.
    pub fn new() -> Self {
        Self { shutdown: CancellationToken::new(), tasks: Mutex::new(Vec::new()) }
    }

    /// Token cancelled by [`Scheduler::shutdown`].
    pub fn token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Runs `task` every `period` after `initial_delay`. A run that overlaps
    /// the next tick makes that tick be skipped. With `lock`, a run only
    /// happens while the lock is held; a node that cannot take it skips
    /// that run.
    pub fn spawn_periodic<F, Fut>(
        &self,
        name: &str,
        initial_delay: Duration,
        period: Duration,
        lock: Option<TaskLock>,
        mut task: F,
    ) where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let token = self.shutdown.clone();
        let task_name = name.to_string();
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(initial_delay) => {}
            }
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!(task = %task_name, period_secs = period.as_secs(), "periodic task started");

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let _lease = match &lock {
                            Some(lock) => match lock.service.try_lock(&lock.name, lock.timeout).await {
                                Some(lease) => Some(lease),
                                None => {
                                    debug!(task = %task_name, lock = %lock.name, "lock held elsewhere, skipping run");
                                    continue;
                                }
                            },
                            None => None,
                        };
                        task().await;
                    }
                }
            }
            debug!(task = %task_name, "periodic task stopped");
        });
        self.tasks.lock().push((name.to_string(), handle));
    }

    /// Runs a long-lived `task` until it returns or the scheduler shuts down.
    pub fn spawn<Fut>(&self, name: &str, task: Fut)
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        let token = self.shutdown.clone();
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = task => {}
            }
        });
        self.tasks.lock().push((name.to_string(), handle));
    }

    /// Runs `task` once after `delay` unless shut down first.
    pub fn spawn_once<Fut>(&self, name: &str, delay: Duration, task: Fut)
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        let token = self.shutdown.clone();
        let task_name = name.to_string();
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!(task = %task_name, "one-shot task cancelled");
                }
                _ = tokio::time::sleep(delay) => task.await,
            }
        });
        self.tasks.lock().push((name.to_string(), handle));
    }

    /// Cancels every task and waits for them to finish.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for (name, handle) in tasks {
            if let Err(e) = handle.await {
                warn!(task = %name, error = %e, "background task ended abnormally");
            }
        }
    }
}
