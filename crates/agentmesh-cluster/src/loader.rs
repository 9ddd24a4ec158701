//! Establishing direct connections to host backends.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use agentmesh_transport::{Answer, Frame, HostId, LinkContext, TransportError};
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use crate::attache::AgentChannel;
use crate::error::{AgentError, AgentResult};
use crate::types::HostRecord;

/// Feeds frames produced by a directly connected backend into the router.
#[derive(Clone, Debug)]
pub struct AnswerSink {
    tx: mpsc::UnboundedSender<(HostId, Frame)>,
}

impl AnswerSink {
    /// Wraps the router's inbound queue.
    pub fn new(tx: mpsc::UnboundedSender<(HostId, Frame)>) -> Self {
        Self { tx }
    }

    /// Queues a frame from `host`; false once the node has stopped.
    pub fn submit(&self, host: HostId, frame: Frame) -> bool {
        self.tx.send((host, frame)).is_ok()
    }
}

/// Result of loading a host.
pub enum LoadedAgent {
    /// A live backend connection.
    Channel(Arc<dyn AgentChannel>),
    /// A placeholder resource with no functional backend.
    Placeholder,
}

/// Connects to a host's backend resource.
#[async_trait]
pub trait HostLoader: Send + Sync {
    /// Opens the backend connection; frames it produces go to `answers`.
    async fn load(&self, host: &HostRecord, answers: AnswerSink) -> AgentResult<LoadedAgent>;
}

/// [`AgentChannel`] over an inbound link the host dialled in on.
pub struct LinkChannel(pub Arc<LinkContext>);

#[async_trait]
impl AgentChannel for LinkChannel {
    async fn deliver(&self, frame: &Frame) -> Result<(), TransportError> {
        self.0.reply(frame).await
    }

    async fn close(&self) {
        self.0.connection().close().await;
    }
}

/// In-process hosts that answer every request with a success.
#[derive(Default)]
pub struct SimulatedHostLoader {
    refused: Mutex<HashSet<HostId>>,
    placeholders: Mutex<HashSet<HostId>>,
    muted: Mutex<HashSet<HostId>>,
    loads: Mutex<HashMap<HostId, usize>>,
    delivered: Arc<Mutex<Vec<(HostId, Frame)>>>,
}

impl SimulatedHostLoader {
    /// Creates a loader that accepts every host.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes loading `host` fail.
    pub fn refuse(&self, host: HostId) {
        self.refused.lock().insert(host);
    }

    /// Lets `host` load again.
    pub fn accept(&self, host: HostId) {
        self.refused.lock().remove(&host);
    }

    /// Loads `host` as a placeholder.
    pub fn placeholder(&self, host: HostId) {
        self.placeholders.lock().insert(host);
    }

    /// `host` receives requests but never answers.
    pub fn mute(&self, host: HostId) {
        self.muted.lock().insert(host);
    }

    /// How many times `host` was loaded.
    pub fn load_count(&self, host: HostId) -> usize {
        self.loads.lock().get(&host).copied().unwrap_or(0)
    }

    /// Every frame handed to a simulated host, in delivery order.
    pub fn delivered(&self) -> Vec<(HostId, Frame)> {
        self.delivered.lock().clone()
    }
}

#[async_trait]
impl HostLoader for SimulatedHostLoader {
    async fn load(&self, host: &HostRecord, answers: AnswerSink) -> AgentResult<LoadedAgent> {
        *self.loads.lock().entry(host.id).or_insert(0) += 1;
        if self.refused.lock().contains(&host.id) {
            return Err(AgentError::unavailable(host.id, "host refused the connection"));
        }
        if self.placeholders.lock().contains(&host.id) {
            return Ok(LoadedAgent::Placeholder);
        }
        debug!(host_id = %host.id, name = %host.name, "simulated host connected");
        Ok(LoadedAgent::Channel(Arc::new(SimulatedHost {
            host: host.id,
            answers,
            muted: self.muted.lock().contains(&host.id),
            delivered: self.delivered.clone(),
        })))
    }
}

struct SimulatedHost {
    host: HostId,
    answers: AnswerSink,
    muted: bool,
    delivered: Arc<Mutex<Vec<(HostId, Frame)>>>,
}

#[async_trait]
impl AgentChannel for SimulatedHost {
    async fn deliver(&self, frame: &Frame) -> Result<(), TransportError> {
        self.delivered.lock().push((self.host, frame.clone()));
        if self.muted || !frame.is_request() || frame.is_control() {
            return Ok(());
        }
        let answers: Vec<Answer> = frame
            .commands()?
            .iter()
            .map(|c| Answer::success(format!("{} handled by host {}", c.name(), self.host)))
            .collect();
        let response = Frame::response(&frame.header, &answers)?;
        if !self.answers.submit(self.host, response) {
            return Err(TransportError::ConnectionReset);
        }
        Ok(())
    }
}
