//! Per-host agent sessions.
//!
//! An [`AgentAttache`] represents one host's agent on this node. `Local`
//! attaches hold the live channel to the host, `Forwarding` attaches proxy
//! every frame to whichever node owns the host, and `Dummy` attaches stand
//! in for placeholder resources that accept no work.
//!
//! Requests flagged sequential are released to the backend one at a time in
//! sequence order; the next one goes out when the answer for the current one
//! arrives (or when it is cancelled). Everything else goes out immediately.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use agentmesh_transport::{Answer, Command, Frame, HostId, NodeId, TransportError};
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, info, trace, warn};

use crate::error::{AgentError, AgentResult};
use crate::types::HostStatus;

/// The live connection to a host's backend.
#[async_trait]
pub trait AgentChannel: Send + Sync {
    /// Hands one frame to the host. Answers come back through the router.
    async fn deliver(&self, frame: &Frame) -> Result<(), TransportError>;

    /// Tears the connection down.
    async fn close(&self) {}
}

/// How forwarding attaches reach the node that owns a host.
#[async_trait]
pub trait PeerRouting: Send + Sync {
    /// Node currently holding the host's live connection.
    async fn owner_of(&self, host: HostId) -> Option<NodeId>;

    /// Ships a frame to a peer; false when it could not be delivered.
    async fn route(&self, peer: NodeId, frame: &Frame) -> bool;

    /// Drops the cached link to a peer.
    async fn close_peer(&self, peer: NodeId);
}

/// Attache variant.
pub enum AttacheKind {
    /// Owns the live host connection.
    Local(Arc<dyn AgentChannel>),
    /// Proxies to the owning node.
    Forwarding(Arc<dyn PeerRouting>),
    /// Placeholder resource; rejects all work.
    Dummy,
}

impl AttacheKind {
    fn label(&self) -> &'static str {
        match self {
            AttacheKind::Local(_) => "local",
            AttacheKind::Forwarding(_) => "forwarding",
            AttacheKind::Dummy => "dummy",
        }
    }
}

type Waiter = oneshot::Sender<AgentResult<Frame>>;

#[derive(Default)]
struct AttacheState {
    queue: BTreeMap<u64, Frame>,
    in_flight: Option<u64>,
    waiters: HashMap<u64, Waiter>,
    transfer_mode: bool,
    transfer_buffer: VecDeque<Frame>,
}

/// Session object for one host on this node.
pub struct AgentAttache {
    host_id: HostId,
    local: NodeId,
    kind: AttacheKind,
    maintenance: bool,
    closed: AtomicBool,
    next_seq: AtomicU64,
    state: Mutex<AttacheState>,
}

impl std::fmt::Debug for AgentAttache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentAttache")
            .field("host_id", &self.host_id)
            .field("kind", &self.kind.label())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl AgentAttache {
    fn new(host_id: HostId, local: NodeId, kind: AttacheKind, maintenance: bool) -> Self {
        // Sequence numbers minted on different nodes must not collide in an owner's queue.
        let base = (local.as_u64() & 0xffff) << 48;
        Self {
            host_id,
            local,
            kind,
            maintenance,
            closed: AtomicBool::new(false),
            next_seq: AtomicU64::new(base),
            state: Mutex::new(AttacheState::default()),
        }
    }

    /// Attache holding the live channel to the host.
    pub fn local(host_id: HostId, local: NodeId, channel: Arc<dyn AgentChannel>, maintenance: bool) -> Self {
        Self::new(host_id, local, AttacheKind::Local(channel), maintenance)
    }

    /// Attache proxying to whichever node owns the host.
    pub fn forwarding(host_id: HostId, local: NodeId, peers: Arc<dyn PeerRouting>) -> Self {
        Self::new(host_id, local, AttacheKind::Forwarding(peers), false)
    }

    /// Placeholder attache.
    pub fn dummy(host_id: HostId, local: NodeId) -> Self {
        Self::new(host_id, local, AttacheKind::Dummy, false)
    }

    /// Host this attache represents.
    pub fn host_id(&self) -> HostId {
        self.host_id
    }

    /// Variant.
    pub fn kind(&self) -> &AttacheKind {
        &self.kind
    }

    /// True for forwarding attaches.
    pub fn is_forwarding(&self) -> bool {
        matches!(self.kind, AttacheKind::Forwarding(_))
    }

    /// True for attaches holding the live host connection.
    pub fn is_local(&self) -> bool {
        matches!(self.kind, AttacheKind::Local(_))
    }

    /// Whether the host was in maintenance when the attache was created.
    pub fn in_maintenance(&self) -> bool {
        self.maintenance
    }

    /// Whether the attache has been disconnected.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Next sequence number for a request originated on this node.
    pub fn next_sequence(&self) -> u64 {
        self.next_seq.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Sequential requests waiting or in flight.
    pub fn queue_size(&self) -> usize {
        let state = self.state.lock();
        state.queue.len() + usize::from(state.in_flight.is_some())
    }

    /// Callers waiting for an answer.
    pub fn pending_listener_count(&self) -> usize {
        self.state.lock().waiters.len()
    }

    /// True when nothing is queued, in flight or awaited.
    pub fn is_idle(&self) -> bool {
        let state = self.state.lock();
        state.queue.is_empty() && state.in_flight.is_none() && state.waiters.is_empty()
    }

    /// While on, outgoing frames are parked instead of dispatched.
    pub fn set_transfer_mode(&self, on: bool) {
        self.state.lock().transfer_mode = on;
        debug!(host_id = %self.host_id, transfer_mode = on, "transfer mode changed");
    }

    /// Whether outgoing frames are being parked.
    pub fn in_transfer_mode(&self) -> bool {
        self.state.lock().transfer_mode
    }

    /// Frames parked during transfer mode.
    pub fn buffered_count(&self) -> usize {
        self.state.lock().transfer_buffer.len()
    }

    /// Pops the oldest parked frame.
    pub fn take_buffered_request(&self) -> Option<Frame> {
        self.state.lock().transfer_buffer.pop_front()
    }

    fn unavailable(&self, reason: impl Into<String>) -> AgentError {
        AgentError::unavailable(self.host_id, reason)
    }

    /// Sends a request without waiting for its answer.
    pub async fn send(&self, frame: Frame) -> AgentResult<()> {
        if self.is_closed() {
            return Err(self.unavailable("attache is closed"));
        }
        if matches!(self.kind, AttacheKind::Dummy) {
            return Err(self.unavailable("placeholder resource accepts no requests"));
        }
        if !frame.requires_sequential() {
            return self.dispatch(&frame).await;
        }

        let seq = frame.sequence();
        let head = {
            let mut state = self.state.lock();
            state.queue.insert(seq, frame);
            match state.in_flight {
                Some(_) => None,
                None => {
                    let head = state.queue.pop_first();
                    state.in_flight = head.as_ref().map(|(s, _)| *s);
                    head.map(|(_, f)| f)
                }
            }
        };

        match head {
            None => {
                trace!(host_id = %self.host_id, seq, "queued behind in-flight request");
                Ok(())
            }
            Some(head) => {
                let head_seq = head.sequence();
                match self.dispatch(&head).await {
                    Ok(()) => Ok(()),
                    Err(e) => {
                        self.fail_waiter(head_seq, &e);
                        self.pump(self.advance(head_seq)).await;
                        Err(e)
                    }
                }
            }
        }
    }

    /// Sends a request and waits up to `timeout` for its answer frame.
    pub async fn send_and_wait(&self, frame: Frame, timeout: Duration) -> AgentResult<Frame> {
        let seq = frame.sequence();
        let (tx, rx) = oneshot::channel();
        self.state.lock().waiters.insert(seq, tx);

        if let Err(e) = self.send(frame).await {
            self.state.lock().waiters.remove(&seq);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(self.unavailable("attache dropped the request")),
            Err(_) => {
                warn!(host_id = %self.host_id, seq, "request timed out");
                self.cancel(seq, "timed out").await;
                if self.is_forwarding() {
                    if let Ok(cancel) = Frame::cancel(self.host_id, self.local, seq, "timed out") {
                        if let Err(e) = self.send_control(cancel).await {
                            debug!(host_id = %self.host_id, seq, error = %e, "unable to cancel on owner");
                        }
                    }
                }
                Err(AgentError::OperationTimedOut { host_id: self.host_id, seq })
            }
        }
    }

    /// Builds a request from `commands`, sends it and decodes the answers.
    pub async fn execute(&self, commands: &[Command], sequential: bool, timeout: Duration) -> AgentResult<Vec<Answer>> {
        let seq = self.next_sequence();
        let frame = Frame::request(self.host_id, self.local, seq, commands, sequential)?;
        let response = self.send_and_wait(frame, timeout).await?;
        Ok(response.answers()?)
    }

    /// Passes a frame straight to the owning node without queueing it here.
    pub async fn route_raw(&self, frame: Frame) -> AgentResult<()> {
        if self.is_closed() {
            return Err(self.unavailable("attache is closed"));
        }
        match self.kind {
            AttacheKind::Forwarding(_) => self.dispatch(&frame).await,
            _ => self.send(frame).await,
        }
    }

    /// Sends a control frame, bypassing the ordering queue and transfer mode.
    pub async fn send_control(&self, frame: Frame) -> AgentResult<()> {
        match &self.kind {
            AttacheKind::Local(channel) => Ok(channel.deliver(&frame).await?),
            AttacheKind::Forwarding(peers) => self.forward(peers.as_ref(), &frame).await,
            AttacheKind::Dummy => Ok(()),
        }
    }

    /// Delivers an answer to its waiter and releases the next sequential
    /// request. Returns false when nothing was waiting for `seq`.
    pub async fn process_answer(&self, seq: u64, frame: Frame) -> bool {
        let (waiter, current) = {
            let mut state = self.state.lock();
            (state.waiters.remove(&seq), state.in_flight == Some(seq))
        };
        let matched = waiter.is_some() || current;
        if let Some(waiter) = waiter {
            let _ = waiter.send(Ok(frame));
        }
        if current {
            self.send_next(seq).await;
        }
        matched
    }

    /// Marks `seq` done and dispatches the next queued sequential request.
    pub async fn send_next(&self, seq: u64) {
        self.pump(self.advance(seq)).await;
    }

    /// Aborts `seq`: drops it from the queue and fails its waiter.
    pub async fn cancel(&self, seq: u64, reason: &str) -> bool {
        let (waiter, queued, current) = {
            let mut state = self.state.lock();
            (state.waiters.remove(&seq), state.queue.remove(&seq).is_some(), state.in_flight == Some(seq))
        };
        let found = waiter.is_some() || queued || current;
        if let Some(waiter) = waiter {
            let _ = waiter.send(Err(AgentError::Cancelled { host_id: self.host_id, seq, reason: reason.to_string() }));
        }
        if current {
            self.send_next(seq).await;
        }
        if found {
            debug!(host_id = %self.host_id, seq, reason, "request cancelled");
        }
        found
    }

    /// Closes the attache and fails everything pending. Idempotent.
    pub async fn disconnect(&self, status: HostStatus) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let (waiters, dropped, parked) = {
            let mut state = self.state.lock();
            let dropped = state.queue.len() + usize::from(state.in_flight.is_some());
            state.queue.clear();
            state.in_flight = None;
            let parked = state.transfer_buffer.len();
            state.transfer_buffer.clear();
            (std::mem::take(&mut state.waiters), dropped, parked)
        };
        for (_, waiter) in waiters {
            let _ = waiter.send(Err(self.unavailable(format!("agent disconnected ({:?})", status))));
        }
        if parked > 0 {
            warn!(host_id = %self.host_id, parked, "dropping parked requests on disconnect");
        }
        info!(host_id = %self.host_id, kind = self.kind.label(), ?status, dropped, "attache disconnected");
        if let AttacheKind::Local(channel) = &self.kind {
            channel.close().await;
        }
    }

    fn advance(&self, seq: u64) -> Option<Frame> {
        let mut state = self.state.lock();
        if state.in_flight != Some(seq) {
            return None;
        }
        state.in_flight = None;
        if self.is_closed() {
            return None;
        }
        let (next, frame) = state.queue.pop_first()?;
        state.in_flight = Some(next);
        Some(frame)
    }

    async fn pump(&self, mut next: Option<Frame>) {
        while let Some(frame) = next {
            let seq = frame.sequence();
            match self.dispatch(&frame).await {
                Ok(()) => return,
                Err(e) => {
                    warn!(host_id = %self.host_id, seq, error = %e, "unable to send queued request");
                    self.fail_waiter(seq, &e);
                    next = self.advance(seq);
                }
            }
        }
    }

    fn fail_waiter(&self, seq: u64, error: &AgentError) {
        if let Some(waiter) = self.state.lock().waiters.remove(&seq) {
            let error = match error {
                AgentError::RouteFailed { host_id, peer } => AgentError::RouteFailed { host_id: *host_id, peer: *peer },
                other => self.unavailable(other.to_string()),
            };
            let _ = waiter.send(Err(error));
        }
    }

    async fn dispatch(&self, frame: &Frame) -> AgentResult<()> {
        {
            let mut state = self.state.lock();
            if state.transfer_mode {
                trace!(host_id = %self.host_id, seq = frame.sequence(), "parking request during transfer");
                state.transfer_buffer.push_back(frame.clone());
                return Ok(());
            }
        }
        match &self.kind {
            AttacheKind::Local(channel) => Ok(channel.deliver(frame).await?),
            AttacheKind::Forwarding(peers) => self.forward(peers.as_ref(), frame).await,
            AttacheKind::Dummy => Err(self.unavailable("placeholder resource accepts no requests")),
        }
    }

    async fn forward(&self, peers: &dyn PeerRouting, frame: &Frame) -> AgentResult<()> {
        let owner = peers
            .owner_of(self.host_id)
            .await
            .filter(|owner| *owner != self.local)
            .ok_or_else(|| self.unavailable("no peer owns the host"))?;
        if peers.route(owner, frame).await {
            Ok(())
        } else {
            Err(AgentError::RouteFailed { host_id: self.host_id, peer: owner })
        }
    }
}
