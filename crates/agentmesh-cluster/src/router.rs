//! Request router.
//!
//! Every frame read from a host link, a peer link or a directly connected
//! backend passes through [`RequestRouter::route`]. Frames travelling toward
//! a host (`from_server`) are delivered to the host's attache here or
//! forwarded to the owning node; answers travelling back are forwarded to
//! the node that originated the request, or matched to a waiting request
//! when that node is this one.

use std::sync::Arc;

use agentmesh_transport::{AgentEvent, Command, Frame, FrameHandler, HostId, LinkContext, NodeId};
use async_trait::async_trait;
use tracing::{debug, info, trace, warn};

use crate::attache::{AgentAttache, PeerRouting};
use crate::directory::OwnershipDirectory;
use crate::error::AgentError;
use crate::lifecycle::AgentLifecycle;

/// Where a frame was read from.
#[derive(Clone, Copy)]
pub enum FrameSource<'a> {
    /// An inbound link from a host or a peer node.
    Link(&'a Arc<LinkContext>),
    /// A backend this node loaded directly.
    Direct(HostId),
}

impl FrameSource<'_> {
    /// Host whose session produced the frame, if the source is bound to one.
    pub fn attachment(&self) -> Option<HostId> {
        match self {
            FrameSource::Link(link) => link.attachment(),
            FrameSource::Direct(host) => Some(*host),
        }
    }
}

impl std::fmt::Debug for FrameSource<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameSource::Link(link) => write!(f, "link {}", link.peer_addr()),
            FrameSource::Direct(host) => write!(f, "host {}", host),
        }
    }
}

/// Handling for frames the cluster layer does not own: unrecognized
/// versions and requests that originate from hosts.
#[async_trait]
pub trait GenericDispatch: Send + Sync {
    /// Handles one frame.
    async fn dispatch(&self, source: FrameSource<'_>, frame: Frame);
}

/// [`GenericDispatch`] that logs and drops.
#[derive(Debug, Default)]
pub struct UnhandledDispatch;

#[async_trait]
impl GenericDispatch for UnhandledDispatch {
    async fn dispatch(&self, source: FrameSource<'_>, frame: Frame) {
        debug!(
            source = ?source,
            "Seq {}-{}: no generic handler, dropping frame",
            frame.agent_id(),
            frame.sequence()
        );
    }
}

/// What [`RequestRouter::route`] did with a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Handed to generic dispatch.
    Generic,
    /// A cancel reached the attache.
    CancelDelivered,
    /// A cancel found nothing to cancel.
    CancelDropped,
    /// Given to the host's attache.
    Dispatched,
    /// No usable attache; the origin node was told to stop waiting.
    AgentUnavailable,
    /// Forwarded to the node that sent the request.
    ForwardedToOrigin {
        /// Whether the peer took the frame.
        delivered: bool,
    },
    /// Matched to a pending request.
    AnswerDelivered,
    /// Nobody was waiting for the answer.
    AnswerDropped,
}

/// Classifies and dispatches inbound frames.
pub struct RequestRouter {
    local: NodeId,
    directory: Arc<OwnershipDirectory>,
    lifecycle: Arc<AgentLifecycle>,
    peers: Arc<dyn PeerRouting>,
    generic: Arc<dyn GenericDispatch>,
}

impl RequestRouter {
    /// Creates a router for node `local`.
    pub fn new(
        local: NodeId,
        directory: Arc<OwnershipDirectory>,
        lifecycle: Arc<AgentLifecycle>,
        peers: Arc<dyn PeerRouting>,
        generic: Arc<dyn GenericDispatch>,
    ) -> Self {
        Self { local, directory, lifecycle, peers, generic }
    }

    /// Routes one inbound frame.
    pub async fn route(&self, source: FrameSource<'_>, frame: Frame) -> RouteOutcome {
        if frame.version().is_none() {
            trace!(version = frame.header.version, "unrecognized version, using generic handling");
            self.generic.dispatch(source, frame).await;
            return RouteOutcome::Generic;
        }
        if frame.from_server() {
            self.route_toward_host(frame).await
        } else {
            self.route_from_host(source, frame).await
        }
    }

    async fn route_toward_host(&self, frame: Frame) -> RouteOutcome {
        let host = frame.agent_id();
        let seq = frame.sequence();

        if frame.is_control() {
            return self.deliver_cancel(host, &frame).await;
        }

        let attache = match self.resolve(host).await {
            Some(attache) if !attache.is_closed() => attache,
            _ => {
                let error = AgentError::unavailable(host, "no attache on this node");
                self.signal_unavailable(&frame, &error).await;
                return RouteOutcome::AgentUnavailable;
            }
        };

        // Requests relayed from another node were already ordered by the
        // origin's own attache.
        let relay = attache.is_forwarding() && (frame.origin() != self.local || !frame.requires_sequential());
        let sent = if !relay {
            match frame.commands() {
                Ok(commands) => {
                    trace!("Seq {}-{}: {} command(s) for local dispatch", host, seq, commands.len());
                    attache.send(frame.clone()).await
                }
                Err(e) => {
                    warn!("Seq {}-{}: undecodable request dropped: {}", host, seq, e);
                    return RouteOutcome::AgentUnavailable;
                }
            }
        } else {
            attache.route_raw(frame.clone()).await
        };

        match sent {
            Ok(()) => RouteOutcome::Dispatched,
            Err(e) => {
                self.signal_unavailable(&frame, &e).await;
                RouteOutcome::AgentUnavailable
            }
        }
    }

    async fn deliver_cancel(&self, host: HostId, frame: &Frame) -> RouteOutcome {
        let attache = match self.directory.lookup(host) {
            Some(attache) => attache,
            None => {
                debug!("Seq {}-{}: cancel for unknown agent dropped", host, frame.sequence());
                return RouteOutcome::CancelDropped;
            }
        };
        let commands = match frame.commands() {
            Ok(commands) => commands,
            Err(e) => {
                warn!("Seq {}-{}: undecodable control frame: {}", host, frame.sequence(), e);
                return RouteOutcome::CancelDropped;
            }
        };
        let mut delivered = false;
        for command in commands {
            if let Command::Cancel { sequence, reason } = command {
                delivered |= attache.cancel(sequence, &reason).await;
            }
        }
        if delivered {
            RouteOutcome::CancelDelivered
        } else {
            debug!("Seq {}-{}: nothing to cancel", host, frame.sequence());
            RouteOutcome::CancelDropped
        }
    }

    async fn signal_unavailable(&self, frame: &Frame, error: &AgentError) {
        let host = frame.agent_id();
        let seq = frame.sequence();
        let origin = frame.origin();
        info!("Seq {}-{}: {}; cancelling on node {}", host, seq, error, origin);
        if !origin.is_known() || origin == self.local {
            return;
        }
        match Frame::cancel(host, self.local, seq, &error.to_string()) {
            Ok(cancel) => {
                if !self.peers.route(origin, &cancel).await {
                    warn!("Seq {}-{}: unable to notify node {} of the failure", host, seq, origin);
                }
            }
            Err(e) => warn!("Seq {}-{}: unable to build cancel: {}", host, seq, e),
        }
    }

    async fn route_from_host(&self, source: FrameSource<'_>, frame: Frame) -> RouteOutcome {
        let host = frame.agent_id();
        let seq = frame.sequence();
        let origin = frame.origin();

        if origin.is_known() && origin != self.local {
            let sequential = frame.requires_sequential();
            let delivered = self.peers.route(origin, &frame).await;
            if !delivered {
                warn!("Seq {}-{}: unable to route answer to node {}", host, seq, origin);
            }
            if sequential {
                if let Some(attache) = source.attachment().and_then(|h| self.directory.lookup(h)) {
                    attache.send_next(seq).await;
                }
            }
            return RouteOutcome::ForwardedToOrigin { delivered };
        }

        if frame.is_request() {
            self.generic.dispatch(source, frame).await;
            return RouteOutcome::Generic;
        }

        if let Err(e) = frame.answers() {
            warn!("Seq {}-{}: undecodable answer dropped: {}", host, seq, e);
            return RouteOutcome::AnswerDropped;
        }
        match self.directory.lookup(host) {
            Some(attache) => {
                if attache.process_answer(seq, frame).await {
                    RouteOutcome::AnswerDelivered
                } else {
                    info!("Seq {}-{}: no request waiting for this answer", host, seq);
                    RouteOutcome::AnswerDropped
                }
            }
            None => {
                info!("Seq {}-{}: answer for unknown agent dropped", host, seq);
                RouteOutcome::AnswerDropped
            }
        }
    }

    async fn resolve(&self, host: HostId) -> Option<Arc<AgentAttache>> {
        match self.lifecycle.attache_for(host).await {
            Ok(attache) => Some(attache),
            Err(e) => {
                debug!(host_id = %host, error = %e, "no attache");
                None
            }
        }
    }
}

#[async_trait]
impl FrameHandler for RequestRouter {
    async fn handle(&self, link: &Arc<LinkContext>, frame: Frame) {
        self.route(FrameSource::Link(link), frame).await;
    }

    async fn link_closed(&self, link: &Arc<LinkContext>) {
        let Some(host) = link.attachment() else {
            return;
        };
        if let Some(attache) = self.directory.lookup(host) {
            if attache.is_local() {
                info!(host_id = %host, peer_addr = link.peer_addr(), "host link closed");
                self.lifecycle.handle_disconnect(&attache, AgentEvent::AgentDisconnected, true).await;
            }
        }
    }
}
