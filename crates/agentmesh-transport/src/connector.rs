//! Peer link cache.
//!
//! One secured link per peer node, opened lazily and re-dialled after an I/O
//! failure. The cache map is guarded by a single lock that is only held to
//! find or create a peer's slot; the slot itself is an async lock so that two
//! callers dialling the same peer never open duplicate sockets.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::error::{Result, TransportError};
use crate::protocol::Frame;
use crate::transport::{Connection, Transport};
use crate::types::NodeId;

/// Resolves a peer node id to a dialable `host:port`.
#[async_trait]
pub trait PeerResolver: Send + Sync {
    /// `None` when the peer is unknown or has no usable address.
    async fn resolve(&self, peer: NodeId) -> Option<String>;
}

/// Connector configuration.
#[derive(Debug, Clone)]
pub struct ConnectorConfig {
    /// Send attempts per `route` call before giving up.
    pub route_attempts: u32,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self { route_attempts: 5 }
    }
}

type Link = Arc<dyn Connection>;
type PeerSlot = Arc<tokio::sync::Mutex<Option<Link>>>;

/// Opens, caches and retires links to peer nodes.
pub struct PeerConnector {
    transport: Arc<dyn Transport>,
    resolver: Arc<dyn PeerResolver>,
    config: ConnectorConfig,
    peers: Mutex<HashMap<NodeId, PeerSlot>>,
}

impl std::fmt::Debug for PeerConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerConnector")
            .field("config", &self.config)
            .field("peers", &self.peers.lock().len())
            .finish()
    }
}

impl PeerConnector {
    /// Creates a connector dialling through `transport`.
    pub fn new(transport: Arc<dyn Transport>, resolver: Arc<dyn PeerResolver>, config: ConnectorConfig) -> Self {
        Self { transport, resolver, config, peers: Mutex::new(HashMap::new()) }
    }

    fn slot(&self, peer: NodeId) -> PeerSlot {
        self.peers.lock().entry(peer).or_default().clone()
    }

    /// Returns the cached link to `peer`, dialling one if needed.
    ///
    /// `prev` is the link the caller just saw fail: if the cache still holds
    /// that same link it is closed and replaced, otherwise whatever another
    /// caller has installed meanwhile is reused.
    pub async fn connect(&self, peer: NodeId, prev: Option<&Link>) -> Result<Link> {
        let mut guard = loop {
            let slot = self.slot(peer);
            let guard = slot.clone().lock_owned().await;
            // `close` may have retired this slot while we waited on it.
            if self.is_current(peer, &slot) {
                break guard;
            }
        };

        if let Some(current) = guard.as_ref() {
            let stale = prev.map(|p| Arc::ptr_eq(p, current)).unwrap_or(false);
            if !stale {
                return Ok(current.clone());
            }
            debug!(node_id = %peer, "dropping failed peer link");
            current.close().await;
            *guard = None;
        }

        let addr = self.resolver.resolve(peer).await.ok_or(TransportError::PeerUnknown(peer))?;
        let conn: Link = Arc::from(self.transport.connect(&addr).await?);
        info!(node_id = %peer, peer = %addr, "connected to peer");
        *guard = Some(conn.clone());
        Ok(conn)
    }

    /// Ships `frame` to `peer`, re-dialling between failed attempts.
    ///
    /// Returns false when the peer cannot be resolved or every attempt failed.
    pub async fn route(&self, peer: NodeId, frame: &Frame) -> bool {
        let tag = frame.tag();
        let mut prev: Option<Link> = None;

        for attempt in 1..=self.config.route_attempts {
            let conn = match self.connect(peer, prev.as_ref()).await {
                Ok(conn) => conn,
                Err(TransportError::PeerUnknown(_)) => {
                    warn!(node_id = %peer, "{}: unable to resolve peer", tag);
                    return false;
                }
                Err(e) => {
                    debug!(node_id = %peer, attempt, error = %e, "{}: unable to connect to peer", tag);
                    continue;
                }
            };

            match conn.send_frame(frame).await {
                Ok(()) => {
                    debug!(node_id = %peer, "{}: routed to peer", tag);
                    return true;
                }
                Err(e) => {
                    debug!(node_id = %peer, attempt, error = %e, "{}: error on link to peer", tag);
                    prev = Some(conn);
                }
            }
        }

        warn!(node_id = %peer, attempts = self.config.route_attempts, "{}: unable to route to peer", tag);
        if let Some(conn) = prev {
            self.evict_if_current(peer, &conn).await;
        }
        false
    }

    fn is_current(&self, peer: NodeId, slot: &PeerSlot) -> bool {
        self.peers.lock().get(&peer).map(|s| Arc::ptr_eq(s, slot)).unwrap_or(false)
    }

    async fn evict_if_current(&self, peer: NodeId, conn: &Link) {
        let slot = self.slot(peer);
        let mut guard = slot.lock().await;
        if guard.as_ref().map(|c| Arc::ptr_eq(c, conn)).unwrap_or(false) {
            *guard = None;
            conn.close().await;
        }
    }

    /// Closes and evicts the cached link to `peer`.
    ///
    /// The slot leaves the map first; a link installed into it by a dial that
    /// was already under way is closed here once that dial releases the slot.
    pub async fn close(&self, peer: NodeId) {
        let slot = self.peers.lock().remove(&peer);
        if let Some(slot) = slot {
            if let Some(conn) = slot.lock().await.take() {
                debug!(node_id = %peer, "closing peer link");
                conn.close().await;
            }
        }
    }

    /// Closes every cached peer link.
    pub async fn close_all(&self) {
        let slots: Vec<(NodeId, PeerSlot)> = self.peers.lock().drain().collect();
        for (peer, slot) in slots {
            if let Some(conn) = slot.lock().await.take() {
                debug!(node_id = %peer, "closing peer link");
                conn.close().await;
            }
        }
    }

    /// Peers that currently have a slot in the cache.
    pub fn cached_peers(&self) -> Vec<NodeId> {
        let mut peers: Vec<NodeId> = self.peers.lock().keys().copied().collect();
        peers.sort();
        peers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Command;
    use crate::transport::Listener;
    use crate::types::HostId;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StaticResolver(HashMap<NodeId, String>);

    #[async_trait]
    impl PeerResolver for StaticResolver {
        async fn resolve(&self, peer: NodeId) -> Option<String> {
            self.0.get(&peer).cloned()
        }
    }

    struct FailingConnection;

    #[async_trait]
    impl Connection for FailingConnection {
        async fn send_frame(&self, _frame: &Frame) -> Result<()> {
            Err(TransportError::ConnectionReset)
        }
        async fn recv_frame(&self) -> Result<Frame> {
            Err(TransportError::ConnectionReset)
        }
        fn peer_addr(&self) -> &str {
            "nowhere"
        }
        async fn close(&self) {}
    }

    #[derive(Default)]
    struct CountingTransport {
        dials: AtomicUsize,
    }

    #[async_trait]
    impl Transport for CountingTransport {
        async fn connect(&self, _addr: &str) -> Result<Box<dyn Connection>> {
            self.dials.fetch_add(1, Ordering::SeqCst);
            tokio::task::yield_now().await;
            Ok(Box::new(FailingConnection))
        }
        async fn listen(&self, _addr: &str) -> Result<Box<dyn Listener>> {
            Err(TransportError::ConnectionRefused { addr: "unsupported".into() })
        }
    }

    fn frame() -> Frame {
        let cmds = [Command::Opaque { name: "Ping".into(), body: vec![] }];
        Frame::request(HostId::new(1), NodeId::new(1), 1, &cmds, false).unwrap()
    }

    fn connector(transport: Arc<CountingTransport>) -> PeerConnector {
        let resolver = StaticResolver(HashMap::from([(NodeId::new(2), "peer-b:9090".to_string())]));
        PeerConnector::new(transport, Arc::new(resolver), ConnectorConfig::default())
    }

    #[tokio::test]
    async fn test_route_gives_up_after_bound() {
        let transport = Arc::new(CountingTransport::default());
        let connector = connector(transport.clone());
        assert!(!connector.route(NodeId::new(2), &frame()).await);
        assert_eq!(transport.dials.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_route_unknown_peer() {
        let transport = Arc::new(CountingTransport::default());
        let connector = connector(transport.clone());
        assert!(!connector.route(NodeId::new(9), &frame()).await);
        assert_eq!(transport.dials.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_concurrent_connect_shares_link() {
        let transport = Arc::new(CountingTransport::default());
        let connector = Arc::new(connector(transport.clone()));
        let a = tokio::spawn({
            let c = connector.clone();
            async move { c.connect(NodeId::new(2), None).await.unwrap() }
        });
        let b = tokio::spawn({
            let c = connector.clone();
            async move { c.connect(NodeId::new(2), None).await.unwrap() }
        });
        let (a, b) = (a.await.unwrap(), b.await.unwrap());
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(transport.dials.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_connect_replaces_only_failed_link() {
        let transport = Arc::new(CountingTransport::default());
        let connector = connector(transport.clone());
        let first = connector.connect(NodeId::new(2), None).await.unwrap();
        let second = connector.connect(NodeId::new(2), Some(&first)).await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        // A stale `prev` no longer in the cache must not evict the fresh link.
        let third = connector.connect(NodeId::new(2), Some(&first)).await.unwrap();
        assert!(Arc::ptr_eq(&second, &third));
        assert_eq!(transport.dials.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_close_evicts() {
        let transport = Arc::new(CountingTransport::default());
        let connector = connector(transport.clone());
        connector.connect(NodeId::new(2), None).await.unwrap();
        assert_eq!(connector.cached_peers(), vec![NodeId::new(2)]);
        connector.close(NodeId::new(2)).await;
        assert!(connector.cached_peers().is_empty());
        connector.connect(NodeId::new(2), None).await.unwrap();
        connector.close_all().await;
        assert!(connector.cached_peers().is_empty());
        assert_eq!(transport.dials.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_dial_waiting_on_closed_slot_lands_in_cache() {
        let transport = Arc::new(CountingTransport::default());
        let connector = Arc::new(connector(transport.clone()));
        let held = connector.slot(NodeId::new(2));
        let guard = held.lock().await;

        let dial = tokio::spawn({
            let c = connector.clone();
            async move { c.connect(NodeId::new(2), None).await.unwrap() }
        });
        tokio::task::yield_now().await;
        let close = tokio::spawn({
            let c = connector.clone();
            async move { c.close(NodeId::new(2)).await }
        });
        tokio::task::yield_now().await;
        drop(guard);

        let link = dial.await.unwrap();
        close.await.unwrap();
        let cached = connector.slot(NodeId::new(2)).lock().await.clone().unwrap();
        assert!(Arc::ptr_eq(&cached, &link));
        assert_eq!(transport.dials.load(Ordering::SeqCst), 1);
    }
}
