//! Inbound link server.
//!
//! Accepts links from hosts and peer nodes and feeds every decoded frame to a
//! [`FrameHandler`], one task per link.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::error::{Result, TransportError};
use crate::protocol::Frame;
use crate::transport::{Connection, Handshake, Listener};
use crate::types::HostId;

/// State attached to one inbound link.
pub struct LinkContext {
    conn: Arc<dyn Connection>,
    attachment: Mutex<Option<HostId>>,
}

impl std::fmt::Debug for LinkContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkContext")
            .field("peer_addr", &self.conn.peer_addr())
            .field("attachment", &*self.attachment.lock())
            .finish()
    }
}

impl LinkContext {
    /// Wraps an accepted link.
    pub fn new(conn: Arc<dyn Connection>) -> Self {
        Self { conn, attachment: Mutex::new(None) }
    }

    /// Remote address of the link.
    pub fn peer_addr(&self) -> &str {
        self.conn.peer_addr()
    }

    /// Host whose agent session is bound to this link, if any.
    pub fn attachment(&self) -> Option<HostId> {
        *self.attachment.lock()
    }

    /// Binds this link to a host's agent session.
    pub fn attach(&self, host: HostId) {
        *self.attachment.lock() = Some(host);
    }

    /// Writes a frame back over the link.
    pub async fn reply(&self, frame: &Frame) -> Result<()> {
        self.conn.send_frame(frame).await
    }

    /// The underlying connection.
    pub fn connection(&self) -> &Arc<dyn Connection> {
        &self.conn
    }
}

/// Receives every frame read from an inbound link.
#[async_trait]
pub trait FrameHandler: Send + Sync + 'static {
    /// Handles one frame. Errors are the handler's to log; the link stays open.
    async fn handle(&self, link: &Arc<LinkContext>, frame: Frame);

    /// Called once when the link is gone.
    async fn link_closed(&self, _link: &Arc<LinkContext>) {}
}

/// Accept loop over a [`Listener`].
pub struct LinkServer {
    listener: Box<dyn Listener>,
    handler: Arc<dyn FrameHandler>,
}

impl LinkServer {
    /// Creates a server dispatching to `handler`.
    pub fn new(listener: Box<dyn Listener>, handler: Arc<dyn FrameHandler>) -> Self {
        Self { listener, handler }
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> Result<String> {
        self.listener.local_addr()
    }

    /// Runs the accept loop until `shutdown` resolves, then aborts open links.
    pub async fn serve_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let addr = self.listener.local_addr()?;
        info!(addr = %addr, "link server listening");
        let mut links = JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(pending) => {
                        debug!(peer = %pending.peer_addr(), "socket accepted");
                        links.spawn(establish(pending, self.handler.clone()));
                    }
                    Err(e) => warn!(error = %e, "accept failed"),
                },
                Some(_) = links.join_next(), if !links.is_empty() => {}
            }
        }

        info!(addr = %addr, open_links = links.len(), "link server stopping");
        links.shutdown().await;
        Ok(())
    }
}

async fn establish(pending: Box<dyn Handshake>, handler: Arc<dyn FrameHandler>) {
    let peer = pending.peer_addr().to_string();
    match pending.finish().await {
        Ok(conn) => serve_link(Arc::new(LinkContext::new(Arc::from(conn))), handler).await,
        Err(e) => warn!(peer = %peer, error = %e, "link setup failed"),
    }
}

async fn serve_link(link: Arc<LinkContext>, handler: Arc<dyn FrameHandler>) {
    loop {
        match link.connection().recv_frame().await {
            Ok(frame) => handler.handle(&link, frame).await,
            Err(TransportError::ConnectionReset) => {
                debug!(peer = %link.peer_addr(), "link closed by remote");
                break;
            }
            Err(e) => {
                // The byte stream cannot be resynchronised after a bad header.
                warn!(peer = %link.peer_addr(), error = %e, "dropping link");
                break;
            }
        }
    }
    handler.link_closed(&link).await;
    link.connection().close().await;
}
