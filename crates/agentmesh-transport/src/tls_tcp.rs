//! TLS-wrapped TCP transport for node-to-node links.

use async_trait::async_trait;

use crate::error::{Result, TransportError};
use crate::tcp::TcpTransportConfig;
use crate::tls::{TlsAcceptor, TlsConfig, TlsConnector};
use crate::transport::{Connection, FramedConnection, Handshake, Listener, Transport};

/// TLS-TCP transport; outbound links handshake in client mode.
#[derive(Debug, Clone)]
pub struct TlsTcpTransport {
    tcp: TcpTransportConfig,
    connector: TlsConnector,
    acceptor: TlsAcceptor,
}

impl TlsTcpTransport {
    /// Creates a new TLS-TCP transport with the given configurations.
    pub fn new(tcp: TcpTransportConfig, tls: &TlsConfig) -> Result<Self> {
        Ok(Self { tcp, connector: TlsConnector::new(tls)?, acceptor: TlsAcceptor::new(tls)? })
    }
}

#[async_trait]
impl Transport for TlsTcpTransport {
    async fn connect(&self, addr: &str) -> Result<Box<dyn Connection>> {
        let stream = self.tcp.open_stream(addr).await?;
        let host = addr.rsplit_once(':').map(|(h, _)| h).unwrap_or(addr);
        let handshake = self.connector.connect(host, stream);
        let tls_stream = tokio::time::timeout(self.tcp.io_timeout(), handshake)
            .await
            .map_err(|_| TransportError::TlsError { reason: format!("handshake with {} timed out", addr) })??;
        tracing::info!(addr = addr, "TLS handshake done");
        Ok(Box::new(FramedConnection::new(tls_stream, addr.to_string(), self.tcp.io_timeout())))
    }

    async fn listen(&self, addr: &str) -> Result<Box<dyn Listener>> {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        tracing::debug!(addr = addr, "TLS-TCP listening");
        Ok(Box::new(TlsTcpListener { inner: listener, acceptor: self.acceptor.clone(), tcp: self.tcp.clone() }))
    }
}

/// Accepts TLS links.
#[derive(Debug)]
pub struct TlsTcpListener {
    inner: tokio::net::TcpListener,
    acceptor: TlsAcceptor,
    tcp: TcpTransportConfig,
}

#[async_trait]
impl Listener for TlsTcpListener {
    async fn accept(&self) -> Result<Box<dyn Handshake>> {
        let (stream, remote) = self.inner.accept().await?;
        stream.set_nodelay(self.tcp.nodelay)?;
        Ok(Box::new(TlsHandshake {
            stream,
            remote: remote.to_string(),
            acceptor: self.acceptor.clone(),
            tcp: self.tcp.clone(),
        }))
    }

    fn local_addr(&self) -> Result<String> {
        Ok(self.inner.local_addr()?.to_string())
    }
}

/// Server-side TLS handshake of one accepted socket.
pub struct TlsHandshake {
    stream: tokio::net::TcpStream,
    remote: String,
    acceptor: TlsAcceptor,
    tcp: TcpTransportConfig,
}

#[async_trait]
impl Handshake for TlsHandshake {
    fn peer_addr(&self) -> &str {
        &self.remote
    }

    async fn finish(self: Box<Self>) -> Result<Box<dyn Connection>> {
        let Self { stream, remote, acceptor, tcp } = *self;
        let tls_stream = tokio::time::timeout(tcp.io_timeout(), acceptor.accept(stream))
            .await
            .map_err(|_| TransportError::TlsError { reason: format!("handshake from {} timed out", remote) })??;
        tracing::debug!(peer = %remote, "TLS-TCP accepted");
        Ok(Box::new(FramedConnection::new(tls_stream, remote, tcp.io_timeout())))
    }
}
