//! Plain TCP transport.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::{TcpSocket, TcpStream};

use crate::error::{Result, TransportError};
use crate::transport::{Connection, FramedConnection, Handshake, Listener, Ready, Transport};

/// TCP transport configuration
#[derive(Debug, Clone)]
pub struct TcpTransportConfig {
    /// Connection timeout in milliseconds.
    pub connect_timeout_ms: u64,
    /// Bound on a single frame write or payload read, in milliseconds.
    pub io_timeout_ms: u64,
    /// Whether to enable TCP_NODELAY (disable Nagle's algorithm).
    pub nodelay: bool,
    /// Whether to enable SO_KEEPALIVE on outbound links.
    pub keepalive: bool,
}

impl Default for TcpTransportConfig {
    fn default() -> Self {
        Self { connect_timeout_ms: 5000, io_timeout_ms: 60_000, nodelay: true, keepalive: true }
    }
}

impl TcpTransportConfig {
    pub(crate) fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }

    /// Opens a socket to `addr` honouring keep-alive, nodelay and the connect timeout.
    pub(crate) async fn open_stream(&self, addr: &str) -> Result<TcpStream> {
        let target: SocketAddr = tokio::net::lookup_host(addr)
            .await?
            .next()
            .ok_or_else(|| TransportError::ConnectionRefused { addr: addr.to_string() })?;
        let socket = if target.is_ipv4() { TcpSocket::new_v4()? } else { TcpSocket::new_v6()? };
        socket.set_keepalive(self.keepalive)?;

        let timeout = Duration::from_millis(self.connect_timeout_ms);
        let stream = tokio::time::timeout(timeout, socket.connect(target))
            .await
            .map_err(|_| TransportError::ConnectionTimeout {
                addr: addr.to_string(),
                timeout_ms: self.connect_timeout_ms,
            })?
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::ConnectionRefused => {
                    TransportError::ConnectionRefused { addr: addr.to_string() }
                }
                _ => TransportError::IoError(e),
            })?;
        if self.nodelay {
            stream.set_nodelay(true)?;
        }
        Ok(stream)
    }
}

/// Unencrypted TCP transport; used when no TLS material is configured.
#[derive(Debug, Clone, Default)]
pub struct TcpTransport {
    config: TcpTransportConfig,
}

impl TcpTransport {
    /// Creates a new TCP transport with the given configuration.
    pub fn new(config: TcpTransportConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn connect(&self, addr: &str) -> Result<Box<dyn Connection>> {
        let stream = self.config.open_stream(addr).await?;
        tracing::debug!(addr = addr, "TCP connected");
        Ok(Box::new(FramedConnection::new(stream, addr.to_string(), self.config.io_timeout())))
    }

    async fn listen(&self, addr: &str) -> Result<Box<dyn Listener>> {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        Ok(Box::new(TcpListener { inner: listener, config: self.config.clone() }))
    }
}

/// Accepts plain TCP links.
pub struct TcpListener {
    inner: tokio::net::TcpListener,
    config: TcpTransportConfig,
}

#[async_trait]
impl Listener for TcpListener {
    async fn accept(&self) -> Result<Box<dyn Handshake>> {
        let (stream, remote) = self.inner.accept().await?;
        if self.config.nodelay {
            stream.set_nodelay(true)?;
        }
        let conn = FramedConnection::new(stream, remote.to_string(), self.config.io_timeout());
        Ok(Box::new(Ready(Box::new(conn))))
    }

    fn local_addr(&self) -> Result<String> {
        Ok(self.inner.local_addr()?.to_string())
    }
}
