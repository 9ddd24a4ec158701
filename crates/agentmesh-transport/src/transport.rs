//! Abstract link layer.
//!
//! `Transport` opens and accepts links, `Connection` moves whole frames over
//! one of them. The plain TCP and TLS-over-TCP backends share
//! `FramedConnection`, which owns the framing and the I/O timeout.

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Mutex;

use crate::error::{Result, TransportError};
use crate::protocol::{Frame, FrameHeader, FRAME_HEADER_SIZE};

/// Opens outbound links and binds listeners.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Connect to a remote peer at `addr` (e.g. "10.0.0.2:9090").
    async fn connect(&self, addr: &str) -> Result<Box<dyn Connection>>;

    /// Listen for incoming links on `addr`.
    async fn listen(&self, addr: &str) -> Result<Box<dyn Listener>>;
}

/// An established link.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Write one frame.
    async fn send_frame(&self, frame: &Frame) -> Result<()>;

    /// Read the next frame.
    async fn recv_frame(&self) -> Result<Frame>;

    /// Remote address.
    fn peer_addr(&self) -> &str;

    /// Shut the write side down; later sends fail.
    async fn close(&self);
}

/// An accepted socket whose link setup has not run yet.
///
/// Listeners hand these out straight from `accept` so that a slow or silent
/// client only ever holds up its own link.
#[async_trait]
pub trait Handshake: Send {
    /// Remote address.
    fn peer_addr(&self) -> &str;

    /// Runs the remaining setup (the TLS handshake, if any).
    async fn finish(self: Box<Self>) -> Result<Box<dyn Connection>>;
}

/// A link that needs no further setup.
pub struct Ready(pub Box<dyn Connection>);

#[async_trait]
impl Handshake for Ready {
    fn peer_addr(&self) -> &str {
        self.0.peer_addr()
    }

    async fn finish(self: Box<Self>) -> Result<Box<dyn Connection>> {
        Ok(self.0)
    }
}

/// Accepts inbound links.
#[async_trait]
pub trait Listener: Send + Sync {
    /// Accept a new incoming socket.
    async fn accept(&self) -> Result<Box<dyn Handshake>>;

    /// Address this listener is bound to.
    fn local_addr(&self) -> Result<String>;
}

/// Framing over any byte stream, reads and writes guarded independently.
pub struct FramedConnection<S> {
    read: Mutex<ReadHalf<S>>,
    write: Mutex<WriteHalf<S>>,
    peer_addr: String,
    io_timeout: Duration,
}

impl<S> std::fmt::Debug for FramedConnection<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FramedConnection").field("peer_addr", &self.peer_addr).finish()
    }
}

impl<S> FramedConnection<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    /// Wraps `stream`; every write and every header read is bounded by `io_timeout`.
    pub fn new(stream: S, peer_addr: String, io_timeout: Duration) -> Self {
        let (read, write) = tokio::io::split(stream);
        Self { read: Mutex::new(read), write: Mutex::new(write), peer_addr, io_timeout }
    }

    fn timeout_err(&self) -> TransportError {
        TransportError::IoTimeout { timeout_ms: self.io_timeout.as_millis() as u64 }
    }
}

#[async_trait]
impl<S> Connection for FramedConnection<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    async fn send_frame(&self, frame: &Frame) -> Result<()> {
        let encoded = frame.encode();
        let mut write = self.write.lock().await;
        tokio::time::timeout(self.io_timeout, async {
            write.write_all(&encoded).await?;
            write.flush().await
        })
        .await
        .map_err(|_| self.timeout_err())?
        .map_err(TransportError::IoError)
    }

    async fn recv_frame(&self) -> Result<Frame> {
        let mut read = self.read.lock().await;
        let mut header_buf = [0u8; FRAME_HEADER_SIZE];
        match read.read_exact(&mut header_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(TransportError::ConnectionReset)
            }
            Err(e) => return Err(TransportError::IoError(e)),
        }
        let header = FrameHeader::decode(&header_buf)?;
        let mut payload = vec![0u8; header.payload_length as usize];
        if !payload.is_empty() {
            tokio::time::timeout(self.io_timeout, read.read_exact(&mut payload))
                .await
                .map_err(|_| self.timeout_err())?
                .map_err(TransportError::IoError)?;
        }
        Ok(Frame { header, payload: payload.into() })
    }

    fn peer_addr(&self) -> &str {
        &self.peer_addr
    }

    async fn close(&self) {
        let mut write = self.write.lock().await;
        if let Err(e) = write.shutdown().await {
            tracing::debug!(peer = %self.peer_addr, error = %e, "shutdown on close failed");
        }
    }
}
