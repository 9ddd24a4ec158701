//! TLS for node-to-node links.
//!
//! Peer links are mutually authenticated with certificates issued by the
//! cluster CA. Outbound links run the handshake in client mode, inbound links
//! in server mode.

use crate::error::{Result, TransportError};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::server::WebPkiClientVerifier;
use std::fmt;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// PEM material for one node.
#[derive(Clone)]
pub struct TlsConfig {
    /// PEM-encoded cluster CA certificate.
    pub ca_cert_pem: Vec<u8>,
    /// PEM-encoded certificate chain for this node.
    pub cert_chain_pem: Vec<u8>,
    /// PEM-encoded PKCS#8 private key for this node.
    pub private_key_pem: Vec<u8>,
    /// Inbound links must present a certificate signed by the CA.
    pub require_client_auth: bool,
}

impl fmt::Debug for TlsConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsConfig")
            .field("require_client_auth", &self.require_client_auth)
            .finish_non_exhaustive()
    }
}

impl TlsConfig {
    /// Creates a new TLS configuration.
    pub fn new(
        ca_cert_pem: Vec<u8>,
        cert_chain_pem: Vec<u8>,
        private_key_pem: Vec<u8>,
        require_client_auth: bool,
    ) -> Self {
        Self { ca_cert_pem, cert_chain_pem, private_key_pem, require_client_auth }
    }

    /// Reads the three PEM files from disk.
    pub fn from_files(ca_cert: &Path, cert_chain: &Path, private_key: &Path) -> Result<Self> {
        Ok(Self::new(
            std::fs::read(ca_cert)?,
            std::fs::read(cert_chain)?,
            std::fs::read(private_key)?,
            true,
        ))
    }

    fn root_store(&self) -> Result<rustls::RootCertStore> {
        let mut roots = rustls::RootCertStore::empty();
        for cert in load_certs_from_pem(&self.ca_cert_pem)? {
            roots.add(cert).map_err(|e| TransportError::TlsError {
                reason: format!("failed to add CA cert: {}", e),
            })?;
        }
        Ok(roots)
    }
}

/// Client-side handshake driver for outbound peer links.
#[derive(Clone)]
pub struct TlsConnector {
    inner: tokio_rustls::TlsConnector,
}

impl fmt::Debug for TlsConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsConnector").finish()
    }
}

impl TlsConnector {
    /// Creates a new TLS connector from configuration.
    pub fn new(config: &TlsConfig) -> Result<Self> {
        let _ = rustls::crypto::ring::default_provider().install_default();
        let certs = load_certs_from_pem(&config.cert_chain_pem)?;
        let key = load_private_key_from_pem(&config.private_key_pem)?;

        let client_config = rustls::ClientConfig::builder()
            .with_root_certificates(config.root_store()?)
            .with_client_auth_cert(certs, key)
            .map_err(|e| TransportError::TlsError {
                reason: format!("failed to create client config: {}", e),
            })?;

        Ok(Self { inner: tokio_rustls::TlsConnector::from(Arc::new(client_config)) })
    }

    /// Runs the client handshake over `stream`.
    pub async fn connect<IO>(&self, domain: &str, stream: IO) -> Result<TlsStream<IO>>
    where
        IO: AsyncRead + AsyncWrite + Unpin,
    {
        let domain = if let Ok(ip) = domain.parse::<std::net::IpAddr>() {
            ServerName::IpAddress(ip.into())
        } else {
            ServerName::try_from(domain.to_string()).map_err(|e| TransportError::TlsError {
                reason: format!("invalid domain: {}", e),
            })?
        };
        let stream = self.inner.connect(domain, stream).await.map_err(|e| TransportError::TlsError {
            reason: format!("client handshake: {}", e),
        })?;
        Ok(TlsStream::Client(stream))
    }
}

/// Server-side handshake driver for inbound links.
#[derive(Clone)]
pub struct TlsAcceptor {
    inner: tokio_rustls::TlsAcceptor,
}

impl fmt::Debug for TlsAcceptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsAcceptor").finish()
    }
}

impl TlsAcceptor {
    /// Creates a new TLS acceptor from configuration.
    pub fn new(config: &TlsConfig) -> Result<Self> {
        let _ = rustls::crypto::ring::default_provider().install_default();
        let certs = load_certs_from_pem(&config.cert_chain_pem)?;
        let key = load_private_key_from_pem(&config.private_key_pem)?;

        let builder = rustls::ServerConfig::builder();
        let builder = if config.require_client_auth {
            let verifier = WebPkiClientVerifier::builder(Arc::new(config.root_store()?))
                .build()
                .map_err(|e| TransportError::TlsError {
                    reason: format!("failed to build client verifier: {}", e),
                })?;
            builder.with_client_cert_verifier(verifier)
        } else {
            builder.with_no_client_auth()
        };
        let server_config = builder.with_single_cert(certs, key).map_err(|e| TransportError::TlsError {
            reason: format!("failed to set server cert: {}", e),
        })?;

        Ok(Self { inner: tokio_rustls::TlsAcceptor::from(Arc::new(server_config)) })
    }

    /// Runs the server handshake over `stream`.
    pub async fn accept<IO>(&self, stream: IO) -> Result<TlsStream<IO>>
    where
        IO: AsyncRead + AsyncWrite + Unpin,
    {
        let stream = self.inner.accept(stream).await.map_err(|e| TransportError::TlsError {
            reason: format!("server handshake: {}", e),
        })?;
        Ok(TlsStream::Server(stream))
    }
}

/// A TLS stream that can be either client or server side.
#[derive(Debug)]
pub enum TlsStream<IO> {
    /// Client-side TLS stream.
    Client(tokio_rustls::client::TlsStream<IO>),
    /// Server-side TLS stream.
    Server(tokio_rustls::server::TlsStream<IO>),
}

impl<IO> AsyncRead for TlsStream<IO>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match &mut *self {
            TlsStream::Client(s) => Pin::new(s).poll_read(cx, buf),
            TlsStream::Server(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl<IO> AsyncWrite for TlsStream<IO>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match &mut *self {
            TlsStream::Client(s) => Pin::new(s).poll_write(cx, buf),
            TlsStream::Server(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match &mut *self {
            TlsStream::Client(s) => Pin::new(s).poll_flush(cx),
            TlsStream::Server(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match &mut *self {
            TlsStream::Client(s) => Pin::new(s).poll_shutdown(cx),
            TlsStream::Server(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// Loads certificates from PEM-encoded data.
pub fn load_certs_from_pem(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>> {
    let mut certs = Vec::new();
    let mut cursor = std::io::Cursor::new(pem);
    while let Ok(Some(rustls_pemfile::Item::X509Certificate(cert))) = rustls_pemfile::read_one(&mut cursor) {
        certs.push(cert);
    }

    if certs.is_empty() {
        return Err(TransportError::TlsError { reason: "no certificates found in PEM".to_string() });
    }

    Ok(certs)
}

/// Loads a PKCS#8 private key from PEM-encoded data.
pub fn load_private_key_from_pem(pem: &[u8]) -> Result<PrivateKeyDer<'static>> {
    let mut cursor = std::io::Cursor::new(pem);
    if let Ok(Some(rustls_pemfile::Item::Pkcs8Key(key))) = rustls_pemfile::read_one(&mut cursor) {
        return Ok(PrivateKeyDer::Pkcs8(key));
    }

    Err(TransportError::TlsError { reason: "no private key found in PEM".to_string() })
}

fn tls_err(what: &str) -> impl Fn(rcgen::Error) -> TransportError + '_ {
    move |e| TransportError::TlsError { reason: format!("{}: {}", what, e) }
}

/// Generates a self-signed cluster CA.
///
/// Returns (CA certificate PEM, CA key PEM).
pub fn generate_self_signed_ca() -> Result<(Vec<u8>, Vec<u8>)> {
    let key_pair = rcgen::KeyPair::generate().map_err(tls_err("failed to generate CA key"))?;

    let mut params = rcgen::CertificateParams::default();
    params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
    let cert = params.self_signed(&key_pair).map_err(tls_err("failed to create CA certificate"))?;

    Ok((cert.pem().into_bytes(), key_pair.serialize_pem().into_bytes()))
}

/// Issues a node certificate for `node_name` signed by the cluster CA.
///
/// Returns (node certificate PEM, node key PEM).
pub fn generate_node_cert(ca_cert_pem: &[u8], ca_key_pem: &[u8], node_name: &str) -> Result<(Vec<u8>, Vec<u8>)> {
    let utf8 = |pem: &[u8], what: &str| {
        std::str::from_utf8(pem)
            .map(str::to_owned)
            .map_err(|e| TransportError::TlsError { reason: format!("invalid {} PEM: {}", what, e) })
    };
    let ca_key = rcgen::KeyPair::from_pem(&utf8(ca_key_pem, "CA key")?).map_err(tls_err("failed to parse CA key"))?;
    let ca_params = rcgen::CertificateParams::from_ca_cert_pem(&utf8(ca_cert_pem, "CA cert")?)
        .map_err(tls_err("failed to parse CA certificate"))?;
    let ca_cert = ca_params.self_signed(&ca_key).map_err(tls_err("failed to rebuild CA certificate"))?;

    let node_key = rcgen::KeyPair::generate().map_err(tls_err("failed to generate node key"))?;
    let node_params = rcgen::CertificateParams::new(vec![node_name.to_string()])
        .map_err(tls_err("failed to create node certificate params"))?;
    let node_cert = node_params
        .signed_by(&node_key, &ca_cert, &ca_key)
        .map_err(tls_err("failed to sign node certificate"))?;

    Ok((node_cert.pem().into_bytes(), node_key.serialize_pem().into_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node_config(name: &str) -> TlsConfig {
        let (ca_cert, ca_key) = generate_self_signed_ca().unwrap();
        let (cert, key) = generate_node_cert(&ca_cert, &ca_key, name).unwrap();
        TlsConfig::new(ca_cert, cert, key, true)
    }

    #[test]
    fn test_generated_material_is_pem() {
        let (ca_cert, ca_key) = generate_self_signed_ca().unwrap();
        assert!(String::from_utf8_lossy(&ca_cert).contains("BEGIN CERTIFICATE"));
        assert!(String::from_utf8_lossy(&ca_key).contains("BEGIN PRIVATE KEY"));
        assert!(!load_certs_from_pem(&ca_cert).unwrap().is_empty());
        assert!(!load_private_key_from_pem(&ca_key).unwrap().secret_der().is_empty());
    }

    #[test]
    fn test_connector_and_acceptor_build() {
        let config = node_config("node-1");
        TlsConnector::new(&config).unwrap();
        TlsAcceptor::new(&config).unwrap();
    }

    #[test]
    fn test_empty_pem_rejected() {
        assert!(load_certs_from_pem(b"").is_err());
        assert!(load_private_key_from_pem(b"not a key").is_err());
    }

    #[test]
    fn test_debug_hides_key_material() {
        let config = node_config("node-2");
        let rendered = format!("{:?}", config);
        assert!(!rendered.contains("PRIVATE KEY"));
    }
}
