#![warn(missing_docs)]

//! agentmesh transport subsystem: node/host identifiers, the inter-node frame
//! codec, TLS peer links and the cached peer connector.

pub mod connector;
pub mod error;
pub mod message;
pub mod protocol;
pub mod server;
pub mod tcp;
pub mod tls;
pub mod tls_tcp;
pub mod transport;
pub mod types;

pub use connector::{ConnectorConfig, PeerConnector, PeerResolver};
pub use error::{Result, TransportError};
pub use message::{AgentEvent, Answer, Command};
pub use protocol::{Frame, FrameFlags, FrameHeader, Version, FRAME_HEADER_SIZE, MAX_PAYLOAD_SIZE};
pub use server::{FrameHandler, LinkContext, LinkServer};
pub use tcp::{TcpTransport, TcpTransportConfig};
pub use tls::TlsConfig;
pub use tls_tcp::TlsTcpTransport;
pub use transport::{Connection, Handshake, Listener, Ready, Transport};
pub use types::{HostId, NodeId};
