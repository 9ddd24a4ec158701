//! Wire frame layout for inter-node and node-to-host traffic.
//!
//! Every frame carries a fixed 30-byte big-endian header followed by an
//! opaque payload:
//!
//! ```text
//! version:1 | flags:1 | agent_id:8 | origin_node:8 | sequence:8 | payload_len:4 | payload
//! ```
//!
//! The header can be inspected without touching the payload, which lets the
//! router forward frames it never decodes.

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Result, TransportError};
use crate::message::{deserialize_message, serialize_message, Answer, Command};
use crate::types::{HostId, NodeId};

/// Frame header size in bytes.
pub const FRAME_HEADER_SIZE: usize = 30;

/// Largest payload accepted from the wire.
pub const MAX_PAYLOAD_SIZE: u32 = 16 * 1024 * 1024;

/// Protocol versions understood by the clustered router.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Version {
    /// Original clustered framing.
    V1 = 1,
    /// Framing with sequential-execution flag.
    V3 = 3,
}

impl Version {
    /// Maps a raw version tag, `None` for tags the cluster layer does not handle.
    pub fn from_u8(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(Version::V1),
            3 => Some(Version::V3),
            _ => None,
        }
    }
}

/// Frame flag bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameFlags(u8);

impl FrameFlags {
    /// Frame is a request; clear means response.
    pub const REQUEST: FrameFlags = FrameFlags(0x01);
    /// Control frame (cancel), bypasses ordering.
    pub const CONTROL: FrameFlags = FrameFlags(0x02);
    /// Must be delivered in sequence order per agent.
    pub const SEQUENTIAL: FrameFlags = FrameFlags(0x04);
    /// Produced by a cluster node and travelling toward a host.
    pub const FROM_SERVER: FrameFlags = FrameFlags(0x08);

    /// No flags set.
    pub fn empty() -> Self {
        FrameFlags(0)
    }

    /// Raw bits.
    pub fn bits(&self) -> u8 {
        self.0
    }

    /// Build from raw bits, unknown bits are kept.
    pub fn from_bits(bits: u8) -> Self {
        FrameFlags(bits)
    }

    /// True if every bit of `other` is set.
    pub fn contains(&self, other: FrameFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// Sets or clears the bits of `other`.
    pub fn set(&mut self, other: FrameFlags, on: bool) {
        if on {
            self.0 |= other.0;
        } else {
            self.0 &= !other.0;
        }
    }
}

impl std::ops::BitOr for FrameFlags {
    type Output = FrameFlags;

    fn bitor(self, rhs: Self) -> Self::Output {
        FrameFlags(self.0 | rhs.0)
    }
}

/// Frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Raw version tag.
    pub version: u8,
    /// Control flags.
    pub flags: FrameFlags,
    /// Host the frame is about.
    pub agent_id: HostId,
    /// Node that originated the request.
    pub origin: NodeId,
    /// Per-agent sequence number.
    pub sequence: u64,
    /// Payload length in bytes.
    pub payload_length: u32,
}

impl FrameHeader {
    /// Encodes the header into `buf`.
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.version);
        buf.put_u8(self.flags.bits());
        buf.put_u64(self.agent_id.as_u64());
        buf.put_u64(self.origin.as_u64());
        buf.put_u64(self.sequence);
        buf.put_u32(self.payload_length);
    }

    /// Decodes a header from exactly `FRAME_HEADER_SIZE` bytes.
    pub fn decode(mut data: &[u8]) -> Result<Self> {
        if data.len() < FRAME_HEADER_SIZE {
            return Err(TransportError::InvalidFrame {
                reason: format!("header truncated at {} bytes", data.len()),
            });
        }
        let version = data.get_u8();
        let flags = FrameFlags::from_bits(data.get_u8());
        let agent_id = HostId::new(data.get_u64());
        let origin = NodeId::new(data.get_u64());
        let sequence = data.get_u64();
        let payload_length = data.get_u32();
        if payload_length > MAX_PAYLOAD_SIZE {
            return Err(TransportError::PayloadTooLarge {
                size: payload_length,
                max_size: MAX_PAYLOAD_SIZE,
            });
        }
        Ok(Self { version, flags, agent_id, origin, sequence, payload_length })
    }
}

/// A single frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Frame header.
    pub header: FrameHeader,
    /// Payload data.
    pub payload: Bytes,
}

impl Frame {
    /// Builds a request frame from a node toward a host.
    pub fn request(
        agent_id: HostId,
        origin: NodeId,
        sequence: u64,
        commands: &[Command],
        sequential: bool,
    ) -> Result<Self> {
        let mut flags = FrameFlags::REQUEST | FrameFlags::FROM_SERVER;
        flags.set(FrameFlags::SEQUENTIAL, sequential);
        Self::with_payload(Version::V3 as u8, flags, agent_id, origin, sequence, serialize_message(&commands)?)
    }

    /// Builds a control frame carrying a single cancel command.
    pub fn cancel(agent_id: HostId, origin: NodeId, sequence: u64, reason: &str) -> Result<Self> {
        let commands = vec![Command::Cancel { sequence, reason: reason.to_string() }];
        let flags = FrameFlags::REQUEST | FrameFlags::FROM_SERVER | FrameFlags::CONTROL;
        Self::with_payload(Version::V3 as u8, flags, agent_id, origin, sequence, serialize_message(&commands)?)
    }

    /// Builds the response to `request`, echoing agent id, origin and sequence.
    pub fn response(request: &FrameHeader, answers: &[Answer]) -> Result<Self> {
        let mut flags = request.flags;
        flags.set(FrameFlags::REQUEST, false);
        flags.set(FrameFlags::FROM_SERVER, false);
        flags.set(FrameFlags::CONTROL, false);
        Self::with_payload(
            request.version,
            flags,
            request.agent_id,
            request.origin,
            request.sequence,
            serialize_message(&answers)?,
        )
    }

    /// Builds a frame around an already encoded payload.
    pub fn with_payload(
        version: u8,
        flags: FrameFlags,
        agent_id: HostId,
        origin: NodeId,
        sequence: u64,
        payload: Vec<u8>,
    ) -> Result<Self> {
        let payload_length = u32::try_from(payload.len())
            .ok()
            .filter(|len| *len <= MAX_PAYLOAD_SIZE)
            .ok_or(TransportError::PayloadTooLarge {
                size: u32::try_from(payload.len()).unwrap_or(u32::MAX),
                max_size: MAX_PAYLOAD_SIZE,
            })?;
        Ok(Self {
            header: FrameHeader {
                version,
                flags,
                agent_id,
                origin,
                sequence,
                payload_length,
            },
            payload: Bytes::from(payload),
        })
    }

    /// Encodes header and payload into one buffer.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + self.payload.len());
        self.header.encode(&mut buf);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Decodes a complete frame from `data`.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let header = FrameHeader::decode(data)?;
        let end = FRAME_HEADER_SIZE + header.payload_length as usize;
        if data.len() < end {
            return Err(TransportError::InvalidFrame {
                reason: format!("payload truncated: need {} bytes, have {}", end, data.len()),
            });
        }
        Ok(Self { header, payload: Bytes::copy_from_slice(&data[FRAME_HEADER_SIZE..end]) })
    }

    /// Version if it is one the cluster layer understands.
    pub fn version(&self) -> Option<Version> {
        Version::from_u8(self.header.version)
    }

    /// Host the frame is about.
    pub fn agent_id(&self) -> HostId {
        self.header.agent_id
    }

    /// Node that originated the request.
    pub fn origin(&self) -> NodeId {
        self.header.origin
    }

    /// Per-agent sequence number.
    pub fn sequence(&self) -> u64 {
        self.header.sequence
    }

    /// Request (true) or response (false).
    pub fn is_request(&self) -> bool {
        self.header.flags.contains(FrameFlags::REQUEST)
    }

    /// Control frames bypass the ordered queue.
    pub fn is_control(&self) -> bool {
        self.header.flags.contains(FrameFlags::CONTROL)
    }

    /// Must be delivered in sequence order.
    pub fn requires_sequential(&self) -> bool {
        self.header.flags.contains(FrameFlags::SEQUENTIAL)
    }

    /// Produced by a cluster node and heading toward a host.
    pub fn from_server(&self) -> bool {
        self.header.flags.contains(FrameFlags::FROM_SERVER)
    }

    /// Decodes the payload as request commands.
    pub fn commands(&self) -> Result<Vec<Command>> {
        deserialize_message(&self.payload)
    }

    /// Decodes the payload as response answers.
    pub fn answers(&self) -> Result<Vec<Answer>> {
        deserialize_message(&self.payload)
    }

    /// Log prefix identifying this frame across nodes.
    pub fn tag(&self) -> FrameTag {
        FrameTag(self.header)
    }
}

/// Display helper rendering `Seq <agent>-<seq>: MgmtId <origin>: Req|Resp`.
pub struct FrameTag(FrameHeader);

impl fmt::Display for FrameTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = if self.0.flags.contains(FrameFlags::REQUEST) { "Req" } else { "Resp" };
        write!(f, "Seq {}-{}: MgmtId {}: {}", self.0.agent_id, self.0.sequence, self.0.origin, kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opaque(name: &str) -> Vec<Command> {
        vec![Command::Opaque { name: name.into(), body: vec![1, 2, 3] }]
    }

    #[test]
    fn test_header_layout_is_bit_exact() {
        let frame = Frame::request(HostId::new(42), NodeId::new(7), 9, &opaque("Ping"), true).unwrap();
        let bytes = frame.encode();
        assert_eq!(bytes[0], 3);
        assert_eq!(bytes[1], 0x01 | 0x04 | 0x08);
        assert_eq!(&bytes[2..10], &42u64.to_be_bytes());
        assert_eq!(&bytes[10..18], &7u64.to_be_bytes());
        assert_eq!(&bytes[18..26], &9u64.to_be_bytes());
        assert_eq!(&bytes[26..30], &(frame.payload.len() as u32).to_be_bytes());
        assert_eq!(bytes.len(), FRAME_HEADER_SIZE + frame.payload.len());
    }

    #[test]
    fn test_decode_preserves_header_and_payload() {
        let frame = Frame::request(HostId::new(1), NodeId::new(2), 3, &opaque("Start"), false).unwrap();
        let decoded = Frame::decode(&frame.encode()).unwrap();
        assert_eq!(decoded, frame);
        assert!(decoded.is_request());
        assert!(decoded.from_server());
        assert!(!decoded.requires_sequential());
        assert_eq!(decoded.commands().unwrap(), opaque("Start"));
    }

    #[test]
    fn test_response_echoes_agent_and_sequence() {
        let request = Frame::request(HostId::new(42), NodeId::new(1), 17, &opaque("Ping"), true).unwrap();
        let response = Frame::response(&request.header, &[Answer::success("pong")]).unwrap();
        assert_eq!(response.agent_id(), HostId::new(42));
        assert_eq!(response.sequence(), 17);
        assert_eq!(response.origin(), NodeId::new(1));
        assert!(!response.is_request());
        assert!(!response.from_server());
        assert!(response.requires_sequential());
        assert_eq!(response.answers().unwrap()[0].details, "pong");
    }

    #[test]
    fn test_cancel_frame_is_control() {
        let frame = Frame::cancel(HostId::new(5), NodeId::new(1), 11, "agent gone").unwrap();
        assert!(frame.is_control());
        assert!(frame.is_request());
        match &frame.commands().unwrap()[0] {
            Command::Cancel { sequence, reason } => {
                assert_eq!(*sequence, 11);
                assert_eq!(reason, "agent gone");
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_cancel_payload_survives_the_wire() {
        let frame = Frame::cancel(HostId::new(9), NodeId::new(4), 3, "timed out").unwrap();
        let decoded = Frame::decode(&frame.encode()).unwrap();
        assert_eq!(
            decoded.commands().unwrap(),
            vec![Command::Cancel { sequence: 3, reason: "timed out".into() }]
        );
    }

    #[test]
    fn test_unknown_version_is_reported_as_none() {
        let mut frame = Frame::request(HostId::new(1), NodeId::new(1), 1, &[], false).unwrap();
        frame.header.version = 2;
        let decoded = Frame::decode(&frame.encode()).unwrap();
        assert_eq!(decoded.version(), None);
        assert_eq!(Version::from_u8(1), Some(Version::V1));
    }

    #[test]
    fn test_truncated_input_rejected() {
        let frame = Frame::request(HostId::new(1), NodeId::new(1), 1, &opaque("x"), false).unwrap();
        let bytes = frame.encode();
        assert!(Frame::decode(&bytes[..10]).is_err());
        assert!(Frame::decode(&bytes[..bytes.len() - 1]).is_err());
    }

    #[test]
    fn test_oversized_length_rejected() {
        let mut buf = BytesMut::new();
        FrameHeader {
            version: 3,
            flags: FrameFlags::empty(),
            agent_id: HostId::new(1),
            origin: NodeId::UNKNOWN,
            sequence: 0,
            payload_length: MAX_PAYLOAD_SIZE + 1,
        }
        .encode(&mut buf);
        assert!(matches!(
            FrameHeader::decode(&buf),
            Err(TransportError::PayloadTooLarge { .. })
        ));
    }

    #[test]
    fn test_tag_formatting() {
        let frame = Frame::request(HostId::new(42), NodeId::UNKNOWN, 3, &[], false).unwrap();
        assert_eq!(frame.tag().to_string(), "Seq 42-3: MgmtId -1: Req");
    }
}
