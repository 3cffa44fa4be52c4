//! Outbound wire format.
//!
//! Every frame is a big-endian `u32` length, a kind byte and a payload:
//!
//! ```text
//! +----------------+--------+---------------------+
//! | length (u32be) | kind   | payload             |
//! |                | (u8)   | (length - 1 bytes)  |
//! +----------------+--------+---------------------+
//! ```
//!
//! The length covers the kind byte and the payload. Payloads are protobuf
//! messages; heartbeats carry none. A frame is always written whole to a
//! session, so a reconnect resumes on a frame boundary.

use std::io;

use prost::Message;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::metadata::HostMetadata;
use crate::model::ResyncItem;

/// Largest frame accepted from the backend.
pub const MAX_INBOUND_FRAME: usize = 1024 * 1024;

/// Bytes of framing added to every payload.
pub const FRAME_OVERHEAD: usize = 5;

/// Frame discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    /// Relay → backend: session credentials.
    Authenticate = 1,
    /// Relay → backend: a batch of resync items.
    ResyncBatch = 2,
    /// Relay → backend: keep-alive with no payload.
    Heartbeat = 3,
    /// Backend → relay: handshake verdict.
    AuthAck = 0x81,
}

impl FrameKind {
    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(Self::Authenticate),
            2 => Some(Self::ResyncBatch),
            3 => Some(Self::Heartbeat),
            0x81 => Some(Self::AuthAck),
            _ => None,
        }
    }
}

/// A complete, encoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    kind: FrameKind,
    bytes: Vec<u8>,
}

impl Frame {
    fn encode(kind: FrameKind, payload: &[u8]) -> Self {
        let length = u32::try_from(payload.len() + 1).unwrap_or(u32::MAX);
        let mut bytes = Vec::with_capacity(FRAME_OVERHEAD + payload.len());
        bytes.extend_from_slice(&length.to_be_bytes());
        bytes.push(kind as u8);
        bytes.extend_from_slice(payload);
        Self { kind, bytes }
    }

    /// An empty keep-alive frame.
    pub fn heartbeat() -> Self {
        Self::encode(FrameKind::Heartbeat, &[])
    }

    /// The session opening frame.
    pub fn authenticate(token: &str, agent_id: &str, hostname: &str) -> Self {
        let message = AuthenticateFrame {
            token: token.to_string(),
            agent_id: agent_id.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            hostname: hostname.to_string(),
        };
        Self::encode(FrameKind::Authenticate, &message.encode_to_vec())
    }

    /// The backend's reply to [`Frame::authenticate`].
    pub fn auth_ack(accepted: bool, reason: &str) -> Self {
        let message = AuthAckFrame {
            accepted,
            reason: reason.to_string(),
        };
        Self::encode(FrameKind::AuthAck, &message.encode_to_vec())
    }

    /// A batch of items with the host metadata attached.
    pub fn batch(metadata: &HostMetadata, items: &[ResyncItem]) -> Self {
        let message = ResyncBatchFrame {
            metadata: Some(metadata.to_wire()),
            items: items.iter().map(WireItem::from).collect(),
        };
        Self::encode(FrameKind::ResyncBatch, &message.encode_to_vec())
    }

    /// Frame discriminator.
    pub fn kind(&self) -> FrameKind {
        self.kind
    }

    /// Encoded size including framing.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Always false: a frame has at least its header.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Encoded bytes including framing.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// The payload without framing.
    pub fn payload(&self) -> &[u8] {
        &self.bytes[FRAME_OVERHEAD..]
    }
}

/// Reads one frame, returning `None` on a clean end of stream.
///
/// # Errors
///
/// I/O errors, truncated frames, unknown kinds and frames longer than
/// `max_len` are reported as [`io::Error`]s.
pub async fn read_frame<R>(reader: &mut R, max_len: usize) -> io::Result<Option<Frame>>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut header = [0_u8; 4];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let length = u32::from_be_bytes(header) as usize;
    if length == 0 || length > max_len {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame length {length} out of range"),
        ));
    }

    let mut body = vec![0_u8; length];
    reader.read_exact(&mut body).await?;

    let kind = FrameKind::from_byte(body[0]).ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unknown frame kind {:#04x}", body[0]),
        )
    })?;

    Ok(Some(Frame::encode(kind, &body[1..])))
}

/// Payload of [`FrameKind::Authenticate`].
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AuthenticateFrame {
    /// Bearer token.
    #[prost(string, tag = "1")]
    pub token: String,
    /// Agent id of this relay instance.
    #[prost(string, tag = "2")]
    pub agent_id: String,
    /// Relay version.
    #[prost(string, tag = "3")]
    pub version: String,
    /// Host the relay runs on.
    #[prost(string, tag = "4")]
    pub hostname: String,
}

/// Payload of [`FrameKind::AuthAck`].
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AuthAckFrame {
    /// True when the token was accepted.
    #[prost(bool, tag = "1")]
    pub accepted: bool,
    /// Why the token was rejected.
    #[prost(string, tag = "2")]
    pub reason: String,
}

/// Payload of [`FrameKind::ResyncBatch`].
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ResyncBatchFrame {
    /// Host and cloud metadata of the relay.
    #[prost(message, optional, tag = "1")]
    pub metadata: Option<WireMetadata>,
    /// Items in arrival order.
    #[prost(message, repeated, tag = "2")]
    pub items: Vec<WireItem>,
}

/// Host metadata as sent on the wire.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WireMetadata {
    /// Agent id.
    #[prost(string, tag = "1")]
    pub agent_id: String,
    /// Hostname.
    #[prost(string, tag = "2")]
    pub hostname: String,
    /// Cloud provider.
    #[prost(string, tag = "3")]
    pub cloud_provider: String,
    /// Cloud region.
    #[prost(string, tag = "4")]
    pub region: String,
    /// Availability zone.
    #[prost(string, tag = "5")]
    pub zone: String,
    /// Instance id.
    #[prost(string, tag = "6")]
    pub instance_id: String,
}

/// A resync item as sent on the wire.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WireItem {
    /// Kind name.
    #[prost(string, tag = "1")]
    pub kind: String,
    /// Namespace.
    #[prost(string, tag = "2")]
    pub namespace: String,
    /// Name.
    #[prost(string, tag = "3")]
    pub name: String,
    /// UID.
    #[prost(string, tag = "4")]
    pub uid: String,
    /// Resource version.
    #[prost(string, tag = "5")]
    pub resource_version: String,
    /// Serialized object.
    #[prost(bytes = "vec", tag = "6")]
    pub payload: Vec<u8>,
    /// Receipt time, nanoseconds since the Unix epoch.
    #[prost(uint64, tag = "7")]
    pub received_at_unix_nanos: u64,
}

impl From<&ResyncItem> for WireItem {
    fn from(item: &ResyncItem) -> Self {
        let received_at_unix_nanos = item
            .received_at
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
            .unwrap_or_default();

        Self {
            kind: item.kind.as_str().to_string(),
            namespace: item.namespace.clone(),
            name: item.name.clone(),
            uid: item.uid.clone(),
            resource_version: item.resource_version.clone(),
            payload: item.payload.clone(),
            received_at_unix_nanos,
        }
    }
}
