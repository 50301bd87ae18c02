//! RVI wire format: node-to-node messages and their framing.
//!
//! Every message is a single JSON object whose `command` field selects the
//! variant. On the TLS stream each object is preceded by a 4-byte big-endian
//! payload length. A receiver that sees a length above `MAX_FRAME_LEN`
//! rejects the session.

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::RviError;

/// Protocol version this node speaks in `authenticate`.
pub const PROTOCOL_VERSION: &str = "1.1";

/// Largest accepted frame payload.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

const LEN_PREFIX: usize = 4;

// ── Messages ──────────────────────────────────────────────────────────────────

/// One node-to-node message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "kebab-case")]
pub enum WireMessage {
    /// Presents the sender's signed credentials.
    Authenticate {
        protocol_version: String,
        credentials: Vec<String>,
    },
    /// Advertises (or withdraws) services the sender offers.
    ServiceAnnounce { services: Vec<ServiceStatus> },
    /// Requests invocation of a service hosted by the receiver.
    Invoke {
        service: String,
        #[serde(default = "empty_parameters")]
        parameters: serde_json::Value,
    },
    /// Error reply to an `invoke`. There is no success reply.
    InvokeError { service: String, reason: String },
    Ping,
    Pong,
}

fn empty_parameters() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

/// One entry of a `service-announce`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub name: String,
    pub status: Availability,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Availability {
    Available,
    Unavailable,
}

impl ServiceStatus {
    pub fn available(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: Availability::Available,
        }
    }

    pub fn unavailable(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: Availability::Unavailable,
        }
    }
}

impl WireMessage {
    pub fn authenticate(credentials: Vec<String>) -> Self {
        WireMessage::Authenticate {
            protocol_version: PROTOCOL_VERSION.to_string(),
            credentials,
        }
    }

    /// Short command name, for logging.
    pub fn command(&self) -> &'static str {
        match self {
            WireMessage::Authenticate { .. } => "authenticate",
            WireMessage::ServiceAnnounce { .. } => "service-announce",
            WireMessage::Invoke { .. } => "invoke",
            WireMessage::InvokeError { .. } => "invoke-error",
            WireMessage::Ping => "ping",
            WireMessage::Pong => "pong",
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, RviError> {
        serde_json::to_vec(self).map_err(|e| RviError::InvalidArgument(e.to_string()))
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, RviError> {
        serde_json::from_slice(data)
            .map_err(|e| RviError::ProtocolViolation(format!("malformed message: {e}")))
    }
}

/// Accepts `1.x` where the major version matches ours.
pub fn version_supported(version: &str) -> bool {
    let ours = PROTOCOL_VERSION.split('.').next();
    version.split('.').next() == ours && !version.is_empty()
}

// ── Framing ───────────────────────────────────────────────────────────────────

/// Append one length-prefixed frame carrying `msg` to `dst`.
pub fn encode_frame(msg: &WireMessage, dst: &mut BytesMut) -> Result<(), RviError> {
    let payload = msg.to_bytes()?;
    if payload.len() > MAX_FRAME_LEN {
        return Err(RviError::InvalidArgument(format!(
            "message of {} bytes exceeds frame limit {MAX_FRAME_LEN}",
            payload.len()
        )));
    }
    dst.reserve(LEN_PREFIX + payload.len());
    dst.put_u32(payload.len() as u32);
    dst.put_slice(&payload);
    Ok(())
}

/// Incremental frame decoder. Holds the partial-read buffer of one connection.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: BytesMut,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(4096),
        }
    }

    /// Buffer for the transport to read into.
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    /// Bytes held that do not yet form a complete frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Pop the next complete message, if one is buffered.
    pub fn decode(&mut self) -> Result<Option<WireMessage>, RviError> {
        if self.buf.len() < LEN_PREFIX {
            return Ok(None);
        }
        let len = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
        if len > MAX_FRAME_LEN {
            return Err(RviError::ProtocolViolation(format!(
                "frame of {len} bytes exceeds limit {MAX_FRAME_LEN}"
            )));
        }
        if self.buf.len() < LEN_PREFIX + len {
            self.buf.reserve(LEN_PREFIX + len - self.buf.len());
            return Ok(None);
        }
        self.buf.advance(LEN_PREFIX);
        let payload = self.buf.split_to(len);
        WireMessage::from_bytes(&payload).map(Some)
    }
}
