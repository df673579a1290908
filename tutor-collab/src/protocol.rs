//! Binary frame protocol for document and presence synchronization.
//!
//! Wire format, one frame per WebSocket binary message:
//! ```text
//! ┌──────────┬─────────────────┬──────────────────────────┐
//! │ msg_type │ payload length  │ payload                  │
//! │ 1 byte   │ LEB128 varint   │ bincode (serde standard) │
//! └──────────┴─────────────────┴──────────────────────────┘
//! ```
//!
//! `decode_prefix` parses frames off a raw byte stream; `decode` expects
//! exactly one frame. Decoding never panics: bad input is a [`ProtocolError`]
//! and the caller drops the frame.
//!
//! Reference: Protocol Buffers encoding guide (Base 128 Varints)

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use thiserror::Error;

use crate::crdt::{Document, StateVector, Update};
use crate::presence::AwarenessMessage;

/// Largest payload accepted by the decoder.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Longest LEB128 encoding of a `u64`.
const MAX_VARINT_LEN: usize = 10;

/// Frame type tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// Sender's state vector; the peer answers with what it lacks.
    SyncRequest = 1,
    /// Diff answering a `SyncRequest`.
    SyncReply = 2,
    /// Incremental update.
    Update = 3,
    /// Presence message.
    Awareness = 4,
    /// Ask for every known presence state. Empty payload.
    AwarenessQuery = 5,
    /// Relay's state vector after applying a member's update.
    SyncAck = 6,
    /// The relay discarded its replica. Empty payload.
    SessionReset = 7,
}

impl TryFrom<u8> for MessageType {
    type Error = ProtocolError;

    fn try_from(tag: u8) -> Result<Self, Self::Error> {
        Ok(match tag {
            1 => Self::SyncRequest,
            2 => Self::SyncReply,
            3 => Self::Update,
            4 => Self::Awareness,
            5 => Self::AwarenessQuery,
            6 => Self::SyncAck,
            7 => Self::SessionReset,
            other => return Err(ProtocolError::UnknownMessageType(other)),
        })
    }
}

/// A decoded protocol frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    SyncRequest(StateVector),
    SyncReply(Update),
    Update(Update),
    Awareness(AwarenessMessage),
    AwarenessQuery,
    SyncAck(StateVector),
    SessionReset,
}

impl Frame {
    pub fn message_type(&self) -> MessageType {
        match self {
            Frame::SyncRequest(_) => MessageType::SyncRequest,
            Frame::SyncReply(_) => MessageType::SyncReply,
            Frame::Update(_) => MessageType::Update,
            Frame::Awareness(_) => MessageType::Awareness,
            Frame::AwarenessQuery => MessageType::AwarenessQuery,
            Frame::SyncAck(_) => MessageType::SyncAck,
            Frame::SessionReset => MessageType::SessionReset,
        }
    }

    /// Serialize to wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let payload = match self {
            Frame::SyncRequest(sv) | Frame::SyncAck(sv) => encode_state_vector(sv)?,
            Frame::SyncReply(update) | Frame::Update(update) => encode_update(update)?,
            Frame::Awareness(msg) => encode_payload(msg)?,
            Frame::AwarenessQuery | Frame::SessionReset => Vec::new(),
        };
        if payload.len() > MAX_FRAME_LEN {
            return Err(ProtocolError::FrameTooLarge(payload.len() as u64));
        }

        let mut out = Vec::with_capacity(1 + MAX_VARINT_LEN + payload.len());
        out.push(self.message_type() as u8);
        encode_varint(payload.len() as u64, &mut out);
        out.extend_from_slice(&payload);
        Ok(out)
    }

    /// Decode exactly one frame.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        match Self::decode_prefix(bytes)? {
            None => Err(ProtocolError::Truncated),
            Some((frame, used)) if used == bytes.len() => Ok(frame),
            Some(_) => Err(ProtocolError::TrailingBytes),
        }
    }

    /// Decode the frame at the start of `bytes`.
    ///
    /// Returns `Ok(None)` if more input is needed, otherwise the frame and
    /// the number of bytes it occupied.
    pub fn decode_prefix(bytes: &[u8]) -> Result<Option<(Self, usize)>, ProtocolError> {
        let Some(&tag) = bytes.first() else {
            return Ok(None);
        };
        let msg_type = MessageType::try_from(tag)?;

        let (len, len_bytes) = match decode_varint(&bytes[1..]) {
            Ok(v) => v,
            Err(ProtocolError::Truncated) => return Ok(None),
            Err(e) => return Err(e),
        };
        if len > MAX_FRAME_LEN as u64 {
            return Err(ProtocolError::FrameTooLarge(len));
        }

        let start = 1 + len_bytes;
        let end = start + len as usize;
        if bytes.len() < end {
            return Ok(None);
        }
        let payload = &bytes[start..end];

        let frame = match msg_type {
            MessageType::SyncRequest => Frame::SyncRequest(decode_state_vector(payload)?),
            MessageType::SyncReply => Frame::SyncReply(decode_update(payload)?),
            MessageType::Update => Frame::Update(decode_update(payload)?),
            MessageType::Awareness => Frame::Awareness(decode_payload(payload)?),
            MessageType::SyncAck => Frame::SyncAck(decode_state_vector(payload)?),
            MessageType::AwarenessQuery | MessageType::SessionReset => {
                if !payload.is_empty() {
                    return Err(ProtocolError::UnexpectedPayload(msg_type));
                }
                if msg_type == MessageType::AwarenessQuery {
                    Frame::AwarenessQuery
                } else {
                    Frame::SessionReset
                }
            }
        };
        Ok(Some((frame, end)))
    }
}

// ─── Payload codecs ───────────────────────────────────────────────────

pub fn encode_update(update: &Update) -> Result<Vec<u8>, ProtocolError> {
    encode_payload(update)
}

pub fn decode_update(bytes: &[u8]) -> Result<Update, ProtocolError> {
    decode_payload(bytes)
}

/// Full-state encoding of a replica: its diff against the empty vector.
pub fn encode_snapshot(doc: &Document) -> Result<Vec<u8>, ProtocolError> {
    encode_update(&doc.snapshot())
}

/// Rebuild a replica from [`encode_snapshot`] bytes. The result has a fresh origin.
pub fn decode_snapshot(bytes: &[u8]) -> Result<Document, ProtocolError> {
    Ok(Document::from_snapshot(&decode_update(bytes)?))
}

pub fn encode_state_vector(sv: &StateVector) -> Result<Vec<u8>, ProtocolError> {
    encode_payload(sv)
}

pub fn decode_state_vector(bytes: &[u8]) -> Result<StateVector, ProtocolError> {
    decode_payload(bytes)
}

fn encode_payload<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| ProtocolError::Serialization(e.to_string()))
}

fn decode_payload<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let (value, used) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
    if used != bytes.len() {
        return Err(ProtocolError::TrailingBytes);
    }
    Ok(value)
}

// ─── Varints ──────────────────────────────────────────────────────────

/// Append `value` as unsigned LEB128.
pub fn encode_varint(mut value: u64, out: &mut Vec<u8>) {
    loop {
        let byte = (value & 0x7F) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

/// Read an unsigned LEB128 value, returning it and the bytes consumed.
pub fn decode_varint(bytes: &[u8]) -> Result<(u64, usize), ProtocolError> {
    let mut value: u64 = 0;
    for (i, &byte) in bytes.iter().enumerate().take(MAX_VARINT_LEN) {
        let bits = u64::from(byte & 0x7F);
        // the 10th byte may only carry the top bit of a u64
        if i == MAX_VARINT_LEN - 1 && bits > 1 {
            return Err(ProtocolError::VarintOverflow);
        }
        value |= bits << (7 * i);
        if byte & 0x80 == 0 {
            return Ok((value, i + 1));
        }
    }
    if bytes.len() >= MAX_VARINT_LEN {
        Err(ProtocolError::VarintOverflow)
    } else {
        Err(ProtocolError::Truncated)
    }
}

// ─── Room addressing ──────────────────────────────────────────────────

/// Kind of shared document a room holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DocumentKind {
    Code,
    Note,
}

impl fmt::Display for DocumentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DocumentKind::Code => "code",
            DocumentKind::Note => "note",
        })
    }
}

/// Room address: `{kind}-session-{session_id}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RoomKey {
    pub kind: DocumentKind,
    pub session_id: String,
}

impl RoomKey {
    pub fn new(kind: DocumentKind, session_id: impl Into<String>) -> Self {
        Self { kind, session_id: session_id.into() }
    }

    pub fn code(session_id: impl Into<String>) -> Self {
        Self::new(DocumentKind::Code, session_id)
    }

    pub fn note(session_id: impl Into<String>) -> Self {
        Self::new(DocumentKind::Note, session_id)
    }

    /// Parse the string form, e.g. `note-session-42`.
    pub fn parse(s: &str) -> Result<Self, ProtocolError> {
        let invalid = || ProtocolError::InvalidRoomKey(s.to_string());
        let (kind, session_id) = s.split_once("-session-").ok_or_else(invalid)?;
        let kind = match kind {
            "code" => DocumentKind::Code,
            "note" => DocumentKind::Note,
            _ => return Err(invalid()),
        };
        let valid_id = !session_id.is_empty()
            && session_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid_id {
            return Err(invalid());
        }
        Ok(Self::new(kind, session_id))
    }

    /// Parse the last segment of a request path such as `/collab/code-session-7`.
    pub fn from_path(path: &str) -> Result<Self, ProtocolError> {
        let path = path.split(['?', '#']).next().unwrap_or_default();
        let segment = path
            .rsplit('/')
            .find(|s| !s.is_empty())
            .ok_or_else(|| ProtocolError::InvalidRoomKey(path.to_string()))?;
        Self::parse(segment)
    }
}

impl fmt::Display for RoomKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-session-{}", self.kind, self.session_id)
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("unknown message type {0}")]
    UnknownMessageType(u8),
    #[error("truncated frame")]
    Truncated,
    #[error("varint exceeds 64 bits")]
    VarintOverflow,
    #[error("frame payload of {0} bytes exceeds limit")]
    FrameTooLarge(u64),
    #[error("trailing bytes after payload")]
    TrailingBytes,
    #[error("{0:?} frame must have an empty payload")]
    UnexpectedPayload(MessageType),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("invalid room key {0:?}")]
    InvalidRoomKey(String),
}
