//! Binary wire protocol for room synchronization.
//!
//! Wire format:
//! ```text
//! ┌──────────┬──────────────────────────┐
//! │ msg_type │ payload                  │
//! │ 1 byte   │ variable (opaque bytes)  │
//! └──────────┴──────────────────────────┘
//! ```
//!
//! The payload is binary-transparent: `SyncState` and `Update` carry a
//! full document snapshot, `AwarenessUpdate` carries the UTF-8 JSON of one
//! user's presence record, and the two request kinds carry nothing.

use thiserror::Error;

/// Message type tag, the first byte of every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// "Send me your full state"
    SyncRequest = 0,
    /// Full-state reply to a `SyncRequest`
    SyncState = 1,
    /// Full-state push after a local change
    Update = 2,
    /// Ask peers to re-announce their presence
    AwarenessRequest = 3,
    /// One user's presence record
    AwarenessUpdate = 4,
}

impl MessageType {
    /// Map a raw tag byte to a message type.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Self::SyncRequest),
            1 => Some(Self::SyncState),
            2 => Some(Self::Update),
            3 => Some(Self::AwarenessRequest),
            4 => Some(Self::AwarenessUpdate),
            _ => None,
        }
    }

    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

/// A decoded protocol frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    SyncRequest,
    SyncState(Vec<u8>),
    Update(Vec<u8>),
    AwarenessRequest,
    AwarenessUpdate(Vec<u8>),
}

impl Frame {
    /// The wire tag for this frame.
    pub fn message_type(&self) -> MessageType {
        match self {
            Frame::SyncRequest => MessageType::SyncRequest,
            Frame::SyncState(_) => MessageType::SyncState,
            Frame::Update(_) => MessageType::Update,
            Frame::AwarenessRequest => MessageType::AwarenessRequest,
            Frame::AwarenessUpdate(_) => MessageType::AwarenessUpdate,
        }
    }

    /// Payload bytes (empty for the request kinds).
    pub fn payload(&self) -> &[u8] {
        match self {
            Frame::SyncRequest | Frame::AwarenessRequest => &[],
            Frame::SyncState(p) | Frame::Update(p) | Frame::AwarenessUpdate(p) => p,
        }
    }

    /// Serialize to binary wire format.
    #[inline]
    pub fn encode(&self) -> Vec<u8> {
        let payload = self.payload();
        let mut out = Vec::with_capacity(1 + payload.len());
        out.push(self.message_type().as_byte());
        out.extend_from_slice(payload);
        out
    }

    /// Deserialize from binary wire format.
    ///
    /// Trailing bytes on `SyncRequest`/`AwarenessRequest` are ignored.
    #[inline]
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (&tag, payload) = bytes.split_first().ok_or(ProtocolError::EmptyFrame)?;
        let msg_type = MessageType::from_byte(tag).ok_or(ProtocolError::UnknownMessageType(tag))?;
        Ok(match msg_type {
            MessageType::SyncRequest => Frame::SyncRequest,
            MessageType::SyncState => Frame::SyncState(payload.to_vec()),
            MessageType::Update => Frame::Update(payload.to_vec()),
            MessageType::AwarenessRequest => Frame::AwarenessRequest,
            MessageType::AwarenessUpdate => Frame::AwarenessUpdate(payload.to_vec()),
        })
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("empty frame")]
    EmptyFrame,
    #[error("unknown message type: {0}")]
    UnknownMessageType(u8),
}
