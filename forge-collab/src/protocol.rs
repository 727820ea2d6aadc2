//! Binary protocol for document synchronization.
//!
//! Wire format (bincode-encoded):
//! ```text
//! ┌──────────┬───────────┬──────────┬──────────┬──────────┐
//! │ msg_type │ peer_id   │ doc_id   │ clock    │ payload  │
//! │ 1 byte   │ 16 bytes  │ 16 bytes │ varint   │ variable │
//! └──────────┴───────────┴──────────┴──────────┴──────────┘
//! ```
//!
//! `peer_id` is the originating peer; frames produced by the relay itself
//! carry the nil UUID. `clock` is the originating peer's per-session delta
//! sequence number (0 = unsequenced).

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::presence::AwarenessMessage;

/// Message types for the sync protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// State vector: "send me what I am missing"
    SyncStep1 = 1,
    /// State diff answering a SyncStep1
    SyncStep2 = 2,
    /// Incremental document update
    Delta = 3,
    /// Presence (cursor/selection) update
    Awareness = 4,
    PeerJoined = 5,
    PeerLeft = 6,
    Ping = 7,
    Pong = 8,
    /// Relay integrated the sender's delta with this clock
    Ack = 9,
    /// Per-peer last integrated clock, sent right before a SyncStep2
    Watermarks = 10,
}

/// Peer identity announced on join.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PeerInfo {
    pub peer_id: Uuid,
    pub name: String,
    /// Clock of the first delta this peer will send on the new connection.
    pub next_clock: u64,
}

impl PeerInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_id(Uuid::new_v4(), name)
    }

    /// Create with explicit peer_id (for testing)
    pub fn with_id(peer_id: Uuid, name: impl Into<String>) -> Self {
        Self {
            peer_id,
            name: name.into(),
            next_clock: 1,
        }
    }
}

/// One entry of a [`MessageType::Watermarks`] payload.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Watermark {
    pub peer_id: Uuid,
    /// Highest clock from this peer already folded into the relay document.
    pub clock: u64,
}

/// Document id shared by every client of a named room.
pub fn room_doc_id(room: &str) -> Uuid {
    Uuid::new_v5(&Uuid::NAMESPACE_OID, room.as_bytes())
}

/// Top-level protocol message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncMessage {
    pub msg_type: MessageType,
    pub peer_id: Uuid,
    pub doc_id: Uuid,
    pub clock: u64,
    pub payload: Vec<u8>,
}

impl SyncMessage {
    fn new(msg_type: MessageType, peer_id: Uuid, doc_id: Uuid, clock: u64, payload: Vec<u8>) -> Self {
        Self {
            msg_type,
            peer_id,
            doc_id,
            clock,
            payload,
        }
    }

    /// Create a delta update message.
    pub fn delta(peer_id: Uuid, doc_id: Uuid, clock: u64, update: Vec<u8>) -> Self {
        Self::new(MessageType::Delta, peer_id, doc_id, clock, update)
    }

    /// Create a sync step 1 (state vector request).
    pub fn sync_step1(peer_id: Uuid, doc_id: Uuid, state_vector: Vec<u8>) -> Self {
        Self::new(MessageType::SyncStep1, peer_id, doc_id, 0, state_vector)
    }

    /// Create a sync step 2 (state diff response).
    pub fn sync_step2(peer_id: Uuid, doc_id: Uuid, state_diff: Vec<u8>) -> Self {
        Self::new(MessageType::SyncStep2, peer_id, doc_id, 0, state_diff)
    }

    /// Create a presence message.
    pub fn awareness(
        peer_id: Uuid,
        doc_id: Uuid,
        message: &AwarenessMessage,
    ) -> Result<Self, ProtocolError> {
        Ok(Self::new(MessageType::Awareness, peer_id, doc_id, 0, encode_payload(message)?))
    }

    /// Create a peer joined notification.
    pub fn peer_joined(doc_id: Uuid, info: &PeerInfo) -> Result<Self, ProtocolError> {
        Ok(Self::new(MessageType::PeerJoined, info.peer_id, doc_id, 0, encode_payload(info)?))
    }

    /// Create a peer left notification.
    pub fn peer_left(peer_id: Uuid, doc_id: Uuid) -> Self {
        Self::new(MessageType::PeerLeft, peer_id, doc_id, 0, Vec::new())
    }

    pub fn ping(peer_id: Uuid) -> Self {
        Self::new(MessageType::Ping, peer_id, Uuid::nil(), 0, Vec::new())
    }

    pub fn pong(peer_id: Uuid) -> Self {
        Self::new(MessageType::Pong, peer_id, Uuid::nil(), 0, Vec::new())
    }

    /// Relay acknowledgement of the delta with `clock`.
    pub fn ack(doc_id: Uuid, clock: u64) -> Self {
        Self::new(MessageType::Ack, Uuid::nil(), doc_id, clock, Vec::new())
    }

    /// Relay watermarks for a resync.
    pub fn watermarks(doc_id: Uuid, marks: &[Watermark]) -> Result<Self, ProtocolError> {
        Ok(Self::new(MessageType::Watermarks, Uuid::nil(), doc_id, 0, encode_payload(&marks)?))
    }

    /// Whether the relay (rather than a peer) produced this frame.
    pub fn from_relay(&self) -> bool {
        self.peer_id.is_nil()
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode_payload(bytes)
    }

    /// Parse a presence payload.
    pub fn awareness_message(&self) -> Result<AwarenessMessage, ProtocolError> {
        self.expect(MessageType::Awareness)?;
        decode_payload(&self.payload)
    }

    /// Parse a peer info payload.
    pub fn peer_info(&self) -> Result<PeerInfo, ProtocolError> {
        self.expect(MessageType::PeerJoined)?;
        decode_payload(&self.payload)
    }

    /// Parse a watermarks payload.
    pub fn watermark_list(&self) -> Result<Vec<Watermark>, ProtocolError> {
        self.expect(MessageType::Watermarks)?;
        decode_payload(&self.payload)
    }

    fn expect(&self, msg_type: MessageType) -> Result<(), ProtocolError> {
        if self.msg_type != msg_type {
            return Err(ProtocolError::InvalidMessageType {
                expected: msg_type,
                actual: self.msg_type,
            });
        }
        Ok(())
    }
}

fn encode_payload<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| ProtocolError::Serialization(e.to_string()))
}

fn decode_payload<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
    Ok(value)
}

/// Protocol errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("expected {expected:?} message, got {actual:?}")]
    InvalidMessageType {
        expected: MessageType,
        actual: MessageType,
    },
}
