//! Message records and the direct-channel data frame envelope.
//!
//! `Message` is the unit the UI produces and consumes. Its `payload` is
//! plaintext on the UI side and the `enc:`-prefixed wire ciphertext beyond
//! the local boundary. `is_read` transitions false→true only on explicit
//! acknowledgment from the recipient.
//!
//! `StoredMessage` is the relay's offline record: deleted on
//! read-acknowledgment, not archived.

use serde::{Deserialize, Serialize};

use rand::rngs::OsRng;
use rand::RngCore;

use crate::chunk::ChunkEnvelope;

// ── Message ─────────────────────────────────────────────────

/// Where a delivered message travelled.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TransportHint {
    /// Arrived over the direct peer channel.
    Direct,
    /// Forwarded (or store-and-forwarded) by the relay.
    Relayed,
}

/// A single two-party message.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Message {
    pub id: String,
    pub sender_id: String,
    pub recipient_id: String,
    /// Plaintext pre-encryption; `enc:`-prefixed ciphertext on the wire.
    pub payload: String,
    pub timestamp: u64,
    pub is_read: bool,
    pub transport_hint: TransportHint,
}

impl Message {
    /// Build an outbound message with a fresh unique id.
    pub fn outbound(sender_id: &str, recipient_id: &str, payload: &str) -> Self {
        Self {
            id: generate_message_id(),
            sender_id: sender_id.to_string(),
            recipient_id: recipient_id.to_string(),
            payload: payload.to_string(),
            timestamp: now_ms(),
            is_read: false,
            transport_hint: TransportHint::Direct,
        }
    }
}

// ── Stored (offline) record ─────────────────────────────────

/// Stored record kind.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum StoredMessageType {
    /// An application message persisted while the recipient was offline.
    Text,
    /// Synthesized by the relay when an offer targeted an offline peer,
    /// so the receiving UI can later decide to accept/reject.
    ConnectionRequest,
}

/// Relay-persisted message row. Removed on read-acknowledgment.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StoredMessage {
    pub id: String,
    pub sender_id: String,
    pub recipient_id: String,
    pub content: String,
    #[serde(rename = "type")]
    pub kind: StoredMessageType,
    pub timestamp: u64,
    pub is_read: bool,
    pub is_p2p: bool,
}

impl StoredMessage {
    /// Persist form of an application message (recipient offline).
    pub fn from_message(msg: &Message) -> Self {
        Self {
            id: msg.id.clone(),
            sender_id: msg.sender_id.clone(),
            recipient_id: msg.recipient_id.clone(),
            content: msg.payload.clone(),
            kind: StoredMessageType::Text,
            timestamp: msg.timestamp,
            is_read: false,
            is_p2p: false,
        }
    }

    /// Delivery form flushed to a reconnecting recipient.
    pub fn into_message(self) -> Message {
        Message {
            id: self.id,
            sender_id: self.sender_id,
            recipient_id: self.recipient_id,
            payload: self.content,
            timestamp: self.timestamp,
            is_read: self.is_read,
            transport_hint: TransportHint::Relayed,
        }
    }
}

// ── Direct-channel frames ───────────────────────────────────

/// Frame exchanged on the direct peer channel, tagged by `"type"`.
/// Envelopes above the chunk threshold travel as `chunk` frames.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type")]
pub enum DataFrame {
    #[serde(rename = "message")]
    Message { message: Message },

    #[serde(rename = "chunk")]
    Chunk(ChunkEnvelope),

    #[serde(rename = "read-ack")]
    ReadAck { message_id: String },
}

// ── Helpers ─────────────────────────────────────────────────

/// Monotonically unique sender-generated message id (128-bit random,
/// hex). Also the chunk-reassembly key.
pub fn generate_message_id() -> String {
    let mut bytes = [0u8; 16];
    OsRng.fill_bytes(&mut bytes);
    let mut out = String::with_capacity(32);
    for b in bytes {
        out.push_str(&format!("{:02x}", b));
    }
    out
}

/// Current time in milliseconds since UNIX epoch.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

// ── Tests ───────────────────────────────────────────────────
