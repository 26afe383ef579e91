//! Chunked transfer for oversized encrypted envelopes.
//!
//! Serialized envelopes above 16 KiB are split into ordered chunk frames
//! `{message_id, chunk, total_chunks, chunk_index}` and transmitted
//! sequentially. The receiver buffers chunks by the sender-generated
//! message id and reassembles exactly once when all indexes are present;
//! arrival order does not matter.
//!
//! Per-message errors (inconsistent or oversized totals, duplicate or
//! out-of-range indexes) discard that message's buffer only — never the
//! session. The announced total is capped so a hostile first chunk cannot
//! demand an arbitrary allocation.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

// ── Constants ───────────────────────────────────────────────

/// Maximum serialized envelope size sent as a single frame. Anything
/// larger is split into chunks of at most this many bytes.
pub const CHUNK_SIZE: usize = 16 * 1024;

/// Upper bound on `total_chunks` for one message (16 MiB reassembled).
/// The announced total sizes the reassembly buffer, so it must be checked
/// before any slots are allocated for a message.
pub const MAX_TOTAL_CHUNKS: u32 = 1024;

// ── Wire type ───────────────────────────────────────────────

/// One chunk of an oversized envelope.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ChunkEnvelope {
    /// Reassembly key: the sender-generated message id.
    pub message_id: String,
    pub chunk: String,
    pub total_chunks: u32,
    pub chunk_index: u32,
}

// ── Error type ──────────────────────────────────────────────

/// Per-message chunk protocol violations. Non-fatal to the session.
#[derive(Debug, PartialEq)]
pub enum ChunkError {
    /// `chunk_index >= total_chunks`.
    IndexOutOfRange { index: u32, total: u32 },
    /// A later chunk declared a different total than the first one seen.
    TotalMismatch { expected: u32, got: u32 },
    /// The same index arrived twice for one message id.
    DuplicateIndex { index: u32 },
    /// `total_chunks == 0`.
    ZeroChunks,
    /// `total_chunks > MAX_TOTAL_CHUNKS`; rejected before allocation.
    TooManyChunks { total: u32 },
}

impl std::fmt::Display for ChunkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChunkError::IndexOutOfRange { index, total } => {
                write!(f, "chunk index {} out of range (total {})", index, total)
            }
            ChunkError::TotalMismatch { expected, got } => {
                write!(f, "total_chunks mismatch: expected {}, got {}", expected, got)
            }
            ChunkError::DuplicateIndex { index } => {
                write!(f, "duplicate chunk index {}", index)
            }
            ChunkError::ZeroChunks => write!(f, "total_chunks is zero"),
            ChunkError::TooManyChunks { total } => {
                write!(
                    f,
                    "total_chunks {} exceeds cap of {}",
                    total, MAX_TOTAL_CHUNKS
                )
            }
        }
    }
}

impl std::error::Error for ChunkError {}

// ── Splitting ───────────────────────────────────────────────

/// Split a serialized envelope into ordered chunks of at most
/// `CHUNK_SIZE` bytes. Only called for envelopes that exceed the
/// threshold; splitting at char boundaries keeps each chunk valid UTF-8.
pub fn split_into_chunks(message_id: &str, envelope: &str) -> Vec<ChunkEnvelope> {
    let mut pieces: Vec<String> = Vec::new();
    let mut current = String::with_capacity(CHUNK_SIZE);
    for ch in envelope.chars() {
        if current.len() + ch.len_utf8() > CHUNK_SIZE {
            pieces.push(std::mem::take(&mut current));
        }
        current.push(ch);
    }
    if !current.is_empty() || pieces.is_empty() {
        pieces.push(current);
    }

    let total = pieces.len() as u32;
    pieces
        .into_iter()
        .enumerate()
        .map(|(i, chunk)| ChunkEnvelope {
            message_id: message_id.to_string(),
            chunk,
            total_chunks: total,
            chunk_index: i as u32,
        })
        .collect()
}

// ── Reassembly ──────────────────────────────────────────────

struct PartialMessage {
    total: u32,
    slots: Vec<Option<String>>,
    received: u32,
}

/// Inbound chunk buffer for one channel session. Keyed by message id;
/// an entry is discarded once all chunks arrive or on session teardown.
#[derive(Default)]
pub struct ReassemblyBuffer {
    partial: HashMap<String, PartialMessage>,
}

impl ReassemblyBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept one chunk. Returns `Ok(Some(envelope))` exactly once, when
    /// the final missing chunk arrives; `Ok(None)` while incomplete.
    /// On error the message's buffer is dropped, leaving other messages
    /// untouched.
    pub fn accept(&mut self, env: ChunkEnvelope) -> Result<Option<String>, ChunkError> {
        if env.total_chunks == 0 {
            return Err(ChunkError::ZeroChunks);
        }
        if env.total_chunks > MAX_TOTAL_CHUNKS {
            self.partial.remove(&env.message_id);
            return Err(ChunkError::TooManyChunks {
                total: env.total_chunks,
            });
        }
        if env.chunk_index >= env.total_chunks {
            self.partial.remove(&env.message_id);
            return Err(ChunkError::IndexOutOfRange {
                index: env.chunk_index,
                total: env.total_chunks,
            });
        }

        let entry = self
            .partial
            .entry(env.message_id.clone())
            .or_insert_with(|| PartialMessage {
                total: env.total_chunks,
                slots: (0..env.total_chunks).map(|_| None).collect(),
                received: 0,
            });

        if entry.total != env.total_chunks {
            let expected = entry.total;
            self.partial.remove(&env.message_id);
            return Err(ChunkError::TotalMismatch {
                expected,
                got: env.total_chunks,
            });
        }

        let slot = &mut entry.slots[env.chunk_index as usize];
        if slot.is_some() {
            self.partial.remove(&env.message_id);
            return Err(ChunkError::DuplicateIndex {
                index: env.chunk_index,
            });
        }
        *slot = Some(env.chunk);
        entry.received += 1;

        if entry.received < entry.total {
            return Ok(None);
        }

        // Complete: join in index order and discard the buffer entry.
        let entry = self
            .partial
            .remove(&env.message_id)
            .expect("BUG: completed entry vanished from reassembly buffer");
        let mut out = String::new();
        for slot in entry.slots {
            out.push_str(&slot.expect("BUG: complete message with empty slot"));
        }
        Ok(Some(out))
    }

    /// Number of messages currently mid-reassembly.
    pub fn pending(&self) -> usize {
        self.partial.len()
    }

    /// Drop all partial state (session teardown).
    pub fn clear(&mut self) {
        self.partial.clear();
    }
}

// ── Tests ───────────────────────────────────────────────────
