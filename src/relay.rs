//! Signaling relay core: registry, control routing, store-and-forward.
//!
//! The relay binary holds one `RelayCore` behind a mutex; each peer
//! connection runs a reader thread (parsing client frames) and a writer
//! thread draining that peer's outbound channel. The core owns the
//! `participant_id → PeerHandle` registry explicitly — no ambient globals —
//! and mutates it only on connect/disconnect.
//!
//! Routing rules:
//! - Control frames go to their `target` if it is live. An `offer` to an
//!   offline target is converted into a stored connection-request so the
//!   recipient finds it on reconnect; the other control kinds are stale by
//!   the time an offline target returns and are dropped.
//! - Application messages are forwarded directly when the recipient is
//!   online (never persisted), stored unread when offline.
//! - A read-ack deletes the stored row. Flushing on reconnect delivers
//!   copies but does not delete — only the recipient's explicit ack does.

use std::collections::HashMap;
use std::sync::mpsc;

use crate::control::{ClientFrame, ControlMessage, RelayFrame};
use crate::message::{now_ms, Message, StoredMessage, StoredMessageType};

// ── Peer handle ─────────────────────────────────────────────

/// Write handle for one connected peer: frames pushed here are drained by
/// that connection's writer thread.
#[derive(Clone)]
pub struct PeerHandle {
    sender: mpsc::Sender<RelayFrame>,
}

impl PeerHandle {
    pub fn new(sender: mpsc::Sender<RelayFrame>) -> Self {
        Self { sender }
    }

    /// Returns false when the writer side is gone.
    pub fn send(&self, frame: RelayFrame) -> bool {
        self.sender.send(frame).is_ok()
    }
}

// ── Registry ────────────────────────────────────────────────

struct RegisteredPeer {
    handle: PeerHandle,
    generation: u64,
}

/// Live connections and published public keys. Each registration gets a
/// generation number so a stale connection thread, exiting after its peer
/// already re-registered, cannot evict the replacement connection.
#[derive(Default)]
pub struct Registry {
    connections: HashMap<String, RegisteredPeer>,
    keys: HashMap<String, String>,
    next_generation: u64,
}

impl Registry {
    /// Register a connection; returns its generation for the eventual
    /// matching unregister.
    pub fn register(&mut self, participant_id: &str, public_key: &str, handle: PeerHandle) -> u64 {
        if self.connections.contains_key(participant_id) {
            eprintln!(
                "[relay] {} re-registered, replacing previous connection",
                participant_id
            );
        }
        self.next_generation += 1;
        let generation = self.next_generation;
        self.connections.insert(
            participant_id.to_string(),
            RegisteredPeer { handle, generation },
        );
        self.keys
            .insert(participant_id.to_string(), public_key.to_string());
        generation
    }

    pub fn unregister(&mut self, participant_id: &str) {
        self.connections.remove(participant_id);
        // The key stays published: offline peers are still addressable.
    }

    /// Unregister only if `generation` still names the live connection.
    /// Returns whether anything was removed.
    pub fn unregister_if_current(&mut self, participant_id: &str, generation: u64) -> bool {
        match self.connections.get(participant_id) {
            Some(peer) if peer.generation == generation => {
                self.connections.remove(participant_id);
                true
            }
            _ => false,
        }
    }

    pub fn lookup(&self, participant_id: &str) -> Option<&PeerHandle> {
        self.connections.get(participant_id).map(|p| &p.handle)
    }

    pub fn public_key(&self, participant_id: &str) -> Option<&str> {
        self.keys.get(participant_id).map(String::as_str)
    }

    pub fn online_count(&self) -> usize {
        self.connections.len()
    }
}

// ── Offline store ───────────────────────────────────────────

/// Per-recipient ordered store of undelivered messages. Rows are removed
/// only by read-acknowledgment.
#[derive(Default)]
pub struct OfflineStore {
    rows: HashMap<String, Vec<StoredMessage>>,
}

impl OfflineStore {
    pub fn persist(&mut self, row: StoredMessage) {
        self.rows
            .entry(row.recipient_id.clone())
            .or_default()
            .push(row);
    }

    /// Copies of everything stored for `recipient_id`, oldest timestamp
    /// first. Does NOT delete — delivery is not acknowledgment.
    pub fn flush_for(&self, recipient_id: &str) -> Vec<StoredMessage> {
        let mut out: Vec<StoredMessage> = self
            .rows
            .get(recipient_id)
            .map(|v| v.to_vec())
            .unwrap_or_default();
        out.sort_by_key(|m| m.timestamp);
        out
    }

    /// Delete the row on read-acknowledgment. Returns whether it existed.
    pub fn ack(&mut self, message_id: &str, reader_id: &str) -> bool {
        let Some(rows) = self.rows.get_mut(reader_id) else {
            return false;
        };
        let before = rows.len();
        rows.retain(|m| m.id != message_id);
        let removed = rows.len() != before;
        if rows.is_empty() {
            self.rows.remove(reader_id);
        }
        removed
    }

    pub fn pending_for(&self, recipient_id: &str) -> usize {
        self.rows.get(recipient_id).map_or(0, Vec::len)
    }
}

// ── Relay core ──────────────────────────────────────────────

#[derive(Default)]
pub struct RelayCore {
    pub registry: Registry,
    pub store: OfflineStore,
}

impl RelayCore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a peer and flush its stored messages, oldest first.
    /// Nothing is marked read or deleted here. Returns the registration
    /// generation for `unregister_if_current`.
    pub fn register(&mut self, participant_id: &str, public_key: &str, handle: PeerHandle) -> u64 {
        let generation = self
            .registry
            .register(participant_id, public_key, handle.clone());
        handle.send(RelayFrame::Registered {
            participant_id: participant_id.to_string(),
        });

        let stored = self.store.flush_for(participant_id);
        if !stored.is_empty() {
            eprintln!(
                "[relay] flushing {} stored messages to {}",
                stored.len(),
                participant_id
            );
        }
        for row in stored {
            handle.send(RelayFrame::Delivery {
                message: row.into_message(),
            });
        }
        generation
    }

    pub fn unregister(&mut self, participant_id: &str) {
        self.registry.unregister(participant_id);
        eprintln!(
            "[relay] {} disconnected ({} online)",
            participant_id,
            self.registry.online_count()
        );
    }

    /// Connection-thread epilogue: drop the registration only if it is
    /// still this thread's own. A reconnected peer's fresh registration
    /// stays routable.
    pub fn unregister_if_current(&mut self, participant_id: &str, generation: u64) {
        if self.registry.unregister_if_current(participant_id, generation) {
            eprintln!(
                "[relay] {} disconnected ({} online)",
                participant_id,
                self.registry.online_count()
            );
        }
    }

    /// Parse and dispatch one text frame from a registered peer.
    /// Malformed frames are logged and dropped — never fatal.
    pub fn handle_text(&mut self, sender_id: &str, text: &str) {
        let frame: ClientFrame = match serde_json::from_str(text) {
            Ok(f) => f,
            Err(e) => {
                eprintln!("[relay] unparseable frame from {}: {}", sender_id, e);
                return;
            }
        };
        self.handle_frame(sender_id, frame);
    }

    pub fn handle_frame(&mut self, sender_id: &str, frame: ClientFrame) {
        match frame {
            ClientFrame::Register { participant_id, .. } => {
                // Registration is connection setup, not a routable frame.
                eprintln!(
                    "[relay] duplicate register from {} (as {}), ignoring",
                    sender_id, participant_id
                );
            }
            ClientFrame::Control { control } => self.route_control(sender_id, control),
            ClientFrame::AppMessage { message } => self.route_message(message),
            ClientFrame::ReadAck {
                message_id,
                reader_id,
            } => {
                if self.store.ack(&message_id, &reader_id) {
                    eprintln!("[relay] read-ack deleted stored message {}", message_id);
                }
            }
            ClientFrame::KeyLookup { participant_id } => {
                let public_key = self
                    .registry
                    .public_key(&participant_id)
                    .map(str::to_string);
                if let Some(handle) = self.registry.lookup(sender_id) {
                    handle.send(RelayFrame::KeyResult {
                        participant_id,
                        public_key,
                    });
                }
            }
        }
    }

    fn route_control(&mut self, sender_id: &str, control: ControlMessage) {
        let target = control.target().to_string();
        if control.source() != sender_id {
            eprintln!(
                "[relay] {} sent control claiming source {}, dropping",
                sender_id,
                control.source()
            );
            return;
        }

        if let Some(handle) = self.registry.lookup(&target) {
            if !handle.send(RelayFrame::Control { control }) {
                eprintln!("[relay] {} writer gone, unregistering", target);
                self.registry.unregister(&target);
            }
            return;
        }

        // Offline target: only a data-channel offer has a fallback.
        if control.is_live_only() {
            eprintln!(
                "[relay] dropping {} for offline target {}",
                control.kind(),
                target
            );
            return;
        }
        eprintln!(
            "[relay] {} offline, storing connection request from {}",
            target, sender_id
        );
        self.store.persist(StoredMessage {
            id: format!("connreq-{}-{}", sender_id, now_ms()),
            sender_id: sender_id.to_string(),
            recipient_id: target,
            content: format!("{} wants to connect", sender_id),
            kind: StoredMessageType::ConnectionRequest,
            timestamp: now_ms(),
            is_read: false,
            is_p2p: true,
        });
    }

    fn route_message(&mut self, message: Message) {
        let recipient = message.recipient_id.clone();
        if let Some(handle) = self.registry.lookup(&recipient) {
            // Online: direct forward, no persistence.
            if handle.send(RelayFrame::Delivery { message }) {
                return;
            }
            eprintln!("[relay] {} writer gone, unregistering", recipient);
            self.registry.unregister(&recipient);
            return;
        }
        eprintln!("[relay] {} offline, persisting message", recipient);
        self.store.persist(StoredMessage::from_message(&message));
    }
}

// ── Tests ───────────────────────────────────────────────────
