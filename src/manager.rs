//! Channel manager: one event loop per local user.
//!
//! Owns every `ChannelSession` for its user (one logical session per
//! remote contact), the call sessions, the negotiation timers, and the
//! relay link. All state is touched only from the manager thread; network
//! callbacks enqueue typed events on the mpsc queue and never block.
//!
//! Timers are deadline records checked by the loop between events; each
//! carries the generation the session armed, so a stale deadline cannot
//! fire after a restart re-armed it.
//!
//! The encryption boundary lives here: `send` resolves the recipient key,
//! encrypts, and hands the session wire ciphertext; a delivered message is
//! decrypted before the observer sees it. An unknown sender key is
//! resolved off the loop so a slow remote lookup cannot stall the timers,
//! and a message that still fails to decrypt is surfaced to the observer
//! as undecryptable — never fatal to the session.

use std::collections::HashMap;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use crate::call::{CallAction, CallEvent, CallSession, CallState};
use crate::candidate_filter::{is_allowed_candidate, NetworkScope};
use crate::codec::{self, KeyPair};
use crate::control::{ClientFrame, RelayFrame};
use crate::key_directory::KeyDirectory;
use crate::message::{DataFrame, Message, TransportHint};
use crate::session::{Action, ChannelSession, Event, SessionState};
use crate::transport::{
    dial, ChannelListener, ListenerGuard, TcpTransport, Transport, TransportEvent,
};

// ── Seams ───────────────────────────────────────────────────

/// Outbound half of the relay connection.
pub trait RelayLink: Send {
    fn send(&self, frame: &ClientFrame) -> Result<(), String>;
}

/// Consumer of channel activity (the UI boundary).
pub trait ChannelObserver: Send {
    /// A message arrived, payload already decrypted.
    fn message_received(&self, message: &Message);
    /// The direct channel to `remote_id` opened or closed.
    fn status_changed(&self, remote_id: &str, active: bool);
    /// Terminal close discarded queued sends. Never silent.
    fn sends_discarded(&self, remote_id: &str, count: usize);
    /// The remote acknowledged reading a message.
    fn read_acknowledged(&self, message_id: &str);
    /// A message arrived but could not be decrypted. The UI marks it so
    /// the sender can retry; the session stays up.
    fn message_undecryptable(&self, _sender_id: &str, _message_id: &str) {}
    /// Call state change for `remote_id`.
    fn call_state(&self, _remote_id: &str, _state: CallState) {}
}

// ── Configuration ───────────────────────────────────────────

pub struct ManagerConfig {
    pub local_id: String,
    pub scope: NetworkScope,
    /// Host addresses advertised as candidates (the bound port is added).
    pub advertise_ips: Vec<String>,
}

// ── Events and handle ───────────────────────────────────────

/// Everything the manager thread reacts to.
pub enum ManagerEvent {
    /// Open a direct channel to `remote_id`.
    Connect { remote_id: String },
    /// Encrypt and send plaintext to `remote_id`.
    Send { remote_id: String, plaintext: String },
    /// Tear down the channel to `remote_id`.
    Close { remote_id: String },
    /// The local user read `message`; acknowledge to the sender.
    MarkRead { message: Message },
    /// Call commands.
    CallDial { remote_id: String },
    CallAccept { remote_id: String },
    CallHangUp { remote_id: String },
    /// A frame from the relay connection.
    Relay(RelayFrame),
    /// Direct transport activity for the session with `remote_id`.
    Transport {
        remote_id: String,
        event: TransportEvent,
    },
    /// A dial or accept produced a connected stream.
    Established {
        remote_id: String,
        stream: std::net::TcpStream,
    },
    /// Internal: a delivery re-queued after its sender key was resolved
    /// off the loop.
    RetryDeliver { message: Message },
    Shutdown,
}

/// Cloneable injection point for the manager's queue.
#[derive(Clone)]
pub struct ManagerHandle {
    tx: mpsc::Sender<ManagerEvent>,
}

impl ManagerHandle {
    pub fn post(&self, event: ManagerEvent) {
        // A send error means the loop already shut down.
        let _ = self.tx.send(event);
    }

    pub fn connect(&self, remote_id: &str) {
        self.post(ManagerEvent::Connect {
            remote_id: remote_id.to_string(),
        });
    }

    pub fn send(&self, remote_id: &str, plaintext: &str) {
        self.post(ManagerEvent::Send {
            remote_id: remote_id.to_string(),
            plaintext: plaintext.to_string(),
        });
    }

    pub fn close(&self, remote_id: &str) {
        self.post(ManagerEvent::Close {
            remote_id: remote_id.to_string(),
        });
    }

    pub fn relay_frame(&self, frame: RelayFrame) {
        self.post(ManagerEvent::Relay(frame));
    }

    pub fn shutdown(&self) {
        self.post(ManagerEvent::Shutdown);
    }
}

// ── Manager ─────────────────────────────────────────────────

struct TimerRecord {
    deadline: Instant,
    generation: u64,
}

pub struct ChannelManager {
    config: ManagerConfig,
    keypair: KeyPair,
    local_public_key: String,
    directory: Arc<KeyDirectory>,
    relay: Box<dyn RelayLink>,
    observer: Box<dyn ChannelObserver>,

    sessions: HashMap<String, ChannelSession>,
    calls: HashMap<String, CallSession>,
    transports: HashMap<String, Box<dyn Transport>>,
    listeners: HashMap<String, ListenerGuard>,
    timers: HashMap<String, TimerRecord>,

    rx: mpsc::Receiver<ManagerEvent>,
    handle: ManagerHandle,
}

impl ChannelManager {
    pub fn new(
        config: ManagerConfig,
        keypair: KeyPair,
        directory: Arc<KeyDirectory>,
        relay: Box<dyn RelayLink>,
        observer: Box<dyn ChannelObserver>,
    ) -> Self {
        let (tx, rx) = mpsc::channel();
        let local_public_key = keypair.public_key_base64();
        Self {
            config,
            keypair,
            local_public_key,
            directory,
            relay,
            observer,
            sessions: HashMap::new(),
            calls: HashMap::new(),
            transports: HashMap::new(),
            listeners: HashMap::new(),
            timers: HashMap::new(),
            rx,
            handle: ManagerHandle { tx },
        }
    }

    pub fn handle(&self) -> ManagerHandle {
        self.handle.clone()
    }

    /// Spawn the event loop on its own thread.
    pub fn spawn(self) -> (ManagerHandle, thread::JoinHandle<()>) {
        let handle = self.handle();
        let join = thread::Builder::new()
            .name(format!("manager-{}", self.config.local_id))
            .spawn(move || self.run())
            .expect("BUG: manager thread failed to spawn");
        (handle, join)
    }

    /// The event loop. Returns when `Shutdown` is processed.
    pub fn run(mut self) {
        loop {
            let event = match self.next_deadline() {
                Some(deadline) => {
                    let now = Instant::now();
                    if deadline <= now {
                        self.fire_due_timers();
                        continue;
                    }
                    match self.rx.recv_timeout(deadline - now) {
                        Ok(ev) => ev,
                        Err(mpsc::RecvTimeoutError::Timeout) => {
                            self.fire_due_timers();
                            continue;
                        }
                        Err(mpsc::RecvTimeoutError::Disconnected) => return,
                    }
                }
                None => match self.rx.recv() {
                    Ok(ev) => ev,
                    Err(_) => return,
                },
            };
            if !self.dispatch(event) {
                return;
            }
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.timers.values().map(|t| t.deadline).min()
    }

    fn fire_due_timers(&mut self) {
        let now = Instant::now();
        let due: Vec<(String, u64)> = self
            .timers
            .iter()
            .filter(|(_, t)| t.deadline <= now)
            .map(|(id, t)| (id.clone(), t.generation))
            .collect();
        for (remote_id, generation) in due {
            self.timers.remove(&remote_id);
            self.feed_session(&remote_id, Event::NegotiationTimeout { generation });
        }
    }

    /// Returns false on shutdown.
    fn dispatch(&mut self, event: ManagerEvent) -> bool {
        match event {
            ManagerEvent::Connect { remote_id } => self.on_connect(&remote_id),
            ManagerEvent::Send {
                remote_id,
                plaintext,
            } => self.on_send(&remote_id, &plaintext),
            ManagerEvent::Close { remote_id } => {
                self.feed_session(&remote_id, Event::Teardown);
            }
            ManagerEvent::MarkRead { message } => self.on_mark_read(&message),
            ManagerEvent::CallDial { remote_id } => {
                self.feed_call(&remote_id, CallEvent::Dial);
            }
            ManagerEvent::CallAccept { remote_id } => {
                self.feed_call(&remote_id, CallEvent::Accept);
            }
            ManagerEvent::CallHangUp { remote_id } => {
                self.feed_call(&remote_id, CallEvent::HangUp);
            }
            ManagerEvent::Relay(frame) => self.on_relay_frame(frame),
            ManagerEvent::Transport { remote_id, event } => {
                self.on_transport_event(&remote_id, event);
            }
            ManagerEvent::Established { remote_id, stream } => {
                self.on_established(&remote_id, stream);
            }
            ManagerEvent::RetryDeliver { message } => self.deliver_resolved(message),
            ManagerEvent::Shutdown => {
                for transport in self.transports.values() {
                    transport.close();
                }
                for listener in self.listeners.values() {
                    listener.close();
                }
                return false;
            }
        }
        true
    }

    // ── Command handling ────────────────────────────────────

    fn on_connect(&mut self, remote_id: &str) {
        let session = self.session_for(remote_id);
        match session.handle(Event::Initiate) {
            Ok(actions) => self.apply_actions(remote_id, actions),
            Err(e) => eprintln!("[manager] connect to {}: {}", remote_id, e),
        }
    }

    fn on_send(&mut self, remote_id: &str, plaintext: &str) {
        let wire = match self.encrypt_for(remote_id, plaintext) {
            Some(wire) => wire,
            None => return,
        };
        let message = Message::outbound(&self.config.local_id, remote_id, &wire);

        let state = self
            .sessions
            .get(remote_id)
            .map(|s| s.state())
            .unwrap_or(SessionState::Idle);
        match state {
            SessionState::Idle | SessionState::Closed => {
                // No channel attempt in flight: the relay carries it, and
                // persists if the recipient is offline.
                if let Err(e) = self.relay.send(&ClientFrame::AppMessage { message }) {
                    eprintln!("[manager] relay send to {} failed: {}", remote_id, e);
                }
            }
            _ => {
                // In-flight or open channel: transmit or queue.
                self.feed_session(remote_id, Event::SendRequest { message });
            }
        }
    }

    fn encrypt_for(&self, remote_id: &str, plaintext: &str) -> Option<String> {
        let key_bytes = match self.directory.resolve_bytes(remote_id) {
            Ok(bytes) => bytes,
            Err(e) => {
                eprintln!("[manager] no key for {}: {}", remote_id, e);
                return None;
            }
        };
        match codec::encrypt(plaintext, &key_bytes, &self.keypair) {
            Ok(wire) => Some(wire),
            Err(e) => {
                eprintln!("[manager] encryption for {} failed: {}", remote_id, e);
                None
            }
        }
    }

    fn on_mark_read(&mut self, message: &Message) {
        match message.transport_hint {
            TransportHint::Direct => {
                if let Some(transport) = self.transports.get(&message.sender_id) {
                    let frame = DataFrame::ReadAck {
                        message_id: message.id.clone(),
                    };
                    match serde_json::to_string(&frame) {
                        Ok(json) => {
                            if let Err(e) = transport.send_frame(&json) {
                                eprintln!("[manager] read-ack over channel failed: {}", e);
                            }
                            return;
                        }
                        Err(e) => {
                            eprintln!("[manager] read-ack serialization failed: {}", e);
                            return;
                        }
                    }
                }
                // Channel gone: fall through to the relay.
                self.relay_read_ack(message);
            }
            TransportHint::Relayed => self.relay_read_ack(message),
        }
    }

    fn relay_read_ack(&self, message: &Message) {
        let frame = ClientFrame::ReadAck {
            message_id: message.id.clone(),
            reader_id: self.config.local_id.clone(),
        };
        if let Err(e) = self.relay.send(&frame) {
            eprintln!("[manager] read-ack via relay failed: {}", e);
        }
    }

    // ── Relay frames ────────────────────────────────────────

    fn on_relay_frame(&mut self, frame: RelayFrame) {
        match frame {
            RelayFrame::Registered { participant_id } => {
                eprintln!("[manager] registered with relay as {}", participant_id);
            }
            RelayFrame::Control { control } => {
                let peer = control.source().to_string();
                if control.is_call() {
                    self.feed_call(&peer, CallEvent::ControlReceived(control));
                } else {
                    self.feed_session(&peer, Event::ControlReceived(control));
                }
            }
            RelayFrame::Delivery { message } => self.deliver(message),
            RelayFrame::KeyResult { participant_id, .. } => {
                // Key lookups run on their own request channel; nothing to
                // correlate here.
                eprintln!(
                    "[manager] stray key result for {} on main link",
                    participant_id
                );
            }
            RelayFrame::Error { message } => {
                eprintln!("[manager] relay error: {}", message);
            }
        }
    }

    /// Hand a message to the observer, decrypted. An unknown sender key
    /// is resolved on a short-lived thread first; the delivery re-enters
    /// the loop as `RetryDeliver` once the lookup settled either way.
    fn deliver(&mut self, message: Message) {
        if self.sender_key_known(&message.sender_id) {
            self.deliver_resolved(message);
            return;
        }
        let directory = self.directory.clone();
        let handle = self.handle.clone();
        let spawned = thread::Builder::new()
            .name("key-resolve".to_string())
            .spawn(move || {
                if let Err(e) = directory.resolve(&message.sender_id) {
                    eprintln!(
                        "[manager] key resolution for {} failed: {}",
                        message.sender_id, e
                    );
                }
                handle.post(ManagerEvent::RetryDeliver { message });
            });
        if let Err(e) = spawned {
            eprintln!("[manager] key resolve thread spawn failed: {}", e);
        }
    }

    /// Decrypt with the (now locally known) sender key. A message that
    /// cannot be decrypted is surfaced as undecryptable, not delivered.
    fn deliver_resolved(&mut self, mut message: Message) {
        let sender_key = match self.sender_key_bytes(&message.sender_id) {
            Some(bytes) => bytes,
            None => {
                eprintln!("[manager] no sender key for {}", message.sender_id);
                self.observer
                    .message_undecryptable(&message.sender_id, &message.id);
                return;
            }
        };
        match codec::decrypt(&message.payload, &sender_key, &self.keypair) {
            Ok(plaintext) => {
                message.payload = plaintext;
                self.observer.message_received(&message);
            }
            Err(e) => {
                eprintln!(
                    "[manager] decryption from {} failed: {}",
                    message.sender_id, e
                );
                self.observer
                    .message_undecryptable(&message.sender_id, &message.id);
            }
        }
    }

    /// Whether a decryption key for `sender_id` is available without
    /// network I/O: pinned by the session or already in the directory.
    fn sender_key_known(&self, sender_id: &str) -> bool {
        self.sessions
            .get(sender_id)
            .and_then(|s| s.remote_public_key())
            .is_some()
            || self.directory.peek(sender_id).is_some()
    }

    /// Sender key: prefer the key pinned by the session's description
    /// exchange, fall back to the directory's local view.
    fn sender_key_bytes(&self, sender_id: &str) -> Option<Vec<u8>> {
        use base64::engine::general_purpose::STANDARD as BASE64;
        use base64::Engine as _;

        if let Some(session) = self.sessions.get(sender_id) {
            if let Some(b64) = session.remote_public_key() {
                if let Ok(bytes) = BASE64.decode(b64) {
                    return Some(bytes);
                }
            }
        }
        let b64 = self.directory.peek(sender_id)?;
        BASE64.decode(b64).ok()
    }

    // ── Transport events ────────────────────────────────────

    fn on_transport_event(&mut self, remote_id: &str, event: TransportEvent) {
        match event {
            TransportEvent::Connected => {
                // Connected is synthesized in on_established once the
                // transport is registered; a reader's own Connected for an
                // already-registered transport is redundant.
            }
            TransportEvent::Frame(frame) => {
                self.feed_session(remote_id, Event::FrameReceived(frame));
            }
            TransportEvent::Closed { reason } => {
                self.transports.remove(remote_id);
                self.feed_session(remote_id, Event::TransportClosed { reason });
            }
        }
    }

    fn on_established(&mut self, remote_id: &str, stream: std::net::TcpStream) {
        if self.transports.contains_key(remote_id) {
            // One transport per session; a second successful dial loses.
            return;
        }
        let write_half = match stream.try_clone() {
            Ok(s) => TcpTransport::new(s),
            Err(e) => {
                eprintln!("[manager] transport clone failed: {}", e);
                return;
            }
        };

        let handle = self.handle.clone();
        let peer = remote_id.to_string();
        let spawned = TcpTransport::spawn_reader(stream, move |ev| {
            handle.post(ManagerEvent::Transport {
                remote_id: peer.clone(),
                event: ev,
            });
        });
        if let Err(e) = spawned {
            eprintln!("[manager] reader spawn failed: {}", e);
            return;
        }

        // The round's listener did its job (or lost to the dial).
        if let Some(listener) = self.listeners.remove(remote_id) {
            listener.close();
        }
        self.transports
            .insert(remote_id.to_string(), Box::new(write_half));
        self.feed_session(remote_id, Event::TransportConnected);
    }

    // ── Session plumbing ────────────────────────────────────

    fn session_for(&mut self, remote_id: &str) -> &mut ChannelSession {
        let local_id = self.config.local_id.clone();
        let public_key = self.local_public_key.clone();
        self.sessions
            .entry(remote_id.to_string())
            .or_insert_with(|| ChannelSession::new(&local_id, remote_id, &public_key))
    }

    fn feed_session(&mut self, remote_id: &str, event: Event) {
        let session = self.session_for(remote_id);
        match session.handle(event) {
            Ok(actions) => self.apply_actions(remote_id, actions),
            Err(e) => eprintln!("[manager] session {}: {}", remote_id, e),
        }
    }

    fn apply_actions(&mut self, remote_id: &str, actions: Vec<Action>) {
        for action in actions {
            self.apply_action(remote_id, action);
        }
    }

    fn apply_action(&mut self, remote_id: &str, action: Action) {
        match action {
            Action::SendControl(control) => {
                if let Err(e) = self.relay.send(&ClientFrame::Control { control }) {
                    eprintln!("[manager] relay control to {} failed: {}", remote_id, e);
                }
            }
            Action::BindListener => self.bind_listener(remote_id),
            Action::ApplyCandidate(candidate) => {
                if !is_allowed_candidate(&candidate.address, self.config.scope) {
                    eprintln!(
                        "[manager] candidate {} rejected by scope policy",
                        candidate.address
                    );
                    return;
                }
                let answerer = self
                    .sessions
                    .get(remote_id)
                    .map(|s| s.is_answerer())
                    .unwrap_or(false);
                if answerer && !self.transports.contains_key(remote_id) {
                    self.dial_candidate(remote_id, &candidate.address);
                }
            }
            Action::ArmTimer {
                generation,
                duration,
            } => {
                self.timers.insert(
                    remote_id.to_string(),
                    TimerRecord {
                        deadline: Instant::now() + duration,
                        generation,
                    },
                );
            }
            Action::CancelTimer => {
                self.timers.remove(remote_id);
            }
            Action::TransmitFrame(frame) => {
                if let Some(transport) = self.transports.get(remote_id) {
                    if let Err(e) = transport.send_frame(&frame) {
                        eprintln!("[manager] transmit to {} failed: {}", remote_id, e);
                    }
                } else {
                    eprintln!("[manager] transmit to {} with no transport", remote_id);
                }
            }
            Action::CloseTransport => {
                if let Some(listener) = self.listeners.remove(remote_id) {
                    listener.close();
                }
                if let Some(transport) = self.transports.remove(remote_id) {
                    transport.close();
                }
            }
            Action::DeliverMessage(message) => self.deliver(message),
            Action::NotifyRead { message_id } => {
                self.observer.read_acknowledged(&message_id);
            }
            Action::NotifyStatus { active } => {
                self.observer.status_changed(remote_id, active);
            }
            Action::ReportDiscarded { count } => {
                self.observer.sends_discarded(remote_id, count);
            }
        }
    }

    /// Bind the offerer listener inline (non-blocking) and report its
    /// scope-filtered candidates back to the session.
    fn bind_listener(&mut self, remote_id: &str) {
        let listener = match ChannelListener::bind() {
            Ok(l) => l,
            Err(e) => {
                eprintln!("[manager] listener bind failed: {}", e);
                self.feed_session(
                    remote_id,
                    Event::TransportClosed {
                        reason: format!("listener bind failed: {}", e),
                    },
                );
                return;
            }
        };
        let candidates: Vec<String> = listener
            .candidate_addresses(&self.config.advertise_ips)
            .into_iter()
            .filter(|addr| is_allowed_candidate(addr, self.config.scope))
            .collect();

        let handle = self.handle.clone();
        let peer = remote_id.to_string();
        let guard = match listener.accept_one(move |stream| {
            if let Some(stream) = stream {
                handle.post(ManagerEvent::Established {
                    remote_id: peer,
                    stream,
                });
            }
        }) {
            Ok((guard, _join)) => guard,
            Err(e) => {
                eprintln!("[manager] accept thread spawn failed: {}", e);
                return;
            }
        };
        // A guard left over from a previous round is stale.
        if let Some(old) = self.listeners.insert(remote_id.to_string(), guard) {
            old.close();
        }
        self.feed_session(remote_id, Event::ListenerBound { candidates });
    }

    fn dial_candidate(&mut self, remote_id: &str, address: &str) {
        let handle = self.handle.clone();
        let peer = remote_id.to_string();
        let address = address.to_string();
        let spawned = thread::Builder::new()
            .name("transport-dial".to_string())
            .spawn(move || match dial(&address) {
                Ok(stream) => {
                    handle.post(ManagerEvent::Established {
                        remote_id: peer,
                        stream,
                    });
                }
                Err(e) => {
                    eprintln!("[manager] dial {} failed: {}", address, e);
                }
            });
        if let Err(e) = spawned {
            eprintln!("[manager] dial thread spawn failed: {}", e);
        }
    }

    // ── Call plumbing ───────────────────────────────────────

    fn feed_call(&mut self, remote_id: &str, event: CallEvent) {
        let local_id = self.config.local_id.clone();
        let public_key = self.local_public_key.clone();
        let call = self
            .calls
            .entry(remote_id.to_string())
            .or_insert_with(|| CallSession::new(&local_id, remote_id, &public_key));
        let actions = call.handle(event);
        let state = call.state();
        for action in actions {
            match action {
                CallAction::SendControl(control) => {
                    if let Err(e) = self.relay.send(&ClientFrame::Control { control }) {
                        eprintln!("[manager] relay call control failed: {}", e);
                    }
                }
                CallAction::NotifyRinging
                | CallAction::NotifyConnected
                | CallAction::NotifyEnded => {
                    self.observer.call_state(remote_id, state);
                }
            }
        }
    }
}

// ── Tests ───────────────────────────────────────────────────
