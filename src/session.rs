//! Per-contact channel session state machine.
//!
//! `Idle → Offering → AwaitingAnswer → Connecting → Open → Closing →
//! Closed`, with `Failed` reachable from any in-flight state. The machine
//! is a pure transition function: `handle(event) → Vec<Action>`. It does no
//! I/O; the manager interprets actions (send control, bind/dial transport,
//! arm timers, deliver plaintext). One event at a time per session — the
//! manager's event loop is the single writer.
//!
//! Reconnection: every offer or restart arms a 30-second negotiation
//! timeout. Timeout, transport failure, or a bad-version description sends
//! the session through `Failed`; up to 5 total attempts are made against
//! the same remote (the initial offer counts as attempt 1), then the
//! session closes and reports how many queued sends were discarded.
//!
//! Glare: when both sides offer simultaneously, the lexicographically
//! smaller participant id becomes the answerer. The smaller side abandons
//! its own offer and answers; the larger side ignores the incoming offer
//! and keeps waiting.

use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use crate::chunk::{split_into_chunks, ReassemblyBuffer, CHUNK_SIZE};
use crate::control::{CandidateInfo, ControlMessage, SessionDescription, PROTOCOL_VERSION};
use crate::message::{generate_message_id, DataFrame, Message, TransportHint};

// ── Constants ───────────────────────────────────────────────

/// How long a negotiation round may run before it is failed.
pub const NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(30);

/// Total connection attempts against one remote before giving up.
/// The initial offer counts as attempt 1.
pub const MAX_ATTEMPTS: u32 = 5;

// ── States and roles ────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    /// Initiating side, waiting for its listener to bind.
    Offering,
    /// Offer sent, waiting for the answer.
    AwaitingAnswer,
    /// Descriptions exchanged, waiting for the transport to connect.
    Connecting,
    Open,
    /// Teardown requested, waiting for the transport-closed event.
    Closing,
    Closed,
    /// Transient: a failing event passes through here and leaves the
    /// session in `Offering` (restart) or `Closed` (attempts exhausted).
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Offerer,
    Answerer,
}

// ── Events and actions ──────────────────────────────────────

/// Inputs to the state machine. Control payloads arrive already decoded;
/// JSON that fails to decode at all is dropped by the manager and never
/// reaches the session.
#[derive(Debug)]
pub enum Event {
    /// Local request to open the channel.
    Initiate,
    /// The offerer's listener is bound; these are its dialable addresses.
    ListenerBound { candidates: Vec<String> },
    /// A control message for this session, routed by the relay.
    ControlReceived(ControlMessage),
    /// Direct transport established (inbound accept or successful dial).
    TransportConnected,
    /// Direct transport ended.
    TransportClosed { reason: String },
    /// One frame of text from the direct transport.
    FrameReceived(String),
    /// Local send. `message.payload` is already wire ciphertext.
    SendRequest { message: Message },
    /// The negotiation timer fired.
    NegotiationTimeout { generation: u64 },
    /// Local request to close the channel.
    Teardown,
}

/// Outputs the manager interprets. The session never performs I/O itself.
#[derive(Debug, PartialEq)]
pub enum Action {
    /// Route a control message to the remote via the relay.
    SendControl(ControlMessage),
    /// Bind a listener for inbound direct connections.
    BindListener,
    /// Dial (or record) a remote transport candidate.
    ApplyCandidate(CandidateInfo),
    /// Arm the negotiation timer. Supersedes any previous generation.
    ArmTimer { generation: u64, duration: Duration },
    CancelTimer,
    /// Write one frame to the open direct transport.
    TransmitFrame(String),
    /// Close the direct transport and any bound listener.
    CloseTransport,
    /// Hand a received message up (payload still ciphertext; the manager
    /// decrypts before the observer sees it).
    DeliverMessage(Message),
    /// The remote acknowledged reading this message id.
    NotifyRead { message_id: String },
    /// Channel status for the observer.
    NotifyStatus { active: bool },
    /// Queued sends discarded on terminal close. Never silent.
    ReportDiscarded { count: usize },
}

// ── Error type ──────────────────────────────────────────────

#[derive(Debug, PartialEq)]
pub enum SessionError {
    /// Initiate while a negotiation or channel is already in flight.
    NotIdle { state: SessionState },
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::NotIdle { state } => {
                write!(f, "cannot initiate: session is {:?}", state)
            }
        }
    }
}

impl std::error::Error for SessionError {}

// ── Session ─────────────────────────────────────────────────

/// One logical channel session per (local, remote) pair.
pub struct ChannelSession {
    local_id: String,
    remote_id: String,
    /// Local public key, base64 — published inside descriptions.
    local_public_key: String,

    state: SessionState,
    role: Option<Role>,
    /// Token of the current negotiation round (the offer's token).
    session_token: Option<String>,
    remote_description: Option<SessionDescription>,
    /// Candidates that arrived before the remote description, in arrival
    /// order.
    pending_candidates: Vec<CandidateInfo>,
    /// Staged between `start_offer` and the offer going out on
    /// `ListenerBound`.
    restart_pending: bool,
    /// The transport connected before the answer arrived (the answerer
    /// dials as soon as it has a candidate, so its connection can beat
    /// the answer frame through the relay).
    transport_ready: bool,

    outbound_queue: VecDeque<Message>,
    reassembly: ReassemblyBuffer,

    attempts: u32,
    timer_generation: u64,
}

impl ChannelSession {
    pub fn new(local_id: &str, remote_id: &str, local_public_key: &str) -> Self {
        Self {
            local_id: local_id.to_string(),
            remote_id: remote_id.to_string(),
            local_public_key: local_public_key.to_string(),
            state: SessionState::Idle,
            role: None,
            session_token: None,
            remote_description: None,
            pending_candidates: Vec::new(),
            restart_pending: false,
            transport_ready: false,
            outbound_queue: VecDeque::new(),
            reassembly: ReassemblyBuffer::new(),
            attempts: 0,
            timer_generation: 0,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn remote_id(&self) -> &str {
        &self.remote_id
    }

    pub fn queued(&self) -> usize {
        self.outbound_queue.len()
    }

    /// Public key from the remote's description, once one is applied.
    pub fn remote_public_key(&self) -> Option<&str> {
        self.remote_description.as_ref().map(|d| d.public_key.as_str())
    }

    /// Whether this side answers (dials) rather than offers (listens).
    pub fn is_answerer(&self) -> bool {
        self.role == Some(Role::Answerer)
    }

    /// Process one event. Only `Initiate` can be rejected; every other
    /// event degrades to logged drops or the failure path.
    pub fn handle(&mut self, event: Event) -> Result<Vec<Action>, SessionError> {
        match event {
            Event::Initiate => self.on_initiate(),
            Event::ListenerBound { candidates } => Ok(self.on_listener_bound(candidates)),
            Event::ControlReceived(msg) => Ok(self.on_control(msg)),
            Event::TransportConnected => Ok(self.on_transport_connected()),
            Event::TransportClosed { reason } => Ok(self.on_transport_closed(&reason)),
            Event::FrameReceived(frame) => Ok(self.on_frame(&frame)),
            Event::SendRequest { message } => Ok(self.on_send(message)),
            Event::NegotiationTimeout { generation } => Ok(self.on_timeout(generation)),
            Event::Teardown => Ok(self.on_teardown()),
        }
    }

    // ── Initiation and restart ──────────────────────────────

    fn on_initiate(&mut self) -> Result<Vec<Action>, SessionError> {
        match self.state {
            SessionState::Idle | SessionState::Closed => {}
            state => return Err(SessionError::NotIdle { state }),
        }
        self.attempts = 1;
        Ok(self.start_offer(false))
    }

    /// Enter `Offering`: new round token, new timer generation, bind a
    /// listener. The offer itself goes out once the listener is bound.
    fn start_offer(&mut self, restart: bool) -> Vec<Action> {
        self.state = SessionState::Offering;
        self.role = Some(Role::Offerer);
        self.session_token = Some(generate_message_id());
        self.remote_description = None;
        self.pending_candidates.clear();
        self.restart_pending = restart;
        self.transport_ready = false;
        self.timer_generation += 1;
        vec![
            Action::BindListener,
            Action::ArmTimer {
                generation: self.timer_generation,
                duration: NEGOTIATION_TIMEOUT,
            },
        ]
    }

    fn on_listener_bound(&mut self, candidates: Vec<String>) -> Vec<Action> {
        if self.state != SessionState::Offering {
            eprintln!(
                "[session] {}→{}: listener bound in {:?}, ignoring",
                self.local_id, self.remote_id, self.state
            );
            return Vec::new();
        }
        let token = self
            .session_token
            .clone()
            .expect("BUG: Offering without a round token");

        self.state = SessionState::AwaitingAnswer;
        let mut actions = vec![Action::SendControl(ControlMessage::Offer {
            target: self.remote_id.clone(),
            source: self.local_id.clone(),
            offer: SessionDescription {
                version: PROTOCOL_VERSION,
                session_token: token.clone(),
                public_key: self.local_public_key.clone(),
                restart: self.restart_pending,
            },
        })];
        for address in candidates {
            actions.push(Action::SendControl(ControlMessage::Candidate {
                target: self.remote_id.clone(),
                source: self.local_id.clone(),
                candidate: CandidateInfo {
                    address,
                    session_token: token.clone(),
                },
            }));
        }
        actions
    }

    // ── Control handling ────────────────────────────────────

    fn on_control(&mut self, msg: ControlMessage) -> Vec<Action> {
        match msg {
            ControlMessage::Offer { offer, .. } => self.on_offer(offer),
            ControlMessage::Answer { answer, .. } => self.on_answer(answer),
            ControlMessage::Candidate { candidate, .. } => self.on_candidate(candidate),
            ControlMessage::Reject { .. } => self.on_reject(),
            other => {
                // call-* kinds belong to the call machine, not here.
                eprintln!(
                    "[session] {}→{}: unexpected {} control, dropping",
                    self.local_id,
                    self.remote_id,
                    other.kind()
                );
                Vec::new()
            }
        }
    }

    fn on_offer(&mut self, offer: SessionDescription) -> Vec<Action> {
        if offer.version != PROTOCOL_VERSION {
            eprintln!(
                "[session] {}→{}: offer with protocol version {} (expected {})",
                self.local_id, self.remote_id, offer.version, PROTOCOL_VERSION
            );
            return self.fail();
        }
        match self.state {
            SessionState::Idle | SessionState::Closed => {
                if self.attempts == 0 {
                    self.attempts = 1;
                }
                self.answer_offer(offer)
            }
            SessionState::Offering | SessionState::AwaitingAnswer => {
                // Glare: smaller id answers, larger id keeps waiting.
                if self.local_id < self.remote_id {
                    eprintln!(
                        "[session] {}→{}: glare, abandoning own offer to answer",
                        self.local_id, self.remote_id
                    );
                    let mut actions = vec![Action::CancelTimer, Action::CloseTransport];
                    actions.extend(self.answer_offer(offer));
                    actions
                } else {
                    eprintln!(
                        "[session] {}→{}: glare, ignoring incoming offer",
                        self.local_id, self.remote_id
                    );
                    Vec::new()
                }
            }
            _ => {
                eprintln!(
                    "[session] {}→{}: offer in {:?}, dropping",
                    self.local_id, self.remote_id, self.state
                );
                Vec::new()
            }
        }
    }

    /// Become the answerer for `offer` and move to `Connecting`.
    fn answer_offer(&mut self, offer: SessionDescription) -> Vec<Action> {
        let token = offer.session_token.clone();
        self.state = SessionState::Connecting;
        self.role = Some(Role::Answerer);
        self.transport_ready = false;
        self.session_token = Some(token.clone());
        self.remote_description = Some(offer);
        self.timer_generation += 1;

        let mut actions = vec![
            Action::SendControl(ControlMessage::Answer {
                target: self.remote_id.clone(),
                source: self.local_id.clone(),
                answer: SessionDescription {
                    version: PROTOCOL_VERSION,
                    session_token: token,
                    public_key: self.local_public_key.clone(),
                    restart: false,
                },
            }),
            Action::ArmTimer {
                generation: self.timer_generation,
                duration: NEGOTIATION_TIMEOUT,
            },
        ];
        actions.extend(self.flush_pending_candidates());
        actions
    }

    fn on_answer(&mut self, answer: SessionDescription) -> Vec<Action> {
        if self.state != SessionState::AwaitingAnswer {
            eprintln!(
                "[session] {}→{}: answer in {:?}, dropping",
                self.local_id, self.remote_id, self.state
            );
            return Vec::new();
        }
        if answer.version != PROTOCOL_VERSION {
            eprintln!(
                "[session] {}→{}: answer with protocol version {} (expected {})",
                self.local_id, self.remote_id, answer.version, PROTOCOL_VERSION
            );
            return self.fail();
        }
        if Some(&answer.session_token) != self.session_token.as_ref() {
            eprintln!(
                "[session] {}→{}: answer for a stale round, dropping",
                self.local_id, self.remote_id
            );
            return Vec::new();
        }
        self.state = SessionState::Connecting;
        self.remote_description = Some(answer);
        let mut actions = self.flush_pending_candidates();
        if self.transport_ready {
            // The answerer's dial landed before its answer frame did.
            self.transport_ready = false;
            actions.extend(self.open_channel());
        }
        actions
    }

    fn on_candidate(&mut self, candidate: CandidateInfo) -> Vec<Action> {
        match self.state {
            SessionState::Offering
            | SessionState::AwaitingAnswer
            | SessionState::Idle
            | SessionState::Closed => {
                // No remote description yet: buffer in arrival order.
                self.pending_candidates.push(candidate);
                Vec::new()
            }
            SessionState::Connecting | SessionState::Open => {
                if Some(&candidate.session_token) != self.session_token.as_ref() {
                    eprintln!(
                        "[session] {}→{}: candidate for a stale round, dropping",
                        self.local_id, self.remote_id
                    );
                    return Vec::new();
                }
                vec![Action::ApplyCandidate(candidate)]
            }
            _ => Vec::new(),
        }
    }

    /// Flush buffered candidates in arrival order, right after the remote
    /// description is applied. Candidates from other rounds are dropped.
    fn flush_pending_candidates(&mut self) -> Vec<Action> {
        let token = self.session_token.clone();
        let local_id = self.local_id.clone();
        let remote_id = self.remote_id.clone();
        std::mem::take(&mut self.pending_candidates)
            .into_iter()
            .filter(|c| {
                if Some(&c.session_token) == token.as_ref() {
                    true
                } else {
                    eprintln!(
                        "[session] {}→{}: dropping buffered candidate from a stale round",
                        local_id, remote_id
                    );
                    false
                }
            })
            .map(Action::ApplyCandidate)
            .collect()
    }

    fn on_reject(&mut self) -> Vec<Action> {
        match self.state {
            SessionState::Idle | SessionState::Closed => Vec::new(),
            _ => {
                eprintln!(
                    "[session] {}→{}: remote rejected, closing",
                    self.local_id, self.remote_id
                );
                self.close(false)
            }
        }
    }

    // ── Transport lifecycle ─────────────────────────────────

    fn on_transport_connected(&mut self) -> Vec<Action> {
        match self.state {
            SessionState::Connecting => self.open_channel(),
            SessionState::AwaitingAnswer => {
                // Hold the channel until the answer arrives and pins the
                // remote description.
                self.transport_ready = true;
                Vec::new()
            }
            state => {
                eprintln!(
                    "[session] {}→{}: transport connected in {:?}, ignoring",
                    self.local_id, self.remote_id, state
                );
                Vec::new()
            }
        }
    }

    /// Enter `Open`: cancel the timer, reset attempts, flush queued sends
    /// oldest-first.
    fn open_channel(&mut self) -> Vec<Action> {
        self.state = SessionState::Open;
        self.attempts = 0;

        let mut actions = vec![
            Action::CancelTimer,
            Action::NotifyStatus { active: true },
        ];
        let queued: Vec<Message> = self.outbound_queue.drain(..).collect();
        for message in queued {
            actions.extend(self.transmit(message));
        }
        actions
    }

    fn on_transport_closed(&mut self, reason: &str) -> Vec<Action> {
        match self.state {
            SessionState::Closing => {
                self.state = SessionState::Closed;
                self.clear_round_state();
                vec![Action::NotifyStatus { active: false }]
            }
            SessionState::Connecting | SessionState::Open => {
                eprintln!(
                    "[session] {}→{}: transport closed ({}), entering recovery",
                    self.local_id, self.remote_id, reason
                );
                self.fail()
            }
            _ => {
                self.transport_ready = false;
                Vec::new()
            }
        }
    }

    fn on_timeout(&mut self, generation: u64) -> Vec<Action> {
        if generation != self.timer_generation {
            // A restart re-armed the timer; this firing is stale.
            return Vec::new();
        }
        match self.state {
            SessionState::Offering | SessionState::AwaitingAnswer | SessionState::Connecting => {
                eprintln!(
                    "[session] {}→{}: negotiation timed out",
                    self.local_id, self.remote_id
                );
                self.fail()
            }
            _ => Vec::new(),
        }
    }

    // ── Failure and reconnection ────────────────────────────

    /// Failure path shared by timeout, transport loss, and bad-version
    /// descriptions. Restarts with a fresh offer while attempts remain,
    /// otherwise closes and reports the discarded queue.
    fn fail(&mut self) -> Vec<Action> {
        self.state = SessionState::Failed;
        if self.attempts < MAX_ATTEMPTS {
            self.attempts += 1;
            eprintln!(
                "[session] {}→{}: reconnecting, attempt {}/{}",
                self.local_id, self.remote_id, self.attempts, MAX_ATTEMPTS
            );
            let mut actions = vec![Action::CloseTransport];
            actions.extend(self.start_offer(true));
            actions
        } else {
            let discarded = self.outbound_queue.len();
            eprintln!(
                "[session] {}→{}: giving up after {} attempts, discarding {} queued sends",
                self.local_id, self.remote_id, self.attempts, discarded
            );
            let mut actions = self.close(false);
            actions.push(Action::ReportDiscarded { count: discarded });
            actions
        }
    }

    // ── Teardown ────────────────────────────────────────────

    fn on_teardown(&mut self) -> Vec<Action> {
        match self.state {
            SessionState::Idle | SessionState::Closed => Vec::new(),
            _ => {
                let mut actions = vec![Action::SendControl(ControlMessage::Reject {
                    target: self.remote_id.clone(),
                    source: self.local_id.clone(),
                })];
                actions.extend(self.close(true));
                actions
            }
        }
    }

    /// Common close path: cancel the timer, close the transport, drop all
    /// per-round buffers. With `await_transport`, an open transport keeps
    /// the session in `Closing` until its closed event arrives.
    fn close(&mut self, await_transport: bool) -> Vec<Action> {
        let had_transport = matches!(
            self.state,
            SessionState::Connecting | SessionState::Open
        );
        let mut actions = vec![Action::CancelTimer, Action::CloseTransport];

        if await_transport && had_transport {
            self.state = SessionState::Closing;
        } else {
            self.state = SessionState::Closed;
            actions.push(Action::NotifyStatus { active: false });
        }
        self.clear_round_state();
        actions
    }

    fn clear_round_state(&mut self) {
        self.session_token = None;
        self.remote_description = None;
        self.pending_candidates.clear();
        self.outbound_queue.clear();
        self.reassembly.clear();
        self.role = None;
        self.restart_pending = false;
        self.transport_ready = false;
    }

    // ── Data path ───────────────────────────────────────────

    fn on_send(&mut self, message: Message) -> Vec<Action> {
        if self.state == SessionState::Open {
            self.transmit(message)
        } else {
            self.outbound_queue.push_back(message);
            Vec::new()
        }
    }

    /// Serialize the message envelope; split into chunk frames when it
    /// exceeds the size threshold.
    fn transmit(&self, message: Message) -> Vec<Action> {
        let message_id = message.id.clone();
        let envelope = match serde_json::to_string(&DataFrame::Message { message }) {
            Ok(json) => json,
            Err(e) => {
                eprintln!(
                    "[session] {}→{}: envelope serialization failed: {}",
                    self.local_id, self.remote_id, e
                );
                return Vec::new();
            }
        };
        if envelope.len() <= CHUNK_SIZE {
            return vec![Action::TransmitFrame(envelope)];
        }

        split_into_chunks(&message_id, &envelope)
            .into_iter()
            .filter_map(|chunk| match serde_json::to_string(&DataFrame::Chunk(chunk)) {
                Ok(json) => Some(Action::TransmitFrame(json)),
                Err(e) => {
                    eprintln!(
                        "[session] {}→{}: chunk serialization failed: {}",
                        self.local_id, self.remote_id, e
                    );
                    None
                }
            })
            .collect()
    }

    fn on_frame(&mut self, frame: &str) -> Vec<Action> {
        let parsed: DataFrame = match serde_json::from_str(frame) {
            Ok(f) => f,
            Err(e) => {
                eprintln!(
                    "[session] {}→{}: unparseable frame, dropping: {}",
                    self.local_id, self.remote_id, e
                );
                return Vec::new();
            }
        };
        match parsed {
            DataFrame::Message { mut message } => {
                message.transport_hint = TransportHint::Direct;
                vec![Action::DeliverMessage(message)]
            }
            DataFrame::Chunk(env) => match self.reassembly.accept(env) {
                Ok(Some(envelope)) => self.on_frame(&envelope),
                Ok(None) => Vec::new(),
                Err(e) => {
                    eprintln!(
                        "[session] {}→{}: chunk rejected, dropping message: {}",
                        self.local_id, self.remote_id, e
                    );
                    Vec::new()
                }
            },
            DataFrame::ReadAck { message_id } => vec![Action::NotifyRead { message_id }],
        }
    }
}

// ── Tests ───────────────────────────────────────────────────
