//! Media call negotiation machine.
//!
//! `Idle → Dialing → Ringing → InCall → Ended`. Shares the relay's
//! control routing (the `call-*` kinds) with the data channel, and nothing
//! else — no chunking, no encryption pipeline, no reconnection policy.
//! Media itself is out of scope; this machine negotiates and tracks call
//! state at the interface.
//!
//! Glare follows the channel rule: the lexicographically smaller
//! participant id becomes the answerer.

use crate::control::{ControlMessage, SessionDescription, PROTOCOL_VERSION};
use crate::message::generate_message_id;

// ── States ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Idle,
    /// We sent a call-offer and wait for the answer.
    Dialing,
    /// We received a call-offer and wait for local accept/reject.
    Ringing,
    InCall,
    Ended,
}

// ── Events and actions ──────────────────────────────────────

#[derive(Debug)]
pub enum CallEvent {
    /// Local request to start a call.
    Dial,
    /// Local accept of a ringing call.
    Accept,
    /// Local hang-up or refusal.
    HangUp,
    /// A `call-*` control message routed by the relay.
    ControlReceived(ControlMessage),
}

#[derive(Debug, PartialEq)]
pub enum CallAction {
    SendControl(ControlMessage),
    NotifyRinging,
    NotifyConnected,
    NotifyEnded,
}

// ── Call session ────────────────────────────────────────────

pub struct CallSession {
    local_id: String,
    remote_id: String,
    local_public_key: String,
    state: CallState,
    session_token: Option<String>,
}

impl CallSession {
    pub fn new(local_id: &str, remote_id: &str, local_public_key: &str) -> Self {
        Self {
            local_id: local_id.to_string(),
            remote_id: remote_id.to_string(),
            local_public_key: local_public_key.to_string(),
            state: CallState::Idle,
            session_token: None,
        }
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    pub fn handle(&mut self, event: CallEvent) -> Vec<CallAction> {
        match event {
            CallEvent::Dial => self.on_dial(),
            CallEvent::Accept => self.on_accept(),
            CallEvent::HangUp => self.on_hang_up(),
            CallEvent::ControlReceived(msg) => self.on_control(msg),
        }
    }

    fn description(&self, token: &str) -> SessionDescription {
        SessionDescription {
            version: PROTOCOL_VERSION,
            session_token: token.to_string(),
            public_key: self.local_public_key.clone(),
            restart: false,
        }
    }

    fn on_dial(&mut self) -> Vec<CallAction> {
        match self.state {
            CallState::Idle | CallState::Ended => {}
            _ => {
                eprintln!(
                    "[call] {}→{}: dial in {:?}, ignoring",
                    self.local_id, self.remote_id, self.state
                );
                return Vec::new();
            }
        }
        let token = generate_message_id();
        self.state = CallState::Dialing;
        self.session_token = Some(token.clone());
        vec![CallAction::SendControl(ControlMessage::CallOffer {
            target: self.remote_id.clone(),
            source: self.local_id.clone(),
            offer: self.description(&token),
        })]
    }

    fn on_accept(&mut self) -> Vec<CallAction> {
        if self.state != CallState::Ringing {
            return Vec::new();
        }
        let token = self
            .session_token
            .clone()
            .expect("BUG: Ringing without a call token");
        self.state = CallState::InCall;
        vec![
            CallAction::SendControl(ControlMessage::CallAnswer {
                target: self.remote_id.clone(),
                source: self.local_id.clone(),
                answer: self.description(&token),
            }),
            CallAction::NotifyConnected,
        ]
    }

    fn on_hang_up(&mut self) -> Vec<CallAction> {
        match self.state {
            CallState::Idle | CallState::Ended => Vec::new(),
            _ => {
                self.state = CallState::Ended;
                self.session_token = None;
                vec![
                    CallAction::SendControl(ControlMessage::CallReject {
                        target: self.remote_id.clone(),
                        source: self.local_id.clone(),
                    }),
                    CallAction::NotifyEnded,
                ]
            }
        }
    }

    fn on_control(&mut self, msg: ControlMessage) -> Vec<CallAction> {
        match msg {
            ControlMessage::CallOffer { offer, .. } => self.on_call_offer(offer),
            ControlMessage::CallAnswer { answer, .. } => self.on_call_answer(answer),
            ControlMessage::CallReject { .. } => self.on_call_reject(),
            other => {
                eprintln!(
                    "[call] {}→{}: unexpected {} control, dropping",
                    self.local_id,
                    self.remote_id,
                    other.kind()
                );
                Vec::new()
            }
        }
    }

    fn on_call_offer(&mut self, offer: SessionDescription) -> Vec<CallAction> {
        match self.state {
            CallState::Idle | CallState::Ended => {
                self.state = CallState::Ringing;
                self.session_token = Some(offer.session_token);
                vec![CallAction::NotifyRinging]
            }
            CallState::Dialing => {
                // Glare: smaller id answers, larger id keeps dialing.
                if self.local_id < self.remote_id {
                    eprintln!(
                        "[call] {}→{}: call glare, abandoning own dial",
                        self.local_id, self.remote_id
                    );
                    self.state = CallState::Ringing;
                    self.session_token = Some(offer.session_token);
                    vec![CallAction::NotifyRinging]
                } else {
                    Vec::new()
                }
            }
            _ => Vec::new(),
        }
    }

    fn on_call_answer(&mut self, answer: SessionDescription) -> Vec<CallAction> {
        if self.state != CallState::Dialing {
            return Vec::new();
        }
        if Some(&answer.session_token) != self.session_token.as_ref() {
            eprintln!(
                "[call] {}→{}: answer for a stale call, dropping",
                self.local_id, self.remote_id
            );
            return Vec::new();
        }
        self.state = CallState::InCall;
        vec![CallAction::NotifyConnected]
    }

    fn on_call_reject(&mut self) -> Vec<CallAction> {
        match self.state {
            CallState::Dialing | CallState::Ringing | CallState::InCall => {
                self.state = CallState::Ended;
                self.session_token = None;
                vec![CallAction::NotifyEnded]
            }
            _ => Vec::new(),
        }
    }
}

// ── Tests ───────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn call(local: &str, remote: &str) -> CallSession {
        CallSession::new(local, remote, "pk-local")
    }

    fn call_offer(token: &str) -> ControlMessage {
        ControlMessage::CallOffer {
            target: "a".into(),
            source: "b".into(),
            offer: SessionDescription {
                version: PROTOCOL_VERSION,
                session_token: token.into(),
                public_key: "pk-remote".into(),
                restart: false,
            },
        }
    }

    fn dialed_token(actions: &[CallAction]) -> String {
        match &actions[0] {
            CallAction::SendControl(ControlMessage::CallOffer { offer, .. }) => {
                offer.session_token.clone()
            }
            other => panic!("expected call-offer, got {:?}", other),
        }
    }

    #[test]
    fn dial_answer_connects() {
        let mut caller = call("a", "b");
        let token = dialed_token(&caller.handle(CallEvent::Dial));
        assert_eq!(caller.state(), CallState::Dialing);

        let actions = caller.handle(CallEvent::ControlReceived(ControlMessage::CallAnswer {
            target: "a".into(),
            source: "b".into(),
            answer: SessionDescription {
                version: PROTOCOL_VERSION,
                session_token: token,
                public_key: "pk-remote".into(),
                restart: false,
            },
        }));
        assert_eq!(actions, vec![CallAction::NotifyConnected]);
        assert_eq!(caller.state(), CallState::InCall);
    }

    #[test]
    fn incoming_offer_rings_then_accept_answers() {
        let mut callee = call("a", "b");
        let actions = callee.handle(CallEvent::ControlReceived(call_offer("tok-1")));
        assert_eq!(actions, vec![CallAction::NotifyRinging]);
        assert_eq!(callee.state(), CallState::Ringing);

        let actions = callee.handle(CallEvent::Accept);
        assert!(matches!(
            &actions[0],
            CallAction::SendControl(ControlMessage::CallAnswer { answer, .. })
                if answer.session_token == "tok-1"
        ));
        assert_eq!(actions[1], CallAction::NotifyConnected);
        assert_eq!(callee.state(), CallState::InCall);
    }

    #[test]
    fn hang_up_sends_reject_and_ends() {
        let mut s = call("a", "b");
        s.handle(CallEvent::Dial);
        let actions = s.handle(CallEvent::HangUp);
        assert!(matches!(
            actions[0],
            CallAction::SendControl(ControlMessage::CallReject { .. })
        ));
        assert_eq!(actions[1], CallAction::NotifyEnded);
        assert_eq!(s.state(), CallState::Ended);
    }

    #[test]
    fn remote_reject_ends_dialing_call() {
        let mut s = call("a", "b");
        s.handle(CallEvent::Dial);
        let actions = s.handle(CallEvent::ControlReceived(ControlMessage::CallReject {
            target: "a".into(),
            source: "b".into(),
        }));
        assert_eq!(actions, vec![CallAction::NotifyEnded]);
        assert_eq!(s.state(), CallState::Ended);
    }

    #[test]
    fn glare_smaller_id_switches_to_ringing() {
        let mut s = call("a", "b"); // "a" < "b": we answer
        s.handle(CallEvent::Dial);
        let actions = s.handle(CallEvent::ControlReceived(call_offer("tok-remote")));
        assert_eq!(actions, vec![CallAction::NotifyRinging]);
        assert_eq!(s.state(), CallState::Ringing);
    }

    #[test]
    fn glare_larger_id_keeps_dialing() {
        let mut s = call("b", "a"); // "b" > "a": we keep dialing
        s.handle(CallEvent::Dial);
        let actions = s.handle(CallEvent::ControlReceived(ControlMessage::CallOffer {
            target: "b".into(),
            source: "a".into(),
            offer: SessionDescription {
                version: PROTOCOL_VERSION,
                session_token: "tok-remote".into(),
                public_key: "pk-remote".into(),
                restart: false,
            },
        }));
        assert!(actions.is_empty());
        assert_eq!(s.state(), CallState::Dialing);
    }

    #[test]
    fn stale_answer_is_dropped() {
        let mut s = call("a", "b");
        s.handle(CallEvent::Dial);
        let actions = s.handle(CallEvent::ControlReceived(ControlMessage::CallAnswer {
            target: "a".into(),
            source: "b".into(),
            answer: SessionDescription {
                version: PROTOCOL_VERSION,
                session_token: "wrong".into(),
                public_key: "pk-remote".into(),
                restart: false,
            },
        }));
        assert!(actions.is_empty());
        assert_eq!(s.state(), CallState::Dialing);
    }

    #[test]
    fn ended_call_can_redial() {
        let mut s = call("a", "b");
        s.handle(CallEvent::Dial);
        s.handle(CallEvent::HangUp);
        assert_eq!(s.state(), CallState::Ended);
        let actions = s.handle(CallEvent::Dial);
        assert!(!actions.is_empty());
        assert_eq!(s.state(), CallState::Dialing);
    }
}
