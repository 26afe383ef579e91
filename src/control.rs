//! Control-plane wire types: negotiation signals and relay frames.
//!
//! One tagged envelope per message kind — routing and dispatch go through
//! typed enums, never field-presence sniffing. Control messages are
//! forwarded by the relay to a live target only; an `offer` to an offline
//! target has store-and-notify fallback semantics (see relay module),
//! while the other kinds are meaningless once the offerer's session has
//! likely timed out and are dropped.

use serde::{Deserialize, Serialize};

use crate::message::Message;

// ── Constants ───────────────────────────────────────────────

/// Current negotiation protocol version. A description carrying any
/// other version is a negotiation failure for that session.
pub const PROTOCOL_VERSION: u32 = 1;

// ── Negotiation payloads ────────────────────────────────────

/// Transport capability description (SDP-equivalent). Carried by offers
/// and answers; candidates trickle separately.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SessionDescription {
    pub version: u32,
    /// Random token binding this negotiation round; candidates and the
    /// answer must echo it.
    pub session_token: String,
    /// Sender's public key, base64 — pre-exchanged here so the first
    /// data frame can already be encrypted.
    pub public_key: String,
    /// Set on reconnection restarts (ICE-restart equivalent).
    pub restart: bool,
}

/// One transport candidate: a dialable socket address.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CandidateInfo {
    pub address: String,
    /// Token of the negotiation round this candidate belongs to.
    pub session_token: String,
}

// ── Control messages ────────────────────────────────────────

/// Control message routed by the relay between exactly two participants.
/// The `call-*` kinds drive the media-call machine, which shares this
/// routing and nothing else.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type")]
pub enum ControlMessage {
    #[serde(rename = "offer")]
    Offer {
        target: String,
        source: String,
        offer: SessionDescription,
    },

    #[serde(rename = "answer")]
    Answer {
        target: String,
        source: String,
        answer: SessionDescription,
    },

    #[serde(rename = "candidate")]
    Candidate {
        target: String,
        source: String,
        candidate: CandidateInfo,
    },

    #[serde(rename = "reject")]
    Reject { target: String, source: String },

    #[serde(rename = "call-offer")]
    CallOffer {
        target: String,
        source: String,
        offer: SessionDescription,
    },

    #[serde(rename = "call-answer")]
    CallAnswer {
        target: String,
        source: String,
        answer: SessionDescription,
    },

    #[serde(rename = "call-reject")]
    CallReject { target: String, source: String },
}

impl ControlMessage {
    pub fn target(&self) -> &str {
        match self {
            Self::Offer { target, .. }
            | Self::Answer { target, .. }
            | Self::Candidate { target, .. }
            | Self::Reject { target, .. }
            | Self::CallOffer { target, .. }
            | Self::CallAnswer { target, .. }
            | Self::CallReject { target, .. } => target,
        }
    }

    pub fn source(&self) -> &str {
        match self {
            Self::Offer { source, .. }
            | Self::Answer { source, .. }
            | Self::Candidate { source, .. }
            | Self::Reject { source, .. }
            | Self::CallOffer { source, .. }
            | Self::CallAnswer { source, .. }
            | Self::CallReject { source, .. } => source,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Offer { .. } => "offer",
            Self::Answer { .. } => "answer",
            Self::Candidate { .. } => "candidate",
            Self::Reject { .. } => "reject",
            Self::CallOffer { .. } => "call-offer",
            Self::CallAnswer { .. } => "call-answer",
            Self::CallReject { .. } => "call-reject",
        }
    }

    /// True for kinds that are dropped when the target is offline.
    /// Only a data-channel `offer` has an offline fallback (the relay
    /// synthesizes a connection-request notification).
    pub fn is_live_only(&self) -> bool {
        !matches!(self, Self::Offer { .. })
    }

    /// True for the media-call kinds.
    pub fn is_call(&self) -> bool {
        matches!(
            self,
            Self::CallOffer { .. } | Self::CallAnswer { .. } | Self::CallReject { .. }
        )
    }
}

// ── Client ↔ relay frames ───────────────────────────────────

/// Frames a client sends to the relay.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type")]
pub enum ClientFrame {
    /// First frame on a connection: binds the participant id and
    /// publishes the public key.
    #[serde(rename = "register")]
    Register {
        participant_id: String,
        public_key: String,
    },

    #[serde(rename = "control")]
    Control { control: ControlMessage },

    /// Application message for relay delivery (recipient offline, or
    /// no direct channel). Payload is already wire ciphertext.
    #[serde(rename = "message")]
    AppMessage { message: Message },

    /// Explicit read acknowledgment; deletes the stored row.
    #[serde(rename = "read-ack")]
    ReadAck {
        message_id: String,
        reader_id: String,
    },

    /// Remote key lookup for the KeyDirectory.
    #[serde(rename = "key-lookup")]
    KeyLookup { participant_id: String },
}

/// Frames the relay sends to a client.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type")]
pub enum RelayFrame {
    #[serde(rename = "registered")]
    Registered { participant_id: String },

    #[serde(rename = "control")]
    Control { control: ControlMessage },

    /// Live forward or offline flush of an application message.
    #[serde(rename = "delivery")]
    Delivery { message: Message },

    #[serde(rename = "key-result")]
    KeyResult {
        participant_id: String,
        public_key: Option<String>,
    },

    #[serde(rename = "error")]
    Error { message: String },
}

// ── Tests ───────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn description() -> SessionDescription {
        SessionDescription {
            version: PROTOCOL_VERSION,
            session_token: "tok-1".to_string(),
            public_key: "AAAA".to_string(),
            restart: false,
        }
    }

    #[test]
    fn offer_wire_shape() {
        let msg = ControlMessage::Offer {
            target: "u2".to_string(),
            source: "u1".to_string(),
            offer: description(),
        };
        let json: serde_json::Value = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "offer");
        assert_eq!(json["target"], "u2");
        assert_eq!(json["source"], "u1");
        assert_eq!(json["offer"]["version"], 1);
        assert_eq!(json["offer"]["restart"], false);
    }

    #[test]
    fn control_roundtrip_all_kinds() {
        let kinds = vec![
            ControlMessage::Offer {
                target: "b".into(),
                source: "a".into(),
                offer: description(),
            },
            ControlMessage::Answer {
                target: "a".into(),
                source: "b".into(),
                answer: description(),
            },
            ControlMessage::Candidate {
                target: "b".into(),
                source: "a".into(),
                candidate: CandidateInfo {
                    address: "192.168.1.10:45000".into(),
                    session_token: "tok-1".into(),
                },
            },
            ControlMessage::Reject {
                target: "a".into(),
                source: "b".into(),
            },
            ControlMessage::CallOffer {
                target: "b".into(),
                source: "a".into(),
                offer: description(),
            },
            ControlMessage::CallAnswer {
                target: "a".into(),
                source: "b".into(),
                answer: description(),
            },
            ControlMessage::CallReject {
                target: "a".into(),
                source: "b".into(),
            },
        ];
        for msg in kinds {
            let json = serde_json::to_string(&msg).unwrap();
            let decoded: ControlMessage = serde_json::from_str(&json).unwrap();
            assert_eq!(decoded, msg);
        }
    }

    #[test]
    fn offline_fallback_only_for_offer() {
        let offer = ControlMessage::Offer {
            target: "b".into(),
            source: "a".into(),
            offer: description(),
        };
        assert!(!offer.is_live_only());

        let answer = ControlMessage::Answer {
            target: "a".into(),
            source: "b".into(),
            answer: description(),
        };
        assert!(answer.is_live_only());

        let reject = ControlMessage::Reject {
            target: "a".into(),
            source: "b".into(),
        };
        assert!(reject.is_live_only());
    }

    #[test]
    fn routing_accessors() {
        let msg = ControlMessage::Candidate {
            target: "u2".into(),
            source: "u1".into(),
            candidate: CandidateInfo {
                address: "10.0.0.5:9000".into(),
                session_token: "tok".into(),
            },
        };
        assert_eq!(msg.target(), "u2");
        assert_eq!(msg.source(), "u1");
        assert_eq!(msg.kind(), "candidate");
        assert!(!msg.is_call());
    }

    #[test]
    fn call_kinds_are_flagged() {
        let msg = ControlMessage::CallReject {
            target: "u2".into(),
            source: "u1".into(),
        };
        assert!(msg.is_call());
        assert!(msg.is_live_only());
    }

    #[test]
    fn unknown_frame_type_is_a_parse_error() {
        let json = r#"{"type":"mystery","target":"b","source":"a"}"#;
        assert!(serde_json::from_str::<ControlMessage>(json).is_err());
        assert!(serde_json::from_str::<ClientFrame>(json).is_err());
    }

    #[test]
    fn client_frame_register_shape() {
        let frame = ClientFrame::Register {
            participant_id: "u1".to_string(),
            public_key: "cGs=".to_string(),
        };
        let json: serde_json::Value = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["type"], "register");
        assert_eq!(json["participant_id"], "u1");
    }

    #[test]
    fn relay_frame_key_result_roundtrip() {
        let frame = RelayFrame::KeyResult {
            participant_id: "u2".to_string(),
            public_key: None,
        };
        let json = serde_json::to_string(&frame).unwrap();
        let decoded: RelayFrame = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, frame);
    }
}
