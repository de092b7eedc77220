use serde::{Deserialize, Serialize};

use crate::identity::PeerIdentity;

/// Negotiation traffic exchanged through the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalMessage {
    Offer { sdp: String },
    Answer { sdp: String },
    Candidate { candidate: String },
    Disconnect,
    /// Any kind this build does not understand. Never sent.
    #[serde(other)]
    Unrecognized,
}

impl SignalMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            SignalMessage::Offer { .. } => "offer",
            SignalMessage::Answer { .. } => "answer",
            SignalMessage::Candidate { .. } => "candidate",
            SignalMessage::Disconnect => "disconnect",
            SignalMessage::Unrecognized => "unrecognized",
        }
    }
}

/// Outbound relay payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayEnvelope {
    #[serde(rename = "src")]
    pub source: PeerIdentity,
    #[serde(rename = "dst")]
    pub destination: PeerIdentity,
    #[serde(rename = "msg")]
    pub message: SignalMessage,
}

/// Inbound relay event delivered by the subscription stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundSignal {
    #[serde(rename = "src")]
    pub source: PeerIdentity,
    #[serde(rename = "msg")]
    pub message: SignalMessage,
}

impl InboundSignal {
    pub fn new(source: PeerIdentity, message: SignalMessage) -> Self {
        Self { source, message }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn wire_shape_matches_relay_protocol() {
        let envelope = RelayEnvelope {
            source: PeerIdentity::new("alice", "chat"),
            destination: PeerIdentity::new("bob", "chat"),
            message: SignalMessage::Candidate {
                candidate: "candidate:1 1 udp 2122260223 10.0.0.2 54321 typ host".into(),
            },
        };
        assert_eq!(
            serde_json::to_value(&envelope).expect("serialize"),
            json!({
                "src": {"user": "alice", "app": "chat"},
                "dst": {"user": "bob", "app": "chat"},
                "msg": {
                    "type": "candidate",
                    "candidate": "candidate:1 1 udp 2122260223 10.0.0.2 54321 typ host"
                }
            })
        );
    }

    #[test]
    fn unknown_kinds_decode_as_unrecognized() {
        let inbound: InboundSignal = serde_json::from_value(json!({
            "src": {"user": "bob", "app": "chat"},
            "msg": {"type": "renegotiate", "sdp": "v=0"}
        }))
        .expect("decode");
        assert_eq!(inbound.message, SignalMessage::Unrecognized);
        assert_eq!(inbound.message.kind(), "unrecognized");
    }

    #[test]
    fn disconnect_has_no_payload() {
        let value = serde_json::to_value(SignalMessage::Disconnect).expect("serialize");
        assert_eq!(value, json!({"type": "disconnect"}));
    }
}
