//! Message Types für das Signaling-Protokoll
//!
//! Der Relay-Server leitet `offer`, `answer`, `ice-candidate`,
//! `reject` und `hangup` anhand von `target` an den Empfänger weiter.
//! Alle Frames sind JSON-Text mit einem `type` Feld.

use crate::call_engine::CallType;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;

// ============================================================================
// PEER → PEER MESSAGES (über den Relay)
// ============================================================================

/// Nachrichten zwischen zwei Teilnehmern eines Anrufs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SignalMessage {
    /// SDP Offer (Anrufer → Angerufener)
    Offer {
        from: String,
        target: String,
        #[serde(rename = "callId")]
        call_id: Uuid,
        #[serde(rename = "callType")]
        call_type: CallType,
        sdp: String,
    },

    /// SDP Answer (Angerufener → Anrufer)
    Answer {
        from: String,
        target: String,
        #[serde(rename = "callId")]
        call_id: Uuid,
        sdp: String,
    },

    /// ICE Candidate (beide Richtungen)
    IceCandidate {
        from: String,
        target: String,
        #[serde(rename = "callId")]
        call_id: Uuid,
        candidate: RTCIceCandidateInit,
    },

    /// Anruf abgelehnt
    Reject {
        from: String,
        target: String,
        #[serde(rename = "callId")]
        call_id: Uuid,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },

    /// Anruf beendet
    Hangup {
        from: String,
        target: String,
        #[serde(rename = "callId")]
        call_id: Uuid,
    },
}

impl SignalMessage {
    pub fn from(&self) -> &str {
        match self {
            SignalMessage::Offer { from, .. }
            | SignalMessage::Answer { from, .. }
            | SignalMessage::IceCandidate { from, .. }
            | SignalMessage::Reject { from, .. }
            | SignalMessage::Hangup { from, .. } => from,
        }
    }

    pub fn target(&self) -> &str {
        match self {
            SignalMessage::Offer { target, .. }
            | SignalMessage::Answer { target, .. }
            | SignalMessage::IceCandidate { target, .. }
            | SignalMessage::Reject { target, .. }
            | SignalMessage::Hangup { target, .. } => target,
        }
    }

    pub fn call_id(&self) -> Uuid {
        match self {
            SignalMessage::Offer { call_id, .. }
            | SignalMessage::Answer { call_id, .. }
            | SignalMessage::IceCandidate { call_id, .. }
            | SignalMessage::Reject { call_id, .. }
            | SignalMessage::Hangup { call_id, .. } => *call_id,
        }
    }

    /// Event-Name auf dem Kanal
    pub fn event_name(&self) -> &'static str {
        match self {
            SignalMessage::Offer { .. } => "offer",
            SignalMessage::Answer { .. } => "answer",
            SignalMessage::IceCandidate { .. } => "ice-candidate",
            SignalMessage::Reject { .. } => "reject",
            SignalMessage::Hangup { .. } => "hangup",
        }
    }
}

// ============================================================================
// CLIENT → SERVER MESSAGES
// ============================================================================

/// Registrierung beim Relay
#[derive(Debug, Clone, Serialize)]
pub struct RegisterPayload {
    #[serde(rename = "type")]
    pub msg_type: &'static str,
    #[serde(rename = "peerId")]
    pub peer_id: String,
    pub timestamp: i64,
}

impl RegisterPayload {
    pub fn new(peer_id: String, timestamp: i64) -> Self {
        Self {
            msg_type: "register",
            peer_id,
            timestamp,
        }
    }
}

/// Heartbeat
#[derive(Debug, Clone, Serialize)]
pub struct HeartbeatPayload {
    #[serde(rename = "type")]
    pub msg_type: &'static str,
    #[serde(rename = "peerId")]
    pub peer_id: String,
    pub timestamp: i64,
}

impl HeartbeatPayload {
    pub fn new(peer_id: String, timestamp: i64) -> Self {
        Self {
            msg_type: "heartbeat",
            peer_id,
            timestamp,
        }
    }
}

// ============================================================================
// SERVER → CLIENT MESSAGES
// ============================================================================

/// Nachrichten, die der Relay selbst erzeugt
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Erfolgreiche Registrierung
    Registered {
        #[serde(rename = "peerId")]
        peer_id: String,
    },

    /// Fehler
    Error { code: i32, message: String },

    /// Heartbeat Antwort
    Pong,
}

/// Eingehender Frame: weitergeleitete Peer-Nachricht oder Server-Nachricht
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum InboundFrame {
    Signal(SignalMessage),
    Server(ServerMessage),
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_offer_wire_format() {
        let call_id = Uuid::new_v4();
        let msg = SignalMessage::Offer {
            from: "alice".to_string(),
            target: "bob".to_string(),
            call_id,
            call_type: CallType::Video,
            sdp: "v=0".to_string(),
        };

        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "offer",
                "from": "alice",
                "target": "bob",
                "callId": call_id.to_string(),
                "callType": "video",
                "sdp": "v=0"
            })
        );
        assert_eq!(msg.event_name(), "offer");
    }

    #[test]
    fn test_ice_candidate_wire_format() {
        let call_id = Uuid::new_v4();
        let text = json!({
            "type": "ice-candidate",
            "from": "bob",
            "target": "alice",
            "callId": call_id.to_string(),
            "candidate": {
                "candidate": "candidate:1 1 udp 2130706431 10.0.0.2 50000 typ host",
                "sdpMid": "0",
                "sdpMLineIndex": 0,
                "usernameFragment": null
            }
        })
        .to_string();

        let msg: SignalMessage = serde_json::from_str(&text).unwrap();
        match &msg {
            SignalMessage::IceCandidate { candidate, .. } => {
                assert_eq!(candidate.sdp_mid.as_deref(), Some("0"));
                assert_eq!(candidate.sdp_mline_index, Some(0));
            }
            other => panic!("unexpected message: {:?}", other),
        }
        assert_eq!(msg.from(), "bob");
        assert_eq!(msg.target(), "alice");
        assert_eq!(msg.call_id(), call_id);
    }

    #[test]
    fn test_reject_without_reason() {
        let msg = SignalMessage::Reject {
            from: "bob".to_string(),
            target: "alice".to_string(),
            call_id: Uuid::nil(),
            reason: None,
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert!(value.get("reason").is_none());

        let back: SignalMessage = serde_json::from_value(value).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn test_inbound_frames() {
        let registered: InboundFrame =
            serde_json::from_str(r#"{"type":"registered","peerId":"alice"}"#).unwrap();
        assert_eq!(
            registered,
            InboundFrame::Server(ServerMessage::Registered {
                peer_id: "alice".to_string()
            })
        );

        let pong: InboundFrame = serde_json::from_str(r#"{"type":"pong"}"#).unwrap();
        assert_eq!(pong, InboundFrame::Server(ServerMessage::Pong));

        let hangup = format!(
            r#"{{"type":"hangup","from":"bob","target":"alice","callId":"{}"}}"#,
            Uuid::nil()
        );
        let frame: InboundFrame = serde_json::from_str(&hangup).unwrap();
        assert!(matches!(frame, InboundFrame::Signal(SignalMessage::Hangup { .. })));
    }

    #[test]
    fn test_register_payload() {
        let value = serde_json::to_value(RegisterPayload::new("alice".to_string(), 42)).unwrap();
        assert_eq!(
            value,
            json!({"type": "register", "peerId": "alice", "timestamp": 42})
        );
    }
}
