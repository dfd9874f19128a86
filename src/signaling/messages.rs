//! Message Types für das Relay-Protokoll
//!
//! JSON Text-Frames, `type` in kebab-case, Felder in camelCase.
//! Das Relay leitet adressierte Nachrichten nur weiter und vergibt die
//! Call-IDs; es kennt keine Anruflogik.

use crate::call_engine::{CallId, CallType, IceCandidate, SessionDescription};
use serde::{Deserialize, Serialize};

// ============================================================================
// CLIENT → SERVER MESSAGES
// ============================================================================

/// Alle Nachrichten an das Relay
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum RelayRequest {
    Register {
        username: String,
        #[serde(rename = "publicKey")]
        public_key: String,
    },

    Heartbeat {
        #[serde(rename = "peerId")]
        peer_id: String,
    },

    CallStart {
        #[serde(rename = "calleeId")]
        callee_id: String,
        #[serde(rename = "callType")]
        call_type: CallType,
    },

    CallAccept {
        #[serde(rename = "callId")]
        call_id: CallId,
    },

    CallReject {
        #[serde(rename = "callId")]
        call_id: CallId,
    },

    CallEnd {
        #[serde(rename = "callId")]
        call_id: CallId,
    },

    Offer {
        #[serde(rename = "toId")]
        to_id: String,
        description: SessionDescription,
    },

    Answer {
        #[serde(rename = "toId")]
        to_id: String,
        description: SessionDescription,
    },

    Ice {
        #[serde(rename = "toId")]
        to_id: String,
        candidate: IceCandidate,
    },
}

impl RelayRequest {
    /// Name für Logs
    pub fn label(&self) -> &'static str {
        match self {
            RelayRequest::Register { .. } => "register",
            RelayRequest::Heartbeat { .. } => "heartbeat",
            RelayRequest::CallStart { .. } => "call-start",
            RelayRequest::CallAccept { .. } => "call-accept",
            RelayRequest::CallReject { .. } => "call-reject",
            RelayRequest::CallEnd { .. } => "call-end",
            RelayRequest::Offer { .. } => "offer",
            RelayRequest::Answer { .. } => "answer",
            RelayRequest::Ice { .. } => "ice",
        }
    }
}

// ============================================================================
// SERVER → CLIENT MESSAGES
// ============================================================================

/// Alle möglichen Server-Nachrichten
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    /// Erfolgreiche Registrierung
    Registered {
        #[serde(rename = "peerId")]
        peer_id: String,
        username: String,
    },

    /// Bestätigung von `call-start`
    CallInitiated {
        #[serde(rename = "callId")]
        call_id: CallId,
    },

    /// Eingehender Anruf
    CallIncoming {
        #[serde(rename = "callId")]
        call_id: CallId,
        #[serde(rename = "callerId")]
        caller_id: String,
        #[serde(rename = "callerName", default)]
        caller_name: Option<String>,
        #[serde(rename = "callerAvatar", default)]
        caller_avatar: Option<String>,
        #[serde(rename = "callType", default)]
        call_type: CallType,
    },

    CallAccepted {
        #[serde(rename = "callId")]
        call_id: CallId,
    },

    CallRejected {
        #[serde(rename = "callId")]
        call_id: CallId,
    },

    CallEnded {
        #[serde(rename = "callId")]
        call_id: CallId,
        /// Dauer in Sekunden
        #[serde(default)]
        duration: Option<u64>,
    },

    /// Niemand hat abgenommen
    CallMissed {
        #[serde(rename = "callId")]
        call_id: CallId,
    },

    CallFailed {
        #[serde(rename = "callId", default)]
        call_id: Option<CallId>,
        reason: String,
    },

    CallError {
        #[serde(rename = "callId", default)]
        call_id: Option<CallId>,
        message: String,
    },

    /// Weitergeleitetes SDP Offer
    Offer {
        #[serde(rename = "fromId")]
        from_id: String,
        description: SessionDescription,
    },

    /// Weitergeleitetes SDP Answer
    Answer {
        #[serde(rename = "fromId")]
        from_id: String,
        description: SessionDescription,
    },

    /// Weitergeleiteter ICE Candidate
    Ice {
        #[serde(rename = "fromId")]
        from_id: String,
        candidate: IceCandidate,
    },

    /// Allgemeiner Fehler
    Error { code: i32, message: String },

    /// Heartbeat Antwort
    Pong,
}
