//! Datenmodell eines Anrufs
//!
//! `CallSession` ist der komplette lokale Zustand genau eines Anrufs.
//! Die UI liest nur Snapshots davon, verändert wird er ausschließlich
//! vom `CallOrchestrator`.

use super::connection::RemoteStream;
use super::error::CallErrorKind;
use super::media::LocalStream;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// IDENTIFIERS & ENUMS
// ============================================================================

/// Vom Relay vergebene Anruf-ID
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(pub u64);

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Art des Anrufs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallType {
    #[default]
    Voice,
    Video,
}

impl CallType {
    pub fn has_video(&self) -> bool {
        matches!(self, CallType::Video)
    }
}

/// Rolle der lokalen Seite
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CallRole {
    Caller,
    Callee,
}

/// Zustand der Call-State-Machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CallState {
    /// Kein Anruf (Start- und Endzustand)
    #[default]
    Idle,
    /// Ausgehender Anruf klingelt beim Peer
    OutgoingRinging,
    /// Eingehender Anruf klingelt lokal
    IncomingRinging,
    /// Angenommen, Verbindung wird ausgehandelt
    Connecting,
    /// Remote-Media ist angekommen
    InCall,
    /// Lokal aufgelegt, warte auf Bestätigung vom Relay
    Ending,
    /// Terminaler Fehler, wird nach dem Anzeige-Fenster zu Idle
    Error,
}

impl CallState {
    pub fn is_idle(&self) -> bool {
        matches!(self, CallState::Idle)
    }
}

/// Anzeige-Informationen über den Peer
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerInfo {
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
}

impl PeerInfo {
    pub fn named(display_name: impl Into<String>) -> Self {
        Self {
            display_name: display_name.into(),
            avatar_url: None,
        }
    }
}

// ============================================================================
// CALL SESSION
// ============================================================================

/// Lokaler Zustand eines Anrufs
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallSession {
    pub call_id: Option<CallId>,
    pub role: Option<CallRole>,
    pub call_type: CallType,
    pub state: CallState,
    pub peer_id: Option<String>,
    pub peer_info: Option<PeerInfo>,
    #[serde(skip)]
    pub local_stream: Option<LocalStream>,
    #[serde(skip)]
    pub remote_stream: Option<RemoteStream>,
    pub is_muted: bool,
    pub is_video_off: bool,
    pub is_speaker_on: bool,
    pub error: Option<CallErrorKind>,
    /// Erst gesetzt wenn Remote-Media beobachtet wurde
    pub started_at: Option<DateTime<Utc>>,
}

impl CallSession {
    /// Neue Session für einen ausgehenden Anruf
    pub fn outgoing(peer_id: String, peer_info: PeerInfo, call_type: CallType) -> Self {
        Self {
            role: Some(CallRole::Caller),
            call_type,
            state: CallState::OutgoingRinging,
            peer_id: Some(peer_id),
            peer_info: Some(peer_info),
            ..Default::default()
        }
    }

    /// Neue Session für einen eingehenden Anruf
    pub fn incoming(
        call_id: CallId,
        call_type: CallType,
        peer_id: String,
        peer_info: PeerInfo,
    ) -> Self {
        Self {
            call_id: Some(call_id),
            role: Some(CallRole::Callee),
            call_type,
            state: CallState::IncomingRinging,
            peer_id: Some(peer_id),
            peer_info: Some(peer_info),
            ..Default::default()
        }
    }

    /// Setzt die Call-ID genau einmal. Gibt `false` zurück wenn bereits vergeben.
    pub fn assign_call_id(&mut self, call_id: CallId) -> bool {
        if self.call_id.is_some() {
            return false;
        }
        self.call_id = Some(call_id);
        true
    }

    /// Prüft ob eine Relay-Nachricht zu diesem Anruf gehört
    pub fn matches(&self, call_id: CallId) -> bool {
        self.call_id == Some(call_id)
    }

    /// Dauer seit Beginn der Remote-Media
    pub fn duration(&self) -> Option<chrono::Duration> {
        self.started_at.map(|started| Utc::now() - started)
    }
}
