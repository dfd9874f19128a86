//! Fehlerarten eines Anrufs
//!
//! Jeder terminale Fehler eines Anrufs wird auf genau eine [`CallErrorKind`]
//! abgebildet. Die Modul-Fehler (`MediaError`, `ConnectionError`,
//! `SignalingError`) liefern ihre Art über `kind()`.

use serde::Serialize;
use thiserror::Error;

/// Terminale Fehlerart eines Anrufs (landet in `CallSession::error`)
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "message", rename_all = "camelCase")]
pub enum CallErrorKind {
    #[error("Permission to use the capture device was denied")]
    PermissionDenied,

    #[error("No capture device available")]
    DeviceUnavailable,

    #[error("Capture device is busy")]
    DeviceBusy,

    #[error("Peer is busy")]
    PeerBusy,

    #[error("Peer is offline")]
    PeerOffline,

    #[error("Peer not found")]
    PeerNotFound,

    #[error("Connection timeout")]
    ConnectionTimeout,

    #[error("Connection failed")]
    ConnectionFailed,

    #[error("Connection lost")]
    ConnectionLost,

    #[error("Call rejected")]
    Rejected,

    #[error("Call not answered")]
    Missed,

    #[error("Relay error: {0}")]
    RelayError(String),
}

impl CallErrorKind {
    /// Bildet den `reason` einer `call-failed` Nachricht ab
    pub fn from_failure_reason(reason: &str) -> Self {
        match reason {
            "busy" => Self::PeerBusy,
            "offline" => Self::PeerOffline,
            "not-found" | "not_found" => Self::PeerNotFound,
            other => Self::RelayError(other.to_string()),
        }
    }

    /// Fehler, die lokal entstanden sind (Gerät, Verbindung).
    ///
    /// Nur bei diesen wird der Peer per `call-end` benachrichtigt; alle
    /// anderen kommen bereits vom Relay.
    pub fn is_local(&self) -> bool {
        matches!(
            self,
            Self::PermissionDenied
                | Self::DeviceUnavailable
                | Self::DeviceBusy
                | Self::ConnectionTimeout
                | Self::ConnectionFailed
                | Self::ConnectionLost
        )
    }
}
