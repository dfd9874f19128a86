//! Call Engine Module - Session-Steuerung, WebRTC und Aufnahme
//!
//! Dieses Modul verwaltet:
//! - Den Zustand des aktuellen Anrufs (Orchestrator)
//! - Die Peer Connection inkl. ICE-Candidate-Puffer
//! - Die lokale Aufnahme (Mikrofon, optional Video)

mod candidates;
mod capture;
mod connection;
mod error;
mod media;
mod orchestrator;
mod rtc;
mod session;

#[cfg(test)]
pub(crate) mod testing;

pub use capture::CpalDevices;
pub use connection::{
    ConnectionError, ConnectionManager, ConnectionObserver, IceCandidate, PeerConnection,
    PeerConnectionFactory, PeerConnectionState, RemoteStream, RemoteTrack, SdpType,
    SessionDescription,
};
pub use error::CallErrorKind;
pub use media::{CaptureDevices, LocalStream, LocalTrack, MediaError, MediaHandler, TrackKind};
pub use orchestrator::{CallError, CallEvent, CallOrchestrator};
pub use rtc::RtcConnectionFactory;
pub use session::{CallId, CallRole, CallSession, CallState, CallType, PeerInfo};
