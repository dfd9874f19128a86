//! Fakes für die Unit-Tests: geskriptete Peer Connection, Aufnahmegeräte
//! und ein Relay das alle Sends mitschreibt.

use super::connection::{
    ConnectionError, ConnectionEvents, ConnectionObserver, IceCandidate, PeerConnection,
    PeerConnectionFactory, PeerConnectionState, RemoteStream, RemoteTrack, SdpType,
    SessionDescription, SignalingState,
};
use super::error::CallErrorKind;
use super::media::{CaptureDevices, CaptureHandle, LocalStream, MediaError, TrackControl, TrackKind};
use crate::signaling::{RelayRequest, RelaySender, SignalingError};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

pub(crate) fn candidate(value: &str) -> IceCandidate {
    IceCandidate {
        candidate: value.to_string(),
        sdp_mid: Some("0".to_string()),
        sdp_mline_index: Some(0),
        username_fragment: None,
    }
}

// ============================================================================
// PEER CONNECTION
// ============================================================================

pub(crate) struct NullEvents;

impl ConnectionEvents for NullEvents {
    fn local_candidate(&self, _candidate: IceCandidate) {}
    fn remote_track(&self, _track: RemoteTrack) {}
    fn state_changed(&self, _state: PeerConnectionState) {}
}

/// Verhält sich bei der Verhandlung wie eine echte Verbindung
pub(crate) struct FakePeerConnection {
    pub id: u64,
    events: Arc<dyn ConnectionEvents>,
    signaling: Mutex<SignalingState>,
    applied: Mutex<Vec<String>>,
    remote: Mutex<Vec<SessionDescription>>,
    local_tracks: Mutex<Vec<String>>,
    closed: AtomicBool,
}

impl FakePeerConnection {
    pub fn new(id: u64, events: Arc<dyn ConnectionEvents>) -> Self {
        Self {
            id,
            events,
            signaling: Mutex::new(SignalingState::Stable),
            applied: Mutex::new(Vec::new()),
            remote: Mutex::new(Vec::new()),
            local_tracks: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn applied_candidates(&self) -> Vec<String> {
        self.applied.lock().clone()
    }

    pub fn remote_descriptions(&self) -> Vec<SessionDescription> {
        self.remote.lock().clone()
    }

    pub fn local_track_count(&self) -> usize {
        self.local_tracks.lock().len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn emit_track(&self, id: &str, stream_id: &str, kind: TrackKind) {
        self.events.remote_track(RemoteTrack {
            id: id.to_string(),
            stream_id: stream_id.to_string(),
            kind,
            source: None,
        });
    }

    pub fn emit_state(&self, state: PeerConnectionState) {
        self.events.state_changed(state);
    }

    pub fn emit_candidate(&self, value: &str) {
        self.events.local_candidate(candidate(value));
    }
}

#[async_trait]
impl PeerConnection for FakePeerConnection {
    async fn add_local_stream(&self, stream: &LocalStream) -> Result<(), ConnectionError> {
        let mut tracks = self.local_tracks.lock();
        tracks.extend(stream.tracks.iter().map(|t| t.id.clone()));
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, ConnectionError> {
        *self.signaling.lock() = SignalingState::HaveLocalOffer;
        Ok(SessionDescription::offer(format!("offer-{}", self.id)))
    }

    async fn create_answer(&self) -> Result<SessionDescription, ConnectionError> {
        let mut state = self.signaling.lock();
        if *state != SignalingState::HaveRemoteOffer {
            return Err(ConnectionError::WebRTC("no remote offer".into()));
        }
        *state = SignalingState::Stable;
        Ok(SessionDescription::answer(format!("answer-{}", self.id)))
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), ConnectionError> {
        {
            let mut state = self.signaling.lock();
            match description.sdp_type {
                SdpType::Offer => *state = SignalingState::HaveRemoteOffer,
                SdpType::Answer => {
                    if *state != SignalingState::HaveLocalOffer {
                        return Err(ConnectionError::WebRTC("answer without offer".into()));
                    }
                    *state = SignalingState::Stable;
                }
            }
        }
        self.remote.lock().push(description);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), ConnectionError> {
        if candidate.candidate.contains("bad") {
            return Err(ConnectionError::WebRTC("malformed candidate".into()));
        }
        self.applied.lock().push(candidate.candidate);
        Ok(())
    }

    fn signaling_state(&self) -> SignalingState {
        *self.signaling.lock()
    }

    async fn close(&self) -> Result<(), ConnectionError> {
        self.closed.store(true, Ordering::SeqCst);
        *self.signaling.lock() = SignalingState::Closed;
        Ok(())
    }
}

#[derive(Default)]
pub(crate) struct FakeConnectionFactory {
    created: Mutex<Vec<Arc<FakePeerConnection>>>,
    fail_next: AtomicBool,
}

impl FakeConnectionFactory {
    pub fn latest(&self) -> Arc<FakePeerConnection> {
        self.created
            .lock()
            .last()
            .cloned()
            .expect("no connection created")
    }

    pub fn count(&self) -> usize {
        self.created.lock().len()
    }

    pub fn fail_next(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl PeerConnectionFactory for FakeConnectionFactory {
    async fn create(
        &self,
        events: Arc<dyn ConnectionEvents>,
    ) -> Result<Arc<dyn PeerConnection>, ConnectionError> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(ConnectionError::WebRTC("scripted failure".into()));
        }
        let mut created = self.created.lock();
        let connection = Arc::new(FakePeerConnection::new(created.len() as u64 + 1, events));
        created.push(Arc::clone(&connection));
        Ok(connection)
    }
}

#[derive(Default)]
pub(crate) struct RecordingObserver {
    candidates: Mutex<Vec<IceCandidate>>,
    remote: Mutex<Vec<RemoteStream>>,
    connected: AtomicUsize,
    failures: Mutex<Vec<CallErrorKind>>,
}

impl RecordingObserver {
    pub fn remote_media_count(&self) -> usize {
        self.remote.lock().len()
    }

    pub fn last_remote_stream(&self) -> Option<RemoteStream> {
        self.remote.lock().last().cloned()
    }

    pub fn failures(&self) -> Vec<CallErrorKind> {
        self.failures.lock().clone()
    }

    pub fn connected_count(&self) -> usize {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn local_candidates(&self) -> Vec<IceCandidate> {
        self.candidates.lock().clone()
    }
}

impl ConnectionObserver for RecordingObserver {
    fn on_local_candidate(&self, candidate: &IceCandidate) {
        self.candidates.lock().push(candidate.clone());
    }

    fn on_remote_media(&self, stream: &RemoteStream) {
        self.remote.lock().push(stream.clone());
    }

    fn on_connected(&self) {
        self.connected.fetch_add(1, Ordering::SeqCst);
    }

    fn on_connection_failure(&self, kind: CallErrorKind) {
        self.failures.lock().push(kind);
    }
}

// ============================================================================
// CAPTURE DEVICES
// ============================================================================

/// Geräte mit geskripteten Fehlern; protokolliert open/stop
#[derive(Default)]
pub(crate) struct FakeCaptureDevices {
    log: Arc<Mutex<Vec<String>>>,
    scripted: Mutex<VecDeque<MediaError>>,
    failing: Mutex<HashMap<TrackKind, MediaError>>,
    attempts: AtomicUsize,
}

impl FakeCaptureDevices {
    /// Der nächste `open` schlägt fehl (beliebig oft stapelbar)
    pub fn fail_next(&self, error: MediaError) {
        self.scripted.lock().push_back(error);
    }

    /// Jeder `open` für `kind` schlägt fehl
    pub fn fail_kind(&self, kind: TrackKind, error: MediaError) {
        self.failing.lock().insert(kind, error);
    }

    pub fn log(&self) -> Vec<String> {
        self.log.lock().clone()
    }

    pub fn open_attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl CaptureDevices for FakeCaptureDevices {
    fn open(
        &self,
        kind: TrackKind,
        _control: TrackControl,
    ) -> Result<Box<dyn CaptureHandle>, MediaError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);

        if let Some(error) = self.scripted.lock().pop_front() {
            return Err(error);
        }
        if let Some(error) = self.failing.lock().get(&kind) {
            return Err(error.clone());
        }

        self.log.lock().push(format!("open:{}", label(kind)));
        Ok(Box::new(FakeCapture {
            kind,
            log: Arc::clone(&self.log),
        }))
    }
}

struct FakeCapture {
    kind: TrackKind,
    log: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl CaptureHandle for FakeCapture {
    async fn stop(&mut self) {
        self.log.lock().push(format!("stop:{}", label(self.kind)));
    }
}

fn label(kind: TrackKind) -> &'static str {
    match kind {
        TrackKind::Audio => "audio",
        TrackKind::Video => "video",
    }
}

// ============================================================================
// RELAY
// ============================================================================

#[derive(Default)]
pub(crate) struct RecordingRelay {
    sent: Mutex<Vec<RelayRequest>>,
    offline: AtomicBool,
}

impl RecordingRelay {
    pub fn sent(&self) -> Vec<RelayRequest> {
        self.sent.lock().clone()
    }

    pub fn labels(&self) -> Vec<&'static str> {
        self.sent.lock().iter().map(RelayRequest::label).collect()
    }

    pub fn count(&self, label: &str) -> usize {
        self.sent
            .lock()
            .iter()
            .filter(|r| r.label() == label)
            .count()
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }
}

impl RelaySender for RecordingRelay {
    fn send(&self, request: RelayRequest) -> Result<(), SignalingError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(SignalingError::NotConnected);
        }
        self.sent.lock().push(request);
        Ok(())
    }
}
