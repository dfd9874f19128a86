//! Session Connection Manager
//!
//! Besitzt genau eine Peer Connection pro Anruf. Jeder Anruf bekommt eine
//! frische Verbindung und eine frische [`SessionEpoch`]; der komplette
//! Verhandlungsfortschritt (Candidate-Queue, Description-Latches,
//! Remote-Stream) lebt in diesem Wert und wird nie in-place zurückgesetzt.
//!
//! Callbacks des Backends gehen an einen epoch-gebundenen Empfänger.
//! Ereignisse einer alten Epoch werden verworfen.

use super::candidates::CandidateQueue;
use super::error::CallErrorKind;
use super::media::{LocalStream, TrackKind};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use webrtc::track::track_remote::TrackRemote;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("WebRTC error: {0}")]
    WebRTC(String),

    #[error("Invalid SDP: {0}")]
    InvalidSdp(String),

    #[error("No active connection")]
    NoConnection,

    #[error("Answer received in signaling state {0:?}")]
    UnexpectedAnswer(SignalingState),
}

impl ConnectionError {
    pub fn kind(&self) -> CallErrorKind {
        CallErrorKind::ConnectionFailed
    }
}

// ============================================================================
// NEGOTIATION TYPES
// ============================================================================

/// ICE Candidate wie er über das Relay läuft
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
    #[serde(default)]
    pub username_fragment: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

/// Session Description (Offer oder Answer)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// Verhandlungsstatus der Verbindung
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    Closed,
}

/// Transport-Status der Verbindung
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

// ============================================================================
// REMOTE MEDIA
// ============================================================================

/// Ein empfangener Track
#[derive(Clone)]
pub struct RemoteTrack {
    pub id: String,
    pub stream_id: String,
    pub kind: TrackKind,
    /// Handle für die Render-Schicht (nur beim WebRTC-Backend gesetzt)
    pub source: Option<Arc<TrackRemote>>,
}

impl std::fmt::Debug for RemoteTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteTrack")
            .field("id", &self.id)
            .field("stream_id", &self.stream_id)
            .field("kind", &self.kind)
            .finish()
    }
}

/// Remote-Stream eines Anrufs; Audio und Video landen im selben Stream
#[derive(Debug, Clone)]
pub struct RemoteStream {
    id: String,
    tracks: Arc<RwLock<Vec<RemoteTrack>>>,
}

impl RemoteStream {
    fn new(first: RemoteTrack) -> Self {
        Self {
            id: first.stream_id.clone(),
            tracks: Arc::new(RwLock::new(vec![first])),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracks(&self) -> Vec<RemoteTrack> {
        self.tracks.read().clone()
    }

    pub fn has_kind(&self, kind: TrackKind) -> bool {
        self.tracks.read().iter().any(|t| t.kind == kind)
    }

    /// Fügt einen Track hinzu, Duplikate (gleiche Track-ID) werden ignoriert
    fn add_track(&self, track: RemoteTrack) -> bool {
        let mut tracks = self.tracks.write();
        if tracks.iter().any(|t| t.id == track.id) {
            return false;
        }
        tracks.push(track);
        true
    }
}

// ============================================================================
// BACKEND TRAITS
// ============================================================================

/// Die eigentliche Media-Verbindung (WebRTC im Produktivbetrieb)
#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn add_local_stream(&self, stream: &LocalStream) -> Result<(), ConnectionError>;

    /// Erstellt ein Offer und setzt es als Local Description
    async fn create_offer(&self) -> Result<SessionDescription, ConnectionError>;

    /// Erstellt ein Answer und setzt es als Local Description
    async fn create_answer(&self) -> Result<SessionDescription, ConnectionError>;

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), ConnectionError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), ConnectionError>;

    fn signaling_state(&self) -> SignalingState;

    /// Stoppt alle Transceiver und schließt die Verbindung
    async fn close(&self) -> Result<(), ConnectionError>;
}

/// Roh-Callbacks vom Backend an den Manager
pub trait ConnectionEvents: Send + Sync {
    fn local_candidate(&self, candidate: IceCandidate);
    fn remote_track(&self, track: RemoteTrack);
    fn state_changed(&self, state: PeerConnectionState);
}

#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    async fn create(
        &self,
        events: Arc<dyn ConnectionEvents>,
    ) -> Result<Arc<dyn PeerConnection>, ConnectionError>;
}

/// Listener für aufbereitete Verbindungs-Ereignisse.
///
/// Beliebig viele Listener können sich registrieren; keiner überschreibt
/// einen anderen.
pub trait ConnectionObserver: Send + Sync {
    fn on_local_candidate(&self, _candidate: &IceCandidate) {}

    /// Genau einmal pro Anruf, beim ersten Remote-Track
    fn on_remote_media(&self, _stream: &RemoteStream) {}

    fn on_connected(&self) {}

    fn on_connection_failure(&self, _kind: CallErrorKind) {}
}

type Observers = Arc<RwLock<Vec<Arc<dyn ConnectionObserver>>>>;

// ============================================================================
// SESSION EPOCH
// ============================================================================

/// Verhandlungszustand genau eines Anrufs
struct SessionEpoch {
    id: u64,
    connection: Arc<dyn PeerConnection>,
    candidates: CandidateQueue,
    remote_description_set: bool,
    /// Pending-Description-Lock für das Answer
    answer_applied: bool,
}

impl SessionEpoch {
    fn new(id: u64, connection: Arc<dyn PeerConnection>) -> Self {
        Self {
            id,
            connection,
            candidates: CandidateQueue::new(),
            remote_description_set: false,
            answer_applied: false,
        }
    }
}

/// Epoch-gebundener Empfänger der Backend-Callbacks
struct EpochEvents {
    epoch: u64,
    live_epoch: Arc<AtomicU64>,
    observers: Observers,
    remote_stream: Mutex<Option<RemoteStream>>,
}

impl EpochEvents {
    fn is_live(&self) -> bool {
        self.live_epoch.load(Ordering::SeqCst) == self.epoch
    }

    fn observers(&self) -> Vec<Arc<dyn ConnectionObserver>> {
        self.observers.read().clone()
    }
}

impl ConnectionEvents for EpochEvents {
    fn local_candidate(&self, candidate: IceCandidate) {
        if !self.is_live() {
            return;
        }
        for observer in self.observers() {
            observer.on_local_candidate(&candidate);
        }
    }

    fn remote_track(&self, track: RemoteTrack) {
        if !self.is_live() {
            tracing::debug!("Ignoring track {} of stale connection", track.id);
            return;
        }

        tracing::info!("Received remote {:?} track {}", track.kind, track.id);

        let first = {
            let mut remote = self.remote_stream.lock();
            match remote.as_ref() {
                Some(stream) => {
                    stream.add_track(track);
                    None
                }
                None => {
                    let stream = RemoteStream::new(track);
                    *remote = Some(stream.clone());
                    Some(stream)
                }
            }
        };

        if let Some(stream) = first {
            for observer in self.observers() {
                observer.on_remote_media(&stream);
            }
        }
    }

    fn state_changed(&self, state: PeerConnectionState) {
        if !self.is_live() {
            return;
        }

        tracing::info!("Peer connection state: {:?}", state);

        let failure = match state {
            PeerConnectionState::Connected => {
                for observer in self.observers() {
                    observer.on_connected();
                }
                None
            }
            PeerConnectionState::Failed => Some(CallErrorKind::ConnectionFailed),
            PeerConnectionState::Disconnected => {
                if self.remote_stream.lock().is_some() {
                    Some(CallErrorKind::ConnectionLost)
                } else {
                    tracing::debug!("Disconnected during setup, waiting for recovery");
                    None
                }
            }
            _ => None,
        };

        if let Some(kind) = failure {
            for observer in self.observers() {
                observer.on_connection_failure(kind.clone());
            }
        }
    }
}

// ============================================================================
// CONNECTION MANAGER
// ============================================================================

/// Verwaltet die Peer Connection des aktuellen Anrufs
pub struct ConnectionManager {
    factory: Arc<dyn PeerConnectionFactory>,
    observers: Observers,
    epoch: tokio::sync::Mutex<Option<SessionEpoch>>,
    live_epoch: Arc<AtomicU64>,
    next_epoch: AtomicU64,
}

impl ConnectionManager {
    pub fn new(factory: Arc<dyn PeerConnectionFactory>) -> Self {
        Self {
            factory,
            observers: Arc::new(RwLock::new(Vec::new())),
            epoch: tokio::sync::Mutex::new(None),
            live_epoch: Arc::new(AtomicU64::new(0)),
            next_epoch: AtomicU64::new(0),
        }
    }

    /// Registriert einen weiteren Listener
    pub fn add_observer(&self, observer: Arc<dyn ConnectionObserver>) {
        self.observers.write().push(observer);
    }

    /// `true` solange eine Verbindung existiert
    pub fn is_active(&self) -> bool {
        self.live_epoch.load(Ordering::SeqCst) != 0
    }

    /// Erstellt eine frische Verbindung für einen neuen Anruf.
    ///
    /// Eine noch vorhandene alte Verbindung wird vorher geschlossen.
    pub async fn create(&self) -> Result<u64, ConnectionError> {
        let mut guard = self.epoch.lock().await;
        if let Some(old) = guard.take() {
            tracing::warn!("Closing leftover connection of epoch {}", old.id);
            self.close_epoch(old).await;
        }

        let id = self.next_epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let events = Arc::new(EpochEvents {
            epoch: id,
            live_epoch: Arc::clone(&self.live_epoch),
            observers: Arc::clone(&self.observers),
            remote_stream: Mutex::new(None),
        });

        self.live_epoch.store(id, Ordering::SeqCst);
        let connection = match self.factory.create(events).await {
            Ok(connection) => connection,
            Err(e) => {
                self.live_epoch.store(0, Ordering::SeqCst);
                return Err(e);
            }
        };

        *guard = Some(SessionEpoch::new(id, connection));
        tracing::debug!("Created peer connection (epoch {})", id);
        Ok(id)
    }

    /// Fügt die lokalen Tracks zur Verbindung hinzu
    pub async fn attach_local_stream(&self, stream: &LocalStream) -> Result<(), ConnectionError> {
        let guard = self.epoch.lock().await;
        let epoch = guard.as_ref().ok_or(ConnectionError::NoConnection)?;
        epoch.connection.add_local_stream(stream).await
    }

    /// Caller: Offer erstellen (setzt die Local Description)
    pub async fn create_offer(&self) -> Result<SessionDescription, ConnectionError> {
        let guard = self.epoch.lock().await;
        let epoch = guard.as_ref().ok_or(ConnectionError::NoConnection)?;
        epoch.connection.create_offer().await
    }

    /// Callee: Offer anwenden, Queue leeren, Answer erzeugen.
    ///
    /// Gibt `None` zurück wenn die Remote Description schon gesetzt war
    /// (erneut zugestelltes Offer).
    pub async fn create_answer(
        &self,
        offer: SessionDescription,
    ) -> Result<Option<SessionDescription>, ConnectionError> {
        let mut guard = self.epoch.lock().await;
        let epoch = guard.as_mut().ok_or(ConnectionError::NoConnection)?;

        if epoch.remote_description_set {
            tracing::debug!("Dropping duplicate offer (epoch {})", epoch.id);
            return Ok(None);
        }
        epoch.remote_description_set = true;

        epoch.connection.set_remote_description(offer).await?;

        let applied = epoch.candidates.drain_into(epoch.connection.as_ref()).await;
        tracing::debug!("Applied {} buffered ICE candidates", applied);

        let answer = epoch.connection.create_answer().await?;
        Ok(Some(answer))
    }

    /// Caller: Answer genau einmal anwenden.
    ///
    /// `Ok(false)` bei Duplikaten. Ein Answer im falschen Verhandlungsstatus
    /// ist ein Fehler und wird nicht angewendet.
    pub async fn apply_answer(&self, answer: SessionDescription) -> Result<bool, ConnectionError> {
        let mut guard = self.epoch.lock().await;
        let epoch = guard.as_mut().ok_or(ConnectionError::NoConnection)?;

        if epoch.answer_applied {
            tracing::debug!("Dropping duplicate answer (epoch {})", epoch.id);
            return Ok(false);
        }

        let state = epoch.connection.signaling_state();
        if state != SignalingState::HaveLocalOffer {
            return Err(ConnectionError::UnexpectedAnswer(state));
        }
        epoch.answer_applied = true;

        epoch.connection.set_remote_description(answer).await?;
        epoch.remote_description_set = true;

        let applied = epoch.candidates.drain_into(epoch.connection.as_ref()).await;
        tracing::debug!("Applied {} buffered ICE candidates", applied);
        Ok(true)
    }

    /// Puffert den Candidate bis zur Remote Description, sonst sofort anwenden
    pub async fn add_discovery_message(
        &self,
        candidate: IceCandidate,
    ) -> Result<(), ConnectionError> {
        let mut guard = self.epoch.lock().await;
        let Some(epoch) = guard.as_mut() else {
            tracing::debug!("Dropping ICE candidate without connection");
            return Ok(());
        };

        if epoch.candidates.is_locked() {
            epoch.candidates.enqueue(candidate);
            return Ok(());
        }

        epoch.connection.add_ice_candidate(candidate).await
    }

    /// Anzahl gepufferter Candidates der aktuellen Verbindung
    pub async fn queued_candidates(&self) -> usize {
        self.epoch
            .lock()
            .await
            .as_ref()
            .map(|e| e.candidates.len())
            .unwrap_or(0)
    }

    /// Schließt die Verbindung. Mehrfacher Aufruf ist harmlos.
    pub async fn destroy(&self) {
        let mut guard = self.epoch.lock().await;
        if let Some(epoch) = guard.take() {
            self.close_epoch(epoch).await;
        }
    }

    /// Schließt nur wenn `epoch` noch die aktuelle Verbindung ist
    pub async fn destroy_epoch(&self, epoch: u64) {
        let mut guard = self.epoch.lock().await;
        if guard.as_ref().is_some_and(|e| e.id == epoch) {
            if let Some(current) = guard.take() {
                self.close_epoch(current).await;
            }
        }
    }

    async fn close_epoch(&self, mut epoch: SessionEpoch) {
        let _ = self.live_epoch.compare_exchange(
            epoch.id,
            0,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        epoch.candidates.reset();

        if let Err(e) = epoch.connection.close().await {
            tracing::warn!("Failed to close peer connection: {}", e);
        }
        tracing::info!("Peer connection closed (epoch {})", epoch.id);
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("live_epoch", &self.live_epoch.load(Ordering::SeqCst))
            .field("observers", &self.observers.read().len())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================
