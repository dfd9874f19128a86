//! Call Orchestrator
//!
//! Besitzt den Zustand des (einzigen) Anrufs und treibt Media Handler,
//! Connection Manager und Signaling Gateway als Reaktion auf
//! Benutzer-Aktionen und eingehende Relay-Nachrichten.
//!
//! Zustandsübergänge:
//! - IDLE → OUTGOING_RINGING (lokaler Start) | INCOMING_RINGING (call-incoming)
//! - OUTGOING_RINGING → CONNECTING (call-accepted, Caller sendet das Offer)
//! - INCOMING_RINGING → CONNECTING (lokales Accept, Callee wartet aufs Offer)
//! - CONNECTING → IN_CALL (erster Remote-Track)
//! - * → ENDING → IDLE (Relay bestätigt, danach Settle-Pause)
//! - * → ERROR → IDLE (nach dem Anzeige-Fenster)
//!
//! Jede Session hat eine Generation. Fortsetzungen nach einem `.await`
//! und Timer prüfen sie erneut und laufen bei Abweichung ins Leere.

use super::connection::{
    ConnectionManager, ConnectionObserver, IceCandidate, PeerConnectionFactory, RemoteStream,
    SessionDescription,
};
use super::error::CallErrorKind;
use super::media::{CaptureDevices, LocalStream, MediaHandler};
use super::session::{CallId, CallRole, CallSession, CallState, CallType, PeerInfo};
use crate::config::CallConfig;
use crate::signaling::{RelaySender, SignalingError, SignalingGateway};
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum CallError {
    #[error("Another call is already active")]
    AlreadyInCall,

    #[error("Action not allowed in state {0:?}")]
    InvalidState(CallState),

    #[error("No active call")]
    NoActiveCall,

    #[error("Signaling failed: {0}")]
    Signaling(#[from] SignalingError),
}

// ============================================================================
// EVENTS
// ============================================================================

/// Events für die UI-Schicht
#[derive(Debug, Clone)]
pub enum CallEvent {
    StateChanged(CallState),

    /// Remote-Media ist angekommen (einmal pro Anruf)
    RemoteMedia(RemoteStream),

    /// Terminaler Fehler, Zustand ist jetzt ERROR
    Error(CallErrorKind),

    /// Anruf vollständig abgebaut, kurz vor IDLE
    Ended {
        call_id: Option<CallId>,
        duration: Option<Duration>,
    },
}

// ============================================================================
// SESSION SLOT
// ============================================================================

const FINISHED_CALL_IDS: usize = 32;

#[derive(Default)]
struct Slot {
    session: CallSession,
    generation: u64,
    /// One-Shot Latch: ab hier sendet `end_call` nichts mehr
    ending: bool,
    /// `call-end` wartet auf `call-initiated`
    end_pending: bool,
    offer_handled: bool,
    connected: bool,
    tearing_down: bool,
    /// Abgeschlossene Call-IDs, Redeliveries dafür laufen ins Leere
    finished: VecDeque<CallId>,
}

impl Slot {
    fn begin(&mut self, session: CallSession) -> u64 {
        self.generation += 1;
        self.session = session;
        self.ending = false;
        self.end_pending = false;
        self.offer_handled = false;
        self.connected = false;
        self.tearing_down = false;
        self.generation
    }

    /// Zurück auf IDLE; Nachzügler der alten Session sehen eine neue Generation
    fn reset(&mut self) {
        if let Some(call_id) = self.session.call_id {
            if self.finished.len() == FINISHED_CALL_IDS {
                self.finished.pop_front();
            }
            self.finished.push_back(call_id);
        }
        self.begin(CallSession::default());
    }

    fn is_finished(&self, call_id: CallId) -> bool {
        self.finished.contains(&call_id)
    }

    /// Session ist noch dieselbe und verhandelt bzw. telefoniert
    fn is_live(&self, generation: u64) -> bool {
        self.generation == generation
            && matches!(self.session.state, CallState::Connecting | CallState::InCall)
    }

    fn is_peer(&self, peer_id: &str) -> bool {
        self.session.peer_id.as_deref() == Some(peer_id)
    }

    /// Gehört eine Relay-Nachricht zu dieser Session?
    fn concerns(&self, call_id: Option<CallId>) -> bool {
        if self.session.state.is_idle() {
            return false;
        }
        match (call_id, self.session.call_id) {
            (Some(id), _) if self.is_finished(id) => false,
            (Some(id), Some(own)) => id == own,
            // Antwort auf call-start vor call-initiated
            (None, None) => self.session.role == Some(CallRole::Caller),
            (Some(_), None) => false,
            (None, Some(_)) => true,
        }
    }

    fn duration(&self) -> Option<Duration> {
        self.session.duration().and_then(|d| d.to_std().ok())
    }
}

#[derive(Default)]
struct Timers {
    connection_timeout: Option<JoinHandle<()>>,
    end_ack: Option<JoinHandle<()>>,
}

struct Inner {
    config: CallConfig,
    gateway: SignalingGateway,
    connection: ConnectionManager,
    media: MediaHandler,
    slot: Mutex<Slot>,
    timers: Mutex<Timers>,
    event_tx: broadcast::Sender<CallEvent>,
}

// ============================================================================
// CALL ORCHESTRATOR
// ============================================================================

/// Steuert genau einen Anruf zur Zeit
#[derive(Clone)]
pub struct CallOrchestrator {
    inner: Arc<Inner>,
}

impl CallOrchestrator {
    pub fn new(
        config: CallConfig,
        relay: Arc<dyn RelaySender>,
        factory: Arc<dyn PeerConnectionFactory>,
        devices: Arc<dyn CaptureDevices>,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(64);

        let inner = Arc::new(Inner {
            gateway: SignalingGateway::new(relay),
            connection: ConnectionManager::new(factory),
            media: MediaHandler::new(devices, config.device_retry_delay(), config.media_settle()),
            slot: Mutex::new(Slot::default()),
            timers: Mutex::new(Timers::default()),
            event_tx,
            config,
        });

        inner.connection.add_observer(Arc::new(SessionObserver {
            inner: Arc::downgrade(&inner),
        }));

        Self { inner }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.inner.event_tx.subscribe()
    }

    /// Snapshot der aktuellen Session
    pub fn session(&self) -> CallSession {
        self.inner.slot.lock().session.clone()
    }

    pub fn state(&self) -> CallState {
        self.inner.slot.lock().session.state
    }

    // ========================================================================
    // USER ACTIONS
    // ========================================================================

    pub async fn start_outgoing_call(
        &self,
        peer_id: String,
        peer_info: PeerInfo,
        call_type: CallType,
    ) -> Result<(), CallError> {
        let generation = {
            let mut slot = self.inner.slot.lock();
            if !slot.session.state.is_idle() {
                tracing::warn!("Refusing call to {}: another call is active", peer_id);
                return Err(CallError::AlreadyInCall);
            }
            slot.begin(CallSession::outgoing(peer_id.clone(), peer_info, call_type))
        };

        tracing::info!("Calling {} ({:?})", peer_id, call_type);
        self.emit_state(CallState::OutgoingRinging);

        if let Err(e) = self.inner.gateway.start_call(&peer_id, call_type) {
            tracing::error!("Failed to send call-start: {}", e);
            self.fail(generation, e.kind()).await;
            return Err(e.into());
        }
        Ok(())
    }

    /// Nimmt den klingelnden Anruf an.
    ///
    /// Die Verbindung wird vor dem `call-accept` erstellt, damit früh
    /// eintreffende Candidates gepuffert werden. Media wird erst mit dem
    /// Offer geholt.
    pub async fn accept(&self) -> Result<(), CallError> {
        let (generation, call_id) = {
            let mut slot = self.inner.slot.lock();
            let state = slot.session.state;
            if state != CallState::IncomingRinging {
                return Err(CallError::InvalidState(state));
            }
            let call_id = slot.session.call_id.ok_or(CallError::NoActiveCall)?;
            slot.session.state = CallState::Connecting;
            (slot.generation, call_id)
        };

        tracing::info!("Accepting call {}", call_id);
        self.emit_state(CallState::Connecting);
        self.start_connection_timer(generation);

        if !self.create_connection(generation).await {
            return Ok(());
        }

        if let Err(e) = self.inner.gateway.accept_call(call_id) {
            tracing::error!("Failed to send call-accept: {}", e);
            self.fail(generation, e.kind()).await;
            return Err(e.into());
        }
        Ok(())
    }

    /// Lehnt den klingelnden Anruf ab (direkt zurück auf IDLE)
    pub fn reject(&self) -> Result<(), CallError> {
        let call_id = {
            let mut slot = self.inner.slot.lock();
            let state = slot.session.state;
            if state != CallState::IncomingRinging {
                return Err(CallError::InvalidState(state));
            }
            let call_id = slot.session.call_id;
            slot.reset();
            call_id
        };

        if let Some(call_id) = call_id {
            tracing::info!("Rejecting call {}", call_id);
            if let Err(e) = self.inner.gateway.reject_call(call_id) {
                tracing::warn!("Failed to send call-reject: {}", e);
            }
        }
        self.emit_state(CallState::Idle);
        Ok(())
    }

    /// Legt auf. Mehrfache Aufrufe senden genau ein `call-end`.
    ///
    /// Die Ressourcen werden erst mit der Bestätigung des Relays
    /// (oder nach dem Fallback-Timeout) freigegeben.
    pub fn end_call(&self) -> Result<(), CallError> {
        let (generation, call_id) = {
            let mut slot = self.inner.slot.lock();
            let state = slot.session.state;
            if state.is_idle() {
                return Err(CallError::NoActiveCall);
            }
            if slot.ending || state == CallState::Error {
                tracing::debug!("end_call ignored, call is already ending");
                return Ok(());
            }
            slot.ending = true;
            slot.session.state = CallState::Ending;
            slot.session.remote_stream = None;
            if slot.session.call_id.is_none() {
                slot.end_pending = true;
            }
            (slot.generation, slot.session.call_id)
        };

        self.emit_state(CallState::Ending);
        match call_id {
            Some(call_id) => {
                tracing::info!("Ending call {}", call_id);
                self.send_end(call_id);
            }
            None => tracing::info!("Ending call before relay acknowledgment, call-end deferred"),
        }
        self.start_end_ack_timer(generation);
        Ok(())
    }

    pub fn set_muted(&self, muted: bool) -> Result<(), CallError> {
        self.update_session(|s| s.is_muted = muted)?;
        self.inner.media.set_audio_enabled(!muted);
        Ok(())
    }

    pub fn set_video_off(&self, video_off: bool) -> Result<(), CallError> {
        self.update_session(|s| s.is_video_off = video_off)?;
        self.inner.media.set_video_enabled(!video_off);
        Ok(())
    }

    /// Nur ein Flag für die Wiedergabe-Schicht
    pub fn set_speaker_on(&self, speaker_on: bool) -> Result<(), CallError> {
        self.update_session(|s| s.is_speaker_on = speaker_on)
    }

    /// Mikrofon-Pegel der laufenden Aufnahme (0.0 - 1.0)
    pub fn input_level(&self) -> f32 {
        self.inner.media.input_level()
    }

    // ========================================================================
    // RELAY HANDLERS
    // ========================================================================

    /// Relay hat die Call-ID vergeben
    pub fn on_call_initiated(&self, call_id: CallId) {
        let send_end = {
            let mut slot = self.inner.slot.lock();
            if slot.session.role != Some(CallRole::Caller) || slot.session.state.is_idle() {
                tracing::debug!("Ignoring call-initiated {} without outgoing call", call_id);
                return;
            }
            if slot.is_finished(call_id) {
                tracing::debug!("Ignoring call-initiated {} of a finished call", call_id);
                return;
            }
            if !slot.session.assign_call_id(call_id) {
                tracing::debug!("Ignoring repeated call-initiated {}", call_id);
                return;
            }
            std::mem::take(&mut slot.end_pending)
        };

        tracing::info!("Call {} initiated", call_id);
        if send_end {
            self.send_end(call_id);
        }
    }

    pub fn receive_incoming_call(
        &self,
        call_id: CallId,
        call_type: CallType,
        peer_id: String,
        peer_info: PeerInfo,
    ) {
        let ringing = {
            let mut slot = self.inner.slot.lock();
            if slot.session.matches(call_id) || slot.is_finished(call_id) {
                tracing::debug!("Ignoring repeated call-incoming {}", call_id);
                return;
            }
            if slot.session.state.is_idle() {
                slot.begin(CallSession::incoming(
                    call_id,
                    call_type,
                    peer_id.clone(),
                    peer_info,
                ));
                true
            } else {
                false
            }
        };

        if ringing {
            tracing::info!("Incoming {:?} call {} from {}", call_type, call_id, peer_id);
            self.emit_state(CallState::IncomingRinging);
            return;
        }

        tracing::info!("Busy, rejecting call {} from {}", call_id, peer_id);
        if let Err(e) = self.inner.gateway.reject_call(call_id) {
            tracing::warn!("Failed to send call-reject: {}", e);
        }
    }

    /// Caller: Peer hat angenommen, Verbindung aufbauen und Offer senden
    pub async fn on_call_accepted(&self, call_id: CallId) {
        let (generation, call_type) = {
            let mut slot = self.inner.slot.lock();
            if !slot.session.matches(call_id)
                || slot.session.role != Some(CallRole::Caller)
                || slot.session.state != CallState::OutgoingRinging
            {
                tracing::debug!("Ignoring call-accepted {}", call_id);
                return;
            }
            slot.session.state = CallState::Connecting;
            (slot.generation, slot.session.call_type)
        };

        tracing::info!("Call {} accepted by peer", call_id);
        self.emit_state(CallState::Connecting);
        self.start_connection_timer(generation);

        if !self.create_connection(generation).await {
            return;
        }
        let Some(stream) = self.acquire_media(generation, call_type).await else {
            return;
        };

        if let Err(e) = self.inner.connection.attach_local_stream(&stream).await {
            tracing::error!("Failed to attach local stream: {}", e);
            self.fail(generation, e.kind()).await;
            return;
        }

        let offer = match self.inner.connection.create_offer().await {
            Ok(offer) => offer,
            Err(e) => {
                tracing::error!("Failed to create offer: {}", e);
                self.fail(generation, e.kind()).await;
                return;
            }
        };

        let Some(peer_id) = self.live_peer(generation) else {
            return;
        };
        if let Err(e) = self.inner.gateway.send_offer(&peer_id, offer) {
            tracing::error!("Failed to send offer: {}", e);
            self.fail(generation, e.kind()).await;
        }
    }

    /// Callee: Offer empfangen, Media holen und Answer senden
    pub async fn on_offer(&self, from_id: &str, description: SessionDescription) {
        let (generation, call_type) = {
            let mut slot = self.inner.slot.lock();
            let generation = slot.generation;
            if slot.session.role != Some(CallRole::Callee)
                || !slot.is_peer(from_id)
                || !slot.is_live(generation)
            {
                tracing::debug!("Ignoring offer from {}", from_id);
                return;
            }
            if std::mem::replace(&mut slot.offer_handled, true) {
                tracing::debug!("Dropping repeated offer from {}", from_id);
                return;
            }
            (generation, slot.session.call_type)
        };

        let Some(stream) = self.acquire_media(generation, call_type).await else {
            return;
        };

        if let Err(e) = self.inner.connection.attach_local_stream(&stream).await {
            tracing::error!("Failed to attach local stream: {}", e);
            self.fail(generation, e.kind()).await;
            return;
        }

        match self.inner.connection.create_answer(description).await {
            Ok(Some(answer)) => {
                let Some(peer_id) = self.live_peer(generation) else {
                    return;
                };
                if let Err(e) = self.inner.gateway.send_answer(&peer_id, answer) {
                    tracing::error!("Failed to send answer: {}", e);
                    self.fail(generation, e.kind()).await;
                }
            }
            Ok(None) => {}
            Err(e) => {
                tracing::error!("Failed to answer offer: {}", e);
                self.fail(generation, e.kind()).await;
            }
        }
    }

    /// Caller: Answer genau einmal anwenden
    pub async fn on_answer(&self, from_id: &str, description: SessionDescription) {
        let generation = {
            let slot = self.inner.slot.lock();
            if slot.session.role != Some(CallRole::Caller)
                || !slot.is_peer(from_id)
                || !slot.is_live(slot.generation)
            {
                tracing::debug!("Ignoring answer from {}", from_id);
                return;
            }
            slot.generation
        };

        match self.inner.connection.apply_answer(description).await {
            Ok(true) => tracing::info!("Remote answer applied"),
            Ok(false) => tracing::debug!("Repeated answer from {} ignored", from_id),
            Err(e) => {
                tracing::error!("Failed to apply answer: {}", e);
                self.fail(generation, e.kind()).await;
            }
        }
    }

    pub async fn on_candidate(&self, from_id: &str, candidate: IceCandidate) {
        let known = {
            let slot = self.inner.slot.lock();
            !slot.session.state.is_idle() && slot.is_peer(from_id)
        };
        if !known {
            tracing::debug!("Dropping ICE candidate from {}", from_id);
            return;
        }

        if let Err(e) = self.inner.connection.add_discovery_message(candidate).await {
            tracing::warn!("Failed to apply ICE candidate: {}", e);
        }
    }

    pub async fn on_call_rejected(&self, call_id: CallId) {
        self.fail_call(Some(call_id), CallErrorKind::Rejected).await;
    }

    pub async fn on_call_missed(&self, call_id: CallId) {
        self.fail_call(Some(call_id), CallErrorKind::Missed).await;
    }

    pub async fn on_call_failed(&self, call_id: Option<CallId>, reason: &str) {
        self.fail_call(call_id, CallErrorKind::from_failure_reason(reason))
            .await;
    }

    pub async fn on_call_error(&self, call_id: Option<CallId>, message: String) {
        self.fail_call(call_id, CallErrorKind::RelayError(message))
            .await;
    }

    /// Relay bestätigt das Ende (oder der Peer hat aufgelegt)
    pub async fn on_call_ended(&self, call_id: CallId, duration_secs: Option<u64>) {
        let generation = {
            let slot = self.inner.slot.lock();
            if !slot.concerns(Some(call_id)) {
                tracing::debug!("Ignoring call-ended {}", call_id);
                return;
            }
            slot.generation
        };

        self.complete_end(generation, duration_secs.map(Duration::from_secs))
            .await;
    }

    // ========================================================================
    // CONNECTION REACTIONS
    // ========================================================================

    fn forward_candidate(&self, candidate: IceCandidate) {
        let peer_id = {
            let slot = self.inner.slot.lock();
            if slot.is_live(slot.generation) {
                slot.session.peer_id.clone()
            } else {
                None
            }
        };

        match peer_id {
            Some(peer_id) => {
                if let Err(e) = self.inner.gateway.send_discovery_message(&peer_id, candidate) {
                    tracing::warn!("Failed to send ICE candidate: {}", e);
                }
            }
            None => tracing::debug!("Dropping local ICE candidate outside of a call"),
        }
    }

    fn remote_media_observed(&self, stream: RemoteStream) {
        let entered = {
            let mut slot = self.inner.slot.lock();
            if slot.session.state == CallState::Connecting {
                slot.session.state = CallState::InCall;
                slot.session.remote_stream = Some(stream.clone());
                slot.session.started_at = Some(Utc::now());
                true
            } else {
                false
            }
        };

        if entered {
            tracing::info!("Remote media received, call is active");
            self.emit_state(CallState::InCall);
            let _ = self.inner.event_tx.send(CallEvent::RemoteMedia(stream));
        } else {
            tracing::debug!("Remote media outside CONNECTING ignored");
        }
    }

    fn connection_established(&self) {
        {
            let mut slot = self.inner.slot.lock();
            if !slot.is_live(slot.generation) {
                return;
            }
            slot.connected = true;
        }

        tracing::info!("Peer connection established");
        if let Some(timer) = self.inner.timers.lock().connection_timeout.take() {
            timer.abort();
        }
    }

    fn connection_failed(&self, kind: CallErrorKind) {
        let generation = {
            let slot = self.inner.slot.lock();
            if !slot.is_live(slot.generation) {
                return;
            }
            slot.generation
        };

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let this = self.clone();
                runtime.spawn(async move { this.fail(generation, kind).await });
            }
            Err(_) => tracing::error!("Connection failure outside of runtime: {}", kind),
        }
    }

    // ========================================================================
    // INTERNALS
    // ========================================================================

    async fn create_connection(&self, generation: u64) -> bool {
        let epoch = match self.inner.connection.create().await {
            Ok(epoch) => epoch,
            Err(e) => {
                tracing::error!("Failed to create peer connection: {}", e);
                self.fail(generation, e.kind()).await;
                return false;
            }
        };

        let live = self.inner.slot.lock().is_live(generation);
        if !live {
            tracing::debug!("Session ended while connecting, dropping connection");
            self.inner.connection.destroy_epoch(epoch).await;
        }
        live
    }

    /// Holt die lokale Aufnahme; gibt sie wieder frei falls die Session
    /// inzwischen vorbei ist
    async fn acquire_media(&self, generation: u64, call_type: CallType) -> Option<LocalStream> {
        let stream = match self.inner.media.acquire(call_type).await {
            Ok(stream) => stream,
            Err(e) => {
                tracing::error!("Media acquisition failed: {}", e);
                self.fail(generation, e.kind()).await;
                return None;
            }
        };

        let flags = {
            let mut slot = self.inner.slot.lock();
            if slot.is_live(generation) {
                slot.session.local_stream = Some(stream.clone());
                Some((slot.session.is_muted, slot.session.is_video_off))
            } else {
                None
            }
        };

        match flags {
            Some((muted, video_off)) => {
                if muted {
                    self.inner.media.set_audio_enabled(false);
                }
                if video_off {
                    self.inner.media.set_video_enabled(false);
                }
                Some(stream)
            }
            None => {
                tracing::debug!("Session ended during acquisition, releasing {}", stream.id);
                self.inner.media.release_stream(&stream.id).await;
                None
            }
        }
    }

    fn live_peer(&self, generation: u64) -> Option<String> {
        let slot = self.inner.slot.lock();
        if slot.is_live(generation) {
            slot.session.peer_id.clone()
        } else {
            None
        }
    }

    fn update_session(&self, update: impl FnOnce(&mut CallSession)) -> Result<(), CallError> {
        let mut slot = self.inner.slot.lock();
        if slot.session.state.is_idle() {
            return Err(CallError::NoActiveCall);
        }
        update(&mut slot.session);
        Ok(())
    }

    fn send_end(&self, call_id: CallId) {
        if let Err(e) = self.inner.gateway.end_call(call_id) {
            tracing::warn!("Failed to send call-end for {}: {}", call_id, e);
        }
    }

    async fn fail_call(&self, call_id: Option<CallId>, kind: CallErrorKind) {
        let generation = {
            let slot = self.inner.slot.lock();
            if !slot.concerns(call_id) {
                tracing::debug!("Ignoring '{}' for unknown call {:?}", kind, call_id);
                return;
            }
            slot.generation
        };
        self.fail(generation, kind).await;
    }

    /// Terminaler Fehler: ERROR anzeigen, abbauen, nach dem Anzeige-Fenster IDLE
    async fn fail(&self, generation: u64, kind: CallErrorKind) {
        enum Next {
            Ignore,
            FinishEnding,
            Fail(Option<CallId>, Option<Duration>),
        }

        let next = {
            let mut slot = self.inner.slot.lock();
            if slot.generation != generation || slot.tearing_down || slot.session.state.is_idle()
            {
                Next::Ignore
            } else if slot.session.state == CallState::Ending {
                Next::FinishEnding
            } else {
                slot.tearing_down = true;
                slot.ending = true;
                slot.session.state = CallState::Error;
                slot.session.error = Some(kind.clone());
                slot.session.remote_stream = None;
                Next::Fail(slot.session.call_id, slot.duration())
            }
        };

        let (call_id, duration) = match next {
            Next::Ignore => {
                tracing::debug!("Ignoring '{}' for finished session", kind);
                return;
            }
            Next::FinishEnding => {
                tracing::info!("'{}' while ending, finishing teardown", kind);
                self.complete_end(generation, None).await;
                return;
            }
            Next::Fail(call_id, duration) => (call_id, duration),
        };

        tracing::error!("Call failed: {}", kind);
        self.clear_timers();
        self.emit_state(CallState::Error);
        let _ = self.inner.event_tx.send(CallEvent::Error(kind.clone()));

        // Relay-Fehler kennt der Peer schon
        if kind.is_local() {
            if let Some(call_id) = call_id {
                self.send_end(call_id);
            }
        }

        self.teardown().await;

        let this = self.clone();
        let display = self.inner.config.error_display();
        tokio::spawn(async move {
            tokio::time::sleep(display).await;
            this.reset_to_idle(generation, CallEvent::Ended { call_id, duration });
        });
    }

    /// ENDING → Abbau → Settle-Pause → IDLE
    async fn complete_end(&self, generation: u64, reported: Option<Duration>) {
        let (call_id, duration, changed) = {
            let mut slot = self.inner.slot.lock();
            if slot.generation != generation || slot.tearing_down || slot.session.state.is_idle()
            {
                return;
            }
            slot.tearing_down = true;
            slot.ending = true;
            let changed = slot.session.state != CallState::Ending;
            slot.session.state = CallState::Ending;
            slot.session.remote_stream = None;
            (slot.session.call_id, reported.or_else(|| slot.duration()), changed)
        };

        self.clear_timers();
        if changed {
            self.emit_state(CallState::Ending);
        }
        tracing::info!("Call {:?} ended, duration {:?}", call_id, duration);

        self.teardown().await;
        tokio::time::sleep(self.inner.config.end_settle()).await;
        self.reset_to_idle(generation, CallEvent::Ended { call_id, duration });
    }

    /// Einziger Abbau-Pfad: Media stoppen, Verbindung schließen, dann
    /// die Settle-Pause der Geräte abwarten
    async fn teardown(&self) {
        self.inner.slot.lock().session.local_stream = None;
        self.inner.media.stop().await;
        self.inner.connection.destroy().await;
        self.inner.media.settled().await;
    }

    fn reset_to_idle(&self, generation: u64, ended: CallEvent) {
        {
            let mut slot = self.inner.slot.lock();
            if slot.generation != generation {
                return;
            }
            slot.reset();
        }

        let _ = self.inner.event_tx.send(ended);
        self.emit_state(CallState::Idle);
    }

    fn start_connection_timer(&self, generation: u64) {
        let this = self.clone();
        let timeout = self.inner.config.connection_timeout();

        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let expired = {
                let slot = this.inner.slot.lock();
                slot.is_live(generation) && !slot.connected
            };
            if expired {
                tracing::warn!("Connection not established after {:?}", timeout);
                // Eigener Task, damit clear_timers() den Abbau nicht abbricht
                tokio::spawn(async move {
                    this.fail(generation, CallErrorKind::ConnectionTimeout)
                        .await
                });
            }
        });

        if let Some(old) = self.inner.timers.lock().connection_timeout.replace(handle) {
            old.abort();
        }
    }

    fn start_end_ack_timer(&self, generation: u64) {
        let this = self.clone();
        let timeout = self.inner.config.end_ack_timeout();

        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let pending = {
                let slot = this.inner.slot.lock();
                slot.generation == generation
                    && slot.session.state == CallState::Ending
                    && !slot.tearing_down
            };
            if pending {
                tracing::warn!("No call-ended from relay after {:?}, tearing down", timeout);
                tokio::spawn(async move { this.complete_end(generation, None).await });
            }
        });

        if let Some(old) = self.inner.timers.lock().end_ack.replace(handle) {
            old.abort();
        }
    }

    fn clear_timers(&self) {
        let mut timers = self.inner.timers.lock();
        for timer in [timers.connection_timeout.take(), timers.end_ack.take()]
            .into_iter()
            .flatten()
        {
            timer.abort();
        }
    }

    fn emit_state(&self, state: CallState) {
        tracing::debug!("Call state: {:?}", state);
        let _ = self.inner.event_tx.send(CallEvent::StateChanged(state));
    }
}

impl std::fmt::Debug for CallOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let slot = self.inner.slot.lock();
        f.debug_struct("CallOrchestrator")
            .field("state", &slot.session.state)
            .field("call_id", &slot.session.call_id)
            .field("generation", &slot.generation)
            .finish()
    }
}

// ============================================================================
// CONNECTION OBSERVER
// ============================================================================

/// Verbindet den Connection Manager mit dem Orchestrator, ohne ihn am
/// Leben zu halten
struct SessionObserver {
    inner: Weak<Inner>,
}

impl SessionObserver {
    fn orchestrator(&self) -> Option<CallOrchestrator> {
        self.inner.upgrade().map(|inner| CallOrchestrator { inner })
    }
}

impl ConnectionObserver for SessionObserver {
    fn on_local_candidate(&self, candidate: &IceCandidate) {
        if let Some(orchestrator) = self.orchestrator() {
            orchestrator.forward_candidate(candidate.clone());
        }
    }

    fn on_remote_media(&self, stream: &RemoteStream) {
        if let Some(orchestrator) = self.orchestrator() {
            orchestrator.remote_media_observed(stream.clone());
        }
    }

    fn on_connected(&self) {
        if let Some(orchestrator) = self.orchestrator() {
            orchestrator.connection_established();
        }
    }

    fn on_connection_failure(&self, kind: CallErrorKind) {
        if let Some(orchestrator) = self.orchestrator() {
            orchestrator.connection_failed(kind);
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call_engine::connection::PeerConnectionState;
    use crate::call_engine::media::{MediaError, TrackKind};
    use crate::call_engine::testing::{
        candidate, FakeCaptureDevices, FakeConnectionFactory, FakePeerConnection, RecordingRelay,
    };
    use crate::signaling::RelayRequest;

    struct Harness {
        call: CallOrchestrator,
        relay: Arc<RecordingRelay>,
        factory: Arc<FakeConnectionFactory>,
        devices: Arc<FakeCaptureDevices>,
        config: CallConfig,
    }

    fn harness() -> Harness {
        let config = CallConfig::default();
        let relay = Arc::new(RecordingRelay::default());
        let factory = Arc::new(FakeConnectionFactory::default());
        let devices = Arc::new(FakeCaptureDevices::default());
        let call = CallOrchestrator::new(
            config.clone(),
            relay.clone(),
            factory.clone(),
            devices.clone(),
        );
        Harness {
            call,
            relay,
            factory,
            devices,
            config,
        }
    }

    fn drain(rx: &mut broadcast::Receiver<CallEvent>) -> Vec<CallEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn states(events: &[CallEvent]) -> Vec<CallState> {
        events
            .iter()
            .filter_map(|e| match e {
                CallEvent::StateChanged(state) => Some(*state),
                _ => None,
            })
            .collect()
    }

    /// Caller-Seite bis IN_CALL, Call-ID 42
    async fn caller_in_call(h: &Harness, call_type: CallType) -> Arc<FakePeerConnection> {
        h.call
            .start_outgoing_call("peer-2".into(), PeerInfo::named("Bob"), call_type)
            .await
            .unwrap();
        h.call.on_call_initiated(CallId(42));
        h.call.on_call_accepted(CallId(42)).await;
        h.call
            .on_answer("peer-2", SessionDescription::answer("answer"))
            .await;

        let pc = h.factory.latest();
        pc.emit_state(PeerConnectionState::Connected);
        pc.emit_track("audio-1", "remote", TrackKind::Audio);
        assert_eq!(h.call.state(), CallState::InCall);
        pc
    }

    #[tokio::test(start_paused = true)]
    async fn test_outgoing_video_call_reaches_in_call() {
        let h = harness();
        let mut rx = h.call.subscribe();

        h.call
            .start_outgoing_call("peer-2".into(), PeerInfo::named("Bob"), CallType::Video)
            .await
            .unwrap();
        assert_eq!(h.call.state(), CallState::OutgoingRinging);
        assert_eq!(
            h.relay.sent(),
            vec![RelayRequest::CallStart {
                callee_id: "peer-2".into(),
                call_type: CallType::Video
            }]
        );

        h.call.on_call_initiated(CallId(42));
        assert_eq!(h.call.session().call_id, Some(CallId(42)));

        h.call.on_call_accepted(CallId(42)).await;
        assert_eq!(h.call.state(), CallState::Connecting);
        assert_eq!(h.relay.labels(), vec!["call-start", "offer"]);
        assert_eq!(h.devices.log(), vec!["open:audio", "open:video"]);

        let pc = h.factory.latest();
        assert_eq!(pc.local_track_count(), 2);

        h.call
            .on_answer("peer-2", SessionDescription::answer("answer"))
            .await;
        assert_eq!(pc.remote_descriptions().len(), 1);

        // Verbunden reicht nicht für IN_CALL
        pc.emit_state(PeerConnectionState::Connected);
        assert_eq!(h.call.state(), CallState::Connecting);
        assert!(h.call.session().started_at.is_none());

        pc.emit_track("audio-1", "remote", TrackKind::Audio);
        let session = h.call.session();
        assert_eq!(session.state, CallState::InCall);
        assert!(session.started_at.is_some());
        assert!(session.remote_stream.is_some());
        assert!(session.local_stream.is_some());

        let events = drain(&mut rx);
        assert_eq!(
            states(&events),
            vec![
                CallState::OutgoingRinging,
                CallState::Connecting,
                CallState::InCall
            ]
        );
        assert!(events
            .iter()
            .any(|e| matches!(e, CallEvent::RemoteMedia(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_callee_buffers_candidates_until_offer() {
        let h = harness();
        h.call.receive_incoming_call(
            CallId(7),
            CallType::Voice,
            "peer-1".into(),
            PeerInfo::named("Alice"),
        );
        assert_eq!(h.call.state(), CallState::IncomingRinging);

        h.call.accept().await.unwrap();
        assert_eq!(h.call.state(), CallState::Connecting);
        assert_eq!(h.relay.labels(), vec!["call-accept"]);
        // Media erst mit dem Offer
        assert!(h.devices.log().is_empty());

        for c in ["c1", "c2", "c3"] {
            h.call.on_candidate("peer-1", candidate(c)).await;
        }
        let pc = h.factory.latest();
        assert!(pc.applied_candidates().is_empty());

        h.call
            .on_offer("peer-1", SessionDescription::offer("offer"))
            .await;
        assert_eq!(h.relay.labels(), vec!["call-accept", "answer"]);
        assert_eq!(pc.applied_candidates(), vec!["c1", "c2", "c3"]);
        assert_eq!(h.devices.log(), vec!["open:audio"]);

        h.call.on_candidate("peer-1", candidate("c4")).await;
        assert_eq!(pc.applied_candidates(), vec!["c1", "c2", "c3", "c4"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_offer_does_not_reacquire_media() {
        let h = harness();
        h.call.receive_incoming_call(
            CallId(7),
            CallType::Voice,
            "peer-1".into(),
            PeerInfo::named("Alice"),
        );
        h.call.accept().await.unwrap();

        let offer = SessionDescription::offer("offer");
        h.call.on_offer("peer-1", offer.clone()).await;
        h.call.on_offer("peer-1", offer).await;

        assert_eq!(h.relay.count("answer"), 1);
        assert_eq!(h.devices.log(), vec!["open:audio"]);
        assert_eq!(h.factory.latest().remote_descriptions().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_local_candidates_forwarded_to_peer() {
        let h = harness();
        let pc = caller_in_call(&h, CallType::Voice).await;

        pc.emit_candidate("local-1");
        assert_eq!(
            h.relay.sent().last(),
            Some(&RelayRequest::Ice {
                to_id: "peer-2".into(),
                candidate: candidate("local-1")
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_device_busy_twice_fails_with_device_busy() {
        let h = harness();
        h.devices.fail_next(MediaError::DeviceBusy("not readable".into()));
        h.devices.fail_next(MediaError::DeviceBusy("not readable".into()));

        h.call
            .start_outgoing_call("peer-2".into(), PeerInfo::named("Bob"), CallType::Voice)
            .await
            .unwrap();
        h.call.on_call_initiated(CallId(42));

        let start = tokio::time::Instant::now();
        h.call.on_call_accepted(CallId(42)).await;
        assert!(start.elapsed() >= h.config.device_retry_delay());

        let session = h.call.session();
        assert_eq!(session.state, CallState::Error);
        assert_eq!(session.error, Some(CallErrorKind::DeviceBusy));
        assert_eq!(h.devices.open_attempts(), 2);
        assert_eq!(h.relay.count("offer"), 0);
        assert_eq!(h.relay.count("call-end"), 1);
        assert!(h.factory.latest().is_closed());

        tokio::time::sleep(h.config.error_display() + Duration::from_millis(100)).await;
        let session = h.call.session();
        assert_eq!(session.state, CallState::Idle);
        assert!(session.error.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_end_call_settles_to_idle_after_ack() {
        let h = harness();
        let pc = caller_in_call(&h, CallType::Video).await;
        let mut rx = h.call.subscribe();

        h.call.end_call().unwrap();
        h.call.end_call().unwrap();
        assert_eq!(h.call.state(), CallState::Ending);
        assert_eq!(h.relay.count("call-end"), 1);
        assert!(h.call.session().remote_stream.is_none());

        let start = tokio::time::Instant::now();
        h.call.on_call_ended(CallId(42), Some(12)).await;
        assert!(start.elapsed() >= h.config.end_settle());

        let session = h.call.session();
        assert_eq!(session.state, CallState::Idle);
        assert!(session.local_stream.is_none());
        assert!(session.remote_stream.is_none());
        assert!(pc.is_closed());
        assert_eq!(
            h.devices.log(),
            vec!["open:audio", "open:video", "stop:audio", "stop:video"]
        );

        let events = drain(&mut rx);
        assert!(events.iter().any(|e| matches!(
            e,
            CallEvent::Ended { call_id: Some(CallId(42)), duration: Some(d) } if *d == Duration::from_secs(12)
        )));
        assert_eq!(
            states(&events),
            vec![CallState::Ending, CallState::Idle]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_call_ended_is_harmless() {
        let h = harness();
        caller_in_call(&h, CallType::Voice).await;
        h.call.end_call().unwrap();

        h.call.on_call_ended(CallId(42), None).await;
        h.call.on_call_ended(CallId(42), None).await;
        assert_eq!(h.call.state(), CallState::Idle);
        assert_eq!(h.devices.log(), vec!["open:audio", "stop:audio"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_hangup_tears_down() {
        let h = harness();
        let pc = caller_in_call(&h, CallType::Voice).await;

        h.call.on_call_ended(CallId(42), Some(30)).await;
        assert_eq!(h.call.state(), CallState::Idle);
        assert!(pc.is_closed());
        assert_eq!(h.relay.count("call-end"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_end_before_initiated_is_deferred() {
        let h = harness();
        h.call
            .start_outgoing_call("peer-2".into(), PeerInfo::named("Bob"), CallType::Voice)
            .await
            .unwrap();

        h.call.end_call().unwrap();
        assert_eq!(h.relay.count("call-end"), 0);

        h.call.on_call_initiated(CallId(42));
        assert_eq!(
            h.relay.sent().last(),
            Some(&RelayRequest::CallEnd { call_id: CallId(42) })
        );

        // Ein spätes call-accepted startet nichts mehr
        h.call.on_call_accepted(CallId(42)).await;
        assert_eq!(h.factory.count(), 0);

        h.call.on_call_ended(CallId(42), None).await;
        assert_eq!(h.call.state(), CallState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_end_ack_timeout_forces_teardown() {
        let h = harness();
        let pc = caller_in_call(&h, CallType::Voice).await;

        h.call.end_call().unwrap();
        tokio::time::sleep(h.config.end_ack_timeout() + Duration::from_secs(1)).await;

        assert_eq!(h.call.state(), CallState::Idle);
        assert!(pc.is_closed());
        assert_eq!(h.relay.count("call-end"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connection_timeout_fails_call() {
        let h = harness();
        h.call
            .start_outgoing_call("peer-2".into(), PeerInfo::named("Bob"), CallType::Voice)
            .await
            .unwrap();
        h.call.on_call_initiated(CallId(42));
        h.call.on_call_accepted(CallId(42)).await;

        tokio::time::sleep(h.config.connection_timeout() + Duration::from_millis(100)).await;

        let session = h.call.session();
        assert_eq!(session.state, CallState::Error);
        assert_eq!(session.error, Some(CallErrorKind::ConnectionTimeout));
        assert_eq!(h.relay.count("call-end"), 1);
        assert!(h.factory.latest().is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connected_clears_timeout() {
        let h = harness();
        h.call
            .start_outgoing_call("peer-2".into(), PeerInfo::named("Bob"), CallType::Voice)
            .await
            .unwrap();
        h.call.on_call_initiated(CallId(42));
        h.call.on_call_accepted(CallId(42)).await;
        h.factory
            .latest()
            .emit_state(PeerConnectionState::Connected);

        tokio::time::sleep(h.config.connection_timeout() * 2).await;
        assert_eq!(h.call.state(), CallState::Connecting);
        assert!(h.call.session().error.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_after_media_is_connection_lost() {
        let h = harness();
        let pc = caller_in_call(&h, CallType::Voice).await;

        pc.emit_state(PeerConnectionState::Disconnected);
        tokio::time::sleep(Duration::from_millis(1)).await;

        let session = h.call.session();
        assert_eq!(session.state, CallState::Error);
        assert_eq!(session.error, Some(CallErrorKind::ConnectionLost));
        assert!(session.remote_stream.is_none());
        assert_eq!(h.relay.count("call-end"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_answer_applied_once_on_redelivery() {
        let h = harness();
        caller_in_call(&h, CallType::Voice).await;

        h.call
            .on_answer("peer-2", SessionDescription::answer("answer"))
            .await;
        assert_eq!(h.factory.latest().remote_descriptions().len(), 1);
        assert_eq!(h.call.state(), CallState::InCall);
    }

    #[tokio::test(start_paused = true)]
    async fn test_incoming_call_while_busy_is_rejected() {
        let h = harness();
        h.call
            .start_outgoing_call("peer-2".into(), PeerInfo::named("Bob"), CallType::Voice)
            .await
            .unwrap();
        h.call.on_call_initiated(CallId(42));

        h.call.receive_incoming_call(
            CallId(9),
            CallType::Video,
            "peer-3".into(),
            PeerInfo::named("Carol"),
        );

        let session = h.call.session();
        assert_eq!(session.state, CallState::OutgoingRinging);
        assert_eq!(session.call_id, Some(CallId(42)));
        assert_eq!(
            h.relay.sent().last(),
            Some(&RelayRequest::CallReject { call_id: CallId(9) })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_incoming_call_ignored() {
        let h = harness();
        for _ in 0..2 {
            h.call.receive_incoming_call(
                CallId(7),
                CallType::Voice,
                "peer-1".into(),
                PeerInfo::named("Alice"),
            );
        }
        assert_eq!(h.call.state(), CallState::IncomingRinging);
        assert!(h.relay.sent().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_outgoing_call_refused() {
        let h = harness();
        h.call
            .start_outgoing_call("peer-2".into(), PeerInfo::named("Bob"), CallType::Voice)
            .await
            .unwrap();

        let result = h
            .call
            .start_outgoing_call("peer-3".into(), PeerInfo::named("Carol"), CallType::Voice)
            .await;
        assert!(matches!(result, Err(CallError::AlreadyInCall)));
        assert_eq!(h.relay.count("call-start"), 1);
        assert_eq!(h.call.session().peer_id.as_deref(), Some("peer-2"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reject_returns_to_idle() {
        let h = harness();
        h.call.receive_incoming_call(
            CallId(7),
            CallType::Voice,
            "peer-1".into(),
            PeerInfo::named("Alice"),
        );

        h.call.reject().unwrap();
        assert_eq!(h.call.state(), CallState::Idle);
        assert_eq!(
            h.relay.sent(),
            vec![RelayRequest::CallReject { call_id: CallId(7) }]
        );
        assert!(matches!(
            h.call.reject(),
            Err(CallError::InvalidState(CallState::Idle))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_peer_rejection_shows_error_then_idle() {
        let h = harness();
        h.call
            .start_outgoing_call("peer-2".into(), PeerInfo::named("Bob"), CallType::Voice)
            .await
            .unwrap();
        h.call.on_call_initiated(CallId(42));

        h.call.on_call_rejected(CallId(42)).await;
        assert_eq!(h.call.state(), CallState::Error);
        assert_eq!(h.call.session().error, Some(CallErrorKind::Rejected));
        assert_eq!(h.relay.count("call-end"), 0);

        tokio::time::sleep(h.config.error_display() + Duration::from_millis(100)).await;
        assert_eq!(h.call.state(), CallState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_failed_before_initiated() {
        let h = harness();
        h.call
            .start_outgoing_call("peer-2".into(), PeerInfo::named("Bob"), CallType::Voice)
            .await
            .unwrap();

        h.call.on_call_failed(None, "offline").await;
        assert_eq!(h.call.session().error, Some(CallErrorKind::PeerOffline));
    }

    #[tokio::test(start_paused = true)]
    async fn test_relay_events_for_other_calls_ignored() {
        let h = harness();
        caller_in_call(&h, CallType::Voice).await;

        h.call.on_call_missed(CallId(99)).await;
        h.call.on_call_ended(CallId(99), None).await;
        h.call
            .on_candidate("stranger", candidate("c1"))
            .await;

        assert_eq!(h.call.state(), CallState::InCall);
        assert!(!h
            .factory
            .latest()
            .applied_candidates()
            .contains(&"c1".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_media_acquired_after_end_is_released() {
        let h = harness();
        h.call
            .start_outgoing_call("peer-2".into(), PeerInfo::named("Bob"), CallType::Voice)
            .await
            .unwrap();
        h.call.on_call_initiated(CallId(42));
        h.devices.fail_next(MediaError::DeviceBusy("not readable".into()));

        let accepting = {
            let call = h.call.clone();
            tokio::spawn(async move { call.on_call_accepted(CallId(42)).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(h.call.state(), CallState::Connecting);

        h.call.end_call().unwrap();
        h.call.on_call_ended(CallId(42), None).await;
        accepting.await.unwrap();

        assert_eq!(h.call.state(), CallState::Idle);
        assert_eq!(h.devices.log(), vec!["open:audio", "stop:audio"]);
        assert_eq!(h.relay.count("offer"), 0);
        assert!(h.factory.latest().is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_next_call_gets_fresh_connection() {
        let h = harness();
        let first = caller_in_call(&h, CallType::Voice).await;
        h.call.end_call().unwrap();
        h.call.on_call_ended(CallId(42), None).await;

        h.call.receive_incoming_call(
            CallId(43),
            CallType::Voice,
            "peer-2".into(),
            PeerInfo::named("Bob"),
        );
        h.call.accept().await.unwrap();

        assert_eq!(h.factory.count(), 2);
        assert!(first.is_closed());
        assert!(!h.factory.latest().is_closed());

        // Nachzügler der alten Verbindung ändern nichts
        first.emit_track("late", "old", TrackKind::Audio);
        assert_eq!(h.call.state(), CallState::Connecting);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mute_and_video_toggles() {
        let h = harness();
        assert!(matches!(h.call.set_muted(true), Err(CallError::NoActiveCall)));

        caller_in_call(&h, CallType::Video).await;
        h.call.set_muted(true).unwrap();
        h.call.set_video_off(true).unwrap();
        h.call.set_speaker_on(true).unwrap();

        let session = h.call.session();
        assert!(session.is_muted && session.is_video_off && session.is_speaker_on);
        let stream = session.local_stream.unwrap();
        assert!(!stream.track(TrackKind::Audio).unwrap().is_enabled());
        assert!(!stream.track(TrackKind::Video).unwrap().is_enabled());
        assert_eq!(h.call.input_level(), 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mute_before_media_applies_on_acquire() {
        let h = harness();
        h.call.receive_incoming_call(
            CallId(7),
            CallType::Voice,
            "peer-1".into(),
            PeerInfo::named("Alice"),
        );
        h.call.set_muted(true).unwrap();
        h.call.accept().await.unwrap();
        h.call
            .on_offer("peer-1", SessionDescription::offer("offer"))
            .await;

        let stream = h.call.session().local_stream.unwrap();
        assert!(!stream.track(TrackKind::Audio).unwrap().is_enabled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_fails_when_relay_unreachable() {
        let h = harness();
        h.relay.set_offline(true);

        let result = h
            .call
            .start_outgoing_call("peer-2".into(), PeerInfo::named("Bob"), CallType::Voice)
            .await;
        assert!(matches!(result, Err(CallError::Signaling(_))));
        assert_eq!(h.call.state(), CallState::Error);
        assert!(matches!(
            h.call.session().error,
            Some(CallErrorKind::RelayError(_))
        ));
    }

    /// Ausgehender Anruf mit der gegebenen Call-ID bis zurück auf IDLE
    async fn finished_outgoing_call(h: &Harness, call_id: CallId) {
        h.call
            .start_outgoing_call("peer-2".into(), PeerInfo::named("Bob"), CallType::Voice)
            .await
            .unwrap();
        h.call.on_call_initiated(call_id);
        h.call.on_call_accepted(call_id).await;
        h.call.end_call().unwrap();
        h.call.on_call_ended(call_id, None).await;
        assert_eq!(h.call.state(), CallState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_redelivered_initiated_of_finished_call_ignored() {
        let h = harness();
        finished_outgoing_call(&h, CallId(41)).await;

        h.call
            .start_outgoing_call("peer-3".into(), PeerInfo::named("Carol"), CallType::Voice)
            .await
            .unwrap();
        h.call.on_call_initiated(CallId(41));
        assert_eq!(h.call.session().call_id, None);

        h.call.on_call_initiated(CallId(43));
        h.call.on_call_accepted(CallId(43)).await;

        let session = h.call.session();
        assert_eq!(session.call_id, Some(CallId(43)));
        assert_eq!(session.state, CallState::Connecting);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_terminal_events_spare_pending_call() {
        let h = harness();
        finished_outgoing_call(&h, CallId(41)).await;

        h.call
            .start_outgoing_call("peer-3".into(), PeerInfo::named("Carol"), CallType::Voice)
            .await
            .unwrap();
        h.call.on_call_ended(CallId(41), None).await;
        h.call.on_call_rejected(CallId(41)).await;
        h.call.on_call_missed(CallId(41)).await;

        let session = h.call.session();
        assert_eq!(session.state, CallState::OutgoingRinging);
        assert_eq!(session.error, None);
        assert_eq!(session.peer_id.as_deref(), Some("peer-3"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_redelivered_incoming_call_after_reject_ignored() {
        let h = harness();
        h.call.receive_incoming_call(
            CallId(7),
            CallType::Voice,
            "peer-1".into(),
            PeerInfo::named("Alice"),
        );
        h.call.reject().unwrap();

        h.call.receive_incoming_call(
            CallId(7),
            CallType::Voice,
            "peer-1".into(),
            PeerInfo::named("Alice"),
        );

        assert_eq!(h.call.state(), CallState::Idle);
        assert_eq!(h.relay.count("call-reject"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_accept_fails_when_connection_cannot_be_created() {
        let h = harness();
        h.call.receive_incoming_call(
            CallId(7),
            CallType::Voice,
            "peer-1".into(),
            PeerInfo::named("Alice"),
        );
        h.factory.fail_next();

        h.call.accept().await.unwrap();

        let session = h.call.session();
        assert_eq!(session.state, CallState::Error);
        assert_eq!(session.error, Some(CallErrorKind::ConnectionFailed));
        assert_eq!(h.relay.count("call-accept"), 0);
        assert!(h.devices.log().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_caller_fails_when_connection_cannot_be_created() {
        let h = harness();
        h.call
            .start_outgoing_call("peer-2".into(), PeerInfo::named("Bob"), CallType::Video)
            .await
            .unwrap();
        h.call.on_call_initiated(CallId(42));
        h.factory.fail_next();

        h.call.on_call_accepted(CallId(42)).await;

        let session = h.call.session();
        assert_eq!(session.state, CallState::Error);
        assert_eq!(session.error, Some(CallErrorKind::ConnectionFailed));
        assert_eq!(h.relay.count("offer"), 0);
        assert_eq!(h.relay.count("call-end"), 1);
        assert!(h.devices.log().is_empty());
    }
}
