//! Media Handler - lokale Audio/Video Aufnahme
//!
//! Acquire und Release laufen strikt nacheinander: eine noch laufende
//! Freigabe ist abgeschlossen, bevor die nächste Aufnahme startet.
//! Ist das Gerät noch belegt ("nicht lesbar"), wird genau einmal nach
//! einer festen Pause erneut versucht.

use super::error::CallErrorKind;
use super::session::CallType;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

/// Sample Rate für Opus (48kHz)
pub const SAMPLE_RATE: u32 = 48000;

/// RTP Clock Rate für Video
const VIDEO_CLOCK_RATE: u32 = 90000;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("No capture device found: {0}")]
    DeviceUnavailable(String),

    #[error("Capture device not readable: {0}")]
    DeviceBusy(String),

    #[error("Capture backend error: {0}")]
    Backend(String),
}

impl MediaError {
    pub fn kind(&self) -> CallErrorKind {
        match self {
            MediaError::PermissionDenied(_) => CallErrorKind::PermissionDenied,
            MediaError::DeviceBusy(_) => CallErrorKind::DeviceBusy,
            MediaError::DeviceUnavailable(_) | MediaError::Backend(_) => {
                CallErrorKind::DeviceUnavailable
            }
        }
    }
}

// ============================================================================
// TRACKS & STREAMS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

/// Geteilter Zustand zwischen Track und Aufnahme-Backend
#[derive(Debug, Clone)]
pub struct TrackControl {
    enabled: Arc<AtomicBool>,
    level: Arc<Mutex<f32>>,
}

impl TrackControl {
    fn new() -> Self {
        Self {
            enabled: Arc::new(AtomicBool::new(true)),
            level: Arc::new(Mutex::new(0.0)),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Vom Backend gemeldeter Pegel (0.0 - 1.0)
    pub fn report_level(&self, level: f32) {
        *self.level.lock() = level.clamp(0.0, 1.0);
    }

    pub fn level(&self) -> f32 {
        *self.level.lock()
    }
}

/// Lokaler Track
#[derive(Clone)]
pub struct LocalTrack {
    pub id: String,
    pub kind: TrackKind,
    control: TrackControl,
    sample_track: Arc<TrackLocalStaticSample>,
}

impl LocalTrack {
    fn new(kind: TrackKind, stream_id: &str) -> Self {
        let id = format!("{}-{}", kind_label(kind), uuid::Uuid::new_v4());
        let codec = match kind {
            TrackKind::Audio => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: SAMPLE_RATE,
                channels: 2,
                ..Default::default()
            },
            TrackKind::Video => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                clock_rate: VIDEO_CLOCK_RATE,
                ..Default::default()
            },
        };
        let sample_track = Arc::new(TrackLocalStaticSample::new(
            codec,
            id.clone(),
            stream_id.to_string(),
        ));

        Self {
            id,
            kind,
            control: TrackControl::new(),
            sample_track,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.control.is_enabled()
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.control.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn level(&self) -> f32 {
        self.control.level()
    }

    /// Track für die Peer Connection
    pub fn rtp_track(&self) -> Arc<TrackLocalStaticSample> {
        Arc::clone(&self.sample_track)
    }
}

impl std::fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

/// Lokaler Stream (Audio, optional Video)
#[derive(Debug, Clone)]
pub struct LocalStream {
    pub id: String,
    pub tracks: Vec<LocalTrack>,
}

impl LocalStream {
    pub fn track(&self, kind: TrackKind) -> Option<&LocalTrack> {
        self.tracks.iter().find(|t| t.kind == kind)
    }

    pub fn has_video(&self) -> bool {
        self.track(TrackKind::Video).is_some()
    }
}

fn kind_label(kind: TrackKind) -> &'static str {
    match kind {
        TrackKind::Audio => "audio",
        TrackKind::Video => "video",
    }
}

// ============================================================================
// CAPTURE BACKEND
// ============================================================================

/// Laufende Aufnahme eines Geräts
#[async_trait]
pub trait CaptureHandle: Send {
    /// Beendet die Aufnahme; kehrt erst zurück wenn das Gerät freigegeben ist
    async fn stop(&mut self);
}

/// Zugriff auf die Aufnahmegeräte der Plattform
pub trait CaptureDevices: Send + Sync {
    fn open(
        &self,
        kind: TrackKind,
        control: TrackControl,
    ) -> Result<Box<dyn CaptureHandle>, MediaError>;
}

struct HeldCapture {
    stream: LocalStream,
    handles: Vec<Box<dyn CaptureHandle>>,
}

// ============================================================================
// MEDIA HANDLER
// ============================================================================

/// Verwaltet die lokale Aufnahme des aktuellen Anrufs
pub struct MediaHandler {
    devices: Arc<dyn CaptureDevices>,
    held: tokio::sync::Mutex<Option<HeldCapture>>,
    current: Mutex<Option<LocalStream>>,
    /// Frühester Zeitpunkt für das nächste Öffnen der Geräte
    settled_at: Mutex<Option<Instant>>,
    retry_delay: Duration,
    settle_delay: Duration,
}

impl MediaHandler {
    pub fn new(devices: Arc<dyn CaptureDevices>, retry_delay: Duration, settle_delay: Duration) -> Self {
        Self {
            devices,
            held: tokio::sync::Mutex::new(None),
            current: Mutex::new(None),
            settled_at: Mutex::new(None),
            retry_delay,
            settle_delay,
        }
    }

    /// Startet die Aufnahme für einen Anruf.
    ///
    /// Eine noch gehaltene Aufnahme wird vorher vollständig freigegeben.
    pub async fn acquire(&self, call_type: CallType) -> Result<LocalStream, MediaError> {
        let mut held = self.held.lock().await;
        if let Some(previous) = held.take() {
            tracing::debug!("Releasing previous capture {} before acquire", previous.stream.id);
            self.release_held(previous).await;
        }
        self.settled().await;

        let capture = match self.open_all(call_type).await {
            Err(MediaError::DeviceBusy(reason)) => {
                tracing::warn!(
                    "Capture device busy ({}), retrying in {:?}",
                    reason,
                    self.retry_delay
                );
                tokio::time::sleep(self.retry_delay).await;
                self.open_all(call_type).await?
            }
            other => other?,
        };

        let stream = capture.stream.clone();
        *self.current.lock() = Some(stream.clone());
        *held = Some(capture);

        tracing::info!(
            "Local capture started: {} ({} track(s))",
            stream.id,
            stream.tracks.len()
        );
        Ok(stream)
    }

    /// Gibt die Aufnahme frei und wartet die Settle-Pause ab
    pub async fn release(&self) {
        self.stop().await;
        self.settled().await;
    }

    /// Stoppt die Geräte ohne die Settle-Pause abzuwarten.
    ///
    /// Das nächste `acquire` wartet die Pause trotzdem ab.
    pub async fn stop(&self) {
        let mut held = self.held.lock().await;
        if let Some(capture) = held.take() {
            self.release_held(capture).await;
        }
    }

    /// Kehrt zurück sobald die zuletzt gestoppten Geräte wieder frei sind
    pub async fn settled(&self) {
        let deadline = *self.settled_at.lock();
        if let Some(deadline) = deadline {
            tokio::time::sleep_until(deadline).await;
        }
    }

    /// Gibt nur frei wenn `stream_id` noch die gehaltene Aufnahme ist
    pub async fn release_stream(&self, stream_id: &str) {
        let mut held = self.held.lock().await;
        if held.as_ref().is_some_and(|c| c.stream.id == stream_id) {
            if let Some(capture) = held.take() {
                self.release_held(capture).await;
                drop(held);
                self.settled().await;
            }
        }
    }

    /// Schaltet Audio-Tracks an/aus, ohne Neuverhandlung
    pub fn set_audio_enabled(&self, enabled: bool) -> bool {
        self.set_enabled(TrackKind::Audio, enabled)
    }

    /// Schaltet Video-Tracks an/aus, ohne Neuverhandlung
    pub fn set_video_enabled(&self, enabled: bool) -> bool {
        self.set_enabled(TrackKind::Video, enabled)
    }

    /// Aktueller Mikrofon-Pegel
    pub fn input_level(&self) -> f32 {
        self.current
            .lock()
            .as_ref()
            .and_then(|s| s.track(TrackKind::Audio).map(|t| t.level()))
            .unwrap_or(0.0)
    }

    pub fn is_capturing(&self) -> bool {
        self.current.lock().is_some()
    }

    fn set_enabled(&self, kind: TrackKind, enabled: bool) -> bool {
        let current = self.current.lock();
        match current.as_ref().and_then(|s| s.track(kind)) {
            Some(track) => {
                track.set_enabled(enabled);
                tracing::debug!("{} track enabled: {}", kind_label(kind), enabled);
                true
            }
            None => false,
        }
    }

    async fn open_all(&self, call_type: CallType) -> Result<HeldCapture, MediaError> {
        let stream_id = uuid::Uuid::new_v4().to_string();
        let mut kinds = vec![TrackKind::Audio];
        if call_type.has_video() {
            kinds.push(TrackKind::Video);
        }

        let mut tracks = Vec::with_capacity(kinds.len());
        let mut handles: Vec<Box<dyn CaptureHandle>> = Vec::with_capacity(kinds.len());

        for kind in kinds {
            let track = LocalTrack::new(kind, &stream_id);
            match self.devices.open(kind, track.control.clone()) {
                Ok(handle) => {
                    handles.push(handle);
                    tracks.push(track);
                }
                Err(e) => {
                    // Bereits geöffnete Geräte wieder freigeben
                    for mut handle in handles {
                        handle.stop().await;
                    }
                    return Err(e);
                }
            }
        }

        Ok(HeldCapture {
            stream: LocalStream {
                id: stream_id,
                tracks,
            },
            handles,
        })
    }

    async fn release_held(&self, capture: HeldCapture) {
        let HeldCapture { stream, handles } = capture;

        for track in &stream.tracks {
            track.set_enabled(false);
        }
        for mut handle in handles {
            handle.stop().await;
        }
        self.current.lock().take();
        *self.settled_at.lock() = Some(Instant::now() + self.settle_delay);

        tracing::info!("Local capture released: {}", stream.id);
    }
}

impl std::fmt::Debug for MediaHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaHandler")
            .field("is_capturing", &self.is_capturing())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================
