//! Aufnahme-Backend der Plattform
//!
//! Verwendet cpal für das Mikrofon. Video wird nicht von einer Kamera
//! gelesen: der Video-Track wird vom Einbetter mit fertig kodierten
//! Frames über `LocalTrack::rtp_track()` befüllt.

use super::media::{CaptureDevices, CaptureHandle, MediaError, TrackControl, TrackKind, SAMPLE_RATE};
use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{
    BuildStreamError, Device, PlayStreamError, SampleFormat, Stream, StreamConfig,
    SupportedStreamConfigRange, SupportedStreamConfigsError,
};

// ============================================================================
// DEVICES
// ============================================================================

/// Geräte des Standard-Hosts
#[derive(Debug, Default)]
pub struct CpalDevices;

impl CaptureDevices for CpalDevices {
    fn open(
        &self,
        kind: TrackKind,
        control: TrackControl,
    ) -> Result<Box<dyn CaptureHandle>, MediaError> {
        match kind {
            TrackKind::Audio => Ok(Box::new(MicrophoneCapture::start(control)?)),
            TrackKind::Video => Ok(Box::new(SampleFedVideo)),
        }
    }
}

// ============================================================================
// MICROPHONE
// ============================================================================

/// Laufende Mikrofon-Aufnahme
pub struct MicrophoneCapture {
    stream: Option<Stream>,
}

// cpal::Stream ist nicht Send; der Stream wird nur gehalten und beim
// Stoppen gedroppt, nie von einem anderen Thread aus benutzt
unsafe impl Send for MicrophoneCapture {}

impl MicrophoneCapture {
    fn start(control: TrackControl) -> Result<Self, MediaError> {
        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .ok_or_else(|| MediaError::DeviceUnavailable("no audio input device".to_string()))?;

        let config = find_best_input_config(&device)?;

        tracing::info!(
            "Starting audio capture: {} Hz, {} channel(s)",
            config.sample_rate.0,
            config.channels
        );

        let stream = device
            .build_input_stream(
                &config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    if data.is_empty() || !control.is_enabled() {
                        control.report_level(0.0);
                        return;
                    }
                    // Pegel als RMS
                    let rms = (data.iter().map(|s| s * s).sum::<f32>() / data.len() as f32).sqrt();
                    control.report_level(rms);
                },
                |err| {
                    tracing::error!("Audio capture error: {}", err);
                },
                None,
            )
            .map_err(map_build_error)?;

        stream.play().map_err(map_play_error)?;

        Ok(Self {
            stream: Some(stream),
        })
    }
}

#[async_trait]
impl CaptureHandle for MicrophoneCapture {
    async fn stop(&mut self) {
        // Drop blockiert bis der Host den Stream beendet hat
        if let Some(stream) = self.stream.take() {
            drop(stream);
            tracing::info!("Audio capture stopped");
        }
    }
}

// ============================================================================
// VIDEO
// ============================================================================

/// Video-Track ohne eigene Gerätequelle
pub struct SampleFedVideo;

#[async_trait]
impl CaptureHandle for SampleFedVideo {
    async fn stop(&mut self) {
        tracing::debug!("Video source detached");
    }
}

// ============================================================================
// CONFIG SELECTION & ERROR MAPPING
// ============================================================================

fn find_best_input_config(device: &Device) -> Result<StreamConfig, MediaError> {
    let configs = device.supported_input_configs().map_err(|e| match e {
        SupportedStreamConfigsError::DeviceNotAvailable => {
            MediaError::DeviceBusy("input device not available".to_string())
        }
        SupportedStreamConfigsError::BackendSpecific { err } => classify_backend(err.description),
        other => MediaError::Backend(other.to_string()),
    })?;

    select_best_config(configs.collect())
}

/// Wählt eine F32-Konfiguration, bevorzugt 48kHz
fn select_best_config(configs: Vec<SupportedStreamConfigRange>) -> Result<StreamConfig, MediaError> {
    let target_rate = cpal::SampleRate(SAMPLE_RATE);

    let mut f32_configs = configs
        .iter()
        .filter(|c| c.sample_format() == SampleFormat::F32)
        .peekable();

    if f32_configs.peek().is_none() {
        return Err(MediaError::Backend(
            "no f32 input configuration available".to_string(),
        ));
    }

    let mut fallback: Option<StreamConfig> = None;
    for config in f32_configs {
        if config.min_sample_rate() <= target_rate && config.max_sample_rate() >= target_rate {
            return Ok(config.clone().with_sample_rate(target_rate).into());
        }
        if fallback.is_none() {
            fallback = Some(config.clone().with_max_sample_rate().into());
        }
    }

    fallback.ok_or_else(|| MediaError::Backend("no suitable input configuration".to_string()))
}

fn map_build_error(err: BuildStreamError) -> MediaError {
    match err {
        BuildStreamError::DeviceNotAvailable => {
            MediaError::DeviceBusy("input device not available".to_string())
        }
        BuildStreamError::BackendSpecific { err } => classify_backend(err.description),
        other => MediaError::Backend(other.to_string()),
    }
}

fn map_play_error(err: PlayStreamError) -> MediaError {
    match err {
        PlayStreamError::DeviceNotAvailable => {
            MediaError::DeviceBusy("input device not available".to_string())
        }
        PlayStreamError::BackendSpecific { err } => classify_backend(err.description),
    }
}

/// Host-spezifische Fehlertexte einordnen
fn classify_backend(description: String) -> MediaError {
    let lower = description.to_lowercase();
    if lower.contains("permission") || lower.contains("denied") || lower.contains("not authorized")
    {
        MediaError::PermissionDenied(description)
    } else if lower.contains("busy") || lower.contains("in use") {
        MediaError::DeviceBusy(description)
    } else {
        MediaError::Backend(description)
    }
}
