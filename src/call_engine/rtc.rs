//! WebRTC Backend für den Connection Manager
//!
//! Baut pro Anruf eine neue `RTCPeerConnection` und leitet ihre Callbacks
//! an die [`ConnectionEvents`] der aktuellen Epoch weiter.

use super::connection::{
    ConnectionError, ConnectionEvents, IceCandidate, PeerConnection, PeerConnectionFactory,
    PeerConnectionState, RemoteTrack, SessionDescription, SdpType, SignalingState,
};
use super::media::{LocalStream, TrackKind};
use crate::config::IceServerConfig;
use async_trait::async_trait;
use std::sync::Arc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::track::track_local::TrackLocal;

fn rtc_err(e: webrtc::Error) -> ConnectionError {
    ConnectionError::WebRTC(e.to_string())
}

// ============================================================================
// FACTORY
// ============================================================================

/// Erzeugt echte WebRTC Peer Connections
#[derive(Debug, Clone)]
pub struct RtcConnectionFactory {
    ice_servers: Vec<RTCIceServer>,
}

impl RtcConnectionFactory {
    pub fn new(ice_servers: &[IceServerConfig]) -> Self {
        let ice_servers = ice_servers
            .iter()
            .map(|server| RTCIceServer {
                urls: server.urls.clone(),
                username: server.username.clone().unwrap_or_default(),
                credential: server.credential.clone().unwrap_or_default(),
                ..Default::default()
            })
            .collect();

        Self { ice_servers }
    }
}

#[async_trait]
impl PeerConnectionFactory for RtcConnectionFactory {
    async fn create(
        &self,
        events: Arc<dyn ConnectionEvents>,
    ) -> Result<Arc<dyn PeerConnection>, ConnectionError> {
        // Media Engine mit Opus/VP8 etc.
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().map_err(rtc_err)?;

        // Interceptors für RTCP, NACK etc.
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine).map_err(rtc_err)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };

        let pc = Arc::new(api.new_peer_connection(config).await.map_err(rtc_err)?);
        register_handlers(&pc, events);

        Ok(Arc::new(RtcPeerConnection { pc }))
    }
}

/// Registriert die Callbacks der Peer Connection
fn register_handlers(pc: &RTCPeerConnection, events: Arc<dyn ConnectionEvents>) {
    let state_events = Arc::clone(&events);
    pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
        state_events.state_changed(map_connection_state(s));
        Box::pin(async {})
    }));

    let candidate_events = Arc::clone(&events);
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        if let Some(c) = candidate {
            match c.to_json() {
                Ok(init) => candidate_events.local_candidate(from_candidate_init(init)),
                Err(e) => tracing::warn!("Failed to serialize local ICE candidate: {}", e),
            }
        }
        Box::pin(async {})
    }));

    let track_events = events;
    pc.on_track(Box::new(move |track, _, _| {
        let kind = match track.kind() {
            RTPCodecType::Video => TrackKind::Video,
            _ => TrackKind::Audio,
        };
        track_events.remote_track(RemoteTrack {
            id: track.id(),
            stream_id: track.stream_id(),
            kind,
            source: Some(track),
        });
        Box::pin(async {})
    }));
}

// ============================================================================
// PEER CONNECTION
// ============================================================================

pub struct RtcPeerConnection {
    pc: Arc<RTCPeerConnection>,
}

#[async_trait]
impl PeerConnection for RtcPeerConnection {
    async fn add_local_stream(&self, stream: &LocalStream) -> Result<(), ConnectionError> {
        for track in &stream.tracks {
            self.pc
                .add_track(track.rtp_track() as Arc<dyn TrackLocal + Send + Sync>)
                .await
                .map_err(rtc_err)?;
        }
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, ConnectionError> {
        let offer = self.pc.create_offer(None).await.map_err(rtc_err)?;
        self.pc
            .set_local_description(offer.clone())
            .await
            .map_err(rtc_err)?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, ConnectionError> {
        let answer = self.pc.create_answer(None).await.map_err(rtc_err)?;
        self.pc
            .set_local_description(answer.clone())
            .await
            .map_err(rtc_err)?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), ConnectionError> {
        let rtc_description = match description.sdp_type {
            SdpType::Offer => RTCSessionDescription::offer(description.sdp),
            SdpType::Answer => RTCSessionDescription::answer(description.sdp),
        }
        .map_err(|e| ConnectionError::InvalidSdp(e.to_string()))?;

        self.pc
            .set_remote_description(rtc_description)
            .await
            .map_err(rtc_err)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), ConnectionError> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: candidate.username_fragment,
            })
            .await
            .map_err(rtc_err)
    }

    fn signaling_state(&self) -> SignalingState {
        match self.pc.signaling_state() {
            RTCSignalingState::HaveLocalOffer | RTCSignalingState::HaveRemotePranswer => {
                SignalingState::HaveLocalOffer
            }
            RTCSignalingState::HaveRemoteOffer | RTCSignalingState::HaveLocalPranswer => {
                SignalingState::HaveRemoteOffer
            }
            RTCSignalingState::Closed => SignalingState::Closed,
            _ => SignalingState::Stable,
        }
    }

    async fn close(&self) -> Result<(), ConnectionError> {
        for transceiver in self.pc.get_transceivers().await {
            if let Err(e) = transceiver.stop().await {
                tracing::debug!("Failed to stop transceiver: {}", e);
            }
        }
        self.pc.close().await.map_err(rtc_err)
    }
}

fn map_connection_state(state: RTCPeerConnectionState) -> PeerConnectionState {
    match state {
        RTCPeerConnectionState::Connecting => PeerConnectionState::Connecting,
        RTCPeerConnectionState::Connected => PeerConnectionState::Connected,
        RTCPeerConnectionState::Disconnected => PeerConnectionState::Disconnected,
        RTCPeerConnectionState::Failed => PeerConnectionState::Failed,
        RTCPeerConnectionState::Closed => PeerConnectionState::Closed,
        _ => PeerConnectionState::New,
    }
}

fn from_candidate_init(init: RTCIceCandidateInit) -> IceCandidate {
    IceCandidate {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_mline_index: init.sdp_mline_index,
        username_fragment: init.username_fragment,
    }
}
