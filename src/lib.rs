//! Call App - P2P Voice/Video Call Core
//!
//! Steuert genau einen Anruf zwischen zwei Peers:
//! - Cloudflare Worker als Signaling-Relay
//! - WebRTC für P2P Audio/Video
//! - Ed25519 Authentifizierung der Relay-Frames

pub mod call_engine;
pub mod config;
pub mod crypto;
pub mod logging;
pub mod signaling;

use call_engine::{
    CallEvent, CallOrchestrator, CallState, CallType, CpalDevices, PeerInfo, RtcConnectionFactory,
};
use config::CallConfig;
use crypto::KeyPair;
use signaling::{SignalingClient, SignalingError, SignalingEvent};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;

// ============================================================================
// APPLICATION
// ============================================================================

/// Verdrahtet Identität, Relay-Client und Orchestrator
pub struct CallApp {
    keypair: Arc<KeyPair>,
    signaling: Arc<SignalingClient>,
    orchestrator: CallOrchestrator,
}

impl CallApp {
    pub fn new(config: CallConfig) -> anyhow::Result<Self> {
        tracing::info!("Initializing Call App...");

        let keypair = Arc::new(KeyPair::load_or_create(config.key_path.as_deref())?);
        tracing::info!("Loaded keypair: {:?}", keypair);

        let signaling = Arc::new(SignalingClient::new(&config, Arc::clone(&keypair))?);
        let factory = Arc::new(RtcConnectionFactory::new(&config.ice_servers));

        let orchestrator = CallOrchestrator::new(
            config,
            signaling.clone(),
            factory,
            Arc::new(CpalDevices),
        );

        Ok(Self {
            keypair,
            signaling,
            orchestrator,
        })
    }

    pub fn orchestrator(&self) -> &CallOrchestrator {
        &self.orchestrator
    }

    pub fn public_key(&self) -> String {
        self.keypair.public_key_base64()
    }

    pub fn peer_id(&self) -> Option<String> {
        self.signaling.peer_id()
    }

    /// Verbindet mit dem Relay, registriert den Benutzer und startet
    /// Event-Dispatch und Heartbeat
    pub async fn connect(&self, username: String) -> Result<String, SignalingError> {
        tracing::info!("Connecting as '{}'...", username);

        // Vor dem Connect abonnieren, sonst gehen frühe Events verloren
        let mut event_rx = self.signaling.subscribe();
        let orchestrator = self.orchestrator.clone();
        tokio::spawn(async move {
            loop {
                match event_rx.recv().await {
                    // Sequentiell, damit Candidates in Empfangsreihenfolge ankommen
                    Ok(event) => dispatch_signaling_event(&orchestrator, event).await,
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!("Signaling dispatcher lagged, {} events dropped", skipped)
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });

        let peer_id = self.signaling.connect_and_register(username).await?;
        Arc::clone(&self.signaling).start_heartbeat();

        tracing::info!("Registered with peer_id: {}", peer_id);
        Ok(peer_id)
    }
}

// ============================================================================
// SIGNALING DISPATCH
// ============================================================================

/// Leitet ein Relay-Event an den passenden Orchestrator-Handler weiter
pub async fn dispatch_signaling_event(call: &CallOrchestrator, event: SignalingEvent) {
    match event {
        SignalingEvent::Connected => {
            tracing::info!("Connected to signaling server");
        }
        SignalingEvent::Disconnected => {
            tracing::warn!("Disconnected from signaling server");
        }
        SignalingEvent::Registered { peer_id, username } => {
            tracing::info!("Registered as '{}' ({})", username, peer_id);
        }
        SignalingEvent::CallInitiated { call_id } => {
            call.on_call_initiated(call_id);
        }
        SignalingEvent::IncomingCall {
            call_id,
            caller_id,
            caller_info,
            call_type,
        } => {
            call.receive_incoming_call(call_id, call_type, caller_id, caller_info);
        }
        SignalingEvent::CallAccepted { call_id } => {
            call.on_call_accepted(call_id).await;
        }
        SignalingEvent::CallRejected { call_id } => {
            call.on_call_rejected(call_id).await;
        }
        SignalingEvent::CallEnded {
            call_id,
            duration_secs,
        } => {
            call.on_call_ended(call_id, duration_secs).await;
        }
        SignalingEvent::CallMissed { call_id } => {
            call.on_call_missed(call_id).await;
        }
        SignalingEvent::CallFailed { call_id, reason } => {
            call.on_call_failed(call_id, &reason).await;
        }
        SignalingEvent::CallError { call_id, message } => {
            call.on_call_error(call_id, message).await;
        }
        SignalingEvent::OfferReceived {
            from_id,
            description,
        } => {
            call.on_offer(&from_id, description).await;
        }
        SignalingEvent::AnswerReceived {
            from_id,
            description,
        } => {
            call.on_answer(&from_id, description).await;
        }
        SignalingEvent::CandidateReceived { from_id, candidate } => {
            call.on_candidate(&from_id, candidate).await;
        }
        SignalingEvent::Error { code, message } => {
            tracing::warn!("Signaling server error {}: {}", code, message);
        }
    }
}

// ============================================================================
// HEADLESS ENTRY POINT
// ============================================================================

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| matches!(v.as_str(), "1" | "true" | "yes"))
        .unwrap_or(false)
}

/// Startet den Client ohne UI.
///
/// - `PULSE_USERNAME`: Anzeigename beim Relay (Default `pulse`)
/// - `PULSE_CALL_PEER`: ruft diese Peer-ID direkt an
/// - `PULSE_VIDEO`: Videoanruf statt Sprachanruf
/// - `PULSE_AUTO_ACCEPT`: nimmt eingehende Anrufe automatisch an
pub async fn run() -> anyhow::Result<()> {
    logging::init();

    let config = CallConfig::from_env()?;
    let app = CallApp::new(config)?;

    let username = std::env::var("PULSE_USERNAME").unwrap_or_else(|_| "pulse".to_string());
    let peer_id = app.connect(username).await?;
    tracing::info!("Public key: {}", app.public_key());
    tracing::info!("Reachable as {}", peer_id);

    let call = app.orchestrator().clone();
    let mut call_events = call.subscribe();
    let auto_accept = env_flag("PULSE_AUTO_ACCEPT");

    if let Ok(target) = std::env::var("PULSE_CALL_PEER") {
        let call_type = if env_flag("PULSE_VIDEO") {
            CallType::Video
        } else {
            CallType::Voice
        };
        call.start_outgoing_call(target.clone(), PeerInfo::named(target), call_type)
            .await?;
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutting down");
                if !call.state().is_idle() {
                    let _ = call.end_call();
                }
                break;
            }
            event = call_events.recv() => {
                match event {
                    Ok(CallEvent::StateChanged(CallState::IncomingRinging)) if auto_accept => {
                        tracing::info!("Auto-accepting incoming call");
                        if let Err(e) = call.accept().await {
                            tracing::warn!("Failed to accept call: {}", e);
                        }
                    }
                    Ok(CallEvent::StateChanged(state)) => {
                        tracing::info!("Call state changed: {:?}", state);
                    }
                    Ok(CallEvent::RemoteMedia(stream)) => {
                        tracing::info!("Receiving remote stream {}", stream.id());
                    }
                    Ok(CallEvent::Error(kind)) => {
                        tracing::error!("Call error: {}", kind);
                    }
                    Ok(CallEvent::Ended { call_id, duration }) => {
                        tracing::info!("Call {:?} ended after {:?}", call_id, duration);
                    }
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => break,
                }
            }
        }
    }

    Ok(())
}

// ============================================================================
// TESTS
// ============================================================================
