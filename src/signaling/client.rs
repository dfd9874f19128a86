//! WebSocket Client für den Signaling-Server
//!
//! Verwaltet die WebSocket-Verbindung zum Relay:
//! - Registrierung mit Username und Public Key
//! - Heartbeat gegen den Idle-Timeout
//! - Signierte Frames
//! - Event-basierte Weitergabe eingehender Nachrichten

use super::gateway::RelaySender;
use super::messages::*;
use crate::call_engine::{
    CallErrorKind, CallId, CallType, IceCandidate, PeerInfo, SessionDescription,
};
use crate::config::{CallConfig, ConfigError};
use crate::crypto::KeyPair;
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use url::Url;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone)]
pub enum SignalingError {
    #[error("WebSocket connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Not connected to signaling server")]
    NotConnected,

    #[error("Failed to send message: {0}")]
    SendFailed(String),

    #[error("Registration failed: {0}")]
    RegistrationFailed(String),

    #[error("Server error: {code} - {message}")]
    ServerError { code: i32, message: String },
}

impl SignalingError {
    pub fn kind(&self) -> CallErrorKind {
        CallErrorKind::RelayError(self.to_string())
    }
}

// ============================================================================
// SIGNALING EVENTS
// ============================================================================

/// Events die vom SignalingClient ausgelöst werden
#[derive(Debug, Clone)]
pub enum SignalingEvent {
    /// Verbunden mit Signaling-Server
    Connected,

    /// Verbindung getrennt
    Disconnected,

    /// Registrierung erfolgreich
    Registered { peer_id: String, username: String },

    /// Relay hat `call-start` bestätigt
    CallInitiated { call_id: CallId },

    /// Eingehender Anruf
    IncomingCall {
        call_id: CallId,
        caller_id: String,
        caller_info: PeerInfo,
        call_type: CallType,
    },

    CallAccepted { call_id: CallId },

    CallRejected { call_id: CallId },

    CallEnded {
        call_id: CallId,
        duration_secs: Option<u64>,
    },

    CallMissed { call_id: CallId },

    CallFailed {
        call_id: Option<CallId>,
        reason: String,
    },

    CallError {
        call_id: Option<CallId>,
        message: String,
    },

    /// SDP Offer erhalten
    OfferReceived {
        from_id: String,
        description: SessionDescription,
    },

    /// SDP Answer erhalten
    AnswerReceived {
        from_id: String,
        description: SessionDescription,
    },

    /// ICE Candidate erhalten
    CandidateReceived {
        from_id: String,
        candidate: IceCandidate,
    },

    /// Fehler vom Server
    Error { code: i32, message: String },
}

// ============================================================================
// CLIENT STATE
// ============================================================================

#[derive(Debug, Clone, Default)]
struct ClientState {
    is_connected: bool,
    peer_id: Option<String>,
    username: Option<String>,
}

type RegistrationSender = mpsc::Sender<Result<String, SignalingError>>;

// ============================================================================
// SIGNALING CLIENT
// ============================================================================

/// WebSocket Client für Signaling-Server Kommunikation
pub struct SignalingClient {
    ws_url: Url,
    keypair: Arc<KeyPair>,
    registration_timeout: Duration,
    heartbeat_interval: Duration,
    state: Arc<RwLock<ClientState>>,
    tx: Arc<RwLock<Option<mpsc::Sender<String>>>>,
    event_tx: broadcast::Sender<SignalingEvent>,
}

impl SignalingClient {
    /// Erstellt einen neuen SignalingClient
    pub fn new(config: &CallConfig, keypair: Arc<KeyPair>) -> Result<Self, ConfigError> {
        let (event_tx, _) = broadcast::channel(100);

        Ok(Self {
            ws_url: config.websocket_url()?,
            keypair,
            registration_timeout: config.registration_timeout(),
            heartbeat_interval: config.heartbeat_interval(),
            state: Arc::new(RwLock::new(ClientState::default())),
            tx: Arc::new(RwLock::new(None)),
            event_tx,
        })
    }

    /// Gibt einen Event-Receiver zurück
    pub fn subscribe(&self) -> broadcast::Receiver<SignalingEvent> {
        self.event_tx.subscribe()
    }

    /// Gibt die aktuelle Peer-ID zurück (falls registriert)
    pub fn peer_id(&self) -> Option<String> {
        self.state.read().peer_id.clone()
    }

    pub fn username(&self) -> Option<String> {
        self.state.read().username.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.state.read().is_connected
    }

    /// Verbindet mit dem Signaling-Server und registriert den Benutzer.
    ///
    /// Gibt die vom Relay vergebene Peer-ID zurück.
    pub async fn connect_and_register(&self, username: String) -> Result<String, SignalingError> {
        tracing::info!("Connecting to signaling server: {}", self.ws_url);

        let (ws_stream, _) = connect_async(self.ws_url.as_str())
            .await
            .map_err(|e| SignalingError::ConnectionFailed(e.to_string()))?;

        let (mut write, mut read) = ws_stream.split();

        let (tx, mut rx) = mpsc::channel::<String>(100);
        *self.tx.write() = Some(tx);

        {
            let mut state = self.state.write();
            state.is_connected = true;
            state.username = Some(username.clone());
        }
        let _ = self.event_tx.send(SignalingEvent::Connected);

        // Channel für Registrierungs-Response
        let (reg_tx, mut reg_rx) = mpsc::channel::<Result<String, SignalingError>>(1);

        // Read-Task
        let state = Arc::clone(&self.state);
        let tx_slot = Arc::clone(&self.tx);
        let event_tx = self.event_tx.clone();
        tokio::spawn(async move {
            while let Some(msg_result) = read.next().await {
                match msg_result {
                    Ok(Message::Text(text)) => match serde_json::from_str::<ServerMessage>(&text) {
                        Ok(server_msg) => {
                            Self::handle_server_message(server_msg, &state, &event_tx, &reg_tx)
                        }
                        Err(e) => tracing::debug!("Ignoring unparseable frame: {}", e),
                    },
                    Ok(Message::Close(_)) => {
                        tracing::info!("WebSocket closed by server");
                        break;
                    }
                    Err(e) => {
                        tracing::error!("WebSocket error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }

            state.write().is_connected = false;
            tx_slot.write().take();
            let _ = event_tx.send(SignalingEvent::Disconnected);
        });

        // Write-Task
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if let Err(e) = write.send(Message::Text(msg)).await {
                    tracing::error!("Failed to send WebSocket message: {}", e);
                    break;
                }
            }
        });

        self.send(RelayRequest::Register {
            username,
            public_key: self.keypair.public_key_base64(),
        })?;

        tokio::select! {
            result = reg_rx.recv() => {
                match result {
                    Some(result) => result,
                    None => Err(SignalingError::RegistrationFailed("No response".to_string())),
                }
            }
            _ = tokio::time::sleep(self.registration_timeout) => {
                Err(SignalingError::RegistrationFailed("Timeout".to_string()))
            }
        }
    }

    /// Startet einen Heartbeat-Task, endet mit der Verbindung
    pub fn start_heartbeat(self: Arc<Self>) {
        let client = Arc::clone(&self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(client.heartbeat_interval);
            // Erster Tick kommt sofort
            interval.tick().await;
            loop {
                interval.tick().await;
                if !client.is_connected() {
                    break;
                }
                let Some(peer_id) = client.peer_id() else {
                    continue;
                };
                if let Err(e) = client.send(RelayRequest::Heartbeat { peer_id }) {
                    tracing::warn!("Failed to send heartbeat: {}", e);
                }
            }
        });
    }

    /// Serialisiert und signiert einen Frame
    fn encode_frame(&self, request: &RelayRequest) -> Result<String, SignalingError> {
        let mut frame = serde_json::to_value(request)
            .map_err(|e| SignalingError::SendFailed(e.to_string()))?;
        self.keypair
            .sign_frame(&mut frame, Utc::now().timestamp_millis());

        serde_json::to_string(&frame).map_err(|e| SignalingError::SendFailed(e.to_string()))
    }

    /// Übersetzt Server-Nachrichten in `SignalingEvent`s
    fn handle_server_message(
        msg: ServerMessage,
        state: &RwLock<ClientState>,
        event_tx: &broadcast::Sender<SignalingEvent>,
        reg_tx: &RegistrationSender,
    ) {
        let event = match msg {
            ServerMessage::Registered { peer_id, username } => {
                tracing::info!("Registered as {} with peer_id {}", username, peer_id);
                {
                    let mut s = state.write();
                    s.peer_id = Some(peer_id.clone());
                    s.username = Some(username.clone());
                }
                let _ = reg_tx.try_send(Ok(peer_id.clone()));
                SignalingEvent::Registered { peer_id, username }
            }

            ServerMessage::CallInitiated { call_id } => SignalingEvent::CallInitiated { call_id },

            ServerMessage::CallIncoming {
                call_id,
                caller_id,
                caller_name,
                caller_avatar,
                call_type,
            } => SignalingEvent::IncomingCall {
                call_id,
                caller_info: PeerInfo {
                    display_name: caller_name.unwrap_or_else(|| caller_id.clone()),
                    avatar_url: caller_avatar,
                },
                caller_id,
                call_type,
            },

            ServerMessage::CallAccepted { call_id } => SignalingEvent::CallAccepted { call_id },

            ServerMessage::CallRejected { call_id } => SignalingEvent::CallRejected { call_id },

            ServerMessage::CallEnded { call_id, duration } => SignalingEvent::CallEnded {
                call_id,
                duration_secs: duration,
            },

            ServerMessage::CallMissed { call_id } => SignalingEvent::CallMissed { call_id },

            ServerMessage::CallFailed { call_id, reason } => {
                SignalingEvent::CallFailed { call_id, reason }
            }

            ServerMessage::CallError { call_id, message } => {
                SignalingEvent::CallError { call_id, message }
            }

            ServerMessage::Offer {
                from_id,
                description,
            } => SignalingEvent::OfferReceived {
                from_id,
                description,
            },

            ServerMessage::Answer {
                from_id,
                description,
            } => SignalingEvent::AnswerReceived {
                from_id,
                description,
            },

            ServerMessage::Ice { from_id, candidate } => {
                SignalingEvent::CandidateReceived { from_id, candidate }
            }

            ServerMessage::Error { code, message } => {
                tracing::error!("Server error {}: {}", code, message);
                // Vor der Registrierung ist jeder Fehler ein Registrierungs-Fehler
                if state.read().peer_id.is_none() {
                    let _ = reg_tx.try_send(Err(SignalingError::ServerError {
                        code,
                        message: message.clone(),
                    }));
                }
                SignalingEvent::Error { code, message }
            }

            ServerMessage::Pong => return,
        };

        let _ = event_tx.send(event);
    }
}

impl RelaySender for SignalingClient {
    /// Non-blocking über `try_send`
    fn send(&self, request: RelayRequest) -> Result<(), SignalingError> {
        let tx = self.tx.read().clone().ok_or(SignalingError::NotConnected)?;
        let frame = self.encode_frame(&request)?;

        tx.try_send(frame)
            .map_err(|e| SignalingError::SendFailed(e.to_string()))
    }
}

impl std::fmt::Debug for SignalingClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalingClient")
            .field("ws_url", &self.ws_url.as_str())
            .field("state", &*self.state.read())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================
