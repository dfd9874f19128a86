//! Signaling Gateway
//!
//! Zustandslose Hülle um den Relay-Kanal. Jede Methode ist genau ein
//! adressierter Send ohne Retry oder Bestätigung.

use super::client::SignalingError;
use super::messages::RelayRequest;
use crate::call_engine::{CallId, CallType, IceCandidate, SessionDescription};
use std::sync::Arc;

/// Transport zum Relay (WebSocket im Produktivbetrieb)
pub trait RelaySender: Send + Sync {
    fn send(&self, request: RelayRequest) -> Result<(), SignalingError>;
}

#[derive(Clone)]
pub struct SignalingGateway {
    relay: Arc<dyn RelaySender>,
}

impl SignalingGateway {
    pub fn new(relay: Arc<dyn RelaySender>) -> Self {
        Self { relay }
    }

    pub fn start_call(&self, callee_id: &str, call_type: CallType) -> Result<(), SignalingError> {
        self.emit(RelayRequest::CallStart {
            callee_id: callee_id.to_string(),
            call_type,
        })
    }

    pub fn accept_call(&self, call_id: CallId) -> Result<(), SignalingError> {
        self.emit(RelayRequest::CallAccept { call_id })
    }

    pub fn reject_call(&self, call_id: CallId) -> Result<(), SignalingError> {
        self.emit(RelayRequest::CallReject { call_id })
    }

    pub fn end_call(&self, call_id: CallId) -> Result<(), SignalingError> {
        self.emit(RelayRequest::CallEnd { call_id })
    }

    pub fn send_offer(
        &self,
        to_id: &str,
        description: SessionDescription,
    ) -> Result<(), SignalingError> {
        self.emit(RelayRequest::Offer {
            to_id: to_id.to_string(),
            description,
        })
    }

    pub fn send_answer(
        &self,
        to_id: &str,
        description: SessionDescription,
    ) -> Result<(), SignalingError> {
        self.emit(RelayRequest::Answer {
            to_id: to_id.to_string(),
            description,
        })
    }

    pub fn send_discovery_message(
        &self,
        to_id: &str,
        candidate: IceCandidate,
    ) -> Result<(), SignalingError> {
        self.emit(RelayRequest::Ice {
            to_id: to_id.to_string(),
            candidate,
        })
    }

    fn emit(&self, request: RelayRequest) -> Result<(), SignalingError> {
        tracing::debug!("Sending {}", request.label());
        self.relay.send(request)
    }
}

impl std::fmt::Debug for SignalingGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalingGateway").finish_non_exhaustive()
    }
}
