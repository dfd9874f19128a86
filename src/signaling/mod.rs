//! Signaling Module - Relay-Protokoll für den Anrufaufbau
//!
//! - `client`: signierte WebSocket-Verbindung zum Relay, Events nach innen
//! - `gateway`: adressierte Sends des Orchestrators (fire-and-forget)
//! - `messages`: Frames in beide Richtungen

mod client;
mod gateway;
mod messages;

pub use client::{SignalingClient, SignalingError, SignalingEvent};
pub use gateway::{RelaySender, SignalingGateway};
pub use messages::*;
