//! Crypto Module - Ed25519 Identität
//!
//! - Generierung eines Ed25519 Schlüsselpaars beim ersten Start
//! - Persistente Speicherung des Private Keys
//! - Signierung der Frames an den Signaling-Server
//!

mod keypair;

pub use keypair::{verify_frame, KeyPair, KeyPairError};
