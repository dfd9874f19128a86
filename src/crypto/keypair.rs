//! Ed25519 Identität gegenüber dem Relay
//!
//! Jeder Frame an den Signaling-Server trägt einen Zeitstempel und eine
//! Signatur über das kanonische JSON (Keys sortiert, ohne `signature`).
//! Der Private Key liegt Base64-kodiert im App-Datenverzeichnis.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum KeyPairError {
    #[error("Key file I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to decode private key: {0}")]
    Base64Decode(#[from] base64::DecodeError),

    #[error("Invalid private key length: expected 32, got {0}")]
    InvalidKeyLength(usize),

    #[error("Could not determine app data directory")]
    NoDataDir,
}

// ============================================================================
// KEYPAIR
// ============================================================================

/// Signaturschlüssel des lokalen Clients
#[derive(Clone)]
pub struct KeyPair {
    signing_key: SigningKey,
}

impl KeyPair {
    /// Lädt den Schlüssel von `path` (oder dem Standardpfad) oder legt ihn an
    pub fn load_or_create(path: Option<&Path>) -> Result<Self, KeyPairError> {
        let key_path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::default_key_path()?,
        };

        if key_path.exists() {
            tracing::info!("Loading existing keypair from {:?}", key_path);
            Self::load_from_file(&key_path)
        } else {
            tracing::info!("Creating new keypair at {:?}", key_path);
            let keypair = Self::generate();
            keypair.save_to_file(&key_path)?;
            Ok(keypair)
        }
    }

    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    fn load_from_file(path: &Path) -> Result<Self, KeyPairError> {
        let encoded = fs::read_to_string(path)?;
        let bytes = BASE64.decode(encoded.trim())?;
        let key_bytes: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| KeyPairError::InvalidKeyLength(bytes.len()))?;

        Ok(Self {
            signing_key: SigningKey::from_bytes(&key_bytes),
        })
    }

    fn save_to_file(&self, path: &Path) -> Result<(), KeyPairError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, BASE64.encode(self.signing_key.to_bytes()))?;

        // Nur Owner darf lesen/schreiben
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
        }

        Ok(())
    }

    /// `<data_dir>/keys/private.key`
    fn default_key_path() -> Result<PathBuf, KeyPairError> {
        let dirs = directories::ProjectDirs::from("com", "kaufm", "call-app")
            .ok_or(KeyPairError::NoDataDir)?;
        Ok(dirs.data_dir().join("keys").join("private.key"))
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }

    pub fn public_key_base64(&self) -> String {
        BASE64.encode(self.verifying_key().to_bytes())
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// Setzt `timestamp` und `signature` in einem ausgehenden Frame
    pub fn sign_frame(&self, frame: &mut Value, timestamp: i64) {
        let Some(obj) = frame.as_object_mut() else {
            return;
        };
        obj.insert("timestamp".to_string(), Value::from(timestamp));

        let signature = self.sign(canonical_json(frame).as_bytes());
        if let Some(obj) = frame.as_object_mut() {
            obj.insert(
                "signature".to_string(),
                Value::String(BASE64.encode(signature.to_bytes())),
            );
        }
    }
}

/// Prüft die Signatur eines Frames gegen einen Base64 Public Key
pub fn verify_frame(public_key_base64: &str, frame: &Value) -> bool {
    let Some(signature_b64) = frame.get("signature").and_then(Value::as_str) else {
        return false;
    };

    let key_bytes: Option<[u8; 32]> = BASE64
        .decode(public_key_base64)
        .ok()
        .and_then(|b| b.as_slice().try_into().ok());
    let sig_bytes: Option<[u8; 64]> = BASE64
        .decode(signature_b64)
        .ok()
        .and_then(|b| b.as_slice().try_into().ok());

    let (Some(key_bytes), Some(sig_bytes)) = (key_bytes, sig_bytes) else {
        return false;
    };
    let Ok(key) = VerifyingKey::from_bytes(&key_bytes) else {
        return false;
    };

    key.verify(
        canonical_json(frame).as_bytes(),
        &Signature::from_bytes(&sig_bytes),
    )
    .is_ok()
}

/// JSON mit rekursiv sortierten Keys, ohne `signature`
fn canonical_json(value: &Value) -> String {
    serde_json::to_string(&sorted(value)).unwrap_or_default()
}

fn sorted(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<_> = map.keys().filter(|k| *k != "signature").collect();
            keys.sort();
            let mut out = Map::new();
            for key in keys {
                if let Some(v) = map.get(key) {
                    out.insert(key.clone(), sorted(v));
                }
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(sorted).collect()),
        other => other.clone(),
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public_key", &self.public_key_base64())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================
