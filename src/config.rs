//! Konfiguration der Call-Engine
//!
//! Standardwerte reichen für den Normalbetrieb; `from_env` überschreibt
//! einzelne Werte aus Umgebungsvariablen.

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Standard Signaling-Server
pub const DEFAULT_SIGNALING_URL: &str = "https://call-app-signaling.questxen.workers.dev";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid signaling URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("Invalid value for {name}: {value}")]
    InvalidValue { name: &'static str, value: String },
}

// ============================================================================
// ICE SERVERS
// ============================================================================

/// STUN/TURN Server
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub credential: Option<String>,
}

/// Google STUN Server (kostenlos, für ~90% der Verbindungen)
pub fn default_ice_servers() -> Vec<IceServerConfig> {
    vec![IceServerConfig {
        urls: vec![
            "stun:stun.l.google.com:19302".to_string(),
            "stun:stun1.l.google.com:19302".to_string(),
            "stun:stun2.l.google.com:19302".to_string(),
        ],
        username: None,
        credential: None,
    }]
}

// ============================================================================
// CALL CONFIG
// ============================================================================

/// Alle Zeiten in Millisekunden
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CallConfig {
    pub signaling_url: String,
    pub ice_servers: Vec<IceServerConfig>,
    /// Frist von CONNECTING bis "connected"
    pub connection_timeout_ms: u64,
    /// Pause nach dem Freigeben der Aufnahmegeräte
    pub media_settle_ms: u64,
    /// Pause vor dem einen Retry bei belegtem Gerät
    pub device_retry_delay_ms: u64,
    /// ENDING → IDLE nach der Bestätigung vom Relay
    pub end_settle_ms: u64,
    /// Wie lange ERROR angezeigt wird
    pub error_display_ms: u64,
    /// Fallback falls das Relay `call-ended` nie bestätigt
    pub end_ack_timeout_ms: u64,
    pub registration_timeout_ms: u64,
    pub heartbeat_interval_ms: u64,
    /// Pfad zum Private Key; `None` = App-Datenverzeichnis
    pub key_path: Option<PathBuf>,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            signaling_url: DEFAULT_SIGNALING_URL.to_string(),
            ice_servers: default_ice_servers(),
            connection_timeout_ms: 30_000,
            media_settle_ms: 300,
            device_retry_delay_ms: 1_000,
            end_settle_ms: 500,
            error_display_ms: 3_000,
            end_ack_timeout_ms: 5_000,
            registration_timeout_ms: 10_000,
            // Cloudflare Workers hat einen Idle-Timeout
            heartbeat_interval_ms: 25_000,
            key_path: None,
        }
    }
}

impl CallConfig {
    /// Liest Overrides aus der Umgebung.
    ///
    /// - `SIGNALING_URL`
    /// - `PULSE_TURN_URL`, `PULSE_TURN_USERNAME`, `PULSE_TURN_CREDENTIAL`
    /// - `PULSE_CONNECTION_TIMEOUT_MS`
    /// - `PULSE_KEY_PATH`
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(url) = lookup("SIGNALING_URL") {
            config.signaling_url = url;
        }

        if let Some(url) = lookup("PULSE_TURN_URL") {
            config.ice_servers.push(IceServerConfig {
                urls: vec![url],
                username: lookup("PULSE_TURN_USERNAME"),
                credential: lookup("PULSE_TURN_CREDENTIAL"),
            });
        }

        if let Some(value) = lookup("PULSE_CONNECTION_TIMEOUT_MS") {
            config.connection_timeout_ms =
                value.parse().map_err(|_| ConfigError::InvalidValue {
                    name: "PULSE_CONNECTION_TIMEOUT_MS",
                    value,
                })?;
        }

        if let Some(path) = lookup("PULSE_KEY_PATH") {
            config.key_path = Some(PathBuf::from(path));
        }

        config.websocket_url()?;
        Ok(config)
    }

    /// WebSocket-Endpunkt des Signaling-Servers (`http(s)` → `ws(s)`, Pfad `/ws`)
    pub fn websocket_url(&self) -> Result<Url, ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidUrl {
            url: self.signaling_url.clone(),
            reason,
        };

        let mut url = Url::parse(&self.signaling_url).map_err(|e| invalid(e.to_string()))?;
        let scheme = match url.scheme() {
            "http" | "ws" => "ws",
            "https" | "wss" => "wss",
            other => return Err(invalid(format!("unsupported scheme '{}'", other))),
        };
        url.set_scheme(scheme)
            .map_err(|_| invalid("cannot change scheme".to_string()))?;

        let path = format!("{}/ws", url.path().trim_end_matches('/'));
        url.set_path(&path);
        Ok(url)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    pub fn media_settle(&self) -> Duration {
        Duration::from_millis(self.media_settle_ms)
    }

    pub fn device_retry_delay(&self) -> Duration {
        Duration::from_millis(self.device_retry_delay_ms)
    }

    pub fn end_settle(&self) -> Duration {
        Duration::from_millis(self.end_settle_ms)
    }

    pub fn error_display(&self) -> Duration {
        Duration::from_millis(self.error_display_ms)
    }

    pub fn end_ack_timeout(&self) -> Duration {
        Duration::from_millis(self.end_ack_timeout_ms)
    }

    pub fn registration_timeout(&self) -> Duration {
        Duration::from_millis(self.registration_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_websocket_url() {
        let config = CallConfig::default();
        assert_eq!(
            config.websocket_url().unwrap().as_str(),
            "wss://call-app-signaling.questxen.workers.dev/ws"
        );

        let config = CallConfig {
            signaling_url: "http://localhost:8787/".into(),
            ..Default::default()
        };
        assert_eq!(
            config.websocket_url().unwrap().as_str(),
            "ws://localhost:8787/ws"
        );
    }

    #[test]
    fn test_invalid_scheme_rejected() {
        let config = CallConfig {
            signaling_url: "ftp://example.org".into(),
            ..Default::default()
        };
        assert!(matches!(
            config.websocket_url(),
            Err(ConfigError::InvalidUrl { .. })
        ));
    }

    #[test]
    fn test_env_overrides() {
        let config = CallConfig::from_lookup(lookup(&[
            ("SIGNALING_URL", "https://relay.example.org"),
            ("PULSE_TURN_URL", "turn:turn.example.org:3478"),
            ("PULSE_TURN_USERNAME", "alice"),
            ("PULSE_TURN_CREDENTIAL", "secret"),
            ("PULSE_CONNECTION_TIMEOUT_MS", "15000"),
        ]))
        .unwrap();

        assert_eq!(config.signaling_url, "https://relay.example.org");
        assert_eq!(config.ice_servers.len(), 2);
        assert_eq!(config.ice_servers[1].username.as_deref(), Some("alice"));
        assert_eq!(config.connection_timeout(), Duration::from_secs(15));
    }

    #[test]
    fn test_invalid_timeout_rejected() {
        let result = CallConfig::from_lookup(lookup(&[("PULSE_CONNECTION_TIMEOUT_MS", "soon")]));
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: CallConfig =
            serde_json::from_str(r#"{ "connectionTimeoutMs": 1000, "endSettleMs": 10 }"#).unwrap();
        assert_eq!(config.connection_timeout(), Duration::from_secs(1));
        assert_eq!(config.end_settle(), Duration::from_millis(10));
        assert_eq!(config.media_settle(), Duration::from_millis(300));
        assert_eq!(config.signaling_url, DEFAULT_SIGNALING_URL);
    }
}
