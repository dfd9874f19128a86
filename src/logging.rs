//! Logging-Setup (tracing-subscriber mit EnvFilter)

use tracing_subscriber::EnvFilter;

const DEFAULT_DIRECTIVES: &str = "call_app=debug,webrtc=warn";

/// Installiert den globalen Subscriber. `RUST_LOG` hat Vorrang.
///
/// Ein zweiter Aufruf ist wirkungslos.
pub fn init() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVES));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init();
}
