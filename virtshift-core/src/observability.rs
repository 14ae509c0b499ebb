//! Logging initialization.
//!
//! Sets up the global `tracing` subscriber once at program entry. The
//! configured level acts as the default; `RUST_LOG` still wins when set so
//! operators can raise verbosity per module.

use tracing_subscriber::EnvFilter;

/// Initialize the global tracing subscriber.
///
/// `level` is one of DEBUG, INFO, WARN, ERROR (case-insensitive). Returns an
/// error string if a subscriber was already installed.
pub fn init(level: &str) -> Result<(), String> {
    let default_directive = match level.to_uppercase().as_str() {
        "DEBUG" => "debug",
        "WARN" => "warn",
        "ERROR" => "error",
        _ => "info",
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| e.to_string())
}
