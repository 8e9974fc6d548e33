// ── Core error types ──
//
// Errors surfaced by the activation engine and scheduler. Adapter faults
// arrive wrapped in `Service`; only lookup misses are lifted into their own
// variant so the binary can map them to a configuration exit code.

use thiserror::Error;

/// Unified error type for the core crate.
#[derive(Debug, Error)]
pub enum CoreError {
    // ── NetworkManager ───────────────────────────────────────────────
    #[error("NetworkManager error: {0}")]
    Service(netcheck_nm::Error),

    #[error("Connection {id} is not known to NetworkManager")]
    UnknownConnection { id: String },

    // ── Configuration errors ─────────────────────────────────────────
    #[error("Configuration error: {message}")]
    Config { message: String },

    // ── Notification ─────────────────────────────────────────────────
    #[error("Gateway notification failed: {message}")]
    Notify { message: String },
}

impl CoreError {
    pub(crate) fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }
}

// ── Conversion from adapter errors ───────────────────────────────────

impl From<netcheck_nm::Error> for CoreError {
    fn from(err: netcheck_nm::Error) -> Self {
        match err {
            netcheck_nm::Error::UnknownConnection { id } => Self::UnknownConnection { id },
            other => Self::Service(other),
        }
    }
}
