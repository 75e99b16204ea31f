//! Error kinds surfaced at the core boundary.
//!
//! Supervising tasks log and swallow local idempotent failures; user-initiated
//! operations return the first cause verbatim. Transient network failures
//! never mutate local state.

/// Result alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// The error kinds the node exposes to callers (viewer, UI clients, scripts).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Group, script, file, or peer unknown.
    #[error("not found: {0}")]
    NotFound(String),

    /// Malformed wire record, invalid arguments, or failed config validation.
    #[error("invalid: {0}")]
    Invalid(String),

    /// Substrate dial failed or the protocol is unsupported by the peer.
    #[error("unreachable: {0}")]
    Unreachable(String),

    /// Ack, script, or read-idle deadline expired.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Group capacity or KV caps exceeded.
    #[error("full: {0}")]
    Full(String),

    /// Sender mismatch, private-IP block, or script policy violation.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Stream, engine, or listener shut down.
    #[error("closed: {0}")]
    Closed(String),
}

impl Error {
    /// True when retrying against another peer or later could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Unreachable(_) | Error::Timeout(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Invalid(format!("json: {e}"))
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::Invalid(format!("storage: {e}"))
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::TimedOut => Error::Timeout(e.to_string()),
            std::io::ErrorKind::NotFound => Error::NotFound(e.to_string()),
            _ => Error::Closed(e.to_string()),
        }
    }
}
