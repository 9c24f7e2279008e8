//! Error types for the backend connection

use thiserror::Error;

/// Result type alias for connection operations
pub type Result<T> = std::result::Result<T, ConnectionError>;

/// Errors that can occur when talking to the backend
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// The session is down or the local queue stayed full past the send timeout
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    /// The connection was started outside of a Tokio runtime
    #[error("no Tokio runtime available to drive the connection")]
    NoRuntime,
}

impl ConnectionError {
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::Unavailable(reason.into())
    }

    /// Check if this error is transient and worth retrying later
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}
