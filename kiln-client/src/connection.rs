//! The connection seam consumed by the engine

use std::fmt;

use kiln_core::wire::{Request, Response};

use crate::error::Result;

/// Lifecycle of the backend session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// First connection attempt has not finished yet
    Connecting,
    Connected,
    /// Session lost; a background task is reconnecting
    Disconnected,
    /// Shut down for good
    Closed,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Closed => "closed",
        })
    }
}

/// One logical session to the generation backend
///
/// Neither method may wait on the network. `send` may wait briefly for room
/// in a local queue, bounded by the configured send timeout.
pub trait BackendConnection: Send {
    /// Ships a request, failing fast with `ConnectionError::Unavailable`
    /// while the session is down. Never retries.
    fn send(&self, request: Request) -> Result<()>;

    /// Like `send`, but fails at once instead of waiting when the local
    /// queue is full
    fn try_send(&self, request: Request) -> Result<()>;

    /// Returns the next queued response, or `None` immediately if there is
    /// none or the session is down.
    fn try_recv(&mut self) -> Option<Response>;

    /// Current session state
    fn state(&self) -> ConnectionState;
}
