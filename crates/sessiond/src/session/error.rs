use std::time::Duration;

use protocol::{ProtocolError, SessionKind};
use thiserror::Error;

use super::SessionId;

/// Errors that can occur during session operations.
#[derive(Error, Debug)]
pub enum SessionError {
    /// The session was not found.
    #[error("session not found: {0}")]
    NotFound(SessionId),

    /// The session kind is reserved and has no transport.
    #[error("unsupported session kind: {0}")]
    UnsupportedKind(SessionKind),

    /// The session configuration was rejected.
    #[error("invalid session configuration: {0}")]
    InvalidConfig(String),

    /// The registry is at its session limit.
    #[error("session limit reached ({0})")]
    LimitReached(usize),

    /// The operation needs a connected session.
    #[error("session not connected: {0}")]
    NotConnected(SessionId),

    /// `connect` was called while connecting or connected.
    #[error("session already connected or connecting: {0}")]
    AlreadyConnected(SessionId),

    /// The handshake did not complete within its bound.
    #[error("handshake timed out after {}ms", .0.as_millis())]
    HandshakeTimeout(Duration),

    /// The handshake failed.
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    /// The transport died after the session connected.
    #[error("transport fault: {0}")]
    TransportFault(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<ProtocolError> for SessionError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::UnsupportedKind(kind) => SessionError::UnsupportedKind(kind),
            other => SessionError::InvalidConfig(other.to_string()),
        }
    }
}
