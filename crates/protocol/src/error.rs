//! Error types for the protocol crate.

use thiserror::Error;

use crate::session::SessionKind;

/// Protocol error type covering wire decoding and configuration validation.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Failed to serialize data.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// Failed to deserialize data.
    #[error("deserialization failed: {0}")]
    Deserialization(String),

    /// The requested session kind is reserved but has no transport.
    #[error("unsupported session kind: {0}")]
    UnsupportedKind(SessionKind),

    /// Session configuration failed validation.
    #[error("invalid session configuration: {0}")]
    InvalidConfig(String),

    /// A byte payload was not valid base64.
    #[error("invalid payload encoding: {0}")]
    InvalidPayload(String),
}

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_eof() || err.is_syntax() {
            ProtocolError::Deserialization(err.to_string())
        } else {
            ProtocolError::Serialization(err.to_string())
        }
    }
}

impl From<base64::DecodeError> for ProtocolError {
    fn from(err: base64::DecodeError) -> Self {
        ProtocolError::InvalidPayload(err.to_string())
    }
}
