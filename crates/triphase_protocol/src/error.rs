//! Protocol error types.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised while encoding or decoding protocol messages.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// CBOR encoding failed.
    #[error("encode error: {0}")]
    Encode(String),

    /// CBOR decoding failed.
    #[error("decode error: {0}")]
    Decode(String),

    /// The peer speaks a different protocol version.
    #[error("protocol version mismatch: local {local}, remote {remote}")]
    VersionMismatch {
        /// Version of this build.
        local: u16,
        /// Version found in the envelope.
        remote: u16,
    },

    /// A message arrived where a different one was expected.
    #[error("unexpected message: expected {expected}, got {actual}")]
    UnexpectedMessage {
        /// The message kind the caller expected.
        expected: &'static str,
        /// The message kind actually received.
        actual: &'static str,
    },
}

impl ProtocolError {
    /// Creates a decode error.
    pub fn decode(msg: impl Into<String>) -> Self {
        Self::Decode(msg.into())
    }

    /// Creates an unexpected message error.
    pub fn unexpected(expected: &'static str, actual: &'static str) -> Self {
        Self::UnexpectedMessage { expected, actual }
    }
}
