//! Protocol error kinds.

use thiserror::Error;

use crate::Protocol;

/// Errors raised while encoding or decoding protocol messages.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// A wire frame could not be decoded into a message.
    #[error("message decoding failed: {0}")]
    Decoding(String),

    /// A message decoded fine but belongs to a different protocol.
    #[error("unexpected protocol (expected {expected}, got {got})")]
    UnexpectedProtocol {
        expected: Protocol,
        got: Protocol,
    },

    /// A message decoded fine but carries the wrong verb type for the context.
    #[error("incorrect message type: {0}")]
    IncorrectType(String),

    /// A frame exceeds the permitted length.
    #[error("frame too large ({len} bytes > {max} bytes)")]
    FrameTooLarge { len: usize, max: usize },

    /// Transport-level failure while reading or writing frames.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    /// Shorthand for a [`ProtocolError::Decoding`] with a formatted message.
    #[must_use]
    pub fn decoding(message: impl Into<String>) -> Self {
        Self::Decoding(message.into())
    }
}
