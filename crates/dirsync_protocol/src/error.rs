//! Error types for the replication protocol.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised while encoding or decoding replication messages.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The buffer held no bytes at all.
    #[error("empty message")]
    Empty,

    /// The leading type byte names no known message.
    #[error("unknown message type {0}")]
    UnknownType(u8),

    /// The CBOR body could not be encoded.
    #[error("encode error: {0}")]
    Encode(String),

    /// The CBOR body could not be decoded.
    #[error("decode error: {0}")]
    Decode(String),
}

impl ProtocolError {
    /// Creates an encode error.
    pub fn encode(message: impl ToString) -> Self {
        Self::Encode(message.to_string())
    }

    /// Creates a decode error.
    pub fn decode(message: impl ToString) -> Self {
        Self::Decode(message.to_string())
    }
}
