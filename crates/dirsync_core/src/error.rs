//! Error types for dirsync core.

use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in the replication core.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Storage backend error.
    #[error("storage error: {0}")]
    Storage(#[from] dirsync_storage::StorageError),

    /// A log segment holds bytes that are not a valid frame.
    #[error("log corruption: {message}")]
    LogCorruption {
        /// Description of the corruption.
        message: String,
    },

    /// Frame checksum mismatch.
    #[error("checksum mismatch: expected {expected:08x}, got {actual:08x}")]
    ChecksumMismatch {
        /// Checksum stored in the frame.
        expected: u32,
        /// Checksum computed over the frame.
        actual: u32,
    },

    /// A record would break the strictly increasing key order of a log.
    #[error("ordering violation in {log}: {offered} is not after {newest}")]
    OrderingViolation {
        /// Stream name of the log.
        log: String,
        /// Newest key already stored.
        newest: String,
        /// Key that was rejected.
        offered: String,
    },

    /// A CSN could not be parsed.
    #[error("invalid CSN {input:?}: {reason}")]
    InvalidCsn {
        /// The rejected input.
        input: String,
        /// Why it was rejected.
        reason: &'static str,
    },

    /// A server state or cookie string could not be parsed.
    #[error("invalid server state: {message}")]
    InvalidState {
        /// Description of the problem.
        message: String,
    },

    /// Historical metadata could not be decoded.
    #[error("invalid historical value {value:?}: {reason}")]
    InvalidHistorical {
        /// The rejected value.
        value: String,
        /// Why it was rejected.
        reason: &'static str,
    },

    /// CBOR encoding or decoding failed.
    #[error("codec error: {message}")]
    Codec {
        /// Description of the failure.
        message: String,
    },

    /// The log has been closed.
    #[error("log is closed")]
    LogClosed,

    /// The cursor was closed by its owner.
    #[error("cursor is closed")]
    CursorClosed,

    /// The segment under a cursor was purged; the cursor cannot continue.
    #[error("cursor invalidated: {message}")]
    CursorInvalidated {
        /// Description of what invalidated the cursor.
        message: String,
    },

    /// A blocking wait was cancelled from another thread.
    #[error("operation cancelled")]
    Cancelled,

    /// Operation not permitted in the current state.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Description of why the operation is invalid.
        message: String,
    },
}

impl CoreError {
    /// Creates a log corruption error.
    pub fn log_corruption(message: impl Into<String>) -> Self {
        Self::LogCorruption {
            message: message.into(),
        }
    }

    /// Creates an invalid state error.
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState {
            message: message.into(),
        }
    }

    /// Creates a codec error.
    pub fn codec(message: impl Into<String>) -> Self {
        Self::Codec {
            message: message.into(),
        }
    }

    /// Creates a cursor invalidated error.
    pub fn cursor_invalidated(message: impl Into<String>) -> Self {
        Self::CursorInvalidated {
            message: message.into(),
        }
    }

    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Returns true for faults of the underlying medium.
    ///
    /// A domain must stop accepting local writes after one of these.
    #[must_use]
    pub fn is_storage_fault(&self) -> bool {
        matches!(
            self,
            Self::Storage(_) | Self::LogCorruption { .. } | Self::ChecksumMismatch { .. }
        )
    }
}
