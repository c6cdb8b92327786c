//! Error types for storage operations.

use std::io;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors raised by byte stores and segment stores.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Attempted to read beyond the end of a segment.
    #[error("read beyond end of segment: offset {offset}, len {len}, size {size}")]
    ReadPastEnd {
        /// The requested read offset.
        offset: u64,
        /// The requested read length.
        len: usize,
        /// The current segment size.
        size: u64,
    },

    /// Truncation was asked to grow a segment.
    #[error("cannot truncate to {requested} bytes, segment holds {size}")]
    InvalidTruncate {
        /// Requested size.
        requested: u64,
        /// Current size.
        size: u64,
    },

    /// A stream name cannot be mapped onto the store.
    #[error("invalid stream name: {0:?}")]
    InvalidStream(String),

    /// The segment does not exist.
    #[error("segment {segment} of stream {stream:?} not found")]
    SegmentNotFound {
        /// Stream the segment belongs to.
        stream: String,
        /// Segment identifier.
        segment: u64,
    },

    /// Another process holds the store directory.
    #[error("store directory locked by another process: {0}")]
    Locked(String),
}

impl StorageError {
    /// Creates a segment-not-found error.
    pub fn segment_not_found(stream: impl Into<String>, segment: u64) -> Self {
        Self::SegmentNotFound {
            stream: stream.into(),
            segment,
        }
    }
}
