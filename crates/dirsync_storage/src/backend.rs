//! Byte store trait for a single log segment.

use crate::error::StorageResult;

/// An append-only byte store holding one log segment.
///
/// Backends are opaque: framing, checksums and keys belong to the log layer
/// in `dirsync_core`. A backend only guarantees that bytes appended at an
/// offset are read back unchanged from that offset.
///
/// # Invariants
///
/// - `append` returns the offset where the data starts
/// - `read_at` never returns bytes past `size()`
/// - after `sync` returns, appended bytes survive process termination
///
/// Backends must be `Send + Sync`: one appender and many cursors share a
/// segment.
pub trait StorageBackend: Send + Sync {
    /// Reads `len` bytes starting at `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::StorageError::ReadPastEnd`] if the range extends past
    /// the current size, or an I/O error.
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>>;

    /// Appends data and returns the offset it was written at.
    ///
    /// # Errors
    ///
    /// Returns an error if an I/O error occurs.
    fn append(&mut self, data: &[u8]) -> StorageResult<u64>;

    /// Pushes buffered writes to the operating system.
    ///
    /// # Errors
    ///
    /// Returns an error if the flush fails.
    fn flush(&mut self) -> StorageResult<()>;

    /// Returns the current size in bytes, which is also the next append offset.
    ///
    /// # Errors
    ///
    /// Returns an error if the size cannot be determined.
    fn size(&self) -> StorageResult<u64>;

    /// Makes all appended data and metadata durable.
    ///
    /// # Errors
    ///
    /// Returns an error if the sync fails.
    fn sync(&mut self) -> StorageResult<()>;

    /// Cuts the segment back to `new_size` bytes.
    ///
    /// Used to drop a partially written frame after a crash or a failed
    /// append.
    ///
    /// # Errors
    ///
    /// Returns [`crate::StorageError::InvalidTruncate`] if `new_size` is
    /// larger than the current size.
    fn truncate(&mut self, new_size: u64) -> StorageResult<()>;
}
