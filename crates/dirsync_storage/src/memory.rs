//! In-memory segment backend.

use crate::backend::StorageBackend;
use crate::error::{StorageError, StorageResult};
use parking_lot::RwLock;
use std::sync::Arc;

/// A segment held in memory.
///
/// Clones share the same buffer, so a [`crate::MemorySegmentStore`] can hand
/// out a fresh handle on every open and still observe earlier writes. This is
/// how tests simulate a restart without touching the file system.
///
/// # Example
///
/// ```rust
/// use dirsync_storage::{InMemoryBackend, StorageBackend};
///
/// let mut segment = InMemoryBackend::new();
/// let reopened = segment.clone();
/// segment.append(b"csn").unwrap();
/// assert_eq!(reopened.size().unwrap(), 3);
/// ```
#[derive(Debug, Default, Clone)]
pub struct InMemoryBackend {
    data: Arc<RwLock<Vec<u8>>>,
}

impl InMemoryBackend {
    /// Creates an empty segment.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a segment holding `data`, for recovery tests.
    #[must_use]
    pub fn with_data(data: Vec<u8>) -> Self {
        Self {
            data: Arc::new(RwLock::new(data)),
        }
    }

    /// Returns a copy of the segment bytes.
    #[must_use]
    pub fn data(&self) -> Vec<u8> {
        self.data.read().clone()
    }

    /// Overwrites one byte, for corruption tests.
    pub fn corrupt_byte(&self, offset: usize) {
        let mut data = self.data.write();
        if let Some(byte) = data.get_mut(offset) {
            *byte ^= 0xFF;
        }
    }
}

impl StorageBackend for InMemoryBackend {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        let data = self.data.read();
        let size = data.len() as u64;
        let start = offset as usize;
        let end = start.saturating_add(len);

        if offset > size || end > data.len() {
            return Err(StorageError::ReadPastEnd { offset, len, size });
        }

        Ok(data[start..end].to_vec())
    }

    fn append(&mut self, bytes: &[u8]) -> StorageResult<u64> {
        let mut data = self.data.write();
        let offset = data.len() as u64;
        data.extend_from_slice(bytes);
        Ok(offset)
    }

    fn flush(&mut self) -> StorageResult<()> {
        Ok(())
    }

    fn size(&self) -> StorageResult<u64> {
        Ok(self.data.read().len() as u64)
    }

    fn sync(&mut self) -> StorageResult<()> {
        Ok(())
    }

    fn truncate(&mut self, new_size: u64) -> StorageResult<()> {
        let mut data = self.data.write();
        let size = data.len() as u64;
        if new_size > size {
            return Err(StorageError::InvalidTruncate {
                requested: new_size,
                size,
            });
        }
        data.truncate(new_size as usize);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_returns_offsets() {
        let mut segment = InMemoryBackend::new();
        assert_eq!(segment.append(b"hello").unwrap(), 0);
        assert_eq!(segment.append(b" world").unwrap(), 5);
        assert_eq!(segment.size().unwrap(), 11);
        assert_eq!(segment.read_at(6, 5).unwrap(), b"world");
    }

    #[test]
    fn read_past_end_fails() {
        let mut segment = InMemoryBackend::new();
        segment.append(b"hello").unwrap();
        assert!(matches!(
            segment.read_at(3, 10),
            Err(StorageError::ReadPastEnd { .. })
        ));
        assert!(segment.read_at(5, 0).unwrap().is_empty());
    }

    #[test]
    fn clones_share_bytes() {
        let mut writer = InMemoryBackend::new();
        let reader = writer.clone();
        writer.append(b"abc").unwrap();
        assert_eq!(reader.read_at(0, 3).unwrap(), b"abc");
    }

    #[test]
    fn truncate_drops_tail() {
        let mut segment = InMemoryBackend::with_data(b"complete|partial".to_vec());
        segment.truncate(8).unwrap();
        assert_eq!(segment.data(), b"complete");
        assert!(matches!(
            segment.truncate(100),
            Err(StorageError::InvalidTruncate { .. })
        ));
    }

    #[test]
    fn corrupt_byte_flips_bits() {
        let segment = InMemoryBackend::with_data(vec![0x00, 0x0F]);
        segment.corrupt_byte(1);
        assert_eq!(segment.data(), vec![0x00, 0xF0]);
        segment.corrupt_byte(10);
        assert_eq!(segment.data().len(), 2);
    }
}
