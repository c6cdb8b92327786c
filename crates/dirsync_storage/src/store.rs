//! Segment stores: named streams of numbered segments.

use crate::backend::StorageBackend;
use crate::error::{StorageError, StorageResult};
use crate::memory::InMemoryBackend;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fmt;

/// A directory of append-only streams, each split into numbered segments.
///
/// A stream is identified by a `/`-separated name such as
/// `changelog/dc=example,dc=com/7`. Segment ids grow within a stream, and
/// the log layer rotates to a new id when a segment gets too large. Purging
/// removes whole segments from the low end.
pub trait SegmentStore: Send + Sync + fmt::Debug {
    /// Lists every stream that holds at least one segment, in sorted order.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be scanned.
    fn list_streams(&self) -> StorageResult<Vec<String>>;

    /// Lists the segment ids of `stream` in ascending order.
    ///
    /// An unknown stream has no segments.
    ///
    /// # Errors
    ///
    /// Returns an error if the stream cannot be scanned.
    fn list_segments(&self, stream: &str) -> StorageResult<Vec<u64>>;

    /// Opens a segment, creating it empty if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the segment cannot be created or opened.
    fn open_segment(&self, stream: &str, segment: u64) -> StorageResult<Box<dyn StorageBackend>>;

    /// Deletes one segment.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::SegmentNotFound`] if it does not exist.
    fn remove_segment(&self, stream: &str, segment: u64) -> StorageResult<()>;

    /// Deletes every segment of a stream. Removing an unknown stream succeeds.
    ///
    /// # Errors
    ///
    /// Returns an error if a segment cannot be removed.
    fn remove_stream(&self, stream: &str) -> StorageResult<()> {
        for segment in self.list_segments(stream)? {
            self.remove_segment(stream, segment)?;
        }
        Ok(())
    }
}

pub(crate) fn validate_stream(stream: &str) -> StorageResult<()> {
    let bad = stream.is_empty()
        || stream.starts_with('/')
        || stream.ends_with('/')
        || stream.split('/').any(str::is_empty);
    if bad {
        return Err(StorageError::InvalidStream(stream.to_string()));
    }
    Ok(())
}

/// A segment store kept entirely in memory.
///
/// Segment buffers outlive the handles opened on them, so reopening a log on
/// the same store replays what was written before.
#[derive(Debug, Default)]
pub struct MemorySegmentStore {
    streams: RwLock<BTreeMap<String, BTreeMap<u64, InMemoryBackend>>>,
}

impl MemorySegmentStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the buffer of a segment, for tests that inspect or corrupt it.
    #[must_use]
    pub fn segment(&self, stream: &str, segment: u64) -> Option<InMemoryBackend> {
        self.streams
            .read()
            .get(stream)
            .and_then(|segments| segments.get(&segment))
            .cloned()
    }
}

impl SegmentStore for MemorySegmentStore {
    fn list_streams(&self) -> StorageResult<Vec<String>> {
        Ok(self
            .streams
            .read()
            .iter()
            .filter(|(_, segments)| !segments.is_empty())
            .map(|(name, _)| name.clone())
            .collect())
    }

    fn list_segments(&self, stream: &str) -> StorageResult<Vec<u64>> {
        Ok(self
            .streams
            .read()
            .get(stream)
            .map(|segments| segments.keys().copied().collect())
            .unwrap_or_default())
    }

    fn open_segment(&self, stream: &str, segment: u64) -> StorageResult<Box<dyn StorageBackend>> {
        validate_stream(stream)?;
        let mut streams = self.streams.write();
        let backend = streams
            .entry(stream.to_string())
            .or_default()
            .entry(segment)
            .or_default()
            .clone();
        Ok(Box::new(backend))
    }

    fn remove_segment(&self, stream: &str, segment: u64) -> StorageResult<()> {
        let mut streams = self.streams.write();
        let removed = streams
            .get_mut(stream)
            .and_then(|segments| segments.remove(&segment));
        if removed.is_none() {
            return Err(StorageError::segment_not_found(stream, segment));
        }
        if streams.get(stream).is_some_and(BTreeMap::is_empty) {
            streams.remove(stream);
        }
        Ok(())
    }
}
