//! Append-only, key-ordered logs split into rotating segments.
//!
//! A [`Log`] stores records whose keys strictly increase. It is the storage
//! shared by replica logs (keyed by CSN) and the change number index (keyed
//! by change number).
//!
//! - appends go to the head segment; a new segment is started once the head
//!   would exceed [`LogConfig::max_segment_size`]
//! - [`Log::purge_before`] deletes whole segments from the low end, never the
//!   head
//! - any number of [`LogCursor`]s read concurrently with the single appender

mod cursor;
pub mod frame;
mod segment;

pub use cursor::LogCursor;

use crate::config::LogConfig;
use crate::csn::{Csn, CSN_KEY_LEN};
use crate::error::{CoreError, CoreResult};
use crate::log::frame::encode_frame;
use crate::log::segment::Segment;
use crate::types::ChangeNumber;
use dirsync_storage::SegmentStore;
use parking_lot::RwLock;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Where a cursor starts relative to its requested key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PositionStrategy {
    /// The first record returned has a key >= the start key.
    AtOrAfter,
    /// The first record returned has a key > the start key.
    StrictlyAfter,
}

/// Keys of a log: totally ordered, with a self-delimiting binary form.
pub trait LogKey: Copy + Ord + fmt::Debug + fmt::Display + Send + Sync + 'static {
    /// Appends the key encoding to `buf`.
    fn encode_key(&self, buf: &mut Vec<u8>);

    /// Decodes a key from the start of `bytes`, returning it and its length.
    ///
    /// # Errors
    ///
    /// Returns an error if `bytes` does not start with a valid key.
    fn decode_key(bytes: &[u8]) -> CoreResult<(Self, usize)>;
}

/// Records stored in a log.
pub trait LogRecord: Clone + Send + Sync + 'static {
    /// Key type ordering the log.
    type Key: LogKey;

    /// Key of this record.
    fn key(&self) -> Self::Key;

    /// Appends everything but the key to `buf`.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be encoded.
    fn encode_value(&self, buf: &mut Vec<u8>) -> CoreResult<()>;

    /// Rebuilds a record from its key and value bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the value bytes are malformed.
    fn decode_value(key: Self::Key, bytes: &[u8]) -> CoreResult<Self>;
}

impl LogKey for Csn {
    fn encode_key(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.to_key_bytes());
    }

    fn decode_key(bytes: &[u8]) -> CoreResult<(Self, usize)> {
        let key = bytes
            .get(..CSN_KEY_LEN)
            .ok_or_else(|| CoreError::log_corruption("record shorter than a CSN key"))?;
        Ok((Csn::from_key_bytes(key)?, CSN_KEY_LEN))
    }
}

impl LogKey for ChangeNumber {
    fn encode_key(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.as_u64().to_be_bytes());
    }

    fn decode_key(bytes: &[u8]) -> CoreResult<(Self, usize)> {
        let raw: [u8; 8] = bytes
            .get(..8)
            .and_then(|b| b.try_into().ok())
            .ok_or_else(|| CoreError::log_corruption("record shorter than a change number"))?;
        Ok((ChangeNumber::new(u64::from_be_bytes(raw)), 8))
    }
}

pub(crate) fn decode_record<R: LogRecord>(payload: &[u8]) -> CoreResult<R> {
    let (key, used) = R::Key::decode_key(payload)?;
    R::decode_value(key, &payload[used..])
}

pub(crate) struct LogState<K> {
    pub(crate) segments: Vec<Segment<K>>,
    pub(crate) closed: bool,
    /// Newest key ever removed by a purge or clear.
    pub(crate) purged_through: Option<K>,
    next_segment_id: u64,
    count: usize,
}

impl<K: LogKey> LogState<K> {
    fn oldest_key(&self) -> Option<K> {
        self.segments.iter().find_map(Segment::first_key)
    }

    fn newest_key(&self) -> Option<K> {
        self.segments.iter().rev().find_map(Segment::last_key)
    }

    /// Finds the segment position and entry index of the first record that
    /// satisfies `strategy` relative to `key` (or the first record at all).
    pub(crate) fn locate(&self, key: Option<K>, strategy: PositionStrategy) -> Option<(usize, usize)> {
        self.segments.iter().enumerate().find_map(|(pos, segment)| {
            let idx = key.map_or(0, |key| segment.lower_bound(key, strategy));
            (idx < segment.len()).then_some((pos, idx))
        })
    }

    pub(crate) fn segment_position(&self, id: u64) -> Option<usize> {
        self.segments.binary_search_by_key(&id, Segment::id).ok()
    }

    fn record_at<R: LogRecord<Key = K>>(&self, pos: usize, idx: usize) -> CoreResult<R> {
        let payload = self.segments[pos].read_payload(idx)?;
        decode_record(&payload)
    }
}

pub(crate) struct LogInner<R: LogRecord> {
    pub(crate) name: String,
    store: Arc<dyn SegmentStore>,
    config: LogConfig,
    pub(crate) state: RwLock<LogState<R::Key>>,
    _record: PhantomData<fn() -> R>,
}

/// An append-only log of `R` records with strictly increasing keys.
///
/// Clones share the same log.
pub struct Log<R: LogRecord> {
    inner: Arc<LogInner<R>>,
}

impl<R: LogRecord> Clone for Log<R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<R: LogRecord> fmt::Debug for Log<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Log").field("name", &self.inner.name).finish()
    }
}

impl<R: LogRecord> Log<R> {
    /// Opens the log stored as stream `name`, rebuilding its index.
    ///
    /// # Errors
    ///
    /// Returns an error if a segment cannot be read, holds a corrupt frame, or
    /// if keys do not increase across segments.
    pub fn open(store: Arc<dyn SegmentStore>, name: impl Into<String>, config: LogConfig) -> CoreResult<Self> {
        let name = name.into();
        let mut segments: Vec<Segment<R::Key>> = Vec::new();
        for id in store.list_segments(&name)? {
            let segment = Segment::open(&name, id, store.open_segment(&name, id)?)?;
            let previous = segments.iter().rev().find_map(Segment::last_key);
            if let (Some(previous), Some(first)) = (previous, segment.first_key()) {
                if first <= previous {
                    return Err(CoreError::log_corruption(format!(
                        "{name}: segment {id} starts at {first}, not after {previous}"
                    )));
                }
            }
            segments.push(segment);
        }

        let next_segment_id = segments.last().map_or(0, |s| s.id() + 1);
        let count = segments.iter().map(Segment::len).sum();
        debug!(log = %name, segments = segments.len(), records = count, "opened log");

        Ok(Self {
            inner: Arc::new(LogInner {
                name,
                store,
                config,
                state: RwLock::new(LogState {
                    segments,
                    closed: false,
                    purged_through: None,
                    next_segment_id,
                    count,
                }),
                _record: PhantomData,
            }),
        })
    }

    /// Stream name of the log.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Appends `record`.
    ///
    /// # Errors
    ///
    /// - [`CoreError::OrderingViolation`] if the key is not greater than the
    ///   newest stored key; nothing is written
    /// - [`CoreError::LogClosed`] after [`Log::close`]
    /// - storage errors, which leave the log unchanged
    pub fn append(&self, record: &R) -> CoreResult<()> {
        let key = record.key();
        let mut payload = Vec::new();
        key.encode_key(&mut payload);
        record.encode_value(&mut payload)?;
        let frame = encode_frame(&payload)?;

        let mut state = self.inner.state.write();
        if state.closed {
            return Err(CoreError::LogClosed);
        }
        if let Some(newest) = state.newest_key() {
            if key <= newest {
                warn!(log = %self.inner.name, %newest, offered = %key, "rejecting out-of-order append");
                return Err(CoreError::OrderingViolation {
                    log: self.inner.name.clone(),
                    newest: newest.to_string(),
                    offered: key.to_string(),
                });
            }
        }

        let rotate = match state.segments.last() {
            None => true,
            Some(head) => {
                !head.is_empty()
                    && head.size() + frame.len() as u64 > self.inner.config.max_segment_size
            }
        };
        if rotate {
            self.rotate(&mut state)?;
        }

        let head = state
            .segments
            .last_mut()
            .ok_or_else(|| CoreError::invalid_operation("log has no head segment"))?;
        head.append(key, &frame)?;
        if self.inner.config.sync_on_append {
            head.sync()?;
        }
        state.count += 1;
        Ok(())
    }

    fn rotate(&self, state: &mut LogState<R::Key>) -> CoreResult<()> {
        if let Some(head) = state.segments.last_mut() {
            head.sync()?;
        }
        let id = state.next_segment_id;
        let backend = self.inner.store.open_segment(&self.inner.name, id)?;
        state.segments.push(Segment::open(&self.inner.name, id, backend)?);
        state.next_segment_id = id + 1;
        debug!(log = %self.inner.name, segment = id, "started new segment");
        Ok(())
    }

    /// Opens a cursor positioned per `strategy` relative to `start`.
    ///
    /// `None` starts at the oldest record. A cursor on an empty log, or past
    /// its newest record, is not an error: it returns `Ok(None)` until
    /// matching records are appended.
    #[must_use]
    pub fn cursor_from(&self, start: Option<R::Key>, strategy: PositionStrategy) -> LogCursor<R> {
        LogCursor::new(Arc::clone(&self.inner), start, strategy)
    }

    /// Key of the oldest record.
    #[must_use]
    pub fn oldest_key(&self) -> Option<R::Key> {
        self.inner.state.read().oldest_key()
    }

    /// Key of the newest record.
    #[must_use]
    pub fn newest_key(&self) -> Option<R::Key> {
        self.inner.state.read().newest_key()
    }

    /// The oldest record.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be read.
    pub fn oldest(&self) -> CoreResult<Option<R>> {
        let state = self.inner.state.read();
        match state.locate(None, PositionStrategy::AtOrAfter) {
            Some((pos, idx)) => state.record_at(pos, idx).map(Some),
            None => Ok(None),
        }
    }

    /// The newest record.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be read.
    pub fn newest(&self) -> CoreResult<Option<R>> {
        let state = self.inner.state.read();
        let found = state
            .segments
            .iter()
            .enumerate()
            .rev()
            .find(|(_, segment)| !segment.is_empty());
        match found {
            Some((pos, segment)) => state.record_at(pos, segment.len() - 1).map(Some),
            None => Ok(None),
        }
    }

    /// Number of records currently stored.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.state.read().count
    }

    /// Returns true if the log holds no record.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of segments, including an empty head.
    #[must_use]
    pub fn segment_count(&self) -> usize {
        self.inner.state.read().segments.len()
    }

    /// Deletes every non-head segment whose records are all older than `key`.
    ///
    /// Records with a key >= `key` are never removed; some older records may
    /// survive because only whole segments are deleted. A cursor that had not
    /// yet read every record of a deleted segment fails on its next read;
    /// cursors past the deleted records carry on. Returns
    /// the key of the oldest remaining record.
    ///
    /// # Errors
    ///
    /// Returns an error if a segment cannot be removed or the log is closed.
    pub fn purge_before(&self, key: R::Key) -> CoreResult<Option<R::Key>> {
        let mut state = self.inner.state.write();
        if state.closed {
            return Err(CoreError::LogClosed);
        }

        let mut removed = 0usize;
        while state.segments.len() > 1 {
            let last = state.segments[0].last_key();
            if last.is_some_and(|last| last >= key) {
                break;
            }
            self.inner.store.remove_segment(&self.inner.name, state.segments[0].id())?;
            let segment = state.segments.remove(0);
            state.count -= segment.len();
            state.purged_through = state.purged_through.max(last);
            removed += segment.len();
        }

        if removed > 0 {
            info!(log = %self.inner.name, before = %key, removed, "purged log segments");
        }
        Ok(state.oldest_key())
    }

    /// Removes every record. Cursors with unread records are invalidated.
    ///
    /// # Errors
    ///
    /// Returns an error if a segment cannot be removed.
    pub fn clear(&self) -> CoreResult<()> {
        let mut state = self.inner.state.write();
        let newest = state.newest_key();
        while let Some(id) = state.segments.last().map(Segment::id) {
            self.inner.store.remove_segment(&self.inner.name, id)?;
            if let Some(segment) = state.segments.pop() {
                state.count -= segment.len();
            }
        }
        state.purged_through = state.purged_through.max(newest);
        info!(log = %self.inner.name, "cleared log");
        Ok(())
    }

    /// Flushes and syncs the head segment.
    ///
    /// # Errors
    ///
    /// Returns an error if the sync fails.
    pub fn sync(&self) -> CoreResult<()> {
        let mut state = self.inner.state.write();
        if let Some(head) = state.segments.last_mut() {
            head.sync()?;
        }
        Ok(())
    }

    /// Syncs and closes the log. Appends fail afterwards and cursors read
    /// nothing more.
    ///
    /// # Errors
    ///
    /// Returns an error if the final sync fails; the log is closed anyway.
    pub fn close(&self) -> CoreResult<()> {
        let mut state = self.inner.state.write();
        if state.closed {
            return Ok(());
        }
        state.closed = true;
        match state.segments.last_mut() {
            Some(head) => head.sync(),
            None => Ok(()),
        }
    }

    /// Returns true once [`Log::close`] has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.state.read().closed
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use dirsync_storage::MemorySegmentStore;

    /// A minimal record keyed by `u64`, used to test the log machinery.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub(crate) struct TestRecord {
        pub(crate) key: u64,
        pub(crate) value: Vec<u8>,
    }

    impl LogKey for u64 {
        fn encode_key(&self, buf: &mut Vec<u8>) {
            buf.extend_from_slice(&self.to_be_bytes());
        }

        fn decode_key(bytes: &[u8]) -> CoreResult<(Self, usize)> {
            let raw: [u8; 8] = bytes
                .get(..8)
                .and_then(|b| b.try_into().ok())
                .ok_or_else(|| CoreError::log_corruption("short u64 key"))?;
            Ok((u64::from_be_bytes(raw), 8))
        }
    }

    impl LogRecord for TestRecord {
        type Key = u64;

        fn key(&self) -> u64 {
            self.key
        }

        fn encode_value(&self, buf: &mut Vec<u8>) -> CoreResult<()> {
            buf.extend_from_slice(&self.value);
            Ok(())
        }

        fn decode_value(key: u64, bytes: &[u8]) -> CoreResult<Self> {
            Ok(Self {
                key,
                value: bytes.to_vec(),
            })
        }
    }

    pub(crate) fn record(key: u64) -> TestRecord {
        TestRecord {
            key,
            value: format!("value-{key}").into_bytes(),
        }
    }

    fn small_segments() -> LogConfig {
        // Each test frame is 10 + 8 + 7..9 + 4 bytes; three fit per segment.
        LogConfig::new().max_segment_size(96)
    }

    fn open(store: &Arc<MemorySegmentStore>) -> Log<TestRecord> {
        Log::open(Arc::clone(store) as Arc<dyn SegmentStore>, "test/log", small_segments()).unwrap()
    }

    #[test]
    fn append_and_bounds() {
        let store = Arc::new(MemorySegmentStore::new());
        let log = open(&store);
        assert!(log.is_empty());
        assert_eq!(log.oldest().unwrap(), None);

        for key in [10, 20, 30] {
            log.append(&record(key)).unwrap();
        }
        assert_eq!(log.len(), 3);
        assert_eq!(log.oldest_key(), Some(10));
        assert_eq!(log.newest_key(), Some(30));
        assert_eq!(log.oldest().unwrap(), Some(record(10)));
        assert_eq!(log.newest().unwrap(), Some(record(30)));
    }

    #[test]
    fn append_rejects_non_increasing_keys() {
        let store = Arc::new(MemorySegmentStore::new());
        let log = open(&store);
        log.append(&record(5)).unwrap();

        for key in [5, 4] {
            assert!(matches!(
                log.append(&record(key)),
                Err(CoreError::OrderingViolation { .. })
            ));
        }
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn rotates_into_new_segments() {
        let store = Arc::new(MemorySegmentStore::new());
        let log = open(&store);
        for key in 1..=10 {
            log.append(&record(key)).unwrap();
        }
        assert!(log.segment_count() >= 3);
        assert_eq!(
            store.list_segments("test/log").unwrap().len(),
            log.segment_count()
        );
    }

    #[test]
    fn reopen_rebuilds_index() {
        let store = Arc::new(MemorySegmentStore::new());
        {
            let log = open(&store);
            for key in 1..=10 {
                log.append(&record(key)).unwrap();
            }
            log.close().unwrap();
        }

        let log = open(&store);
        assert_eq!(log.len(), 10);
        assert_eq!(log.newest_key(), Some(10));
        log.append(&record(11)).unwrap();
        assert!(log.append(&record(3)).is_err());
    }

    #[test]
    fn torn_tail_is_repaired_on_open() {
        let store = Arc::new(MemorySegmentStore::new());
        {
            let log = open(&store);
            log.append(&record(1)).unwrap();
        }
        let mut head = store.segment("test/log", 0).unwrap();
        let frame = encode_frame(b"partial frame bytes").unwrap();
        dirsync_storage::StorageBackend::append(&mut head, &frame[..9]).unwrap();

        let log = open(&store);
        assert_eq!(log.len(), 1);
        log.append(&record(2)).unwrap();
        drop(log);
        assert_eq!(open(&store).len(), 2);
    }

    #[test]
    fn corrupt_frame_fails_open() {
        let store = Arc::new(MemorySegmentStore::new());
        {
            let log = open(&store);
            log.append(&record(1)).unwrap();
            log.append(&record(2)).unwrap();
        }
        store.segment("test/log", 0).unwrap().corrupt_byte(12);

        let result = Log::<TestRecord>::open(
            Arc::clone(&store) as Arc<dyn SegmentStore>,
            "test/log",
            small_segments(),
        );
        assert!(matches!(result, Err(CoreError::ChecksumMismatch { .. })));
    }

    #[test]
    fn purge_removes_whole_old_segments_only() {
        let store = Arc::new(MemorySegmentStore::new());
        let log = open(&store);
        for key in 1..=10 {
            log.append(&record(key)).unwrap();
        }
        let segments_before = log.segment_count();

        let oldest = log.purge_before(5).unwrap().unwrap();
        assert!(oldest <= 5);
        assert!(log.segment_count() < segments_before);
        assert_eq!(log.len() as u64, 10 - oldest + 1);

        // The head segment is never purged.
        log.purge_before(1_000).unwrap();
        assert_eq!(log.segment_count(), 1);
        assert_eq!(log.newest_key(), Some(10));
    }

    #[test]
    fn closed_log_rejects_appends() {
        let store = Arc::new(MemorySegmentStore::new());
        let log = open(&store);
        log.append(&record(1)).unwrap();
        log.close().unwrap();
        assert!(log.is_closed());
        assert!(matches!(log.append(&record(2)), Err(CoreError::LogClosed)));
        assert!(matches!(log.purge_before(2), Err(CoreError::LogClosed)));
    }

    #[test]
    fn clear_empties_the_log() {
        let store = Arc::new(MemorySegmentStore::new());
        let log = open(&store);
        for key in 1..=5 {
            log.append(&record(key)).unwrap();
        }
        log.clear().unwrap();
        assert!(log.is_empty());
        assert!(store.list_segments("test/log").unwrap().is_empty());
        log.append(&record(1)).unwrap();
        assert_eq!(log.len(), 1);
    }
}
