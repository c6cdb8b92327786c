//! Change numbers: a dense, externally visible numbering of all changes.
//!
//! The [`ChangeNumberIndex`] maps change numbers to CSNs. Each record also
//! carries the cookie of the position just before the change, so a consumer
//! that knows only a change number can switch to cookie-based reads.
//!
//! The [`ChangeNumberIndexer`] fills the index from a merge cursor over the
//! changelog, but only up to the global medium consistency point: a change
//! numbered too early could later be preceded by a slower replica's change.

use crate::changelog::ChangelogDb;
use crate::config::LogConfig;
use crate::csn::{Csn, CSN_KEY_LEN};
use crate::error::{CoreError, CoreResult};
use crate::log::{Log, LogCursor, LogRecord, PositionStrategy};
use crate::merge::MergeCursor;
use crate::server_state::MultiDomainServerState;
use crate::types::{ChangeNumber, DomainId};
use dirsync_storage::SegmentStore;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info};

/// Stream holding the change number index.
pub const CN_INDEX_STREAM: &str = "cnindex";

/// One entry of the change number index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CnIndexRecord {
    /// The change number.
    pub change_number: ChangeNumber,
    /// CSN of the change.
    pub csn: Csn,
    /// Domain of the change.
    pub domain: DomainId,
    /// Cookie of the position just before this change.
    pub previous_cookie: String,
}

impl LogRecord for CnIndexRecord {
    type Key = ChangeNumber;

    fn key(&self) -> ChangeNumber {
        self.change_number
    }

    fn encode_value(&self, buf: &mut Vec<u8>) -> CoreResult<()> {
        buf.extend_from_slice(&self.csn.to_key_bytes());
        let domain = self.domain.as_str().as_bytes();
        let len = u16::try_from(domain.len())
            .map_err(|_| CoreError::invalid_operation("domain name longer than 65535 bytes"))?;
        buf.extend_from_slice(&len.to_be_bytes());
        buf.extend_from_slice(domain);
        buf.extend_from_slice(self.previous_cookie.as_bytes());
        Ok(())
    }

    fn decode_value(change_number: ChangeNumber, bytes: &[u8]) -> CoreResult<Self> {
        let corrupt = || CoreError::log_corruption(format!("truncated index record {change_number}"));
        let csn = Csn::from_key_bytes(bytes.get(..CSN_KEY_LEN).ok_or_else(corrupt)?)?;
        let rest = &bytes[CSN_KEY_LEN..];
        let len_bytes = rest.get(..2).ok_or_else(corrupt)?;
        let len = usize::from(u16::from_be_bytes([len_bytes[0], len_bytes[1]]));
        let domain = rest.get(2..2 + len).ok_or_else(corrupt)?;
        let text = |b: &[u8]| {
            std::str::from_utf8(b)
                .map(str::to_owned)
                .map_err(|_| CoreError::log_corruption(format!("non UTF-8 text in {change_number}")))
        };
        Ok(Self {
            change_number,
            csn,
            domain: DomainId::new(&text(domain)?),
            previous_cookie: text(&rest[2 + len..])?,
        })
    }
}

/// Persistent change number to CSN index.
#[derive(Debug)]
pub struct ChangeNumberIndex {
    log: Log<CnIndexRecord>,
    next: Mutex<ChangeNumber>,
}

impl ChangeNumberIndex {
    /// Opens the index, deriving the next change number from the newest
    /// stored record.
    ///
    /// # Errors
    ///
    /// Returns an error if the index cannot be read back.
    pub fn open(store: Arc<dyn SegmentStore>, config: LogConfig) -> CoreResult<Self> {
        let log = Log::open(store, CN_INDEX_STREAM, config)?;
        let next = log
            .newest_key()
            .map_or(ChangeNumber::FIRST, ChangeNumber::next);
        debug!(next = %next, "opened change number index");
        Ok(Self {
            log,
            next: Mutex::new(next),
        })
    }

    /// Appends a change and returns the change number assigned to it.
    ///
    /// A failed append does not consume a change number.
    ///
    /// # Errors
    ///
    /// Returns storage errors from the underlying log.
    pub fn append(&self, csn: Csn, domain: DomainId, previous_cookie: impl Into<String>) -> CoreResult<ChangeNumber> {
        let mut next = self.next.lock();
        let record = CnIndexRecord {
            change_number: *next,
            csn,
            domain,
            previous_cookie: previous_cookie.into(),
        };
        self.log.append(&record)?;
        *next = next.next();
        Ok(record.change_number)
    }

    /// The change number the next append will get.
    #[must_use]
    pub fn next_change_number(&self) -> ChangeNumber {
        *self.next.lock()
    }

    /// The record with the lowest change number.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be read.
    pub fn oldest(&self) -> CoreResult<Option<CnIndexRecord>> {
        self.log.oldest()
    }

    /// The record with the highest change number.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be read.
    pub fn newest(&self) -> CoreResult<Option<CnIndexRecord>> {
        self.log.newest()
    }

    /// Opens a cursor at `change_number` (or the first one after it).
    #[must_use]
    pub fn cursor_from(&self, change_number: ChangeNumber) -> LogCursor<CnIndexRecord> {
        self.log.cursor_from(Some(change_number), PositionStrategy::AtOrAfter)
    }

    /// Looks up the record of one change number.
    ///
    /// # Errors
    ///
    /// Returns an error if the index cannot be read.
    pub fn get(&self, change_number: ChangeNumber) -> CoreResult<Option<CnIndexRecord>> {
        let mut cursor = self.cursor_from(change_number);
        Ok(cursor.next()?.filter(|r| r.change_number == change_number))
    }

    /// Number of stored records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.log.len()
    }

    /// Returns true if the index is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.log.is_empty()
    }

    /// Removes whole segments below `change_number`.
    ///
    /// # Errors
    ///
    /// Returns an error if a segment cannot be removed.
    pub fn purge_before(&self, change_number: ChangeNumber) -> CoreResult<Option<ChangeNumber>> {
        self.log.purge_before(change_number)
    }

    /// Removes every record. Numbering continues where it was.
    ///
    /// # Errors
    ///
    /// Returns an error if a segment cannot be removed.
    pub fn clear(&self) -> CoreResult<()> {
        self.log.clear()
    }

    /// Closes the index.
    ///
    /// # Errors
    ///
    /// Returns an error if the final sync fails.
    pub fn close(&self) -> CoreResult<()> {
        self.log.close()
    }
}

/// Feeds the change number index from the changelog in CSN order.
#[derive(Debug)]
pub struct ChangeNumberIndexer {
    changelog: Arc<ChangelogDb>,
    index: Arc<ChangeNumberIndex>,
    cursor: MergeCursor,
}

impl ChangeNumberIndexer {
    /// Creates an indexer that continues after the newest indexed change.
    ///
    /// # Errors
    ///
    /// Returns an error if the newest record or its cookie cannot be read.
    pub fn new(changelog: Arc<ChangelogDb>, index: Arc<ChangeNumberIndex>) -> CoreResult<Self> {
        let start = match index.newest()? {
            Some(last) => {
                let mut cookie: MultiDomainServerState = last.previous_cookie.parse()?;
                cookie.update(&last.domain, last.csn);
                cookie
            }
            None => MultiDomainServerState::new(),
        };
        let cursor = MergeCursor::open(&changelog, &start, PositionStrategy::StrictlyAfter);
        Ok(Self {
            changelog,
            index,
            cursor,
        })
    }

    /// Cookie of the position after the last indexed change.
    #[must_use]
    pub fn cookie(&self) -> &MultiDomainServerState {
        self.cursor.position()
    }

    /// Indexes every change up to the global medium consistency point.
    ///
    /// Returns the number of changes indexed.
    ///
    /// # Errors
    ///
    /// Returns changelog read errors and index append errors.
    pub fn index_available(&mut self) -> CoreResult<usize> {
        let Some(limit) = self.changelog.global_medium_consistency() else {
            return Ok(0);
        };

        let mut indexed = 0;
        loop {
            let (csn, domain) = match self.cursor.peek()? {
                Some(head) if head.csn <= limit => (head.csn, head.domain.clone()),
                _ => break,
            };
            let previous_cookie = self.cursor.position().to_string();
            // The cursor only moves past a change once it is indexed.
            self.index.append(csn, domain, previous_cookie)?;
            self.cursor.advance()?;
            indexed += 1;
        }
        if indexed > 0 {
            info!(indexed, limit = %limit, next = %self.index.next_change_number(), "indexed changes");
        }
        Ok(indexed)
    }

    /// Stops the indexer and releases its cursor.
    pub fn close(&mut self) {
        self.cursor.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChangelogConfig;
    use crate::replica_log::ChangeRecord;
    use crate::types::ReplicaId;
    use dirsync_storage::{MemorySegmentStore, StorageBackend, StorageError, StorageResult};
    use std::sync::atomic::{AtomicBool, Ordering};

    fn csn(ts: u64, replica: u16) -> Csn {
        Csn::new(ts, 0, ReplicaId(replica))
    }

    fn store() -> Arc<dyn SegmentStore> {
        Arc::new(MemorySegmentStore::new())
    }

    #[test]
    fn append_assigns_consecutive_numbers() {
        let index = ChangeNumberIndex::open(store(), LogConfig::new()).unwrap();
        let domain = DomainId::new("dc=a");
        assert_eq!(index.append(csn(1, 1), domain.clone(), "").unwrap(), ChangeNumber(1));
        assert_eq!(index.append(csn(2, 1), domain.clone(), "x").unwrap(), ChangeNumber(2));
        assert_eq!(index.oldest().unwrap().unwrap().csn, csn(1, 1));

        let newest = index.newest().unwrap().unwrap();
        assert_eq!(newest.change_number, ChangeNumber(2));
        assert_eq!(newest.previous_cookie, "x");
        assert_eq!(index.get(ChangeNumber(1)).unwrap().unwrap().csn, csn(1, 1));
        assert!(index.get(ChangeNumber(9)).unwrap().is_none());
    }

    #[test]
    fn reopen_continues_numbering() {
        let store = store();
        {
            let index = ChangeNumberIndex::open(Arc::clone(&store), LogConfig::new()).unwrap();
            for ts in 1..=3 {
                index.append(csn(ts, 1), DomainId::new("dc=a"), "").unwrap();
            }
        }
        let index = ChangeNumberIndex::open(store, LogConfig::new()).unwrap();
        assert_eq!(index.next_change_number(), ChangeNumber(4));
        assert_eq!(index.append(csn(9, 1), DomainId::new("dc=a"), "").unwrap(), ChangeNumber(4));
    }

    #[test]
    fn failed_append_does_not_consume_a_number() {
        let index = ChangeNumberIndex::open(store(), LogConfig::new()).unwrap();
        index.append(csn(1, 1), DomainId::new("dc=a"), "").unwrap();
        index.close().unwrap();
        assert!(index.append(csn(2, 1), DomainId::new("dc=a"), "").is_err());
        assert_eq!(index.next_change_number(), ChangeNumber(2));
    }

    #[test]
    fn cursor_reads_from_change_number() {
        let index = ChangeNumberIndex::open(store(), LogConfig::new()).unwrap();
        for ts in 1..=5 {
            index.append(csn(ts, 1), DomainId::new("dc=a"), "").unwrap();
        }
        let mut cursor = index.cursor_from(ChangeNumber(3));
        let mut seen = Vec::new();
        while let Some(record) = cursor.next().unwrap() {
            seen.push(record.change_number.as_u64());
        }
        assert_eq!(seen, vec![3, 4, 5]);
    }

    fn changelog() -> Arc<ChangelogDb> {
        Arc::new(ChangelogDb::open(store(), ChangelogConfig::default()).unwrap())
    }

    fn publish(db: &ChangelogDb, domain: &str, csn: Csn) {
        db.publish(&ChangeRecord::new(csn, DomainId::new(domain), Vec::new()))
            .unwrap();
    }

    #[test]
    fn indexer_stops_at_medium_consistency() {
        let db = changelog();
        let index = Arc::new(ChangeNumberIndex::open(store(), LogConfig::new()).unwrap());
        publish(&db, "dc=a", csn(10, 1));
        publish(&db, "dc=a", csn(20, 1));
        publish(&db, "dc=a", csn(15, 2));

        let mut indexer = ChangeNumberIndexer::new(Arc::clone(&db), Arc::clone(&index)).unwrap();
        // Replica 2 is only known up to 15.
        assert_eq!(indexer.index_available().unwrap(), 2);
        assert_eq!(index.newest().unwrap().unwrap().csn, csn(15, 2));

        db.heartbeat(&DomainId::new("dc=a"), csn(30, 2));
        assert_eq!(indexer.index_available().unwrap(), 1);
        assert_eq!(index.newest().unwrap().unwrap().csn, csn(20, 1));
        assert_eq!(indexer.index_available().unwrap(), 0);
    }

    #[test]
    fn index_records_carry_previous_cookie() {
        let db = changelog();
        let index = Arc::new(ChangeNumberIndex::open(store(), LogConfig::new()).unwrap());
        publish(&db, "dc=a", csn(1, 1));
        publish(&db, "dc=b", csn(2, 1));

        let mut indexer = ChangeNumberIndexer::new(Arc::clone(&db), Arc::clone(&index)).unwrap();
        assert_eq!(indexer.index_available().unwrap(), 2);

        let first = index.get(ChangeNumber(1)).unwrap().unwrap();
        assert_eq!(first.previous_cookie, "");
        let second = index.get(ChangeNumber(2)).unwrap().unwrap();
        assert_eq!(second.previous_cookie, format!("dc=a:{};", csn(1, 1)));
    }

    #[test]
    fn new_indexer_resumes_after_newest_record() {
        let db = changelog();
        let index = Arc::new(ChangeNumberIndex::open(store(), LogConfig::new()).unwrap());
        publish(&db, "dc=a", csn(1, 1));
        publish(&db, "dc=a", csn(2, 1));
        {
            let mut indexer = ChangeNumberIndexer::new(Arc::clone(&db), Arc::clone(&index)).unwrap();
            indexer.index_available().unwrap();
            indexer.close();
        }
        publish(&db, "dc=a", csn(3, 1));

        let mut indexer = ChangeNumberIndexer::new(Arc::clone(&db), Arc::clone(&index)).unwrap();
        assert_eq!(indexer.index_available().unwrap(), 1);
        assert_eq!(index.len(), 3);
        assert_eq!(index.newest().unwrap().unwrap().change_number, ChangeNumber(3));
    }

    /// Segments whose appends fail while the shared switch is on.
    #[derive(Debug, Default)]
    struct FlakyStore {
        inner: MemorySegmentStore,
        failing: Arc<AtomicBool>,
    }

    struct FlakySegment {
        inner: Box<dyn StorageBackend>,
        failing: Arc<AtomicBool>,
    }

    impl SegmentStore for FlakyStore {
        fn list_streams(&self) -> StorageResult<Vec<String>> {
            self.inner.list_streams()
        }

        fn list_segments(&self, stream: &str) -> StorageResult<Vec<u64>> {
            self.inner.list_segments(stream)
        }

        fn open_segment(&self, stream: &str, segment: u64) -> StorageResult<Box<dyn StorageBackend>> {
            Ok(Box::new(FlakySegment {
                inner: self.inner.open_segment(stream, segment)?,
                failing: Arc::clone(&self.failing),
            }))
        }

        fn remove_segment(&self, stream: &str, segment: u64) -> StorageResult<()> {
            self.inner.remove_segment(stream, segment)
        }
    }

    impl StorageBackend for FlakySegment {
        fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
            self.inner.read_at(offset, len)
        }

        fn append(&mut self, data: &[u8]) -> StorageResult<u64> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(StorageError::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "flaky",
                )));
            }
            self.inner.append(data)
        }

        fn flush(&mut self) -> StorageResult<()> {
            self.inner.flush()
        }

        fn size(&self) -> StorageResult<u64> {
            self.inner.size()
        }

        fn sync(&mut self) -> StorageResult<()> {
            self.inner.sync()
        }

        fn truncate(&mut self, new_size: u64) -> StorageResult<()> {
            self.inner.truncate(new_size)
        }
    }

    #[test]
    fn failed_index_append_is_retried() {
        let db = changelog();
        let flaky = Arc::new(FlakyStore::default());
        let failing = Arc::clone(&flaky.failing);
        let index = Arc::new(ChangeNumberIndex::open(flaky, LogConfig::new()).unwrap());
        publish(&db, "dc=a", csn(1, 1));
        publish(&db, "dc=a", csn(2, 1));

        let mut indexer = ChangeNumberIndexer::new(Arc::clone(&db), Arc::clone(&index)).unwrap();
        failing.store(true, Ordering::SeqCst);
        assert!(indexer.index_available().is_err());
        assert!(index.is_empty());

        failing.store(false, Ordering::SeqCst);
        assert_eq!(indexer.index_available().unwrap(), 2);
        assert_eq!(index.get(ChangeNumber(1)).unwrap().unwrap().csn, csn(1, 1));
        assert_eq!(index.get(ChangeNumber(2)).unwrap().unwrap().csn, csn(2, 1));
        assert_eq!(indexer.cookie().to_string(), format!("dc=a:{};", csn(2, 1)));
    }
}
