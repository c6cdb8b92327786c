//! Persisted per-domain server state.
//!
//! A domain saves its [`ServerState`] regularly so a restart knows which
//! changes it already has. Missing or unreadable state is not an error: it
//! loads as unknown, and the domain starts from the oldest changes.

use crate::error::{CoreError, CoreResult};
use crate::log::frame::{encode_frame, FrameReader};
use crate::server_state::ServerState;
use crate::types::DomainId;
use dirsync_storage::{SegmentStore, StorageBackend};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Storage of per-domain server states.
pub trait StateStore: Send + Sync {
    /// Loads the last saved state of `domain`, `None` if unknown.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying medium fails.
    fn load(&self, domain: &DomainId) -> CoreResult<Option<ServerState>>;

    /// Saves the state of `domain`, replacing the previous one.
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be written.
    fn save(&self, domain: &DomainId, state: &ServerState) -> CoreResult<()>;
}

/// A state store kept in memory.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    states: Mutex<HashMap<DomainId, ServerState>>,
}

impl MemoryStateStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateStore for MemoryStateStore {
    fn load(&self, domain: &DomainId) -> CoreResult<Option<ServerState>> {
        Ok(self.states.lock().get(domain).cloned())
    }

    fn save(&self, domain: &DomainId, state: &ServerState) -> CoreResult<()> {
        self.states.lock().insert(domain.clone(), state.clone());
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedState {
    domain: String,
    csns: Vec<String>,
}

#[derive(Debug, Clone, Copy)]
struct StreamCursor {
    segment: u64,
    records: usize,
}

/// A state store writing framed CBOR records to a segment store.
///
/// Each save appends a record to the stream `state/<domain>`; the newest
/// complete record wins on load. Once a stream holds `compaction_threshold`
/// records it is rewritten as a fresh segment with only the newest one.
pub struct LogStateStore {
    store: Arc<dyn SegmentStore>,
    compaction_threshold: usize,
    streams: Mutex<HashMap<DomainId, StreamCursor>>,
}

impl std::fmt::Debug for LogStateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogStateStore")
            .field("store", &self.store)
            .field("compaction_threshold", &self.compaction_threshold)
            .finish_non_exhaustive()
    }
}

fn stream_name(domain: &DomainId) -> String {
    format!("state/{domain}")
}

fn encode_state(domain: &DomainId, state: &ServerState) -> CoreResult<Vec<u8>> {
    let record = PersistedState {
        domain: domain.to_string(),
        csns: state.to_csn_strings(),
    };
    let mut payload = Vec::new();
    ciborium::into_writer(&record, &mut payload).map_err(|e| CoreError::codec(e.to_string()))?;
    encode_frame(&payload)
}

/// Scans a segment, cuts off anything after the last good frame and returns
/// the payload of that frame with the number of good frames.
fn recover(stream: &str, backend: &mut dyn StorageBackend) -> CoreResult<(Option<Vec<u8>>, usize)> {
    let (last, count, valid_len) = {
        let mut reader = FrameReader::new(&*backend, 0)?;
        let mut last = None;
        let mut count = 0;
        for frame in reader.by_ref() {
            match frame {
                Ok((_, payload)) => {
                    last = Some(payload);
                    count += 1;
                }
                Err(e) => {
                    warn!(stream, error = %e, "ignoring damaged state record");
                    break;
                }
            }
        }
        (last, count, reader.valid_len())
    };
    if backend.size()? > valid_len {
        backend.truncate(valid_len)?;
    }
    Ok((last, count))
}

impl LogStateStore {
    /// Creates a state store over `store`.
    #[must_use]
    pub fn new(store: Arc<dyn SegmentStore>, compaction_threshold: usize) -> Self {
        Self {
            store,
            compaction_threshold: compaction_threshold.max(1),
            streams: Mutex::new(HashMap::new()),
        }
    }

    /// Finds the newest readable state record of `stream`, repairing the
    /// segment it lives in. Leftover older segments are removed.
    fn open_stream(&self, stream: &str) -> CoreResult<(StreamCursor, Option<Vec<u8>>)> {
        let mut segments = self.store.list_segments(stream)?;
        let Some(&newest) = segments.last() else {
            return Ok((StreamCursor { segment: 0, records: 0 }, None));
        };

        let mut found = None;
        while let Some(id) = segments.pop() {
            let mut backend = self.store.open_segment(stream, id)?;
            let (last, count) = recover(stream, backend.as_mut())?;
            if last.is_some() {
                found = Some((id, last, count));
                break;
            }
        }

        let (segment, last, records) = match found {
            Some((id, last, count)) => (id, last, count),
            None => (newest, None, 0),
        };
        for id in self.store.list_segments(stream)? {
            if id < segment {
                debug!(stream, segment = id, "removing superseded state segment");
                self.store.remove_segment(stream, id)?;
            }
        }
        Ok((StreamCursor { segment, records }, last))
    }

    fn cursor(&self, domain: &DomainId) -> CoreResult<StreamCursor> {
        if let Some(cursor) = self.streams.lock().get(domain) {
            return Ok(*cursor);
        }
        let (cursor, _) = self.open_stream(&stream_name(domain))?;
        self.streams.lock().insert(domain.clone(), cursor);
        Ok(cursor)
    }

    fn compact(&self, domain: &DomainId, cursor: StreamCursor, frame: &[u8]) -> CoreResult<StreamCursor> {
        let stream = stream_name(domain);
        let fresh = StreamCursor {
            segment: cursor.segment + 1,
            records: 1,
        };
        let mut backend = self.store.open_segment(&stream, fresh.segment)?;
        backend.append(frame)?;
        backend.flush()?;
        backend.sync()?;
        self.store.remove_segment(&stream, cursor.segment)?;
        info!(domain = %domain, records = cursor.records, "compacted persisted state");
        Ok(fresh)
    }
}

impl StateStore for LogStateStore {
    fn load(&self, domain: &DomainId) -> CoreResult<Option<ServerState>> {
        let (cursor, payload) = self.open_stream(&stream_name(domain))?;
        self.streams.lock().insert(domain.clone(), cursor);
        let Some(payload) = payload else {
            return Ok(None);
        };

        let record: PersistedState = match ciborium::from_reader(payload.as_slice()) {
            Ok(record) => record,
            Err(e) => {
                warn!(domain = %domain, error = %e, "unreadable persisted state, starting from oldest");
                return Ok(None);
            }
        };
        match ServerState::from_csn_strings(&record.csns) {
            Ok(state) => Ok(Some(state)),
            Err(e) => {
                warn!(domain = %domain, error = %e, "invalid persisted state, starting from oldest");
                Ok(None)
            }
        }
    }

    fn save(&self, domain: &DomainId, state: &ServerState) -> CoreResult<()> {
        let frame = encode_state(domain, state)?;
        let cursor = self.cursor(domain)?;

        let updated = if cursor.records >= self.compaction_threshold {
            self.compact(domain, cursor, &frame)?
        } else {
            let mut backend = self.store.open_segment(&stream_name(domain), cursor.segment)?;
            let size = backend.size()?;
            if let Err(e) = backend.append(&frame).and_then(|_| backend.flush()).and_then(|()| backend.sync()) {
                // Leave no partial record behind.
                if let Err(undo) = backend.truncate(size) {
                    warn!(domain = %domain, error = %undo, "could not roll back failed state save");
                }
                return Err(e.into());
            }
            StreamCursor {
                segment: cursor.segment,
                records: cursor.records + 1,
            }
        };
        self.streams.lock().insert(domain.clone(), updated);
        debug!(domain = %domain, state = %state, "saved server state");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::csn::Csn;
    use crate::types::ReplicaId;
    use dirsync_storage::{FileSegmentStore, MemorySegmentStore};
    use tempfile::tempdir;

    fn state(pairs: &[(u64, u16)]) -> ServerState {
        pairs
            .iter()
            .map(|(ts, replica)| Csn::new(*ts, 0, ReplicaId(*replica)))
            .collect()
    }

    fn domain() -> DomainId {
        DomainId::new("dc=example")
    }

    #[test]
    fn memory_store_round_trip() {
        let store = MemoryStateStore::new();
        assert_eq!(store.load(&domain()).unwrap(), None);
        store.save(&domain(), &state(&[(5, 1)])).unwrap();
        assert_eq!(store.load(&domain()).unwrap(), Some(state(&[(5, 1)])));
    }

    #[test]
    fn newest_record_wins() {
        let segments = Arc::new(MemorySegmentStore::new());
        let store = LogStateStore::new(Arc::clone(&segments) as Arc<dyn SegmentStore>, 100);
        assert_eq!(store.load(&domain()).unwrap(), None);

        store.save(&domain(), &state(&[(1, 1)])).unwrap();
        store.save(&domain(), &state(&[(2, 1), (3, 2)])).unwrap();

        let reopened = LogStateStore::new(segments, 100);
        assert_eq!(reopened.load(&domain()).unwrap(), Some(state(&[(2, 1), (3, 2)])));
        assert_eq!(reopened.load(&DomainId::new("dc=other")).unwrap(), None);
    }

    #[test]
    fn torn_or_corrupt_tail_falls_back_to_previous_record() {
        let segments = Arc::new(MemorySegmentStore::new());
        let store = LogStateStore::new(Arc::clone(&segments) as Arc<dyn SegmentStore>, 100);
        store.save(&domain(), &state(&[(1, 1)])).unwrap();
        let good_len = segments.segment("state/dc=example", 0).unwrap().data().len();
        store.save(&domain(), &state(&[(2, 1)])).unwrap();

        // Damage the second record.
        segments.segment("state/dc=example", 0).unwrap().corrupt_byte(good_len + 12);

        let reopened = LogStateStore::new(Arc::clone(&segments) as Arc<dyn SegmentStore>, 100);
        assert_eq!(reopened.load(&domain()).unwrap(), Some(state(&[(1, 1)])));

        // The damaged record was cut off; new saves are readable.
        reopened.save(&domain(), &state(&[(9, 1)])).unwrap();
        let again = LogStateStore::new(segments, 100);
        assert_eq!(again.load(&domain()).unwrap(), Some(state(&[(9, 1)])));
    }

    #[test]
    fn compaction_keeps_only_newest() {
        let segments = Arc::new(MemorySegmentStore::new());
        let store = LogStateStore::new(Arc::clone(&segments) as Arc<dyn SegmentStore>, 3);
        for ts in 1..=7 {
            store.save(&domain(), &state(&[(ts, 1)])).unwrap();
        }
        let ids = segments.list_segments("state/dc=example").unwrap();
        assert_eq!(ids.len(), 1);
        assert!(ids[0] >= 2);

        let reopened = LogStateStore::new(segments, 3);
        assert_eq!(reopened.load(&domain()).unwrap(), Some(state(&[(7, 1)])));
    }

    #[test]
    fn undecodable_payload_loads_as_unknown() {
        let segments = Arc::new(MemorySegmentStore::new());
        let mut backend = segments.open_segment("state/dc=example", 0).unwrap();
        backend.append(&encode_frame(b"not cbor at all").unwrap()).unwrap();

        let store = LogStateStore::new(segments, 10);
        assert_eq!(store.load(&domain()).unwrap(), None);
    }

    #[test]
    fn file_store_survives_restart() {
        let dir = tempdir().unwrap();
        {
            let segments: Arc<dyn SegmentStore> = Arc::new(FileSegmentStore::open(dir.path()).unwrap());
            let store = LogStateStore::new(segments, 10);
            store.save(&domain(), &state(&[(42, 3)])).unwrap();
        }
        let segments: Arc<dyn SegmentStore> = Arc::new(FileSegmentStore::open(dir.path()).unwrap());
        let store = LogStateStore::new(segments, 10);
        assert_eq!(store.load(&domain()).unwrap(), Some(state(&[(42, 3)])));
    }
}
