//! Per-replica change logs.
//!
//! Every (domain, replica) pair has its own [`ReplicaLog`]: the changes that
//! replica originated, in CSN order, stored in the stream
//! `changelog/<domain>/<replica>`.

use crate::config::LogConfig;
use crate::csn::Csn;
use crate::error::{CoreError, CoreResult};
use crate::log::{Log, LogCursor, LogRecord, PositionStrategy};
use crate::types::{DomainId, ReplicaId};
use dirsync_storage::SegmentStore;
use std::sync::Arc;

const STREAM_PREFIX: &str = "changelog/";

/// One change as stored in a replica log.
///
/// The payload is the encoded update message, opaque to the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeRecord {
    /// CSN of the change.
    pub csn: Csn,
    /// Domain the change belongs to.
    pub domain: DomainId,
    /// Encoded update message.
    pub payload: Vec<u8>,
}

impl ChangeRecord {
    /// Creates a record.
    pub fn new(csn: Csn, domain: DomainId, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            csn,
            domain,
            payload: payload.into(),
        }
    }
}

impl LogRecord for ChangeRecord {
    type Key = Csn;

    fn key(&self) -> Csn {
        self.csn
    }

    fn encode_value(&self, buf: &mut Vec<u8>) -> CoreResult<()> {
        let domain = self.domain.as_str().as_bytes();
        let len = u16::try_from(domain.len())
            .map_err(|_| CoreError::invalid_operation("domain name longer than 65535 bytes"))?;
        buf.extend_from_slice(&len.to_be_bytes());
        buf.extend_from_slice(domain);
        buf.extend_from_slice(&self.payload);
        Ok(())
    }

    fn decode_value(csn: Csn, bytes: &[u8]) -> CoreResult<Self> {
        if bytes.len() < 2 {
            return Err(CoreError::log_corruption("change record without domain"));
        }
        let len = usize::from(u16::from_be_bytes([bytes[0], bytes[1]]));
        let domain = bytes
            .get(2..2 + len)
            .ok_or_else(|| CoreError::log_corruption("change record domain overruns record"))?;
        let domain = std::str::from_utf8(domain)
            .map_err(|_| CoreError::log_corruption("change record domain is not UTF-8"))?;
        Ok(Self {
            csn,
            domain: DomainId::new(domain),
            payload: bytes[2 + len..].to_vec(),
        })
    }
}

/// Cursor over one replica log.
pub type ReplicaLogCursor = LogCursor<ChangeRecord>;

/// The changes originated by one replica in one domain.
#[derive(Debug, Clone)]
pub struct ReplicaLog {
    domain: DomainId,
    replica: ReplicaId,
    log: Log<ChangeRecord>,
}

impl ReplicaLog {
    /// Opens (or creates) the log of `replica` in `domain`.
    ///
    /// # Errors
    ///
    /// Returns an error if the stored segments cannot be read back.
    pub fn open(
        store: Arc<dyn SegmentStore>,
        domain: DomainId,
        replica: ReplicaId,
        config: LogConfig,
    ) -> CoreResult<Self> {
        let log = Log::open(store, stream_name(&domain, replica), config)?;
        Ok(Self {
            domain,
            replica,
            log,
        })
    }

    /// Domain of this log.
    #[must_use]
    pub fn domain(&self) -> &DomainId {
        &self.domain
    }

    /// Replica whose changes this log holds.
    #[must_use]
    pub fn replica_id(&self) -> ReplicaId {
        self.replica
    }

    /// Appends a change.
    ///
    /// # Errors
    ///
    /// - [`CoreError::InvalidOperation`] if the record belongs to another
    ///   domain or replica
    /// - [`CoreError::OrderingViolation`] if its CSN is not newer than the
    ///   newest stored CSN
    /// - storage errors
    pub fn append(&self, record: &ChangeRecord) -> CoreResult<()> {
        if record.domain != self.domain || record.csn.replica_id() != self.replica {
            return Err(CoreError::invalid_operation(format!(
                "change {} of {} does not belong to {}",
                record.csn,
                record.domain,
                self.log.name()
            )));
        }
        self.log.append(record)
    }

    /// Opens a cursor relative to `csn` (`None` = oldest).
    #[must_use]
    pub fn cursor_from(&self, csn: Option<Csn>, strategy: PositionStrategy) -> ReplicaLogCursor {
        self.log.cursor_from(csn, strategy)
    }

    /// The oldest stored change.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be read.
    pub fn oldest(&self) -> CoreResult<Option<ChangeRecord>> {
        self.log.oldest()
    }

    /// The newest stored change.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be read.
    pub fn newest(&self) -> CoreResult<Option<ChangeRecord>> {
        self.log.newest()
    }

    /// CSN of the oldest stored change.
    #[must_use]
    pub fn oldest_csn(&self) -> Option<Csn> {
        self.log.oldest_key()
    }

    /// CSN of the newest stored change.
    #[must_use]
    pub fn newest_csn(&self) -> Option<Csn> {
        self.log.newest_key()
    }

    /// Number of stored changes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.log.len()
    }

    /// Returns true if the log holds no change.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.log.is_empty()
    }

    /// Removes whole segments older than `csn`. See [`Log::purge_before`].
    ///
    /// # Errors
    ///
    /// Returns an error if a segment cannot be removed.
    pub fn purge_before(&self, csn: Csn) -> CoreResult<Option<Csn>> {
        self.log.purge_before(csn)
    }

    /// Removes every change.
    ///
    /// # Errors
    ///
    /// Returns an error if a segment cannot be removed.
    pub fn clear(&self) -> CoreResult<()> {
        self.log.clear()
    }

    /// Syncs the head segment.
    ///
    /// # Errors
    ///
    /// Returns an error if the sync fails.
    pub fn sync(&self) -> CoreResult<()> {
        self.log.sync()
    }

    /// Closes the log.
    ///
    /// # Errors
    ///
    /// Returns an error if the final sync fails.
    pub fn close(&self) -> CoreResult<()> {
        self.log.close()
    }
}

/// Stream name of the log of `replica` in `domain`.
#[must_use]
pub fn stream_name(domain: &DomainId, replica: ReplicaId) -> String {
    format!("{STREAM_PREFIX}{domain}/{replica}")
}

/// Splits a replica log stream name back into domain and replica.
///
/// Returns `None` for streams that are not replica logs.
#[must_use]
pub fn parse_stream_name(stream: &str) -> Option<(DomainId, ReplicaId)> {
    let rest = stream.strip_prefix(STREAM_PREFIX)?;
    let (domain, replica) = rest.rsplit_once('/')?;
    if domain.is_empty() {
        return None;
    }
    let replica = replica.parse::<u16>().ok()?;
    Some((DomainId::new(domain), ReplicaId(replica)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use dirsync_storage::MemorySegmentStore;

    fn csn(ts: u64, replica: u16) -> Csn {
        Csn::new(ts, 0, ReplicaId(replica))
    }

    fn open_log() -> ReplicaLog {
        let store: Arc<dyn SegmentStore> = Arc::new(MemorySegmentStore::new());
        ReplicaLog::open(store, DomainId::new("dc=example"), ReplicaId(1), LogConfig::new()).unwrap()
    }

    #[test]
    fn stream_names_round_trip() {
        let domain = DomainId::new("ou=people,dc=example");
        let name = stream_name(&domain, ReplicaId(12));
        assert_eq!(name, "changelog/ou=people,dc=example/12");
        assert_eq!(parse_stream_name(&name), Some((domain, ReplicaId(12))));

        assert_eq!(parse_stream_name("state/dc=example"), None);
        assert_eq!(parse_stream_name("changelog/dc=example/x"), None);
        assert_eq!(parse_stream_name("changelog/7"), None);
    }

    #[test]
    fn record_encoding_keeps_domain_and_payload() {
        let record = ChangeRecord::new(csn(5, 1), DomainId::new("dc=example"), b"\x01\x02".to_vec());
        let mut value = Vec::new();
        record.encode_value(&mut value).unwrap();
        assert_eq!(ChangeRecord::decode_value(record.csn, &value).unwrap(), record);

        assert!(ChangeRecord::decode_value(record.csn, &[0, 40, b'd']).is_err());
    }

    #[test]
    fn append_read_and_bounds() {
        let log = open_log();
        let domain = log.domain().clone();
        for ts in [10, 20, 30] {
            log.append(&ChangeRecord::new(csn(ts, 1), domain.clone(), vec![ts as u8]))
                .unwrap();
        }

        assert_eq!(log.len(), 3);
        assert_eq!(log.oldest_csn(), Some(csn(10, 1)));
        assert_eq!(log.newest().unwrap().unwrap().payload, vec![30]);

        let mut cursor = log.cursor_from(Some(csn(10, 1)), PositionStrategy::StrictlyAfter);
        assert_eq!(cursor.next().unwrap().unwrap().csn, csn(20, 1));
    }

    #[test]
    fn rejects_foreign_records() {
        let log = open_log();
        let other_replica = ChangeRecord::new(csn(1, 2), DomainId::new("dc=example"), Vec::new());
        let other_domain = ChangeRecord::new(csn(1, 1), DomainId::new("dc=other"), Vec::new());
        assert!(matches!(log.append(&other_replica), Err(CoreError::InvalidOperation { .. })));
        assert!(matches!(log.append(&other_domain), Err(CoreError::InvalidOperation { .. })));
        assert!(log.is_empty());
    }

    #[test]
    fn rejects_out_of_order_csn() {
        let log = open_log();
        let domain = log.domain().clone();
        log.append(&ChangeRecord::new(csn(20, 1), domain.clone(), Vec::new())).unwrap();
        let result = log.append(&ChangeRecord::new(csn(10, 1), domain, Vec::new()));
        assert!(matches!(result, Err(CoreError::OrderingViolation { .. })));
    }
}
