//! The changelog database: every replica log of every domain.
//!
//! [`ChangelogDb`] owns the replica logs stored in one [`SegmentStore`] and
//! the shared machinery long-lived readers need:
//!
//! - a generation counter, bumped whenever a replica log or domain appears or
//!   disappears, so merge cursors know to rescan their sources
//! - a [`ChangeNotifier`] woken on every publish, heartbeat or removal
//! - a [`CursorRegistry`] of active reader positions, which bounds purging
//! - per-domain [`MediumConsistency`] tracking

use crate::config::ChangelogConfig;
use crate::consistency::MediumConsistency;
use crate::csn::Csn;
use crate::error::{CoreError, CoreResult};
use crate::replica_log::{parse_stream_name, ChangeRecord, ReplicaLog};
use crate::server_state::ServerState;
use crate::types::{DomainId, ReplicaId};
use dirsync_storage::SegmentStore;
use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Wakes readers blocked waiting for new changes.
#[derive(Debug, Default)]
pub struct ChangeNotifier {
    version: Mutex<u64>,
    cond: Condvar,
}

impl ChangeNotifier {
    /// Creates a notifier.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current version; it changes on every notification.
    #[must_use]
    pub fn version(&self) -> u64 {
        *self.version.lock()
    }

    /// Wakes every waiter.
    pub fn notify(&self) {
        let mut version = self.version.lock();
        *version = version.wrapping_add(1);
        self.cond.notify_all();
    }

    /// Blocks until the version differs from `seen` or `timeout` elapses.
    ///
    /// Returns the version observed on return.
    pub fn wait_for_change(&self, seen: u64, timeout: Duration) -> u64 {
        let deadline = Instant::now() + timeout;
        let mut version = self.version.lock();
        while *version == seen {
            if self.cond.wait_until(&mut version, deadline).timed_out() {
                break;
            }
        }
        *version
    }
}

/// Lowest position any registered reader may still need.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerFloor {
    /// No reader is registered.
    Unbounded,
    /// Some reader still needs the oldest change of some log.
    Oldest,
    /// Every reader is at or past this CSN.
    Csn(Csn),
}

/// Positions of active readers, keyed by a registration id.
///
/// A position of `None` means the reader still has to read some log from
/// its oldest record.
#[derive(Debug, Default)]
pub struct CursorRegistry {
    next_id: AtomicU64,
    positions: Mutex<HashMap<u64, Option<Csn>>>,
}

impl CursorRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a reader at `position`, returning its registration id.
    pub fn register(&self, position: Option<Csn>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.positions.lock().insert(id, position);
        id
    }

    /// Moves a registered reader.
    pub fn update(&self, id: u64, position: Option<Csn>) {
        if let Some(slot) = self.positions.lock().get_mut(&id) {
            *slot = position;
        }
    }

    /// Removes a reader.
    pub fn deregister(&self, id: u64) {
        self.positions.lock().remove(&id);
    }

    /// Number of registered readers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.positions.lock().len()
    }

    /// Returns true if no reader is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The lowest position over all readers.
    #[must_use]
    pub fn floor(&self) -> ConsumerFloor {
        let positions = self.positions.lock();
        let mut floor = ConsumerFloor::Unbounded;
        for position in positions.values() {
            match position {
                None => return ConsumerFloor::Oldest,
                Some(csn) => {
                    floor = match floor {
                        ConsumerFloor::Csn(current) if current <= *csn => floor,
                        _ => ConsumerFloor::Csn(*csn),
                    };
                }
            }
        }
        floor
    }
}

#[derive(Debug, Default)]
struct DomainLogs {
    replicas: BTreeMap<ReplicaId, ReplicaLog>,
    consistency: MediumConsistency,
}

/// All replica logs of all domains, plus the shared reader machinery.
pub struct ChangelogDb {
    store: Arc<dyn SegmentStore>,
    config: ChangelogConfig,
    domains: RwLock<BTreeMap<DomainId, DomainLogs>>,
    generation: AtomicU64,
    notifier: Arc<ChangeNotifier>,
    registry: Arc<CursorRegistry>,
    closed: AtomicBool,
}

impl fmt::Debug for ChangelogDb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChangelogDb")
            .field("store", &self.store)
            .field("generation", &self.generation())
            .finish_non_exhaustive()
    }
}

impl ChangelogDb {
    /// Opens the changelog, discovering every replica log in `store`.
    ///
    /// # Errors
    ///
    /// Returns an error if a stored log cannot be read back.
    pub fn open(store: Arc<dyn SegmentStore>, config: ChangelogConfig) -> CoreResult<Self> {
        let mut domains: BTreeMap<DomainId, DomainLogs> = BTreeMap::new();
        for stream in store.list_streams()? {
            let Some((domain, replica)) = parse_stream_name(&stream) else {
                continue;
            };
            let log = ReplicaLog::open(Arc::clone(&store), domain.clone(), replica, config.log.clone())?;
            let logs = domains.entry(domain).or_default();
            if let Some(newest) = log.newest_csn() {
                logs.consistency.record_alive(newest);
            }
            logs.replicas.insert(replica, log);
        }

        let count: usize = domains.values().map(|d| d.replicas.len()).sum();
        info!(domains = domains.len(), replica_logs = count, "opened changelog");

        Ok(Self {
            store,
            config,
            domains: RwLock::new(domains),
            generation: AtomicU64::new(0),
            notifier: Arc::new(ChangeNotifier::new()),
            registry: Arc::new(CursorRegistry::new()),
            closed: AtomicBool::new(false),
        })
    }

    /// The configuration the changelog was opened with.
    #[must_use]
    pub fn config(&self) -> &ChangelogConfig {
        &self.config
    }

    /// Appends a change to its replica log, creating the log if needed.
    ///
    /// # Errors
    ///
    /// - [`CoreError::LogClosed`] after [`ChangelogDb::close`]
    /// - [`CoreError::OrderingViolation`] if the CSN is not newer than the
    ///   newest change of its replica
    /// - storage errors
    pub fn publish(&self, record: &ChangeRecord) -> CoreResult<()> {
        if self.is_closed() {
            return Err(CoreError::LogClosed);
        }
        let log = self.log_for(&record.domain, record.csn.replica_id())?;
        log.append(record)?;

        if let Some(logs) = self.domains.write().get_mut(&record.domain) {
            logs.consistency.record_alive(record.csn);
        }
        self.notifier.notify();
        Ok(())
    }

    fn log_for(&self, domain: &DomainId, replica: ReplicaId) -> CoreResult<ReplicaLog> {
        if let Some(log) = self
            .domains
            .read()
            .get(domain)
            .and_then(|logs| logs.replicas.get(&replica))
        {
            return Ok(log.clone());
        }

        let mut domains = self.domains.write();
        let logs = domains.entry(domain.clone()).or_default();
        if let Some(log) = logs.replicas.get(&replica) {
            return Ok(log.clone());
        }
        let log = ReplicaLog::open(
            Arc::clone(&self.store),
            domain.clone(),
            replica,
            self.config.log.clone(),
        )?;
        logs.replicas.insert(replica, log.clone());
        self.generation.fetch_add(1, Ordering::SeqCst);
        debug!(domain = %domain, replica = %replica, "created replica log");
        Ok(log)
    }

    /// The log of `replica` in `domain`, if it exists.
    #[must_use]
    pub fn replica_log(&self, domain: &DomainId, replica: ReplicaId) -> Option<ReplicaLog> {
        self.domains
            .read()
            .get(domain)
            .and_then(|logs| logs.replicas.get(&replica))
            .cloned()
    }

    /// Every replica log, ordered by domain then replica.
    #[must_use]
    pub fn replica_logs(&self) -> Vec<ReplicaLog> {
        self.domains
            .read()
            .values()
            .flat_map(|logs| logs.replicas.values().cloned())
            .collect()
    }

    /// Known domains.
    #[must_use]
    pub fn domains(&self) -> Vec<DomainId> {
        self.domains.read().keys().cloned().collect()
    }

    /// Replicas with a log in `domain`.
    #[must_use]
    pub fn replicas(&self, domain: &DomainId) -> Vec<ReplicaId> {
        self.domains
            .read()
            .get(domain)
            .map(|logs| logs.replicas.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Counter bumped whenever the set of replica logs changes.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// The notifier woken on every change.
    #[must_use]
    pub fn notifier(&self) -> &Arc<ChangeNotifier> {
        &self.notifier
    }

    /// The registry of active reader positions.
    #[must_use]
    pub fn registry(&self) -> &Arc<CursorRegistry> {
        &self.registry
    }

    /// Newest stored CSN of every replica of `domain`.
    #[must_use]
    pub fn domain_state(&self, domain: &DomainId) -> ServerState {
        self.collect_state(domain, ReplicaLog::newest_csn)
    }

    /// Oldest stored CSN of every replica of `domain`.
    #[must_use]
    pub fn oldest_state(&self, domain: &DomainId) -> ServerState {
        self.collect_state(domain, ReplicaLog::oldest_csn)
    }

    fn collect_state(&self, domain: &DomainId, pick: fn(&ReplicaLog) -> Option<Csn>) -> ServerState {
        self.domains
            .read()
            .get(domain)
            .map(|logs| logs.replicas.values().filter_map(pick).collect())
            .unwrap_or_default()
    }

    /// Records a heartbeat: `csn`'s replica has published everything up to
    /// `csn`.
    pub fn heartbeat(&self, domain: &DomainId, csn: Csn) {
        self.domains
            .write()
            .entry(domain.clone())
            .or_default()
            .consistency
            .record_alive(csn);
        self.notifier.notify();
    }

    /// Records that `csn`'s replica went offline after publishing up to `csn`.
    pub fn replica_offline(&self, domain: &DomainId, csn: Csn) {
        self.domains
            .write()
            .entry(domain.clone())
            .or_default()
            .consistency
            .record_offline(csn);
        info!(domain = %domain, replica = %csn.replica_id(), csn = %csn, "replica offline");
        self.notifier.notify();
    }

    /// Medium consistency point of `domain`.
    #[must_use]
    pub fn medium_consistency(&self, domain: &DomainId) -> Option<Csn> {
        self.domains
            .read()
            .get(domain)
            .and_then(|logs| logs.consistency.point())
    }

    /// Lowest medium consistency point over the domains that have one.
    #[must_use]
    pub fn global_medium_consistency(&self) -> Option<Csn> {
        self.domains
            .read()
            .values()
            .filter_map(|logs| logs.consistency.point())
            .min()
    }

    /// Purges old changes of every domain. See [`ChangelogDb::purge_domain`].
    ///
    /// # Errors
    ///
    /// Returns the first purge error.
    pub fn purge(&self, now_millis: u64) -> CoreResult<usize> {
        let mut removed = 0;
        for domain in self.domains() {
            removed += self.purge_domain(&domain, now_millis)?;
        }
        Ok(removed)
    }

    /// Purges the changes of `domain` nobody can still need.
    ///
    /// The purge point is the lowest of the retention point
    /// (`now - purge_delay`), the registered readers' floor and the domain's
    /// medium consistency point. Returns the number of changes removed.
    ///
    /// # Errors
    ///
    /// Returns an error if a segment cannot be removed.
    pub fn purge_domain(&self, domain: &DomainId, now_millis: u64) -> CoreResult<usize> {
        let Some(point) = self.purge_point(domain, now_millis) else {
            return Ok(0);
        };

        let logs: Vec<ReplicaLog> = self
            .domains
            .read()
            .get(domain)
            .map(|logs| logs.replicas.values().cloned().collect())
            .unwrap_or_default();

        let mut removed = 0;
        for log in logs {
            let before = log.len();
            log.purge_before(point)?;
            removed += before - log.len();
        }
        if removed > 0 {
            info!(domain = %domain, before = %point, removed, "purged changelog");
        }
        Ok(removed)
    }

    fn purge_point(&self, domain: &DomainId, now_millis: u64) -> Option<Csn> {
        let delay = u64::try_from(self.config.purge_delay.as_millis()).unwrap_or(u64::MAX);
        let retention = Csn::at_time(now_millis.saturating_sub(delay));
        let consistency = self.medium_consistency(domain)?;
        let point = retention.min(consistency);
        match self.registry.floor() {
            ConsumerFloor::Unbounded => Some(point),
            ConsumerFloor::Oldest => None,
            ConsumerFloor::Csn(floor) => Some(point.min(floor)),
        }
    }

    /// Removes a domain and deletes all of its logs.
    ///
    /// # Errors
    ///
    /// Returns an error if a log cannot be deleted.
    pub fn remove_domain(&self, domain: &DomainId) -> CoreResult<()> {
        let removed = self.domains.write().remove(domain);
        if let Some(logs) = removed {
            for log in logs.replicas.values() {
                log.clear()?;
                log.close()?;
            }
            self.generation.fetch_add(1, Ordering::SeqCst);
            info!(domain = %domain, "removed domain from changelog");
        }
        self.notifier.notify();
        Ok(())
    }

    /// Syncs every log.
    ///
    /// # Errors
    ///
    /// Returns the first sync error.
    pub fn sync(&self) -> CoreResult<()> {
        for log in self.replica_logs() {
            log.sync()?;
        }
        Ok(())
    }

    /// Closes every log and wakes all waiting readers.
    ///
    /// # Errors
    ///
    /// Returns the first close error; every log is closed regardless.
    pub fn close(&self) -> CoreResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut result = Ok(());
        for log in self.replica_logs() {
            if let Err(e) = log.close() {
                result = result.and(Err(e));
            }
        }
        self.notifier.notify();
        info!("closed changelog");
        result
    }

    /// Returns true once [`ChangelogDb::close`] has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LogConfig;
    use crate::log::PositionStrategy;
    use dirsync_storage::MemorySegmentStore;

    fn csn(ts: u64, replica: u16) -> Csn {
        Csn::new(ts, 0, ReplicaId(replica))
    }

    fn domain() -> DomainId {
        DomainId::new("dc=example")
    }

    fn change(ts: u64, replica: u16) -> ChangeRecord {
        ChangeRecord::new(csn(ts, replica), domain(), vec![replica as u8])
    }

    fn open(store: &Arc<MemorySegmentStore>, config: ChangelogConfig) -> ChangelogDb {
        ChangelogDb::open(Arc::clone(store) as Arc<dyn SegmentStore>, config).unwrap()
    }

    #[test]
    fn publish_creates_logs_and_bumps_generation() {
        let store = Arc::new(MemorySegmentStore::new());
        let db = open(&store, ChangelogConfig::default());
        assert_eq!(db.generation(), 0);

        db.publish(&change(10, 1)).unwrap();
        db.publish(&change(11, 1)).unwrap();
        assert_eq!(db.generation(), 1);
        db.publish(&change(12, 2)).unwrap();
        assert_eq!(db.generation(), 2);

        assert_eq!(db.domains(), vec![domain()]);
        assert_eq!(db.replicas(&domain()), vec![ReplicaId(1), ReplicaId(2)]);
        let state = db.domain_state(&domain());
        assert_eq!(state.newest(ReplicaId(1)), Some(csn(11, 1)));
        assert_eq!(db.oldest_state(&domain()).newest(ReplicaId(1)), Some(csn(10, 1)));
    }

    #[test]
    fn publish_rejects_older_csn_for_same_replica() {
        let store = Arc::new(MemorySegmentStore::new());
        let db = open(&store, ChangelogConfig::default());
        db.publish(&change(10, 1)).unwrap();
        assert!(matches!(
            db.publish(&change(10, 1)),
            Err(CoreError::OrderingViolation { .. })
        ));
        // Other replicas are independent.
        db.publish(&change(5, 2)).unwrap();
    }

    #[test]
    fn reopen_discovers_existing_logs() {
        let store = Arc::new(MemorySegmentStore::new());
        {
            let db = open(&store, ChangelogConfig::default());
            db.publish(&change(10, 1)).unwrap();
            db.publish(&change(20, 3)).unwrap();
            db.close().unwrap();
        }
        let db = open(&store, ChangelogConfig::default());
        assert_eq!(db.replicas(&domain()), vec![ReplicaId(1), ReplicaId(3)]);
        assert_eq!(db.medium_consistency(&domain()), Some(csn(10, 1)));
        let log = db.replica_log(&domain(), ReplicaId(3)).unwrap();
        let mut cursor = log.cursor_from(None, PositionStrategy::AtOrAfter);
        assert_eq!(cursor.next().unwrap().unwrap().csn, csn(20, 3));
    }

    #[test]
    fn heartbeats_move_medium_consistency() {
        let store = Arc::new(MemorySegmentStore::new());
        let db = open(&store, ChangelogConfig::default());
        db.publish(&change(10, 1)).unwrap();
        db.publish(&change(50, 2)).unwrap();
        assert_eq!(db.medium_consistency(&domain()), Some(csn(10, 1)));

        db.heartbeat(&domain(), csn(60, 1));
        assert_eq!(db.medium_consistency(&domain()), Some(csn(50, 2)));

        db.replica_offline(&domain(), csn(50, 2));
        assert_eq!(db.medium_consistency(&domain()), Some(csn(60, 1)));
        assert_eq!(db.global_medium_consistency(), Some(csn(60, 1)));
    }

    #[test]
    fn notifier_wakes_on_publish() {
        let store = Arc::new(MemorySegmentStore::new());
        let db = Arc::new(open(&store, ChangelogConfig::default()));
        let seen = db.notifier().version();

        let waiter = {
            let db = Arc::clone(&db);
            std::thread::spawn(move || db.notifier().wait_for_change(seen, Duration::from_secs(5)))
        };
        db.publish(&change(1, 1)).unwrap();
        assert_ne!(waiter.join().unwrap(), seen);

        // Nothing happens: the wait times out with the same version.
        let now = db.notifier().version();
        assert_eq!(db.notifier().wait_for_change(now, Duration::from_millis(10)), now);
    }

    #[test]
    fn registry_floor() {
        let registry = CursorRegistry::new();
        assert_eq!(registry.floor(), ConsumerFloor::Unbounded);

        let a = registry.register(Some(csn(30, 1)));
        let b = registry.register(Some(csn(20, 1)));
        assert_eq!(registry.floor(), ConsumerFloor::Csn(csn(20, 1)));

        registry.update(b, None);
        assert_eq!(registry.floor(), ConsumerFloor::Oldest);

        registry.deregister(b);
        assert_eq!(registry.floor(), ConsumerFloor::Csn(csn(30, 1)));
        registry.deregister(a);
        assert!(registry.is_empty());
    }

    fn purge_config() -> ChangelogConfig {
        ChangelogConfig::new()
            .log(LogConfig::new().max_segment_size(128))
            .purge_delay(Duration::from_millis(100))
    }

    fn fill(db: &ChangelogDb) {
        for ts in 1..=20 {
            db.publish(&change(ts * 10, 1)).unwrap();
        }
    }

    #[test]
    fn purge_respects_retention_delay() {
        let store = Arc::new(MemorySegmentStore::new());
        let db = open(&store, purge_config());
        fill(&db);

        // Everything is younger than the delay.
        assert_eq!(db.purge(100).unwrap(), 0);

        let removed = db.purge(300).unwrap();
        assert!(removed > 0);
        let log = db.replica_log(&domain(), ReplicaId(1)).unwrap();
        // Nothing at or after the purge point (200) was removed.
        assert!(log.oldest_csn().unwrap() <= csn(200, 1));
        assert_eq!(log.newest_csn(), Some(csn(200, 1)));
    }

    #[test]
    fn purge_respects_medium_consistency_and_readers() {
        let store = Arc::new(MemorySegmentStore::new());
        let db = open(&store, purge_config());
        fill(&db);

        // A silent replica 2 holds the consistency point back.
        db.heartbeat(&domain(), csn(5, 2));
        assert_eq!(db.purge(10_000).unwrap(), 0);

        db.heartbeat(&domain(), csn(1_000, 2));
        let reader = db.registry().register(None);
        assert_eq!(db.purge(10_000).unwrap(), 0);

        db.registry().update(reader, Some(csn(60, 1)));
        db.purge(10_000).unwrap();
        let log = db.replica_log(&domain(), ReplicaId(1)).unwrap();
        assert!(log.oldest_csn().unwrap() <= csn(60, 1));
        assert!(log.oldest_csn().unwrap() > csn(10, 1));
    }

    #[test]
    fn remove_domain_deletes_logs() {
        let store = Arc::new(MemorySegmentStore::new());
        let db = open(&store, ChangelogConfig::default());
        db.publish(&change(1, 1)).unwrap();
        let generation = db.generation();

        db.remove_domain(&domain()).unwrap();
        assert!(db.domains().is_empty());
        assert!(db.generation() > generation);
        assert!(store.list_streams().unwrap().is_empty());
    }

    #[test]
    fn closed_changelog_rejects_publish() {
        let store = Arc::new(MemorySegmentStore::new());
        let db = open(&store, ChangelogConfig::default());
        db.close().unwrap();
        assert!(db.is_closed());
        assert!(matches!(db.publish(&change(1, 1)), Err(CoreError::LogClosed)));
    }
}
