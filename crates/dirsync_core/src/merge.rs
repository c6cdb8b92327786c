//! One globally ordered view over many replica logs.
//!
//! A [`MergeCursor`] keeps one [`ReplicaLogCursor`] per (domain, replica)
//! and always returns the smallest CSN among their heads. Its position is a
//! [`MultiDomainServerState`], the cookie a consumer hands back to resume.

use crate::changelog::{ChangeNotifier, ChangelogDb};
use crate::csn::Csn;
use crate::error::{CoreError, CoreResult};
use crate::log::PositionStrategy;
use crate::replica_log::{ChangeRecord, ReplicaLog, ReplicaLogCursor};
use crate::server_state::MultiDomainServerState;
use crate::types::{DomainId, ReplicaId};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

type SourceKey = (DomainId, ReplicaId);

struct Source {
    cursor: ReplicaLogCursor,
    head: Option<ChangeRecord>,
    /// Newest CSN of this source the consumer is known to be past.
    position: Option<Csn>,
}

/// Closes a [`MergeCursor`] from another thread.
///
/// A consumer blocked in [`MergeCursor::wait_next`] wakes up with
/// [`CoreError::Cancelled`].
#[derive(Debug, Clone)]
pub struct MergeCursorHandle {
    closed: Arc<AtomicBool>,
    notifier: Arc<ChangeNotifier>,
}

impl MergeCursorHandle {
    /// Closes the cursor.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notifier.notify();
    }
}

/// K-way merge over the replica logs of a changelog.
pub struct MergeCursor {
    changelog: Arc<ChangelogDb>,
    start: MultiDomainServerState,
    strategy: PositionStrategy,
    domains: Option<BTreeSet<DomainId>>,
    sources: BTreeMap<SourceKey, Source>,
    generation: u64,
    registration: u64,
    position: MultiDomainServerState,
    closed: Arc<AtomicBool>,
    released: bool,
}

impl fmt::Debug for MergeCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MergeCursor")
            .field("sources", &self.sources.len())
            .field("position", &self.position.to_string())
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl MergeCursor {
    /// Opens a cursor over every domain.
    ///
    /// Each (domain, replica) source starts relative to its CSN in `start`
    /// using `strategy`; sources absent from `start` start at their oldest
    /// change.
    #[must_use]
    pub fn open(changelog: &Arc<ChangelogDb>, start: &MultiDomainServerState, strategy: PositionStrategy) -> Self {
        Self::build(changelog, start, strategy, None)
    }

    /// Opens a cursor restricted to `domains`.
    #[must_use]
    pub fn open_for_domains(
        changelog: &Arc<ChangelogDb>,
        start: &MultiDomainServerState,
        strategy: PositionStrategy,
        domains: impl IntoIterator<Item = DomainId>,
    ) -> Self {
        Self::build(changelog, start, strategy, Some(domains.into_iter().collect()))
    }

    fn build(
        changelog: &Arc<ChangelogDb>,
        start: &MultiDomainServerState,
        strategy: PositionStrategy,
        domains: Option<BTreeSet<DomainId>>,
    ) -> Self {
        let mut position = MultiDomainServerState::new();
        for (domain, state) in start.iter() {
            if domains.as_ref().map_or(true, |set| set.contains(domain)) {
                position.set(domain.clone(), state.clone());
            }
        }

        let registration = changelog.registry().register(None);
        let mut cursor = Self {
            changelog: Arc::clone(changelog),
            start: start.clone(),
            strategy,
            domains,
            sources: BTreeMap::new(),
            generation: 0,
            registration,
            position,
            closed: Arc::new(AtomicBool::new(false)),
            released: false,
        };
        cursor.rescan();
        cursor
    }

    /// A handle that can close this cursor from another thread.
    #[must_use]
    pub fn close_handle(&self) -> MergeCursorHandle {
        MergeCursorHandle {
            closed: Arc::clone(&self.closed),
            notifier: Arc::clone(self.changelog.notifier()),
        }
    }

    /// The cookie: for each domain and replica, the newest CSN returned (or
    /// the start position if nothing was returned yet).
    #[must_use]
    pub fn position(&self) -> &MultiDomainServerState {
        &self.position
    }

    /// Number of (domain, replica) sources currently merged.
    #[must_use]
    pub fn source_count(&self) -> usize {
        self.sources.len()
    }

    fn wants(&self, domain: &DomainId) -> bool {
        self.domains.as_ref().map_or(true, |set| set.contains(domain))
    }

    /// Synchronizes the source set with the changelog's replica logs.
    fn rescan(&mut self) {
        // Read the generation first so a log created during the scan
        // triggers another rescan.
        self.generation = self.changelog.generation();
        let logs: Vec<ReplicaLog> = self
            .changelog
            .replica_logs()
            .into_iter()
            .filter(|log| self.wants(log.domain()))
            .collect();

        let live: BTreeSet<SourceKey> = logs
            .iter()
            .map(|log| (log.domain().clone(), log.replica_id()))
            .collect();
        let gone: Vec<SourceKey> = self
            .sources
            .keys()
            .filter(|key| !live.contains(*key))
            .cloned()
            .collect();
        for key in gone {
            if let Some(mut source) = self.sources.remove(&key) {
                source.cursor.close();
            }
            if !live.iter().any(|(domain, _)| *domain == key.0) {
                self.position.remove(&key.0);
            }
            debug!(domain = %key.0, replica = %key.1, "merge cursor dropped source");
        }

        for log in logs {
            let key = (log.domain().clone(), log.replica_id());
            if self.sources.contains_key(&key) {
                continue;
            }
            let start = self
                .start
                .get(&key.0)
                .and_then(|state| state.newest(key.1));
            let cursor = match start {
                Some(csn) => log.cursor_from(Some(csn), self.strategy),
                None => log.cursor_from(None, PositionStrategy::AtOrAfter),
            };
            debug!(domain = %key.0, replica = %key.1, start = ?start, "merge cursor added source");
            self.sources.insert(
                key,
                Source {
                    cursor,
                    head: None,
                    position: start,
                },
            );
        }
    }

    fn fill_heads(&mut self) -> CoreResult<()> {
        if self.changelog.generation() != self.generation {
            self.rescan();
        }
        for source in self.sources.values_mut() {
            if source.head.is_none() {
                source.head = source.cursor.next()?;
            }
        }
        Ok(())
    }

    fn min_source(&self) -> Option<SourceKey> {
        self.sources
            .iter()
            .filter_map(|(key, source)| source.head.as_ref().map(|head| (head.csn, key)))
            .min_by_key(|(csn, _)| *csn)
            .map(|(_, key)| key.clone())
    }

    fn ensure_open(&self) -> CoreResult<()> {
        if self.released || self.closed.load(Ordering::SeqCst) {
            return Err(CoreError::CursorClosed);
        }
        Ok(())
    }

    /// Returns the change with the smallest CSN among all sources, or
    /// `Ok(None)` if every source is exhausted for now.
    ///
    /// # Errors
    ///
    /// - [`CoreError::CursorClosed`] once closed
    /// - the read error of any source, after which the cursor should be
    ///   reopened from its [`position`](MergeCursor::position)
    pub fn next(&mut self) -> CoreResult<Option<ChangeRecord>> {
        self.ensure_open()?;
        self.fill_heads()?;
        Ok(self.take_head())
    }

    /// Consumes the change the last [`MergeCursor::peek`] returned, without
    /// reading further or picking up new sources.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::CursorClosed`] once closed.
    pub fn advance(&mut self) -> CoreResult<Option<ChangeRecord>> {
        self.ensure_open()?;
        Ok(self.take_head())
    }

    fn take_head(&mut self) -> Option<ChangeRecord> {
        let key = self.min_source()?;
        let record = self.sources.get_mut(&key).and_then(|s| s.head.take())?;
        if let Some(source) = self.sources.get_mut(&key) {
            source.position = Some(record.csn);
        }
        self.position.update(&record.domain, record.csn);
        self.publish_floor();
        Some(record)
    }

    /// Returns the change [`MergeCursor::next`] would return, without
    /// consuming it.
    ///
    /// # Errors
    ///
    /// Same as [`MergeCursor::next`].
    pub fn peek(&mut self) -> CoreResult<Option<&ChangeRecord>> {
        self.ensure_open()?;
        self.fill_heads()?;
        let Some(key) = self.min_source() else {
            return Ok(None);
        };
        Ok(self.sources.get(&key).and_then(|s| s.head.as_ref()))
    }

    /// Waits up to `timeout` for the next change.
    ///
    /// Returns `Ok(None)` on timeout or once the changelog is closed.
    ///
    /// # Errors
    ///
    /// - [`CoreError::Cancelled`] if closed through a [`MergeCursorHandle`]
    /// - the errors of [`MergeCursor::next`]
    pub fn wait_next(&mut self, timeout: Duration) -> CoreResult<Option<ChangeRecord>> {
        let deadline = Instant::now() + timeout;
        let notifier = Arc::clone(self.changelog.notifier());
        loop {
            if self.closed.load(Ordering::SeqCst) {
                return Err(CoreError::Cancelled);
            }
            let seen = notifier.version();
            if let Some(record) = self.next()? {
                return Ok(Some(record));
            }
            if self.changelog.is_closed() {
                return Ok(None);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            notifier.wait_for_change(seen, deadline - now);
        }
    }

    fn publish_floor(&self) {
        let mut floor: Option<Csn> = None;
        for source in self.sources.values() {
            match source.position {
                None => {
                    self.changelog.registry().update(self.registration, None);
                    return;
                }
                Some(csn) => floor = Some(floor.map_or(csn, |f| f.min(csn))),
            }
        }
        self.changelog.registry().update(self.registration, floor);
    }

    /// Releases every source and leaves the cursor registry.
    pub fn close(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
        self.release();
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        for source in self.sources.values_mut() {
            source.cursor.close();
        }
        self.sources.clear();
        self.changelog.registry().deregister(self.registration);
    }
}

impl Drop for MergeCursor {
    fn drop(&mut self) {
        self.release();
    }
}
