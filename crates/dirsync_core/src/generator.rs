//! Monotonic CSN generation.
//!
//! A [`CsnGenerator`] hands out strictly increasing CSNs for one replica, even
//! when the wall clock steps backwards, when thousands of CSNs are requested
//! within one millisecond, or across a restart (when seeded from the replica's
//! log tail or persisted state).

use crate::csn::{Csn, MAX_CSN_TIMESTAMP};
use crate::server_state::ServerState;
use crate::types::ReplicaId;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Source of wall-clock milliseconds.
pub trait Clock: Send + Sync + fmt::Debug {
    /// Current time in milliseconds since the Unix epoch.
    fn now_millis(&self) -> u64;
}

/// The system wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }
}

/// A clock moved by hand, for tests that need rollback or frozen time.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    /// Creates a clock reading `now` milliseconds.
    #[must_use]
    pub fn new(now: u64) -> Self {
        Self {
            now: AtomicU64::new(now),
        }
    }

    /// Sets the current time, possibly backwards.
    pub fn set(&self, now: u64) {
        self.now.store(now, Ordering::SeqCst);
    }

    /// Moves the clock forward by `millis`.
    pub fn advance(&self, millis: u64) {
        self.now.fetch_add(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Last {
    timestamp: u64,
    seq: u32,
}

/// Per-replica CSN factory.
///
/// Thread-safe: concurrent callers serialize on an internal mutex, so every
/// caller receives a distinct CSN and CSNs are handed out in increasing order.
#[derive(Debug)]
pub struct CsnGenerator {
    replica_id: ReplicaId,
    clock: Arc<dyn Clock>,
    last: Mutex<Last>,
}

impl CsnGenerator {
    /// Creates a generator with no history.
    #[must_use]
    pub fn new(replica_id: ReplicaId, clock: Arc<dyn Clock>) -> Self {
        Self {
            replica_id,
            clock,
            last: Mutex::new(Last::default()),
        }
    }

    /// Creates a generator whose first CSN sorts after `seed`.
    ///
    /// `seed` is the newest CSN found in local storage.
    #[must_use]
    pub fn with_seed(replica_id: ReplicaId, clock: Arc<dyn Clock>, seed: Option<Csn>) -> Self {
        let generator = Self::new(replica_id, clock);
        if let Some(seed) = seed {
            generator.adjust(&seed);
        }
        generator
    }

    /// Creates a generator that sorts after every CSN in `state`.
    #[must_use]
    pub fn from_state(replica_id: ReplicaId, clock: Arc<dyn Clock>, state: &ServerState) -> Self {
        Self::with_seed(replica_id, clock, state.max_csn())
    }

    /// Replica this generator stamps CSNs with.
    #[must_use]
    pub fn replica_id(&self) -> ReplicaId {
        self.replica_id
    }

    /// Returns a CSN strictly greater than every CSN this generator returned
    /// or was adjusted to.
    ///
    /// The clock is read no further than [`MAX_CSN_TIMESTAMP`]; once that
    /// millisecond runs out of sequence numbers the last CSN repeats.
    pub fn next_csn(&self) -> Csn {
        let now = self.clock.now_millis().min(MAX_CSN_TIMESTAMP);
        let mut last = self.last.lock();

        if now > last.timestamp {
            last.timestamp = now;
            last.seq = 0;
        } else if last.seq == u32::MAX && last.timestamp < MAX_CSN_TIMESTAMP {
            last.timestamp += 1;
            last.seq = 0;
        } else {
            last.seq = last.seq.saturating_add(1);
        }

        Csn::new(last.timestamp, last.seq, self.replica_id)
    }

    /// Moves the generator past a CSN seen elsewhere.
    ///
    /// After this returns, [`CsnGenerator::next_csn`] yields a CSN newer than
    /// `seen`, whatever replica generated it.
    pub fn adjust(&self, seen: &Csn) {
        let mut last = self.last.lock();
        if seen.timestamp() > last.timestamp
            || (seen.timestamp() == last.timestamp && seen.seq() > last.seq)
        {
            last.timestamp = seen.timestamp();
            last.seq = seen.seq();
        }
    }
}
