//! Assured replication: writers waiting for peers to acknowledge a change.
//!
//! A local change is registered before it is published. Acks from peers are
//! folded into the registration until enough have arrived, then the waiting
//! writer is woken through a oneshot channel. Timing out is advisory: the
//! change itself has already succeeded.

use dirsync_core::{Csn, ReplicaId};
use dirsync_protocol::AckMsg;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time;
use tracing::{debug, warn};

/// Result of waiting on an assured change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssuredOutcome {
    /// Enough peers answered; the ack carries their merged error flags.
    Acknowledged(AckMsg),
    /// Not enough peers answered in time.
    TimedOut,
    /// The change was not sent in assured mode.
    NotAssured,
}

impl AssuredOutcome {
    /// Returns true for a clean acknowledgement.
    pub fn is_acknowledged(&self) -> bool {
        matches!(self, AssuredOutcome::Acknowledged(ack) if !ack.has_errors())
    }
}

/// Assured replication counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AssuredStats {
    /// Changes sent in assured mode.
    pub sent: u64,
    /// Changes fully acknowledged in time.
    pub acknowledged: u64,
    /// Changes whose wait timed out.
    pub timed_out: u64,
    /// Acks reporting a peer in the wrong status.
    pub wrong_status: u64,
    /// Acks reporting a replay error.
    pub replay_errors: u64,
}

#[derive(Debug)]
struct Waiting {
    expected: usize,
    acked_by: HashSet<ReplicaId>,
    ack: AckMsg,
    tx: oneshot::Sender<AckMsg>,
}

#[derive(Debug, Default)]
struct Inner {
    waiting: Mutex<HashMap<Csn, Waiting>>,
    sent: AtomicU64,
    acknowledged: AtomicU64,
    timed_out: AtomicU64,
    wrong_status: AtomicU64,
    replay_errors: AtomicU64,
}

impl Inner {
    /// Removes `csn` after a timeout. Returns false if an ack completed it
    /// first.
    fn expire(&self, csn: &Csn) -> bool {
        self.waiting.lock().remove(csn).is_some()
    }
}

/// Tracks assured changes of one domain awaiting acknowledgement.
#[derive(Debug, Clone, Default)]
pub struct AssuredTracker {
    inner: Arc<Inner>,
}

impl AssuredTracker {
    /// Creates an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `csn` before it is published and returns its waiter.
    ///
    /// `expected` is the number of acks needed; zero completes immediately.
    pub fn register(&self, csn: Csn, expected: usize, timeout: Duration) -> AssuredWaiter {
        let (tx, rx) = oneshot::channel();
        self.inner.sent.fetch_add(1, Ordering::Relaxed);
        if expected == 0 {
            self.inner.acknowledged.fetch_add(1, Ordering::Relaxed);
            let _ = tx.send(AckMsg::new(csn, csn.replica_id()));
        } else {
            self.inner.waiting.lock().insert(
                csn,
                Waiting {
                    expected,
                    acked_by: HashSet::new(),
                    ack: AckMsg::new(csn, csn.replica_id()),
                    tx,
                },
            );
        }
        AssuredWaiter {
            csn,
            timeout,
            rx,
            inner: Arc::clone(&self.inner),
        }
    }

    /// Folds in an ack from a peer and wakes the writer once enough
    /// distinct servers answered.
    ///
    /// Acks for unknown CSNs (late, or after a cancel) are ignored, as is a
    /// repeated ack from a server already counted.
    pub fn on_ack(&self, ack: &AckMsg) {
        let mut waiting = self.inner.waiting.lock();
        let Some(entry) = waiting.get_mut(&ack.csn) else {
            self.count_flags(ack);
            debug!(csn = %ack.csn, "ack for a change nobody waits on");
            return;
        };
        if !entry.acked_by.insert(ack.sender) {
            debug!(csn = %ack.csn, sender = %ack.sender, "duplicate ack");
            return;
        }
        self.count_flags(ack);
        entry.ack.merge(ack);
        if entry.acked_by.len() < entry.expected {
            return;
        }
        if let Some(done) = waiting.remove(&ack.csn) {
            self.inner.acknowledged.fetch_add(1, Ordering::Relaxed);
            let _ = done.tx.send(done.ack);
        }
    }

    fn count_flags(&self, ack: &AckMsg) {
        if ack.has_wrong_status {
            self.inner.wrong_status.fetch_add(1, Ordering::Relaxed);
        }
        if ack.has_replay_error {
            self.inner.replay_errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Forgets `csn`; its waiter reports a timeout.
    pub fn cancel(&self, csn: &Csn) {
        self.inner.waiting.lock().remove(csn);
    }

    /// Number of changes still waiting.
    pub fn waiting(&self) -> usize {
        self.inner.waiting.lock().len()
    }

    /// Current counters.
    pub fn stats(&self) -> AssuredStats {
        AssuredStats {
            sent: self.inner.sent.load(Ordering::Relaxed),
            acknowledged: self.inner.acknowledged.load(Ordering::Relaxed),
            timed_out: self.inner.timed_out.load(Ordering::Relaxed),
            wrong_status: self.inner.wrong_status.load(Ordering::Relaxed),
            replay_errors: self.inner.replay_errors.load(Ordering::Relaxed),
        }
    }
}

/// Handle a writer awaits for the acknowledgement of one change.
#[derive(Debug)]
pub struct AssuredWaiter {
    csn: Csn,
    timeout: Duration,
    rx: oneshot::Receiver<AckMsg>,
    inner: Arc<Inner>,
}

impl AssuredWaiter {
    /// CSN of the awaited change.
    pub fn csn(&self) -> Csn {
        self.csn
    }

    /// Waits for the acknowledgement or the timeout.
    ///
    /// An ack that completes while the timeout fires still counts as
    /// acknowledged.
    pub async fn wait(mut self) -> AssuredOutcome {
        match time::timeout(self.timeout, &mut self.rx).await {
            Ok(Ok(ack)) => return AssuredOutcome::Acknowledged(ack),
            Ok(Err(_)) => {}
            Err(_) => {
                if !self.inner.expire(&self.csn) {
                    if let Ok(ack) = self.rx.try_recv() {
                        return AssuredOutcome::Acknowledged(ack);
                    }
                }
            }
        }
        self.inner.timed_out.fetch_add(1, Ordering::Relaxed);
        warn!(csn = %self.csn, timeout_ms = self.timeout.as_millis() as u64, "assured replication timed out");
        AssuredOutcome::TimedOut
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dirsync_core::ReplicaId;

    fn csn(ts: u64) -> Csn {
        Csn::new(ts, 0, ReplicaId(1))
    }

    #[tokio::test]
    async fn ack_wakes_waiter() {
        let tracker = AssuredTracker::new();
        let waiter = tracker.register(csn(1), 1, Duration::from_secs(5));
        assert_eq!(tracker.waiting(), 1);

        tracker.on_ack(&AckMsg::new(csn(1), ReplicaId(2)));
        let outcome = waiter.wait().await;
        assert!(outcome.is_acknowledged());
        assert_eq!(tracker.waiting(), 0);
        assert_eq!(tracker.stats().acknowledged, 1);
    }

    #[tokio::test]
    async fn waits_for_every_expected_ack() {
        let tracker = AssuredTracker::new();
        let waiter = tracker.register(csn(1), 2, Duration::from_secs(5));

        tracker.on_ack(&AckMsg::replay_error(csn(1), ReplicaId(3)));
        assert_eq!(tracker.waiting(), 1);
        tracker.on_ack(&AckMsg::new(csn(1), ReplicaId(2)));

        match waiter.wait().await {
            AssuredOutcome::Acknowledged(ack) => {
                assert!(ack.has_replay_error);
                assert_eq!(ack.failed_servers, vec![ReplicaId(3)]);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(tracker.stats().replay_errors, 1);
    }

    #[tokio::test]
    async fn repeated_ack_from_one_server_counts_once() {
        let tracker = AssuredTracker::new();
        let waiter = tracker.register(csn(1), 2, Duration::from_secs(5));

        tracker.on_ack(&AckMsg::replay_error(csn(1), ReplicaId(2)));
        tracker.on_ack(&AckMsg::replay_error(csn(1), ReplicaId(2)));
        assert_eq!(tracker.waiting(), 1);
        assert_eq!(tracker.stats().replay_errors, 1);

        tracker.on_ack(&AckMsg::new(csn(1), ReplicaId(3)));
        assert_eq!(tracker.waiting(), 0);
        match waiter.wait().await {
            AssuredOutcome::Acknowledged(ack) => {
                assert_eq!(ack.failed_servers, vec![ReplicaId(2)]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn duplicate_acks_alone_time_out() {
        let tracker = AssuredTracker::new();
        let waiter = tracker.register(csn(1), 2, Duration::from_millis(50));
        tracker.on_ack(&AckMsg::new(csn(1), ReplicaId(2)));
        tracker.on_ack(&AckMsg::new(csn(1), ReplicaId(2)));
        assert_eq!(waiter.wait().await, AssuredOutcome::TimedOut);
        assert_eq!(tracker.stats().acknowledged, 0);
    }

    #[tokio::test]
    async fn times_out_without_ack() {
        let tracker = AssuredTracker::new();
        let waiter = tracker.register(csn(1), 1, Duration::from_millis(50));

        assert_eq!(waiter.wait().await, AssuredOutcome::TimedOut);
        assert_eq!(tracker.waiting(), 0);

        let stats = tracker.stats();
        assert_eq!(stats.sent, 1);
        assert_eq!(stats.timed_out, 1);
        assert_eq!(stats.acknowledged, 0);

        // A late ack is ignored.
        tracker.on_ack(&AckMsg::new(csn(1), ReplicaId(2)));
        assert_eq!(tracker.stats().acknowledged, 0);
    }

    #[tokio::test]
    async fn ack_delivered_after_deadline_but_before_wait_counts() {
        let tracker = AssuredTracker::new();
        let waiter = tracker.register(csn(1), 1, Duration::from_millis(10));

        tokio::time::sleep(Duration::from_millis(20)).await;
        tracker.on_ack(&AckMsg::new(csn(1), ReplicaId(2)));

        assert!(waiter.wait().await.is_acknowledged());
        assert_eq!(tracker.stats().timed_out, 0);
    }

    #[tokio::test]
    async fn zero_expected_completes_immediately() {
        let tracker = AssuredTracker::new();
        let waiter = tracker.register(csn(1), 0, Duration::from_millis(10));
        assert!(waiter.wait().await.is_acknowledged());
        assert_eq!(tracker.waiting(), 0);
    }

    #[tokio::test]
    async fn cancelled_change_times_out() {
        let tracker = AssuredTracker::new();
        let waiter = tracker.register(csn(1), 1, Duration::from_secs(5));
        tracker.cancel(&csn(1));
        assert_eq!(waiter.wait().await, AssuredOutcome::TimedOut);
    }
}
