//! Configuration for replication domains.

use dirsync_core::{DomainId, ReplicaId};
use dirsync_protocol::AssuredMode;
use std::time::Duration;

/// Configuration of one replication domain on one server.
#[derive(Debug, Clone)]
pub struct DomainConfig {
    /// Replicated subtree.
    pub domain: DomainId,
    /// Identifier of this server in the domain.
    pub replica_id: ReplicaId,
    /// Assured replication for local changes; `None` for plain replication.
    pub assured: Option<AssuredConfig>,
    /// Number of tasks replaying remote updates.
    pub worker_count: usize,
    /// Capacity of the inbound message queue.
    pub queue_depth: usize,
    /// How often an idle domain announces itself.
    pub heartbeat_interval: Duration,
    /// How often the server state is persisted.
    pub save_interval: Duration,
    /// How often the changelog of the domain is purged.
    pub purge_interval: Duration,
    /// Age above which a pending local change blocking the outbound stream is
    /// reported.
    pub head_of_line_threshold: Duration,
}

impl DomainConfig {
    /// Creates a configuration with default tuning.
    pub fn new(domain: DomainId, replica_id: ReplicaId) -> Self {
        Self {
            domain,
            replica_id,
            assured: None,
            worker_count: 4,
            queue_depth: 1024,
            heartbeat_interval: Duration::from_secs(1),
            save_interval: Duration::from_secs(1),
            purge_interval: Duration::from_secs(60),
            head_of_line_threshold: Duration::from_secs(5),
        }
    }

    /// Enables assured replication for local changes.
    #[must_use]
    pub fn with_assured(mut self, assured: AssuredConfig) -> Self {
        self.assured = Some(assured);
        self
    }

    /// Sets the number of replay workers (at least one).
    #[must_use]
    pub fn with_worker_count(mut self, count: usize) -> Self {
        self.worker_count = count.max(1);
        self
    }

    /// Sets the inbound queue capacity (at least one).
    #[must_use]
    pub fn with_queue_depth(mut self, depth: usize) -> Self {
        self.queue_depth = depth.max(1);
        self
    }

    /// Sets the heartbeat interval.
    #[must_use]
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Sets the state save interval.
    #[must_use]
    pub fn with_save_interval(mut self, interval: Duration) -> Self {
        self.save_interval = interval;
        self
    }

    /// Sets the purge interval.
    #[must_use]
    pub fn with_purge_interval(mut self, interval: Duration) -> Self {
        self.purge_interval = interval;
        self
    }

    /// Sets the head-of-line warning threshold.
    #[must_use]
    pub fn with_head_of_line_threshold(mut self, threshold: Duration) -> Self {
        self.head_of_line_threshold = threshold;
        self
    }
}

/// Assured replication settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AssuredConfig {
    /// Mode requested on every local update.
    pub mode: AssuredMode,
    /// How long a writer waits for acknowledgements.
    pub timeout: Duration,
}

impl AssuredConfig {
    /// Safe-data mode: `level` servers, the origin included, must hold each
    /// change.
    pub fn safe_data(level: u8) -> Self {
        Self {
            mode: AssuredMode::SafeData { level },
            timeout: Duration::from_secs(2),
        }
    }

    /// Safe-read mode: every replica must have replayed each change.
    pub fn safe_read() -> Self {
        Self {
            mode: AssuredMode::SafeRead,
            timeout: Duration::from_secs(2),
        }
    }

    /// Sets the acknowledgement timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}
