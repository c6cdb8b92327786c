//! Medium consistency tracking.
//!
//! The medium consistency point of a domain is the newest CSN up to which
//! every online replica is known to have published its changes. Changes at or
//! below it can be ordered globally without waiting for a slower replica, so
//! the change number indexer stops there and purging never passes it.

use crate::csn::Csn;
use crate::server_state::ServerState;
use crate::types::ReplicaId;
use std::collections::BTreeMap;

/// Liveness watermarks of the replicas of one domain.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MediumConsistency {
    alive: ServerState,
    offline: BTreeMap<ReplicaId, Csn>,
}

impl MediumConsistency {
    /// Creates an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a change or heartbeat from `csn`'s replica.
    ///
    /// A replica that was offline comes back online once it sends anything
    /// newer than its offline notice.
    pub fn record_alive(&mut self, csn: Csn) {
        let replica = csn.replica_id();
        if self.offline.get(&replica).is_some_and(|off| csn > *off) {
            self.offline.remove(&replica);
        }
        self.alive.update(csn);
    }

    /// Records that `csn`'s replica went offline after publishing up to `csn`.
    pub fn record_offline(&mut self, csn: Csn) {
        self.alive.update(csn);
        self.offline.insert(csn.replica_id(), csn);
    }

    /// Forgets a replica entirely.
    pub fn remove(&mut self, replica: ReplicaId) {
        self.alive.remove(replica);
        self.offline.remove(&replica);
    }

    /// Returns true if `replica` is known and not offline.
    #[must_use]
    pub fn is_online(&self, replica: ReplicaId) -> bool {
        self.alive.newest(replica).is_some() && !self.offline.contains_key(&replica)
    }

    /// Newest known CSN of every replica.
    #[must_use]
    pub fn alive(&self) -> &ServerState {
        &self.alive
    }

    /// The medium consistency point, `None` if no replica is known.
    ///
    /// Offline replicas are ignored; if every replica is offline, nothing is
    /// outstanding and the newest known CSN is the point.
    #[must_use]
    pub fn point(&self) -> Option<Csn> {
        let online = self
            .alive
            .iter()
            .filter(|csn| !self.offline.contains_key(&csn.replica_id()))
            .min();
        online.or_else(|| self.alive.max_csn())
    }
}
