//! Buffers that keep changes in CSN order between assignment and release.
//!
//! [`PendingChanges`] holds local changes from CSN assignment until they are
//! published. Local operations finish in any order, but the outbound stream
//! must be CSN ordered, so only the committed prefix is ever released.
//!
//! [`RemotePendingChanges`] holds updates received from other replicas until
//! they are replayed. The server state may only advance over the replayed
//! prefix, and an update touching the same subtree as an earlier unreplayed
//! one waits for it.

use crate::error::{ReplicationError, ReplicationResult};
use dirsync_core::{Csn, CsnGenerator, ReplicaId};
use dirsync_protocol::UpdateMsg;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// Lifecycle of a local change in the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingState {
    /// A CSN was handed out; the operation is still running.
    Assigned,
    /// The operation finished and its update is ready to publish.
    Committed,
}

#[derive(Debug)]
struct PendingChange {
    state: PendingState,
    msg: Option<UpdateMsg>,
    assigned_at: Instant,
}

/// Local changes waiting to be published, in CSN order.
///
/// Owns the replica's CSN generator so that assignment order and buffer order
/// are the same.
#[derive(Debug)]
pub struct PendingChanges {
    generator: CsnGenerator,
    changes: BTreeMap<Csn, PendingChange>,
}

impl PendingChanges {
    /// Creates an empty buffer.
    pub fn new(generator: CsnGenerator) -> Self {
        Self {
            generator,
            changes: BTreeMap::new(),
        }
    }

    /// The CSN generator of the local replica.
    pub fn generator(&self) -> &CsnGenerator {
        &self.generator
    }

    /// Assigns the next CSN to a starting operation.
    pub fn assign(&mut self) -> Csn {
        let csn = self.generator.next_csn();
        self.changes.insert(
            csn,
            PendingChange {
                state: PendingState::Assigned,
                msg: None,
                assigned_at: Instant::now(),
            },
        );
        csn
    }

    /// Marks the operation holding `csn` as finished with `msg` as its update.
    ///
    /// # Errors
    ///
    /// - [`ReplicationError::UnknownChange`] if `csn` is not pending
    /// - [`ReplicationError::InvalidState`] if it was already committed
    pub fn commit(&mut self, csn: Csn, msg: UpdateMsg) -> ReplicationResult<()> {
        let change = self
            .changes
            .get_mut(&csn)
            .ok_or(ReplicationError::UnknownChange { csn })?;
        if change.state == PendingState::Committed {
            return Err(ReplicationError::InvalidState(format!(
                "change {csn} is already committed"
            )));
        }
        change.state = PendingState::Committed;
        change.msg = Some(msg);
        Ok(())
    }

    /// Drops the change holding `csn` without publishing it.
    ///
    /// # Errors
    ///
    /// Returns [`ReplicationError::UnknownChange`] if `csn` is not pending.
    pub fn discard(&mut self, csn: Csn) -> ReplicationResult<()> {
        self.changes
            .remove(&csn)
            .map(|_| ())
            .ok_or(ReplicationError::UnknownChange { csn })
    }

    /// The oldest change, if it is committed and so ready to publish.
    ///
    /// It stays in the buffer until [`PendingChanges::release_head`].
    pub fn committed_head(&self) -> Option<&UpdateMsg> {
        let (_, change) = self.changes.first_key_value()?;
        match change.state {
            PendingState::Assigned => None,
            PendingState::Committed => change.msg.as_ref(),
        }
    }

    /// Removes the committed head once it has been published.
    ///
    /// Returns `None` if the oldest change is still assigned.
    pub fn release_head(&mut self) -> Option<UpdateMsg> {
        let entry = self.changes.first_entry()?;
        if entry.get().state == PendingState::Assigned {
            return None;
        }
        entry.remove().msg
    }

    /// State of the change holding `csn`.
    pub fn state(&self, csn: &Csn) -> Option<PendingState> {
        self.changes.get(csn).map(|change| change.state)
    }

    /// Oldest pending CSN and how long it has been waiting.
    ///
    /// A long wait means one slow operation holds back every later change.
    pub fn oldest_pending_age(&self, now: Instant) -> Option<(Csn, Duration)> {
        self.changes
            .iter()
            .next()
            .map(|(csn, change)| (*csn, now.saturating_duration_since(change.assigned_at)))
    }

    /// Number of pending changes.
    pub fn len(&self) -> usize {
        self.changes.len()
    }

    /// Returns true if no change is pending.
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}

#[derive(Debug)]
struct RemoteChange {
    msg: UpdateMsg,
    in_progress: bool,
    replayed: bool,
}

/// Remote updates waiting for replay, in CSN order.
#[derive(Debug, Default)]
pub struct RemotePendingChanges {
    changes: BTreeMap<Csn, RemoteChange>,
}

impl RemotePendingChanges {
    /// Creates an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a received update. Returns false if it is already buffered.
    pub fn put(&mut self, msg: UpdateMsg) -> bool {
        if self.changes.contains_key(&msg.csn) {
            return false;
        }
        self.changes.insert(
            msg.csn,
            RemoteChange {
                msg,
                in_progress: false,
                replayed: false,
            },
        );
        true
    }

    /// Returns true if `csn` is buffered.
    pub fn contains(&self, csn: &Csn) -> bool {
        self.changes.contains_key(csn)
    }

    /// Takes the oldest update that can be replayed now and marks it in
    /// progress.
    ///
    /// An update is held back while an older unfinished update targets the
    /// same entry, one of its ancestors or one of its descendants.
    pub fn next_ready(&mut self) -> Option<UpdateMsg> {
        let mut ready = None;
        for (csn, change) in &self.changes {
            if change.in_progress || change.replayed {
                continue;
            }
            if !self.has_dependency(csn, &change.msg.target_dn) {
                ready = Some(*csn);
                break;
            }
        }
        let change = self.changes.get_mut(&ready?)?;
        change.in_progress = true;
        Some(change.msg.clone())
    }

    /// Returns true if an update older than `csn` and not yet replayed
    /// touches `dn`'s subtree or one of its ancestors.
    pub fn has_dependency(&self, csn: &Csn, dn: &str) -> bool {
        self.changes
            .range(..csn)
            .filter(|(_, change)| !change.replayed)
            .any(|(_, change)| dn_related(&change.msg.target_dn, dn))
    }

    /// Marks `csn` replayed and returns the CSNs of the replayed prefix it
    /// released, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`ReplicationError::UnknownChange`] if `csn` is not buffered.
    pub fn commit(&mut self, csn: Csn) -> ReplicationResult<Vec<Csn>> {
        let change = self
            .changes
            .get_mut(&csn)
            .ok_or(ReplicationError::UnknownChange { csn })?;
        change.in_progress = false;
        change.replayed = true;

        let mut released = Vec::new();
        while let Some(entry) = self.changes.first_entry() {
            if !entry.get().replayed {
                break;
            }
            released.push(*entry.key());
            entry.remove();
        }
        Ok(released)
    }

    /// Returns true if an update from `replica` is still buffered.
    pub fn has_pending_from(&self, replica: ReplicaId) -> bool {
        self.changes.keys().any(|csn| csn.replica_id() == replica)
    }

    /// Number of buffered updates, replayed ones included.
    pub fn len(&self) -> usize {
        self.changes.len()
    }

    /// Returns true if nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}

/// Returns true if one DN equals the other or is one of its ancestors.
fn dn_related(a: &str, b: &str) -> bool {
    let a = normalized_rdns(a);
    let b = normalized_rdns(b);
    a.ends_with(&b) || b.ends_with(&a)
}

/// Splits a DN into its RDNs, leaf first, lowercased and trimmed.
///
/// Only unescaped commas separate RDNs, so `cn=a\,b` stays one RDN. The
/// empty DN has no RDN.
pub fn normalized_rdns(dn: &str) -> Vec<String> {
    let mut rdns = Vec::new();
    let mut current = String::new();
    let mut escaped = false;
    for c in dn.chars() {
        match c {
            _ if escaped => {
                current.push(c);
                escaped = false;
            }
            '\\' => {
                current.push(c);
                escaped = true;
            }
            ',' => rdns.push(normalize_rdn(&std::mem::take(&mut current))),
            _ => current.push(c),
        }
    }
    if !rdns.is_empty() || !current.trim().is_empty() {
        rdns.push(normalize_rdn(&current));
    }
    rdns
}

fn normalize_rdn(rdn: &str) -> String {
    rdn.trim().to_ascii_lowercase()
}
