//! Per-replica progress vectors.
//!
//! A [`ServerState`] maps each replica of one domain to the newest CSN seen
//! from it. [`MultiDomainServerState`] bundles one state per domain and is the
//! resumable "cookie" handed to external changelog consumers.

use crate::csn::Csn;
use crate::error::{CoreError, CoreResult};
use crate::types::{DomainId, ReplicaId};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Newest CSN seen per replica for one domain.
///
/// Watermarks only move forward: [`ServerState::update`] ignores CSNs that are
/// not newer than the stored one, which makes updates idempotent and the
/// merge of two states commutative.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerState {
    csns: BTreeMap<ReplicaId, Csn>,
}

impl ServerState {
    /// Creates an empty state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `csn` for its replica if it is newer than the stored value.
    ///
    /// Returns whether the state changed.
    pub fn update(&mut self, csn: Csn) -> bool {
        match self.csns.get(&csn.replica_id()) {
            Some(current) if *current >= csn => false,
            _ => {
                self.csns.insert(csn.replica_id(), csn);
                true
            }
        }
    }

    /// Newest CSN recorded for `replica`.
    #[must_use]
    pub fn newest(&self, replica: ReplicaId) -> Option<Csn> {
        self.csns.get(&replica).copied()
    }

    /// Applies [`ServerState::update`] for every entry of `other`.
    ///
    /// Returns whether any watermark moved.
    pub fn merge(&mut self, other: &ServerState) -> bool {
        let mut changed = false;
        for csn in other.csns.values() {
            changed |= self.update(*csn);
        }
        changed
    }

    /// Returns true if `csn` is at or below the watermark of its replica.
    #[must_use]
    pub fn covers(&self, csn: &Csn) -> bool {
        self.newest(csn.replica_id())
            .is_some_and(|newest| newest >= *csn)
    }

    /// The newest CSN across all replicas.
    #[must_use]
    pub fn max_csn(&self) -> Option<Csn> {
        self.csns.values().max().copied()
    }

    /// The oldest watermark across all replicas.
    #[must_use]
    pub fn min_csn(&self) -> Option<Csn> {
        self.csns.values().min().copied()
    }

    /// Replicas with a watermark, in ascending order.
    pub fn replicas(&self) -> impl Iterator<Item = ReplicaId> + '_ {
        self.csns.keys().copied()
    }

    /// Watermarks in replica order.
    pub fn iter(&self) -> impl Iterator<Item = Csn> + '_ {
        self.csns.values().copied()
    }

    /// Number of replicas tracked.
    #[must_use]
    pub fn len(&self) -> usize {
        self.csns.len()
    }

    /// Returns true if no replica is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.csns.is_empty()
    }

    /// Drops the watermark of `replica`.
    pub fn remove(&mut self, replica: ReplicaId) -> Option<Csn> {
        self.csns.remove(&replica)
    }

    /// Text form of every watermark, for persistence.
    #[must_use]
    pub fn to_csn_strings(&self) -> Vec<String> {
        self.iter().map(|csn| csn.to_string()).collect()
    }

    /// Rebuilds a state from persisted CSN strings.
    ///
    /// # Errors
    ///
    /// Returns an error if any string is not a valid CSN.
    pub fn from_csn_strings<S: AsRef<str>>(values: &[S]) -> CoreResult<Self> {
        let mut state = Self::new();
        for value in values {
            state.update(value.as_ref().parse()?);
        }
        Ok(state)
    }
}

impl FromIterator<Csn> for ServerState {
    fn from_iter<I: IntoIterator<Item = Csn>>(iter: I) -> Self {
        let mut state = Self::new();
        for csn in iter {
            state.update(csn);
        }
        state
    }
}

/// Space-separated CSNs in replica order.
impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, csn) in self.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{csn}")?;
        }
        Ok(())
    }
}

impl FromStr for ServerState {
    type Err = CoreError;

    fn from_str(s: &str) -> CoreResult<Self> {
        let values: Vec<&str> = s.split_whitespace().collect();
        Self::from_csn_strings(&values)
    }
}

/// A [`ServerState`] shared between the domain engine and its readers.
///
/// Writers go through the lock; [`SharedServerState::snapshot`] hands out a
/// copy that stays stable while the live state keeps moving.
#[derive(Debug, Default)]
pub struct SharedServerState {
    inner: RwLock<ServerState>,
}

impl SharedServerState {
    /// Wraps an initial state.
    #[must_use]
    pub fn new(state: ServerState) -> Self {
        Self {
            inner: RwLock::new(state),
        }
    }

    /// See [`ServerState::update`].
    pub fn update(&self, csn: Csn) -> bool {
        self.inner.write().update(csn)
    }

    /// See [`ServerState::merge`].
    pub fn merge(&self, other: &ServerState) -> bool {
        self.inner.write().merge(other)
    }

    /// See [`ServerState::newest`].
    #[must_use]
    pub fn newest(&self, replica: ReplicaId) -> Option<Csn> {
        self.inner.read().newest(replica)
    }

    /// See [`ServerState::covers`].
    #[must_use]
    pub fn covers(&self, csn: &Csn) -> bool {
        self.inner.read().covers(csn)
    }

    /// Returns an immutable copy of the current state.
    #[must_use]
    pub fn snapshot(&self) -> ServerState {
        self.inner.read().clone()
    }
}

/// One [`ServerState`] per domain: the resumable changelog cookie.
///
/// Text form: `"<domain>:<csn> <csn>;<domain>:<csn>;"`, domains sorted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MultiDomainServerState {
    domains: BTreeMap<DomainId, ServerState>,
}

impl MultiDomainServerState {
    /// Creates an empty cookie.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `csn` for `domain`. Returns whether anything changed.
    pub fn update(&mut self, domain: &DomainId, csn: Csn) -> bool {
        self.domains.entry(domain.clone()).or_default().update(csn)
    }

    /// Merges a whole state into `domain`.
    pub fn merge_domain(&mut self, domain: &DomainId, state: &ServerState) -> bool {
        self.domains.entry(domain.clone()).or_default().merge(state)
    }

    /// State of `domain`, if any.
    #[must_use]
    pub fn get(&self, domain: &DomainId) -> Option<&ServerState> {
        self.domains.get(domain)
    }

    /// Replaces the state of `domain`.
    pub fn set(&mut self, domain: DomainId, state: ServerState) {
        self.domains.insert(domain, state);
    }

    /// Removes `domain` from the cookie.
    pub fn remove(&mut self, domain: &DomainId) -> Option<ServerState> {
        self.domains.remove(domain)
    }

    /// Domains and their states, sorted by domain.
    pub fn iter(&self) -> impl Iterator<Item = (&DomainId, &ServerState)> {
        self.domains.iter()
    }

    /// Returns true if no domain has a state.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.domains.values().all(ServerState::is_empty)
    }
}

impl fmt::Display for MultiDomainServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (domain, state) in &self.domains {
            write!(f, "{domain}:{state};")?;
        }
        Ok(())
    }
}

impl FromStr for MultiDomainServerState {
    type Err = CoreError;

    fn from_str(s: &str) -> CoreResult<Self> {
        let mut cookie = Self::new();
        for part in s.split(';').map(str::trim).filter(|p| !p.is_empty()) {
            // DNs contain '=' and ',' but never ':'.
            let (domain, csns) = part.split_once(':').ok_or_else(|| {
                CoreError::invalid_state(format!("cookie entry without domain: {part:?}"))
            })?;
            let domain = domain.trim();
            if domain.is_empty() {
                return Err(CoreError::invalid_state(format!(
                    "cookie entry with empty domain: {part:?}"
                )));
            }
            cookie.merge_domain(&DomainId::new(domain), &csns.parse()?);
        }
        Ok(cookie)
    }
}
