//! The replication domain: one replicated subtree on one server.
//!
//! A [`ReplicationDomain`] owns the domain's pending buffers and server state.
//! Local writers go through [`ReplicationDomain::assign`],
//! [`ReplicationDomain::commit`] and [`ReplicationDomain::discard`]; the
//! committed prefix is appended to the local replica log, sent to peers and
//! folded into the server state, always in CSN order.
//!
//! Once started, the domain runs on tokio:
//!
//! - a dispatcher task reading the bounded inbound queue
//! - a fixed pool of workers replaying remote updates
//! - a maintenance task persisting state, purging the changelog, sending
//!   heartbeats and reporting a blocked outbound stream
//!
//! All of them stop when [`DomainHandle::shutdown`] is called.

use crate::assured::{AssuredOutcome, AssuredStats, AssuredTracker, AssuredWaiter};
use crate::config::DomainConfig;
use crate::error::{ReplicationError, ReplicationResult};
use crate::pending::{PendingChanges, RemotePendingChanges};
use crate::transport::ChangePublisher;
use dirsync_core::{
    ChangeRecord, ChangelogDb, Clock, Csn, CsnGenerator, DomainId, ServerState,
    SharedServerState, StateStore,
};
use dirsync_protocol::{
    AckMsg, AssuredMode, HeartbeatMsg, OfflineMsg, Opcode, ReplicationMsg, UpdateMsg,
};
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{self, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Applies remote updates to the local directory.
pub trait ReplayHandler: Send + Sync {
    /// Replays one update. Called at most once per CSN.
    fn replay(&self, msg: &UpdateMsg) -> ReplayOutcome;
}

/// Result of replaying a remote update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplayOutcome {
    /// The entry changed.
    Applied,
    /// Conflict resolution left nothing to apply.
    NoOp,
    /// The update could not be applied.
    Failed(String),
}

/// A replay handler that records the updates it sees, for tests.
#[derive(Debug, Default)]
pub struct MemoryReplayHandler {
    replayed: Mutex<Vec<UpdateMsg>>,
    fail_dn: RwLock<Option<String>>,
}

impl MemoryReplayHandler {
    /// Creates an empty handler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes updates targeting `dn` fail.
    pub fn fail_on(&self, dn: impl Into<String>) {
        *self.fail_dn.write() = Some(dn.into());
    }

    /// Updates replayed so far, in replay order.
    pub fn replayed(&self) -> Vec<UpdateMsg> {
        self.replayed.lock().clone()
    }
}

impl ReplayHandler for MemoryReplayHandler {
    fn replay(&self, msg: &UpdateMsg) -> ReplayOutcome {
        if self.fail_dn.read().as_deref() == Some(msg.target_dn.as_str()) {
            return ReplayOutcome::Failed(format!("no such entry {}", msg.target_dn));
        }
        self.replayed.lock().push(msg.clone());
        ReplayOutcome::Applied
    }
}

/// Counters of a replication domain.
#[derive(Debug, Clone, Default)]
pub struct DomainStats {
    /// Local changes published.
    pub local_changes: u64,
    /// Remote updates accepted for replay.
    pub remote_received: u64,
    /// Remote updates replayed, failed ones included.
    pub remote_replayed: u64,
    /// Remote updates dropped because they were already known.
    pub duplicates_skipped: u64,
    /// Remote updates that failed to replay.
    pub replay_errors: u64,
    /// Messages the outbound channel refused.
    pub publish_failures: u64,
    /// Heartbeats sent.
    pub heartbeats_sent: u64,
    /// Times the server state was persisted.
    pub state_saves: u64,
}

/// Returned by [`ReplicationDomain::commit`].
#[derive(Debug)]
pub struct CommitReceipt {
    csn: Csn,
    waiter: Option<AssuredWaiter>,
}

impl CommitReceipt {
    /// CSN of the committed change.
    pub fn csn(&self) -> Csn {
        self.csn
    }

    /// Waits for assured acknowledgement, if the change was sent assured.
    pub async fn wait(self) -> AssuredOutcome {
        match self.waiter {
            Some(waiter) => waiter.wait().await,
            None => AssuredOutcome::NotAssured,
        }
    }
}

/// One replicated domain on this server.
pub struct ReplicationDomain {
    config: DomainConfig,
    changelog: Arc<ChangelogDb>,
    publisher: Arc<dyn ChangePublisher>,
    replay: Arc<dyn ReplayHandler>,
    state_store: Arc<dyn StateStore>,
    clock: Arc<dyn Clock>,
    pending: Mutex<PendingChanges>,
    remote: Mutex<RemotePendingChanges>,
    state: SharedServerState,
    saved: Mutex<Option<ServerState>>,
    assured: AssuredTracker,
    halted: RwLock<Option<String>>,
    stopped: AtomicBool,
    stats: RwLock<DomainStats>,
    work: Notify,
}

impl fmt::Debug for ReplicationDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplicationDomain")
            .field("domain", &self.config.domain)
            .field("replica_id", &self.config.replica_id)
            .field("halted", &*self.halted.read())
            .finish_non_exhaustive()
    }
}

impl ReplicationDomain {
    /// Opens a domain, restoring its server state.
    ///
    /// The state is the persisted one, moved forward to the newest change of
    /// the local replica log. A missing state means every replica starts from
    /// its oldest change. The CSN generator is seeded past every CSN the state
    /// knows.
    ///
    /// # Errors
    ///
    /// Returns an error if the state store cannot be read.
    pub fn open(
        config: DomainConfig,
        changelog: Arc<ChangelogDb>,
        publisher: Arc<dyn ChangePublisher>,
        replay: Arc<dyn ReplayHandler>,
        state_store: Arc<dyn StateStore>,
        clock: Arc<dyn Clock>,
    ) -> ReplicationResult<Arc<Self>> {
        let domain = &config.domain;
        let persisted = state_store.load(domain)?;
        if persisted.is_none() {
            info!(domain = %domain, "no persisted server state, starting from oldest");
        }
        let mut state = persisted.clone().unwrap_or_default();
        if let Some(newest) = changelog
            .replica_log(domain, config.replica_id)
            .and_then(|log| log.newest_csn())
        {
            state.update(newest);
        }

        let generator = CsnGenerator::from_state(config.replica_id, Arc::clone(&clock), &state);
        debug!(domain = %domain, state = ?state, "opened replication domain");

        Ok(Arc::new(Self {
            changelog,
            publisher,
            replay,
            state_store,
            clock,
            pending: Mutex::new(PendingChanges::new(generator)),
            remote: Mutex::new(RemotePendingChanges::new()),
            state: SharedServerState::new(state),
            saved: Mutex::new(persisted),
            assured: AssuredTracker::new(),
            halted: RwLock::new(None),
            stopped: AtomicBool::new(false),
            stats: RwLock::new(DomainStats::default()),
            work: Notify::new(),
            config,
        }))
    }

    /// The domain's configuration.
    pub fn config(&self) -> &DomainConfig {
        &self.config
    }

    /// The domain name.
    pub fn domain(&self) -> &DomainId {
        &self.config.domain
    }

    /// The changelog this domain writes to.
    pub fn changelog(&self) -> &Arc<ChangelogDb> {
        &self.changelog
    }

    /// Snapshot of the server state.
    pub fn server_state(&self) -> ServerState {
        self.state.snapshot()
    }

    /// Current counters.
    pub fn stats(&self) -> DomainStats {
        self.stats.read().clone()
    }

    /// Assured replication counters.
    pub fn assured_stats(&self) -> AssuredStats {
        self.assured.stats()
    }

    /// Returns true once a storage fault stopped local writes.
    pub fn is_halted(&self) -> bool {
        self.halted.read().is_some()
    }

    /// The fault that halted the domain.
    pub fn halt_reason(&self) -> Option<String> {
        self.halted.read().clone()
    }

    /// Number of local changes not yet published.
    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    /// Number of remote updates not yet released into the server state.
    pub fn remote_pending_len(&self) -> usize {
        self.remote.lock().len()
    }

    fn halt(&self, reason: &str) {
        let mut halted = self.halted.write();
        if halted.is_none() {
            error!(domain = %self.config.domain, reason, "replication domain halted");
            *halted = Some(reason.to_string());
        }
    }

    /// Returns true once the domain has gone offline.
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    fn check_writable(&self) -> ReplicationResult<()> {
        if self.is_stopped() {
            return Err(ReplicationError::Shutdown);
        }
        match &*self.halted.read() {
            Some(reason) => Err(ReplicationError::halted(
                self.config.domain.as_str(),
                reason.clone(),
            )),
            None => Ok(()),
        }
    }

    fn check_domain(&self, domain: &DomainId) -> ReplicationResult<()> {
        if *domain == self.config.domain {
            Ok(())
        } else {
            Err(ReplicationError::WrongDomain {
                expected: self.config.domain.to_string(),
                got: domain.to_string(),
            })
        }
    }

    /// Assigns a CSN to a local operation about to run.
    ///
    /// # Errors
    ///
    /// - [`ReplicationError::DomainHalted`] after a storage fault
    /// - [`ReplicationError::Shutdown`] once the domain has gone offline
    pub fn assign(&self) -> ReplicationResult<Csn> {
        self.check_writable()?;
        Ok(self.pending.lock().assign())
    }

    /// Marks the local operation holding `csn` as done and releases every
    /// change that is now at the head of the buffer.
    ///
    /// With assured replication configured, the change is registered before
    /// it is sent; await the receipt to learn whether peers acknowledged it.
    ///
    /// # Errors
    ///
    /// - [`ReplicationError::DomainHalted`] after a storage fault, including
    ///   one raised while releasing
    /// - [`ReplicationError::Shutdown`] once the domain has gone offline
    /// - [`ReplicationError::UnknownChange`] if `csn` is not pending
    pub fn commit(
        &self,
        csn: Csn,
        opcode: Opcode,
        target_dn: impl Into<String>,
        payload: impl Into<Vec<u8>>,
    ) -> ReplicationResult<CommitReceipt> {
        self.check_writable()?;
        let mut msg = UpdateMsg::new(self.config.domain.clone(), csn, opcode, target_dn, payload);

        let mut waiter = None;
        if let Some(assured) = self.config.assured {
            msg.assured = Some(assured.mode);
            let expected = self.expected_acks(assured.mode);
            waiter = Some(self.assured.register(csn, expected, assured.timeout));
        }

        let result = {
            let mut pending = self.pending.lock();
            pending
                .commit(csn, msg)
                .and_then(|()| self.drain(&mut pending))
        };
        if let Err(err) = result {
            self.assured.cancel(&csn);
            return Err(err);
        }
        Ok(CommitReceipt { csn, waiter })
    }

    /// Drops the local operation holding `csn`; it is never published.
    ///
    /// # Errors
    ///
    /// - [`ReplicationError::UnknownChange`] if `csn` is not pending
    /// - [`ReplicationError::DomainHalted`] if releasing the changes behind it
    ///   hits a storage fault
    pub fn discard(&self, csn: Csn) -> ReplicationResult<()> {
        let mut pending = self.pending.lock();
        pending.discard(csn)?;
        self.drain(&mut pending)
    }

    fn expected_acks(&self, mode: AssuredMode) -> usize {
        match mode {
            AssuredMode::SafeData { level } => usize::from(level.saturating_sub(1)),
            AssuredMode::SafeRead => self
                .changelog
                .replicas(&self.config.domain)
                .into_iter()
                .filter(|replica| *replica != self.config.replica_id)
                .count(),
        }
    }

    /// Releases the committed prefix. Runs under the pending lock.
    ///
    /// A change leaves the buffer only once it is in the changelog.
    fn drain(&self, pending: &mut PendingChanges) -> ReplicationResult<()> {
        while let Some(msg) = pending.committed_head().cloned() {
            let csn = msg.csn;
            let wire = ReplicationMsg::Update(msg);
            let record = ChangeRecord::new(csn, self.config.domain.clone(), wire.encode()?);

            if let Err(err) = self.changelog.publish(&record) {
                let reason = err.to_string();
                self.halt(&reason);
                return Err(ReplicationError::halted(self.config.domain.as_str(), reason));
            }
            pending.release_head();
            if let Err(err) = self.publisher.publish(&wire) {
                warn!(domain = %self.config.domain, csn = %csn, error = %err, "failed to send change");
                self.stats.write().publish_failures += 1;
            }
            self.state.update(csn);
            self.stats.write().local_changes += 1;
            debug!(domain = %self.config.domain, csn = %csn, "published local change");
        }
        Ok(())
    }

    /// Handles one inbound message.
    ///
    /// Updates are logged in the changelog and queued for replay; replay
    /// itself happens on the worker pool or in
    /// [`ReplicationDomain::replay_pending`].
    ///
    /// # Errors
    ///
    /// - [`ReplicationError::WrongDomain`] for a message of another domain
    /// - [`ReplicationError::DomainHalted`] if logging an update hits a
    ///   storage fault
    /// - [`ReplicationError::Shutdown`] once the domain has gone offline
    pub fn receive(&self, msg: ReplicationMsg) -> ReplicationResult<()> {
        if self.is_stopped() {
            return Err(ReplicationError::Shutdown);
        }
        match msg {
            ReplicationMsg::Update(update) => {
                self.check_domain(&update.domain)?;
                self.receive_update(update)
            }
            ReplicationMsg::Heartbeat(HeartbeatMsg { domain, csn }) => {
                self.check_domain(&domain)?;
                self.changelog.heartbeat(&domain, csn);
                debug!(domain = %domain, csn = %csn, "heartbeat");
                Ok(())
            }
            ReplicationMsg::Offline(OfflineMsg { domain, csn }) => {
                self.check_domain(&domain)?;
                self.changelog.replica_offline(&domain, csn);
                Ok(())
            }
            ReplicationMsg::Ack(ack) => {
                self.assured.on_ack(&ack);
                Ok(())
            }
        }
    }

    fn receive_update(&self, update: UpdateMsg) -> ReplicationResult<()> {
        let csn = update.csn;
        let origin = update.origin();
        if origin == self.config.replica_id {
            debug!(domain = %self.config.domain, csn = %csn, "ignoring own change");
            return Ok(());
        }
        self.pending.lock().generator().adjust(&csn);

        // Held until the update is buffered.
        let mut remote = self.remote.lock();
        if self.state.covers(&csn) || remote.contains(&csn) {
            debug!(domain = %self.config.domain, csn = %csn, "skipping duplicate change");
            self.stats.write().duplicates_skipped += 1;
            return Ok(());
        }

        let logged = self
            .changelog
            .replica_log(&self.config.domain, origin)
            .and_then(|log| log.newest_csn())
            .is_some_and(|newest| newest >= csn);
        if !logged {
            let wire = ReplicationMsg::Update(update.clone()).encode()?;
            let record = ChangeRecord::new(csn, self.config.domain.clone(), wire);
            if let Err(err) = self.changelog.publish(&record) {
                if err.is_storage_fault() {
                    let reason = err.to_string();
                    self.halt(&reason);
                    return Err(ReplicationError::halted(self.config.domain.as_str(), reason));
                }
                warn!(domain = %self.config.domain, csn = %csn, error = %err, "rejected remote change");
                return Err(err.into());
            }
        }

        remote.put(update);
        drop(remote);
        self.stats.write().remote_received += 1;
        self.work.notify_one();
        Ok(())
    }

    /// Replays every remote update that is ready, on the calling thread.
    ///
    /// Returns the number replayed.
    pub fn replay_pending(&self) -> usize {
        let mut replayed = 0;
        loop {
            let next = self.remote.lock().next_ready();
            match next {
                Some(update) => {
                    self.replay_one(update);
                    replayed += 1;
                }
                None => return replayed,
            }
        }
    }

    fn replay_one(&self, update: UpdateMsg) {
        let csn = update.csn;
        let failed = match self.replay.replay(&update) {
            ReplayOutcome::Applied => false,
            ReplayOutcome::NoOp => {
                debug!(domain = %self.config.domain, csn = %csn, "remote change superseded");
                false
            }
            ReplayOutcome::Failed(reason) => {
                warn!(domain = %self.config.domain, csn = %csn, reason = %reason, "replay failed");
                true
            }
        };
        {
            let mut stats = self.stats.write();
            stats.remote_replayed += 1;
            if failed {
                stats.replay_errors += 1;
            }
        }

        if update.is_assured() {
            let ack = if failed {
                AckMsg::replay_error(csn, self.config.replica_id)
            } else {
                AckMsg::new(csn, self.config.replica_id)
            };
            if let Err(err) = self.publisher.publish(&ReplicationMsg::Ack(ack)) {
                warn!(domain = %self.config.domain, csn = %csn, error = %err, "failed to send ack");
                self.stats.write().publish_failures += 1;
            }
        }

        {
            // Released CSNs reach the state before another receive can look.
            let mut remote = self.remote.lock();
            match remote.commit(csn) {
                Ok(released) => {
                    for csn in released {
                        self.state.update(csn);
                    }
                }
                Err(err) => warn!(domain = %self.config.domain, error = %err, "replayed change vanished"),
            }
        }
        self.work.notify_one();
    }

    /// Announces this replica when it has no local change in flight.
    ///
    /// Returns false if a change is pending or the domain is halted.
    pub fn send_heartbeat(&self) -> bool {
        if self.is_halted() {
            return false;
        }
        let csn = {
            let pending = self.pending.lock();
            if !pending.is_empty() {
                return false;
            }
            pending.generator().next_csn()
        };

        self.changelog.heartbeat(&self.config.domain, csn);
        let msg = ReplicationMsg::Heartbeat(HeartbeatMsg {
            domain: self.config.domain.clone(),
            csn,
        });
        if let Err(err) = self.publisher.publish(&msg) {
            warn!(domain = %self.config.domain, error = %err, "failed to send heartbeat");
            self.stats.write().publish_failures += 1;
            return false;
        }
        self.stats.write().heartbeats_sent += 1;
        true
    }

    /// Persists the server state if it changed since the last save.
    ///
    /// Returns true if it was written.
    ///
    /// # Errors
    ///
    /// Returns an error if the state store fails.
    pub fn save_state(&self) -> ReplicationResult<bool> {
        let state = self.state.snapshot();
        let mut saved = self.saved.lock();
        let unchanged = saved
            .as_ref()
            .map_or(state.is_empty(), |previous| *previous == state);
        if unchanged {
            return Ok(false);
        }
        self.state_store.save(&self.config.domain, &state)?;
        debug!(domain = %self.config.domain, replicas = state.len(), "saved server state");
        *saved = Some(state);
        self.stats.write().state_saves += 1;
        Ok(true)
    }

    /// Purges changes of this domain nobody can still need.
    ///
    /// # Errors
    ///
    /// Returns an error if a log segment cannot be removed.
    pub fn purge(&self) -> ReplicationResult<usize> {
        Ok(self
            .changelog
            .purge_domain(&self.config.domain, self.clock.now_millis())?)
    }

    /// Reports the oldest pending local change if it has waited longer than
    /// the head-of-line threshold.
    pub fn check_head_of_line(&self) -> Option<(Csn, Duration)> {
        let (csn, age) = self.pending.lock().oldest_pending_age(Instant::now())?;
        if age < self.config.head_of_line_threshold {
            return None;
        }
        warn!(
            domain = %self.config.domain,
            csn = %csn,
            age_ms = age.as_millis() as u64,
            "pending change is holding back the outbound stream"
        );
        Some((csn, age))
    }

    /// Tells peers this replica is leaving and persists the state.
    ///
    /// Local writes and inbound messages are refused from then on.
    fn go_offline(&self) -> ReplicationResult<()> {
        self.stopped.store(true, Ordering::Release);
        let csn = self.pending.lock().generator().next_csn();
        self.changelog.replica_offline(&self.config.domain, csn);
        let msg = ReplicationMsg::Offline(OfflineMsg {
            domain: self.config.domain.clone(),
            csn,
        });
        if let Err(err) = self.publisher.publish(&msg) {
            warn!(domain = %self.config.domain, error = %err, "failed to send offline notice");
        }
        self.save_state().map(|_| ())
    }

    /// Starts the dispatcher, the replay workers and the maintenance task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(self: &Arc<Self>) -> DomainHandle {
        let (inbound_tx, inbound_rx) = mpsc::channel(self.config.queue_depth.max(1));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let workers = self.config.worker_count.max(1);
        let mut tasks = Vec::with_capacity(workers + 2);
        tasks.push(tokio::spawn(Self::dispatch_loop(
            Arc::clone(self),
            inbound_rx,
            shutdown_rx.clone(),
        )));
        for _ in 0..workers {
            tasks.push(tokio::spawn(Self::replay_loop(
                Arc::clone(self),
                shutdown_rx.clone(),
            )));
        }
        tasks.push(tokio::spawn(Self::maintenance_loop(
            Arc::clone(self),
            shutdown_rx,
        )));

        info!(
            domain = %self.config.domain,
            replica = %self.config.replica_id,
            workers,
            "replication domain started"
        );
        DomainHandle {
            domain: Arc::clone(self),
            inbound: inbound_tx,
            shutdown_tx,
            tasks,
        }
    }

    async fn dispatch_loop(
        self: Arc<Self>,
        mut inbound: mpsc::Receiver<ReplicationMsg>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                msg = inbound.recv() => match msg {
                    Some(msg) => {
                        if let Err(err) = self.receive(msg) {
                            if err.is_fatal() {
                                error!(domain = %self.config.domain, error = %err, "inbound message failed");
                            } else {
                                warn!(domain = %self.config.domain, error = %err, "inbound message dropped");
                            }
                        }
                    }
                    None => break,
                },
            }
        }
    }

    async fn replay_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }
            let next = self.remote.lock().next_ready();
            match next {
                Some(update) => {
                    self.replay_one(update);
                    tokio::task::yield_now().await;
                }
                None => {
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = self.work.notified() => {}
                    }
                }
            }
        }
    }

    async fn maintenance_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut heartbeat = ticker(self.config.heartbeat_interval);
        let mut save = ticker(self.config.save_interval);
        let mut purge = ticker(self.config.purge_interval);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = heartbeat.tick() => {
                    self.send_heartbeat();
                    self.check_head_of_line();
                }
                _ = save.tick() => {
                    if let Err(err) = self.save_state() {
                        warn!(domain = %self.config.domain, error = %err, "failed to save server state");
                    }
                }
                _ = purge.tick() => {
                    if let Err(err) = self.purge() {
                        warn!(domain = %self.config.domain, error = %err, "changelog purge failed");
                    }
                }
            }
        }
    }
}

fn ticker(period: Duration) -> Interval {
    let mut interval = time::interval(period.max(Duration::from_millis(1)));
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

/// Controls a started domain.
#[derive(Debug)]
pub struct DomainHandle {
    domain: Arc<ReplicationDomain>,
    inbound: mpsc::Sender<ReplicationMsg>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl DomainHandle {
    /// The running domain.
    pub fn domain(&self) -> &Arc<ReplicationDomain> {
        &self.domain
    }

    /// Sender for the domain's inbound queue.
    pub fn inbound(&self) -> mpsc::Sender<ReplicationMsg> {
        self.inbound.clone()
    }

    /// Signals every task to stop without waiting.
    pub fn request_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Stops every task, tells peers this replica is offline and persists the
    /// server state.
    ///
    /// # Errors
    ///
    /// Returns an error if the final state save fails.
    pub async fn shutdown(self) -> ReplicationResult<()> {
        self.request_shutdown();
        for task in self.tasks {
            let _ = task.await;
        }
        info!(domain = %self.domain.config.domain, "replication domain stopped");
        self.domain.go_offline()
    }
}
