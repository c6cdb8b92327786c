//! Started replicas wired together in process.

use crate::directory::{encode_entry, encode_modifications, MemoryDirectory};
use crate::fixtures::TestChangelog;
use dirsync_core::{
    Clock, DomainId, EntryAttributes, MemoryStateStore, Modification, ReplicaId, ServerState,
    SystemClock,
};
use dirsync_engine::{
    CommitReceipt, DomainConfig, DomainHandle, PeerLinks, ReplayOutcome, ReplicationDomain,
    ReplicationError, ReplicationResult,
};
use dirsync_protocol::Opcode;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{self, Instant};

/// A started replication domain with its own changelog, directory and
/// outbound links.
///
/// Must be created inside a tokio runtime.
pub struct TestReplica {
    /// The replica's directory.
    pub directory: Arc<MemoryDirectory>,
    /// Where the replica's messages go.
    pub links: Arc<PeerLinks>,
    /// Persisted server states.
    pub states: Arc<MemoryStateStore>,
    /// The replica's changelog.
    pub changelog: TestChangelog,
    handle: DomainHandle,
}

impl TestReplica {
    /// Starts replica `replica_id` of `domain` on an in-memory changelog.
    pub fn start(domain: &DomainId, replica_id: u16) -> Self {
        Self::start_with(
            DomainConfig::new(domain.clone(), ReplicaId(replica_id)),
            TestChangelog::memory(),
        )
    }

    /// Starts a replica with `config` on `changelog`.
    pub fn start_with(config: DomainConfig, changelog: TestChangelog) -> Self {
        let directory = Arc::new(MemoryDirectory::new());
        let links = Arc::new(PeerLinks::new());
        let states = Arc::new(MemoryStateStore::new());
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let domain = ReplicationDomain::open(
            config,
            Arc::clone(&changelog.changelog),
            links.clone(),
            directory.clone(),
            states.clone(),
            clock,
        )
        .expect("Failed to open replication domain");
        let handle = domain.start();
        Self {
            directory,
            links,
            states,
            changelog,
            handle,
        }
    }

    /// The running domain.
    pub fn domain(&self) -> &Arc<ReplicationDomain> {
        self.handle.domain()
    }

    /// The replica's id.
    pub fn replica_id(&self) -> ReplicaId {
        self.domain().config().replica_id
    }

    /// The domain's server state.
    pub fn server_state(&self) -> ServerState {
        self.domain().server_state()
    }

    /// Applies an operation locally and commits it for replication.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory rejects the operation or the domain
    /// refuses the commit.
    pub fn write(
        &self,
        opcode: Opcode,
        dn: &str,
        payload: Vec<u8>,
    ) -> ReplicationResult<CommitReceipt> {
        let domain = self.domain();
        let csn = domain.assign()?;
        if let ReplayOutcome::Failed(reason) = self.directory.apply(csn, opcode, dn, &payload) {
            domain.discard(csn)?;
            return Err(ReplicationError::InvalidState(reason));
        }
        domain.commit(csn, opcode, dn, payload)
    }

    /// Adds an entry.
    pub fn add_entry(&self, dn: &str, attributes: &EntryAttributes) -> ReplicationResult<CommitReceipt> {
        self.write(Opcode::Add, dn, encode_entry(attributes))
    }

    /// Modifies an entry.
    pub fn modify(&self, dn: &str, mods: &[Modification]) -> ReplicationResult<CommitReceipt> {
        self.write(Opcode::Modify, dn, encode_modifications(mods))
    }

    /// Deletes an entry.
    pub fn delete(&self, dn: &str) -> ReplicationResult<CommitReceipt> {
        self.write(Opcode::Delete, dn, Vec::new())
    }

    /// Stops the domain, announcing it offline and saving its state.
    pub async fn shutdown(self) -> TestChangelog {
        self.handle
            .shutdown()
            .await
            .expect("Failed to shut down replication domain");
        self.changelog
    }
}

/// Makes `from` send its messages to `to`.
pub fn link(from: &TestReplica, to: &TestReplica) {
    from.links.connect(to.handle.inbound());
}

/// Links every pair of replicas in both directions.
pub fn connect_all(replicas: &[&TestReplica]) {
    for from in replicas {
        for to in replicas {
            if from.replica_id() != to.replica_id() {
                link(from, to);
            }
        }
    }
}

/// Polls `condition` every few milliseconds until it holds or `timeout`
/// elapses. Returns whether it held.
pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        time::sleep(Duration::from_millis(5)).await;
    }
}

/// Waits until every replica's directory holds the same entries and no
/// update is left to replay.
pub async fn wait_converged(replicas: &[&TestReplica], timeout: Duration) -> bool {
    wait_until(timeout, || {
        let Some((first, rest)) = replicas.split_first() else {
            return true;
        };
        let expected = first.directory.snapshot();
        replicas.iter().all(|r| r.domain().remote_pending_len() == 0)
            && rest.iter().all(|r| r.directory.snapshot() == expected)
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn person(cn: &str) -> EntryAttributes {
        [("cn".to_string(), BTreeSet::from([cn.to_string()]))]
            .into_iter()
            .collect()
    }

    #[tokio::test]
    async fn two_replicas_converge() {
        crate::fixtures::init_tracing();
        let domain = DomainId::new("dc=example,dc=com");
        let r1 = TestReplica::start(&domain, 1);
        let r2 = TestReplica::start(&domain, 2);
        connect_all(&[&r1, &r2]);

        r1.add_entry("uid=a,dc=example,dc=com", &person("A")).unwrap();
        r2.add_entry("uid=b,dc=example,dc=com", &person("B")).unwrap();

        assert!(wait_converged(&[&r1, &r2], Duration::from_secs(5)).await);
        assert_eq!(r1.directory.len(), 2);
        assert!(
            wait_until(Duration::from_secs(5), || r1.server_state() == r2.server_state()).await
        );

        r1.shutdown().await;
        r2.shutdown().await;
    }

    #[tokio::test]
    async fn rejected_write_is_discarded() {
        let domain = DomainId::new("o=test");
        let replica = TestReplica::start(&domain, 1);
        let result = replica.write(Opcode::Modify, "uid=x,o=test", vec![0xff]);
        assert!(matches!(result, Err(ReplicationError::InvalidState(_))));
        assert_eq!(replica.domain().pending_len(), 0);
        replica.shutdown().await;
    }
}
