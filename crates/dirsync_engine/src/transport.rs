//! Outbound side of a replication domain.

use crate::error::{ReplicationError, ReplicationResult};
use dirsync_protocol::ReplicationMsg;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;

/// Sends a domain's messages to its peers.
///
/// Implementations must preserve the order of messages from one domain.
pub trait ChangePublisher: Send + Sync {
    /// Sends one message.
    fn publish(&self, msg: &ReplicationMsg) -> ReplicationResult<()>;
}

/// A publisher that records messages, for tests.
#[derive(Debug, Default)]
pub struct MemoryChannel {
    messages: Mutex<Vec<ReplicationMsg>>,
    failing: AtomicBool,
}

impl MemoryChannel {
    /// Creates an empty channel.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every following publish fail, or succeed again.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Messages published so far.
    pub fn messages(&self) -> Vec<ReplicationMsg> {
        self.messages.lock().clone()
    }

    /// Removes and returns the messages published so far.
    pub fn take(&self) -> Vec<ReplicationMsg> {
        std::mem::take(&mut *self.messages.lock())
    }

    /// Number of messages published so far.
    pub fn len(&self) -> usize {
        self.messages.lock().len()
    }

    /// Returns true if nothing was published.
    pub fn is_empty(&self) -> bool {
        self.messages.lock().is_empty()
    }
}

impl ChangePublisher for MemoryChannel {
    fn publish(&self, msg: &ReplicationMsg) -> ReplicationResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(ReplicationError::Channel("injected failure".into()));
        }
        self.messages.lock().push(msg.clone());
        Ok(())
    }
}

/// A publisher feeding the inbound queues of in-process peer domains.
///
/// Peers may be connected after the domain started.
#[derive(Debug, Default)]
pub struct PeerLinks {
    peers: RwLock<Vec<mpsc::Sender<ReplicationMsg>>>,
}

impl PeerLinks {
    /// Creates a publisher with no peers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a peer's inbound queue.
    pub fn connect(&self, peer: mpsc::Sender<ReplicationMsg>) {
        self.peers.write().push(peer);
    }

    /// Number of connected peers.
    pub fn peer_count(&self) -> usize {
        self.peers.read().len()
    }
}

impl ChangePublisher for PeerLinks {
    /// Offers `msg` to every peer. A refusing peer does not keep the others
    /// from receiving it; the refusals are reported together.
    fn publish(&self, msg: &ReplicationMsg) -> ReplicationResult<()> {
        let failures: Vec<String> = self
            .peers
            .read()
            .iter()
            .enumerate()
            .filter_map(|(index, peer)| {
                peer.try_send(msg.clone())
                    .err()
                    .map(|err| format!("peer {index}: {err}"))
            })
            .collect();
        if failures.is_empty() {
            Ok(())
        } else {
            Err(ReplicationError::Channel(failures.join("; ")))
        }
    }
}
