//! # dirsync engine
//!
//! Per-domain replication engine for dirsync.
//!
//! This crate provides:
//! - [`ReplicationDomain`]: CSN assignment, commit ordering and release of
//!   local changes; logging and replay of remote updates
//! - [`PendingChanges`] and [`RemotePendingChanges`], the CSN-ordered buffers
//!   behind both directions
//! - [`AssuredTracker`] for writers that wait on peer acknowledgements
//! - [`ChangePublisher`] and [`ReplayHandler`], the seams to the transport and
//!   to the directory
//!
//! ## Invariants
//!
//! - A replica's outbound stream is in CSN order, however its local
//!   operations interleave
//! - The server state only covers changes that were published or replayed
//! - A storage fault stops local writes; transport faults never do
//! - Assured timeouts are advisory: the change itself has succeeded

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod assured;
mod config;
mod domain;
mod error;
mod pending;
mod transport;

pub use assured::{AssuredOutcome, AssuredStats, AssuredTracker, AssuredWaiter};
pub use config::{AssuredConfig, DomainConfig};
pub use domain::{
    CommitReceipt, DomainHandle, DomainStats, MemoryReplayHandler, ReplayHandler, ReplayOutcome,
    ReplicationDomain,
};
pub use error::{ReplicationError, ReplicationResult};
pub use pending::{normalized_rdns, PendingChanges, PendingState, RemotePendingChanges};
pub use transport::{ChangePublisher, MemoryChannel, PeerLinks};
