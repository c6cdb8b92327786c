//! # dirsync core
//!
//! The ordering and storage core of dirsync, a multi-master directory
//! replication engine.
//!
//! - [`Csn`] is the logical clock: every accepted write gets one, and CSNs
//!   totally order all writes of the topology
//! - [`ServerState`] and [`MultiDomainServerState`] record how far a server
//!   has progressed per replica; the latter's text form is the cookie
//! - [`CsnGenerator`] hands out strictly increasing CSNs for one replica
//! - [`ReplicaLog`] keeps the changes of one replica in CSN order, and
//!   [`ChangelogDb`] holds all of them
//! - [`MergeCursor`] merges replica logs into one ordered feed
//! - [`ChangeNumberIndex`] numbers changes densely for external consumers
//! - [`EntryHistorical`] resolves conflicting modifications per attribute
//!
//! ## Example
//!
//! ```rust
//! use dirsync_core::{
//!     ChangeRecord, ChangelogConfig, ChangelogDb, CsnGenerator, DomainId, ManualClock,
//!     MergeCursor, MultiDomainServerState, PositionStrategy, ReplicaId,
//! };
//! use dirsync_storage::MemorySegmentStore;
//! use std::sync::Arc;
//!
//! let changelog = Arc::new(
//!     ChangelogDb::open(Arc::new(MemorySegmentStore::new()), ChangelogConfig::default()).unwrap(),
//! );
//! let domain = DomainId::new("dc=example,dc=com");
//!
//! let r1 = CsnGenerator::new(ReplicaId(1), Arc::new(ManualClock::new(1_000)));
//! let r2 = CsnGenerator::new(ReplicaId(2), Arc::new(ManualClock::new(999)));
//! for generator in [&r1, &r2] {
//!     let csn = generator.next_csn();
//!     changelog.publish(&ChangeRecord::new(csn, domain.clone(), Vec::new())).unwrap();
//! }
//!
//! let mut cursor = MergeCursor::open(&changelog, &MultiDomainServerState::new(), PositionStrategy::AtOrAfter);
//! assert_eq!(cursor.next().unwrap().unwrap().csn.replica_id(), ReplicaId(2));
//! assert_eq!(cursor.next().unwrap().unwrap().csn.replica_id(), ReplicaId(1));
//! assert!(cursor.next().unwrap().is_none());
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod changelog;
pub mod cn_index;
mod config;
pub mod consistency;
pub mod csn;
mod error;
pub mod generator;
pub mod historical;
pub mod log;
pub mod merge;
pub mod replica_log;
pub mod server_state;
pub mod state_store;
mod types;

pub use changelog::{ChangeNotifier, ChangelogDb, ConsumerFloor, CursorRegistry};
pub use cn_index::{ChangeNumberIndex, ChangeNumberIndexer, CnIndexRecord};
pub use config::{ChangelogConfig, LogConfig};
pub use consistency::MediumConsistency;
pub use csn::{Csn, MAX_CSN_TIMESTAMP};
pub use error::{CoreError, CoreResult};
pub use generator::{Clock, CsnGenerator, ManualClock, SystemClock};
pub use historical::{
    apply_modifications, EntryAttributes, EntryHistorical, ModKind, Modification, Resolution,
    ResolutionOutcome,
};
pub use log::{Log, LogCursor, PositionStrategy};
pub use merge::{MergeCursor, MergeCursorHandle};
pub use replica_log::{ChangeRecord, ReplicaLog, ReplicaLogCursor};
pub use server_state::{MultiDomainServerState, ServerState, SharedServerState};
pub use state_store::{LogStateStore, MemoryStateStore, StateStore};
pub use types::{ChangeNumber, DomainId, ReplicaId};
