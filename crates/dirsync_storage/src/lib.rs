//! # dirsync storage
//!
//! Byte-level storage beneath the dirsync replica logs.
//!
//! Everything here is format-agnostic: a [`StorageBackend`] is one append-only
//! segment of opaque bytes, and a [`SegmentStore`] is a directory of named
//! streams, each split into numbered segments. Frames, CSN keys and checksums
//! are owned by `dirsync_core`.
//!
//! ## Available stores
//!
//! - [`MemorySegmentStore`] / [`InMemoryBackend`] for tests and ephemeral
//!   topologies
//! - [`FileSegmentStore`] / [`FileBackend`] for durable changelogs
//!
//! ## Example
//!
//! ```rust
//! use dirsync_storage::{MemorySegmentStore, SegmentStore};
//!
//! let store = MemorySegmentStore::new();
//! let mut segment = store.open_segment("changelog/dc=example/1", 0).unwrap();
//! let offset = segment.append(b"frame").unwrap();
//! assert_eq!(segment.read_at(offset, 5).unwrap(), b"frame");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file;
mod file_store;
mod memory;
mod store;

pub use backend::StorageBackend;
pub use error::{StorageError, StorageResult};
pub use file::FileBackend;
pub use file_store::FileSegmentStore;
pub use memory::InMemoryBackend;
pub use store::{MemorySegmentStore, SegmentStore};
