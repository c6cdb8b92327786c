//! # dirsync testkit
//!
//! Test utilities for dirsync.
//!
//! This crate provides:
//! - proptest strategies for CSNs, replica streams and modifications
//! - changelog fixtures over memory or a temporary directory
//! - [`MemoryDirectory`], an in-memory entry store that replays updates with
//!   historical conflict resolution
//! - [`TestReplica`], a started replication domain wired to its own
//!   changelog and directory
//!
//! ## Usage
//!
//! ```rust,ignore
//! use dirsync_testkit::prelude::*;
//!
//! #[test]
//! fn publishes() {
//!     init_tracing();
//!     let fixture = memory_changelog();
//!     // ... publish and read changes
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod directory;
pub mod fixtures;
pub mod generators;
pub mod replica;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::directory::*;
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::replica::*;
}

pub use directory::*;
pub use fixtures::*;
pub use generators::*;
pub use replica::*;
