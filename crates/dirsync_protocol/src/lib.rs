//! # dirsync protocol
//!
//! Messages exchanged between replicas of a dirsync topology and their wire
//! codec.
//!
//! A message on the wire is one type byte followed by a CBOR body:
//!
//! | Type | Message |
//! |------|---------|
//! | 1 | [`UpdateMsg`] |
//! | 2 | [`HeartbeatMsg`] |
//! | 3 | [`OfflineMsg`] |
//! | 4 | [`AckMsg`] |
//!
//! This crate does no I/O.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod messages;

pub use error::{ProtocolError, ProtocolResult};
pub use messages::{
    AckMsg, AssuredMode, HeartbeatMsg, OfflineMsg, Opcode, ReplicationMsg, UpdateMsg,
};
