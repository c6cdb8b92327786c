//! Error types for the replication engine.

use dirsync_core::{CoreError, Csn};
use dirsync_protocol::ProtocolError;
use thiserror::Error;

/// Result type for replication operations.
pub type ReplicationResult<T> = Result<T, ReplicationError>;

/// Errors that can occur in a replication domain.
#[derive(Error, Debug)]
pub enum ReplicationError {
    /// Error from the changelog or state storage.
    #[error("core error: {0}")]
    Core(#[from] CoreError),

    /// A message could not be encoded or decoded.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The domain hit a storage fault and refuses local writes.
    #[error("domain {domain} halted: {reason}")]
    DomainHalted {
        /// Domain name.
        domain: String,
        /// The fault that halted it.
        reason: String,
    },

    /// No pending change carries this CSN.
    #[error("no pending change {csn}")]
    UnknownChange {
        /// The CSN passed in.
        csn: Csn,
    },

    /// A pending change is not in the state the call requires.
    #[error("invalid pending state: {0}")]
    InvalidState(String),

    /// A message addressed to another domain.
    #[error("message for domain {got} delivered to {expected}")]
    WrongDomain {
        /// Domain of the receiver.
        expected: String,
        /// Domain named by the message.
        got: String,
    },

    /// The outbound channel refused a message.
    #[error("channel error: {0}")]
    Channel(String),

    /// The domain runtime has shut down.
    #[error("domain shut down")]
    Shutdown,
}

impl ReplicationError {
    /// Creates a domain halted error.
    pub fn halted(domain: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::DomainHalted {
            domain: domain.into(),
            reason: reason.into(),
        }
    }

    /// Returns true if the domain cannot accept local writes after this error.
    pub fn is_fatal(&self) -> bool {
        match self {
            ReplicationError::DomainHalted { .. } => true,
            ReplicationError::Core(err) => err.is_storage_fault(),
            _ => false,
        }
    }
}
