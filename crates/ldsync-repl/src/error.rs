//! Error types for the replication subsystem.

use thiserror::Error;

use crate::csn::Csn;
use crate::server_state::ReplicaId;

/// Errors that can occur in the replication subsystem.
#[derive(Debug, Error)]
pub enum ReplError {
    /// Local changelog persistence failed (disk full, corruption, rejected write).
    #[error("changelog error: {msg}")]
    Changelog {
        /// Error message describing the issue.
        msg: String,
    },

    /// A cursor was opened below the purge point of a changelog partition.
    #[error("changes of {replica} up to {purged_up_to} were purged")]
    ChangesPurged {
        /// The partition that was read.
        replica: ReplicaId,
        /// Newest CSN that is no longer retained.
        purged_up_to: Csn,
    },

    /// Malformed or out-of-sequence session traffic.
    #[error("protocol error: {msg}")]
    Protocol {
        /// Error message describing the violation.
        msg: String,
    },

    /// The peer serves a different data generation; full reinitialization required.
    #[error("generation mismatch: local={local}, remote={remote}")]
    GenerationMismatch {
        /// Generation ID of the local replica.
        local: u64,
        /// Generation ID announced by the peer.
        remote: u64,
    },

    /// The pending-add buffer is full.
    #[error("pending update buffer exceeded {capacity} entries")]
    ConflictOverflow {
        /// Configured capacity of the buffer.
        capacity: usize,
    },

    /// The key-value backend rejected an operation.
    #[error("backend error: {msg}")]
    Backend {
        /// Error message describing the issue.
        msg: String,
    },

    /// A local change targets an entry that does not exist.
    #[error("no such entry: {target}")]
    NoSuchEntry {
        /// entryUUID or DN of the missing entry.
        target: String,
    },

    /// A local add targets a DN that is already in use.
    #[error("entry already exists: {dn}")]
    EntryAlreadyExists {
        /// The DN in use.
        dn: String,
    },

    /// Invalid configuration.
    #[error("configuration error: {msg}")]
    Config {
        /// Error message describing the issue.
        msg: String,
    },

    /// Serialization/deserialization error.
    #[error("serialization error")]
    Serialization(#[from] bincode::Error),

    /// I/O error.
    #[error("I/O error")]
    Io(#[from] std::io::Error),

    /// Protocol version mismatch.
    #[error("version mismatch: expected {expected}, got {got}")]
    VersionMismatch {
        /// Expected protocol version.
        expected: u8,
        /// Actual protocol version.
        got: u8,
    },

    /// A later change of an originating server arrived while an earlier one
    /// of the same server is still unapplied.
    #[error("update {csn} held back until {waiting_for} is applied")]
    UpdateHeldBack {
        /// The update refused.
        csn: Csn,
        /// Oldest unapplied update of the same originating server.
        waiting_for: Csn,
    },

    /// The domain or replication server was shut down.
    #[error("replication shut down")]
    Shutdown,
}

impl ReplError {
    /// Build a [`ReplError::Protocol`] from anything printable.
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol { msg: msg.into() }
    }

    /// Build a [`ReplError::Backend`] from anything printable.
    pub fn backend(msg: impl Into<String>) -> Self {
        Self::Backend { msg: msg.into() }
    }

    /// Build a [`ReplError::Changelog`] from anything printable.
    pub fn changelog(msg: impl Into<String>) -> Self {
        Self::Changelog { msg: msg.into() }
    }

    /// Returns true if retrying the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Backend { .. } | Self::Changelog { .. } | Self::Io(_)
        )
    }

    /// Returns true if this error requires a full reinitialization of the replica.
    pub fn requires_full_update(&self) -> bool {
        matches!(
            self,
            Self::GenerationMismatch { .. } | Self::ConflictOverflow { .. } | Self::ChangesPurged { .. }
        )
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ReplError>;
