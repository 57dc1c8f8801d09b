//! Error types for quiver-core.
//!
//! Every fallible operation in the crate returns [`Result`]. The variants map
//! onto the failure classes callers act on differently: missing data, corrupt
//! data, caller mistakes on edits, contention on dataset heads and transient
//! storage faults. Merge conflicts are not errors; they are returned as data in
//! [`crate::merge::MergeResult`].

use std::io;
use thiserror::Error;

use crate::hash::Ref;
use crate::merge::Conflict;
use crate::value::Kind;

/// Error type for all quiver operations.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// A required chunk is not in the store
    #[error("chunk not found: {0}")]
    NotFound(Ref),

    /// Malformed chunk bytes (bad header, bad payload, hash mismatch)
    #[error("corrupt encoding: {0}")]
    CorruptEncoding(String),

    /// The stored value's kind disagrees with the kind the caller asked for
    #[error("type mismatch: expected {expected}, found {found}")]
    TypeMismatch { expected: Kind, found: Kind },

    /// Update or delete of a key that is not present
    #[error("key not found: {0}")]
    KeyNotFound(String),

    /// Positional access or splice beyond the end of a list
    #[error("index {index} out of range for length {len}")]
    IndexOutOfRange { index: u64, len: u64 },

    /// An edit batch that cannot be applied as given
    #[error("invalid edit: {0}")]
    InvalidEdit(String),

    /// Compare-and-swap on a dataset head kept losing
    #[error("concurrent modification of dataset '{dataset}' after {attempts} attempts")]
    ConcurrentModification { dataset: String, attempts: u32 },

    /// The new commit does not descend from the dataset's current head
    #[error("merge needed: commit does not descend from the head of '{dataset}'")]
    MergeNeeded { dataset: String },

    /// Automatic merge while committing produced conflicts
    #[error("merge into '{dataset}' produced {} conflict(s)", .conflicts.len())]
    MergeConflict {
        dataset: String,
        conflicts: Vec<Conflict>,
    },

    /// Two commits share no history
    #[error("no common ancestor between {0} and {1}")]
    NoCommonAncestor(Ref, Ref),

    /// Transient I/O failure in a backend
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// Lock/mutex poisoned
    #[error("lock poisoned: {0}")]
    LockPoisoned(String),

    /// Invalid configuration
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// True for faults that may succeed when the operation is retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::StoreUnavailable(_) | Error::ConcurrentModification { .. }
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::StoreUnavailable(err.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::CorruptEncoding(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        if err.is_io() {
            Error::StoreUnavailable(err.to_string())
        } else {
            Error::CorruptEncoding(err.to_string())
        }
    }
}

impl From<hex::FromHexError> for Error {
    fn from(err: hex::FromHexError) -> Self {
        Error::CorruptEncoding(format!("invalid hex: {}", err))
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Error::Config(err.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Error::LockPoisoned(err.to_string())
    }
}

/// Result type for quiver operations.
pub type Result<T> = std::result::Result<T, Error>;
