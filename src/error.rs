//! Error types for store operations.
//!
//! Failures raised inside user-supplied methods and mutators propagate to the
//! caller unchanged; storage backend failures are surfaced, never suppressed
//! or translated.

use thiserror::Error;

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Dispatch target does not exist in the methods map.
    #[error("unknown method: {0}")]
    UnknownMethod(String),

    /// A user-supplied method or mutator signaled failure.
    #[error("method failed: {0}")]
    Method(String),

    /// A value had the wrong kind for the requested operation.
    #[error("type mismatch: expected {expected}, found {found}")]
    TypeMismatch {
        expected: &'static str,
        found: &'static str,
    },

    /// Snapshot encoding or decoding error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Storage backend error (bad store name, medium unavailable).
    #[error("storage error: {0}")]
    Storage(String),

    /// A persisted snapshot could not be migrated to the current version.
    #[error("migration from version {from} failed: {reason}")]
    Migration { from: u32, reason: String },

    /// I/O error from a storage backend.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}
