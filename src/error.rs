//! Error types shared across the crate

use thiserror::Error;

/// Errors surfaced by phonon operations
#[derive(Error, Debug)]
pub enum PhononError {
    /// Lock acquisition timed out or a non-blocking attempt found the lease held
    #[error("Already locked: {0}")]
    AlreadyLocked(String),

    /// Transient failure talking to the shared store
    #[error("Shared store error: {0}")]
    Store(String),

    /// Redis transport or protocol error
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Caller mistake: missing required field, impossible topology
    #[error("Argument error: {0}")]
    Argument(String),

    /// Error raised from user-supplied execute/merge/on_complete code
    #[error("User callback error: {0}")]
    Callback(String),

    /// Cached snapshot carries a version this build does not understand
    #[error("Unknown snapshot version: {0}")]
    UnknownSnapshotVersion(u8),

    /// Snapshot payload failed to encode or decode
    #[error("Snapshot codec error: {0}")]
    Snapshot(String),

    /// The asynchronous expiry worker is no longer accepting victims
    #[error("Expiry queue closed")]
    ExpiryQueueClosed,
}

impl PhononError {
    /// Whether this error is a lock-contention signal the caller may retry on.
    pub fn is_already_locked(&self) -> bool {
        matches!(self, PhononError::AlreadyLocked(_))
    }
}

/// Result type for phonon operations
pub type Result<T> = std::result::Result<T, PhononError>;
