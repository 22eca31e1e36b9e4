//! Queue storage error types.

use thiserror::Error;

/// Error raised by a queue storage operation.
///
/// Storage errors are surfaced synchronously to the caller of the mutating
/// operation and are never retried by the queue itself.
#[derive(Error, Debug)]
pub enum QueueStorageError {
    /// SQLite error
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Event blob could not be encoded or decoded
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Migration error
    #[error("Migration error: {0}")]
    Migration(String),

    /// A stored row could not be interpreted
    #[error("Invalid stored row: {0}")]
    InvalidRow(String),

    /// Capacity must be at least one item
    #[error("Invalid capacity: {0}")]
    InvalidCapacity(usize),
}

/// Result type alias using QueueStorageError.
pub type QueueResult<T> = Result<T, QueueStorageError>;
