//! Error types for the dispatch orchestrator.

use dispatch_config_and_utils::CoreError;
use event_queue_sqlite_persist::QueueStorageError;
use thiserror::Error;

/// Errors surfaced by the dispatch core.
#[derive(Error, Debug)]
pub enum DispatchError {
    /// Queue storage failed; the operation was not applied
    #[error("Storage error: {0}")]
    Storage(#[from] QueueStorageError),

    /// Configuration or path error
    #[error("Config error: {0}")]
    Config(#[from] CoreError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The serial executor thread is gone
    #[error("Serial executor closed")]
    ExecutorClosed,

    /// The intake worker is gone
    #[error("Dispatch core is shut down")]
    Shutdown,

    /// `start` was called twice
    #[error("Dispatch core already started")]
    AlreadyStarted,
}

/// Result type alias using DispatchError.
pub type DispatchResult<T> = Result<T, DispatchError>;
