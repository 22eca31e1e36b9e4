//! File system paths for the dispatch core.

use crate::{CoreError, CoreResult};
use std::path::PathBuf;

/// Queue database filename under the base directory.
const QUEUE_DATABASE_NAME: &str = "queue.sqlite";

/// Manages file system paths for the dispatch core.
#[derive(Debug, Clone)]
pub struct Paths {
    /// Base directory for runtime files (~/.dispatch)
    base_dir: PathBuf,
}

impl Paths {
    /// Create a new Paths instance rooted at `~/.dispatch`.
    pub fn new() -> CoreResult<Self> {
        let home = dirs::home_dir()
            .ok_or_else(|| CoreError::Path("Could not determine home directory".to_string()))?;

        Ok(Self {
            base_dir: home.join(".dispatch"),
        })
    }

    /// Create a new Paths instance with a custom base directory.
    pub fn with_base_dir(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    /// Get the base directory (~/.dispatch).
    pub fn base_dir(&self) -> &PathBuf {
        &self.base_dir
    }

    /// Get the config file path (~/.dispatch/config.json).
    pub fn config_file(&self) -> PathBuf {
        self.base_dir.join("config.json")
    }

    /// Get the queue database path (~/.dispatch/queue.sqlite).
    pub fn queue_database_file(&self) -> PathBuf {
        self.base_dir.join(QUEUE_DATABASE_NAME)
    }

    /// Get the logs directory (~/.dispatch/logs).
    pub fn logs_dir(&self) -> PathBuf {
        self.base_dir.join("logs")
    }

    /// Get the central log file (~/.dispatch/logs/dispatch.jsonl).
    pub fn log_file(&self) -> PathBuf {
        self.logs_dir().join("dispatch.jsonl")
    }

    /// Ensure all necessary directories exist.
    pub fn ensure_dirs(&self) -> CoreResult<()> {
        std::fs::create_dir_all(&self.base_dir)?;
        std::fs::create_dir_all(self.logs_dir())?;
        Ok(())
    }
}
