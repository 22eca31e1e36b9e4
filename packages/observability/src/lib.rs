//! # Observability
//!
//! Logging initialization for the dispatch workspace.
//!
//! Crates are **log producers** only: they use the standard `tracing` macros
//! with structured fields and never decide where output goes. The embedding
//! application calls [`init`] or [`init_with_config`] once at startup.
//!
//! Output is JSONL appended to a central file (default
//! `~/.dispatch/logs/dispatch.jsonl`), optionally mirrored to stderr in a
//! compact human format. `RUST_LOG` overrides the configured default level.
//!
//! The file is opened in append mode and written unbuffered: the fmt layer
//! emits each event with a single write, so lines from several processes
//! sharing the file do not interleave.
//!
//! ```rust,ignore
//! observability::init("dispatch");
//! tracing::info!(destination = "collect", "dispatch loop started");
//! ```

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Configuration for the logging system.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Name of the service, attached to the startup line for filtering.
    pub service_name: String,

    /// Default log level filter (e.g., "debug", "info", "warn").
    /// Can be overridden by `RUST_LOG` environment variable.
    pub default_level: String,

    /// Optional custom log file path.
    /// Defaults to `~/.dispatch/logs/dispatch.jsonl`.
    pub log_path: Option<PathBuf>,

    /// Skip the JSONL file entirely (stderr only).
    pub disable_file: bool,

    /// Also emit logs to stderr for immediate feedback.
    pub also_stderr: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            service_name: "unknown".into(),
            default_level: "info".into(),
            log_path: None,
            disable_file: false,
            also_stderr: false,
        }
    }
}

/// Initialize logging with default settings.
///
/// Errors (unwritable log file, subscriber already installed) are reported on
/// stderr and otherwise ignored so that logging never prevents startup.
pub fn init(service_name: &str) {
    if let Err(e) = init_with_config(LogConfig {
        service_name: service_name.into(),
        ..Default::default()
    }) {
        eprintln!("observability init failed: {}", e);
    }
}

/// Initialize logging with custom configuration.
pub fn init_with_config(config: LogConfig) -> io::Result<()> {
    let file_layer = if config.disable_file {
        None
    } else {
        let log_path = match config.log_path.clone() {
            Some(path) => path,
            None => default_log_path()?,
        };
        let file = open_log_file(&log_path)?;
        Some(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(true)
                .with_target(true)
                .with_writer(file)
                .with_filter(env_filter(&config.default_level)),
        )
    };

    let stderr_layer = if config.also_stderr {
        Some(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_file(false)
                .with_line_number(false)
                .compact()
                .with_writer(io::stderr)
                .with_filter(env_filter(&config.default_level)),
        )
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(file_layer)
        .with(stderr_layer)
        .try_init()
        .map_err(|e| io::Error::new(io::ErrorKind::AlreadyExists, e.to_string()))?;

    tracing::info!(
        service = %config.service_name,
        pid = std::process::id(),
        "observability initialized"
    );
    Ok(())
}

/// Opens `path` for appending, creating parent directories as needed.
fn open_log_file(path: &Path) -> io::Result<Arc<File>> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    Ok(Arc::new(file))
}

fn env_filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
}

/// Central log file location: `~/.dispatch/logs/dispatch.jsonl`.
fn default_log_path() -> io::Result<PathBuf> {
    dirs::home_dir()
        .map(|home| home.join(".dispatch").join("logs").join("dispatch.jsonl"))
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "home directory not found"))
}

/// Re-export tracing macros for convenience.
pub use tracing::{debug, error, info, instrument, trace, warn};

/// Re-export Level for advanced filtering.
pub use tracing::Level;
