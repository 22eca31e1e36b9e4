//! Logging initialization for the dispatch core.
//!
//! Thin wrapper over the observability package: structured JSONL to the
//! central log file plus compact stderr output.

use observability::LogConfig;

/// Initialize logging for the dispatch core.
///
/// `RUST_LOG` still takes precedence over `level`.
///
/// ```ignore
/// init_logging("info");
/// tracing::info!("dispatch core started");
/// ```
pub fn init_logging(level: &str) {
    init_logging_for_service("dispatch", level);
}

/// Initialize logging with a custom service name.
pub fn init_logging_for_service(service_name: &str, level: &str) {
    let disable_file = std::env::var("DISPATCH_LOG_FILE")
        .map(|raw| matches!(raw.trim().to_ascii_lowercase().as_str(), "0" | "off" | "false"))
        .unwrap_or(false);

    if let Err(e) = observability::init_with_config(LogConfig {
        service_name: service_name.into(),
        default_level: level.into(),
        disable_file,
        also_stderr: true,
        ..Default::default()
    }) {
        eprintln!("logging init failed: {}", e);
    }
}
