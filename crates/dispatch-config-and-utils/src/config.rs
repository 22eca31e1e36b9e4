//! Configuration for the dispatch core.

use crate::{CoreError, CoreResult, Paths};
use dispatch_types::DestinationId;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default log level.
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Retry policy for the built-in backoff interceptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Initial retry delay in milliseconds.
    pub backoff_base_ms: u64,
    /// Maximum retry delay in milliseconds.
    pub backoff_max_ms: u64,
    /// Maximum retry attempts after the first one.
    pub max_retries: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            backoff_base_ms: 1000,
            backoff_max_ms: 60000,
            max_retries: 10,
        }
    }
}

/// Consent gating settings. Absent means events are never held for consent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsentConfig {
    /// Purpose every decision must grant before anything is enqueued.
    pub required_purpose: String,
    /// Destinations that receive refire copies under partial implicit consent.
    pub refire_destinations: Vec<DestinationId>,
}

impl Default for ConsentConfig {
    fn default() -> Self {
        Self {
            required_purpose: "essential".to_string(),
            refire_destinations: Vec::new(),
        }
    }
}

/// Dispatch core configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
    /// Maximum number of distinct events kept in the queue.
    pub queue_capacity: usize,
    /// Age after which queued events are dropped. `None` keeps them forever.
    pub expiration_secs: Option<u64>,
    /// Ceiling of claimed-but-unacknowledged events per destination.
    pub max_inflight_per_destination: usize,
    /// Events per deliver call for destinations that do not set their own limit.
    pub default_dispatch_limit: usize,
    /// First cooldown after a failed delivery, in milliseconds.
    pub cooldown_base_ms: u64,
    /// Cooldown cap, in milliseconds.
    pub cooldown_max_ms: u64,
    /// Retry chain defaults.
    pub retry: RetryConfig,
    /// Consent gating; `None` disables the consent gate.
    pub consent: Option<ConsentConfig>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            log_level: DEFAULT_LOG_LEVEL.to_string(),
            queue_capacity: 100,
            expiration_secs: Some(86_400),
            max_inflight_per_destination: 50,
            default_dispatch_limit: 1,
            cooldown_base_ms: 1000,
            cooldown_max_ms: 60000,
            retry: RetryConfig::default(),
            consent: None,
        }
    }
}

impl DispatchConfig {
    /// Create a new config with default values, then override from environment.
    pub fn new() -> Self {
        let mut config = Self::default();
        config.load_from_env();
        config
    }

    /// Load configuration from the config file, falling back to defaults.
    pub fn load(paths: &Paths) -> CoreResult<Self> {
        let config_path = paths.config_file();

        let mut config = if config_path.exists() {
            Self::load_from_file(&config_path)?
        } else {
            Self::default()
        };

        config.load_from_env();
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file.
    pub fn load_from_file(path: &Path) -> CoreResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: DispatchConfig = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to the config file.
    pub fn save(&self, paths: &Paths) -> CoreResult<()> {
        paths.ensure_dirs()?;
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(paths.config_file(), content)?;
        Ok(())
    }

    /// Override configuration from environment variables.
    fn load_from_env(&mut self) {
        if let Ok(log_level) = std::env::var("DISPATCH_LOG_LEVEL") {
            self.log_level = log_level;
        }
        if let Some(capacity) = std::env::var("DISPATCH_QUEUE_CAPACITY")
            .ok()
            .and_then(|raw| raw.trim().parse::<usize>().ok())
        {
            self.queue_capacity = capacity;
        }
    }

    /// Reject values the dispatch loops cannot work with.
    pub fn validate(&self) -> CoreResult<()> {
        if self.queue_capacity == 0 {
            return Err(CoreError::Config("queue_capacity must be at least 1".into()));
        }
        if self.max_inflight_per_destination == 0 {
            return Err(CoreError::Config(
                "max_inflight_per_destination must be at least 1".into(),
            ));
        }
        if self.default_dispatch_limit == 0 {
            return Err(CoreError::Config(
                "default_dispatch_limit must be at least 1".into(),
            ));
        }
        if self.cooldown_base_ms > self.cooldown_max_ms {
            return Err(CoreError::Config(
                "cooldown_base_ms must not exceed cooldown_max_ms".into(),
            ));
        }
        if let Some(consent) = &self.consent {
            if consent.required_purpose.trim().is_empty() {
                return Err(CoreError::Config("consent.required_purpose is empty".into()));
            }
        }
        Ok(())
    }

    pub fn expiration(&self) -> Option<Duration> {
        self.expiration_secs.map(Duration::from_secs)
    }

    pub fn cooldown_base(&self) -> Duration {
        Duration::from_millis(self.cooldown_base_ms)
    }

    pub fn cooldown_max(&self) -> Duration {
        Duration::from_millis(self.cooldown_max_ms)
    }
}
