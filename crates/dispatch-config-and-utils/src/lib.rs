//! Configuration, paths, logging and shared errors for the dispatch core.

mod config;
mod error;
mod logging;
mod paths;
mod snapshot;

pub use config::{ConsentConfig, DispatchConfig, RetryConfig, DEFAULT_LOG_LEVEL};
pub use error::{CoreError, CoreResult};
pub use logging::{init_logging, init_logging_for_service};
pub use paths::Paths;
pub use snapshot::{ConfigHandle, ConfigSnapshot};
