//! Dispatch orchestration for the event dispatch core.
//!
//! This crate ties the queue, gates, pipeline and delivery crates together:
//!
//! - [`SerialExecutor`]: a dedicated thread owning the queue, inflight
//!   registry and consent gate
//! - [`QueueCoordinator`]: claims without double-claiming, releases and
//!   store notifications
//! - [`ModuleRegistry`]: dispatchers and collectors, looked up by id
//! - [`Orchestrator`]: one dispatch loop per destination
//! - [`DispatchCore`]: the `track` facade
//!
//! # Example
//!
//! ```ignore
//! let config = ConfigHandle::new(DispatchConfig::new())?;
//! let core = DispatchCore::builder(config)
//!     .dispatcher(Arc::new(my_dispatcher))
//!     .build()?;
//! core.start().await?;
//! core.track(Event::new("app_open", EventData::new()))?;
//! ```

mod collector;
mod coordinator;
mod dispatch_core;
mod error;
mod executor;
mod orchestrator;
mod registry;

#[cfg(test)]
mod tests;

pub use collector::{CollectContext, Collector, StaticCollector};
pub use coordinator::{
    ConsentSummary, CoreState, DestinationStatus, QueueCoordinator, QueueNotice, TrackOutcome,
};
pub use dispatch_core::{DispatchCore, DispatchCoreBuilder};
pub use error::{DispatchError, DispatchResult};
pub use executor::SerialExecutor;
pub use orchestrator::Orchestrator;
pub use registry::ModuleRegistry;
