//! Shared data model for the event dispatch core.
//!
//! Every crate in the workspace speaks these types:
//!
//! - [`Event`] - the immutable record produced by one `track` call
//! - [`EventId`] / [`DestinationId`] - identity of events and delivery sinks
//! - [`QueueItem`] - an event plus the destinations still owed a delivery
//! - [`ConsentDecision`] - the latest consent state from the consent provider
//! - [`ParkedEvent`] - an event the consent gate keeps until a decision
//! - [`TransformationScope`] / [`BarrierScope`] - applicability selectors
//!
//! Event payloads use `serde_json::Value` with insertion order preserved, so
//! the data map of an event round-trips through the queue unchanged.

mod consent;
mod event;
mod ids;
mod scope;

pub use consent::{ConsentDecision, DecisionKind, ParkedChange, ParkedEvent, ParkedKind};
pub use event::{Event, EventData, QueueItem, Value};
pub use ids::{DestinationId, EventId};
pub use scope::{BarrierScope, ScopedBarrier, ScopedTransformation, TransformationScope};
