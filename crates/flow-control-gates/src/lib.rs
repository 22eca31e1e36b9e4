//! Flow-control gates.
//!
//! - [`BarrierGate`] combines registered [`Barrier`]s into one open/closed
//!   signal per destination.
//! - [`ConsentGate`] decides whether tracked events are enqueued, held until
//!   a consent decision arrives, or discarded.

mod barrier;
mod consent;

pub use barrier::{Barrier, BarrierGate, BarrierState, SwitchBarrier};
pub use consent::{
    ConsentGate, ConsentOutcome, ConsentProvider, ConsentRoute, ManualConsentProvider,
    CONSENT_TYPE_KEY, PURPOSES_ALL_KEY, PURPOSES_PROCESSED_KEY, PURPOSES_UNPROCESSED_KEY,
};
