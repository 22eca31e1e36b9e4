//! Delivery requests and results.

use dispatch_types::{DestinationId, Event, EventId, Value};
use serde::Serialize;

use crate::DeliveryError;

/// One batch of events bound for one destination.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeliveryRequest {
    pub destination: DestinationId,
    pub events: Vec<Event>,
}

impl DeliveryRequest {
    pub fn new(destination: DestinationId, events: Vec<Event>) -> Self {
        Self {
            destination,
            events,
        }
    }

    pub fn event_ids(&self) -> Vec<EventId> {
        self.events.iter().map(|e| e.id().clone()).collect()
    }
}

/// A successful transport answer.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportResponse {
    pub status: u16,
    pub body: Option<Value>,
}

impl TransportResponse {
    pub fn ok() -> Self {
        Self {
            status: 200,
            body: None,
        }
    }
}

/// Final result of a retry chain.
#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryOutcome {
    Delivered(TransportResponse),
    Failed(DeliveryError),
    Cancelled,
}

impl DeliveryOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, DeliveryOutcome::Delivered(_))
    }
}
