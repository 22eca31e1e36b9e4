//! Destination delivering each batch through a retry chain.

use dispatch_types::{DestinationId, Event};
use tracing::debug;

use crate::{DeliveryAcks, DeliveryOutcome, DeliveryRequest, Dispatcher, RetryChain};

/// Sends every batch as one [`DeliveryRequest`] through a [`RetryChain`] and
/// reports the whole batch once the chain finishes.
pub struct RetryingDispatcher {
    id: DestinationId,
    chain: RetryChain,
    dispatch_limit: Option<usize>,
}

impl RetryingDispatcher {
    pub fn new(id: impl Into<DestinationId>, chain: RetryChain) -> Self {
        Self {
            id: id.into(),
            chain,
            dispatch_limit: None,
        }
    }

    pub fn with_dispatch_limit(mut self, limit: usize) -> Self {
        self.dispatch_limit = Some(limit.max(1));
        self
    }
}

impl Dispatcher for RetryingDispatcher {
    fn id(&self) -> &DestinationId {
        &self.id
    }

    fn dispatch_limit(&self) -> Option<usize> {
        self.dispatch_limit
    }

    fn deliver(&self, events: Vec<Event>, acks: DeliveryAcks) {
        let request = DeliveryRequest::new(self.id.clone(), events);
        let ids = request.event_ids();
        let pending = self.chain.send(request);
        let cancel = pending.cancel_token();

        tokio::spawn(async move {
            let outcome = tokio::select! {
                outcome = pending.outcome() => outcome,
                _ = acks.cancelled() => {
                    cancel.cancel();
                    DeliveryOutcome::Cancelled
                }
            };

            match outcome {
                DeliveryOutcome::Delivered(_) => acks.delivered(ids),
                DeliveryOutcome::Failed(error) => acks.failed(ids, error),
                DeliveryOutcome::Cancelled => {
                    debug!(destination = %acks.destination(), events = ids.len(), "Batch cancelled");
                }
            }
        });
    }
}
