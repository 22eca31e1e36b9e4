//! The destination contract.

use dispatch_types::{DestinationId, Event, EventId};
use tokio::sync::mpsc;
use tracing::debug;

use crate::{CancelToken, DeliveryError};

/// Terminal result for a group of events handed to a destination.
#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryReport {
    Delivered(Vec<EventId>),
    /// The destination gave up on these events. They are released like
    /// delivered ones; the error only slows the destination down.
    Failed {
        ids: Vec<EventId>,
        error: DeliveryError,
    },
}

impl DeliveryReport {
    pub fn ids(&self) -> &[EventId] {
        match self {
            DeliveryReport::Delivered(ids) => ids,
            DeliveryReport::Failed { ids, .. } => ids,
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, DeliveryReport::Failed { .. })
    }
}

/// A report together with the cancellation state of the `deliver` call that
/// produced it.
#[derive(Debug, Clone)]
pub struct AckEnvelope {
    pub report: DeliveryReport,
    pub token: CancelToken,
}

/// Completion handle passed to [`Dispatcher::deliver`].
///
/// May be used any number of times, from any task, until every event of the
/// call has been reported. Reports made after the orchestrator cancelled the
/// handle are ignored.
#[derive(Clone, Debug)]
pub struct DeliveryAcks {
    destination: DestinationId,
    sender: mpsc::UnboundedSender<AckEnvelope>,
    token: CancelToken,
}

impl DeliveryAcks {
    pub fn new(destination: DestinationId, sender: mpsc::UnboundedSender<AckEnvelope>) -> Self {
        Self {
            destination,
            sender,
            token: CancelToken::new(),
        }
    }

    pub fn destination(&self) -> &DestinationId {
        &self.destination
    }

    pub fn delivered(&self, ids: Vec<EventId>) {
        self.report(DeliveryReport::Delivered(ids));
    }

    pub fn failed(&self, ids: Vec<EventId>, error: DeliveryError) {
        self.report(DeliveryReport::Failed { ids, error });
    }

    pub fn report(&self, report: DeliveryReport) {
        if report.ids().is_empty() {
            return;
        }
        let envelope = AckEnvelope {
            report,
            token: self.token.clone(),
        };
        if self.sender.send(envelope).is_err() {
            debug!(destination = %self.destination, "Acknowledgement after loop stopped");
        }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Completes once the orchestrator cancelled this handle.
    pub async fn cancelled(&self) {
        self.token.cancelled().await;
    }

    pub fn token(&self) -> CancelToken {
        self.token.clone()
    }
}

/// A delivery destination.
pub trait Dispatcher: Send + Sync {
    fn id(&self) -> &DestinationId;

    /// Maximum events per `deliver` call. `None` uses the configured default.
    fn dispatch_limit(&self) -> Option<usize> {
        None
    }

    /// Starts delivering `events` and returns immediately. Results are
    /// reported through `acks`.
    fn deliver(&self, events: Vec<Event>, acks: DeliveryAcks);
}
