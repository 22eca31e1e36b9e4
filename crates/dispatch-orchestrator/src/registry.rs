//! Registry of destinations and collectors.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use delivery_retry_chain::Dispatcher;
use dispatch_types::DestinationId;
use parking_lot::RwLock;
use tracing::{info, warn};

use crate::Collector;

/// Registered dispatchers keyed by destination, plus collectors in
/// registration order.
#[derive(Default)]
pub struct ModuleRegistry {
    dispatchers: RwLock<BTreeMap<DestinationId, Arc<dyn Dispatcher>>>,
    collectors: RwLock<Vec<Arc<dyn Collector>>>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `dispatcher`, replacing one with the same destination id.
    /// Returns true when a previous dispatcher was replaced.
    pub fn add_dispatcher(&self, dispatcher: Arc<dyn Dispatcher>) -> bool {
        let id = dispatcher.id().clone();
        let replaced = self
            .dispatchers
            .write()
            .insert(id.clone(), dispatcher)
            .is_some();
        if replaced {
            warn!(destination = %id, "Replaced existing dispatcher");
        } else {
            info!(destination = %id, "Registered dispatcher");
        }
        replaced
    }

    pub fn remove_dispatcher(&self, id: &DestinationId) -> Option<Arc<dyn Dispatcher>> {
        let removed = self.dispatchers.write().remove(id);
        if removed.is_some() {
            info!(destination = %id, "Removed dispatcher");
        }
        removed
    }

    pub fn dispatcher(&self, id: &DestinationId) -> Option<Arc<dyn Dispatcher>> {
        self.dispatchers.read().get(id).cloned()
    }

    pub fn destination_ids(&self) -> BTreeSet<DestinationId> {
        self.dispatchers.read().keys().cloned().collect()
    }

    pub fn add_collector(&self, collector: Arc<dyn Collector>) {
        let mut collectors = self.collectors.write();
        collectors.retain(|c| c.id() != collector.id());
        info!(collector_id = %collector.id(), "Registered collector");
        collectors.push(collector);
    }

    pub fn remove_collector(&self, id: &str) -> bool {
        let mut collectors = self.collectors.write();
        let before = collectors.len();
        collectors.retain(|c| c.id() != id);
        before != collectors.len()
    }

    pub fn collectors(&self) -> Vec<Arc<dyn Collector>> {
        self.collectors.read().clone()
    }
}
