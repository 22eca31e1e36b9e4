//! Collectors add context data to every tracked event.

use async_trait::async_trait;
use dispatch_types::{EventData, EventId};

/// What a collector knows about the event it is enriching.
#[derive(Debug, Clone)]
pub struct CollectContext {
    pub event_id: EventId,
    pub event_name: String,
    pub timestamp_ms: i64,
}

/// Supplies extra data merged into each tracked event.
///
/// Keys already present on the event, or produced by an earlier collector,
/// win over the collector's.
#[async_trait]
pub trait Collector: Send + Sync {
    fn id(&self) -> &str;

    async fn collect(&self, context: &CollectContext) -> EventData;
}

/// A collector returning the same data every time (app version, platform).
pub struct StaticCollector {
    id: String,
    data: EventData,
}

impl StaticCollector {
    pub fn new(id: impl Into<String>, data: EventData) -> Self {
        Self {
            id: id.into(),
            data,
        }
    }
}

#[async_trait]
impl Collector for StaticCollector {
    fn id(&self) -> &str {
        &self.id
    }

    async fn collect(&self, _context: &CollectContext) -> EventData {
        self.data.clone()
    }
}
