//! Storage contract for the persistent event queue.

use std::collections::{BTreeSet, HashSet};
use std::time::Duration;

use dispatch_types::{DestinationId, Event, EventId, ParkedChange, ParkedEvent};

use crate::QueueResult;

/// What a `store` call changed besides inserting the new rows.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreReport {
    /// Number of events written.
    pub stored: usize,
    /// Ids that already existed and were replaced.
    pub replaced: Vec<EventId>,
    /// Ids removed because they passed the expiration age.
    pub expired: Vec<EventId>,
    /// Ids removed to bring the queue back under capacity.
    pub evicted: Vec<EventId>,
}

impl StoreReport {
    /// Ids whose stored destination set may have shrunk or vanished.
    pub fn affected_ids(&self) -> impl Iterator<Item = &EventId> {
        self.replaced
            .iter()
            .chain(self.expired.iter())
            .chain(self.evicted.iter())
    }
}

/// A bounded, multi-destination event queue.
///
/// Implementations are driven from a single execution context and are not
/// required to be `Sync`.
pub trait EventQueueStorage: Send {
    /// Stores `events` for every destination in `destinations`.
    ///
    /// Existing ids are replaced. An empty destination list stores nothing.
    /// Expired items are purged and capacity is enforced after the insert.
    fn store(&mut self, events: &[Event], destinations: &[DestinationId])
        -> QueueResult<StoreReport>;

    /// Returns up to `limit` events pending for `destination`, oldest first,
    /// skipping ids in `excluding` and expired items.
    fn claim(
        &mut self,
        destination: &DestinationId,
        limit: usize,
        excluding: &HashSet<EventId>,
    ) -> QueueResult<Vec<Event>>;

    /// Drops `destination` from each listed item, deleting items left with no
    /// destination. Returns the number of destination rows removed.
    fn release(&mut self, ids: &[EventId], destination: &DestinationId) -> QueueResult<usize>;

    /// Changes the capacity, evicting oldest items if the queue is now over it.
    fn resize(&mut self, capacity: usize) -> QueueResult<Vec<EventId>>;

    /// Sets the maximum item age and purges items already older than it.
    fn set_expiration(&mut self, ttl: Option<Duration>) -> QueueResult<Vec<EventId>>;

    /// Removes pending rows for every destination not in `allowed`.
    ///
    /// Returns the ids of items deleted because no destination remained.
    fn delete_for_destinations_not_in(
        &mut self,
        allowed: &[DestinationId],
    ) -> QueueResult<Vec<EventId>>;

    /// Number of distinct items.
    fn count(&self) -> QueueResult<usize>;

    /// Number of items pending for `destination` (expired items included
    /// until they are purged).
    fn count_for(&self, destination: &DestinationId) -> QueueResult<usize>;

    /// Whether `id` is still pending for `destination`.
    fn contains(&self, destination: &DestinationId, id: &EventId) -> QueueResult<bool>;

    /// Destinations with at least one pending item.
    fn pending_destinations(&self) -> QueueResult<BTreeSet<DestinationId>>;

    fn capacity(&self) -> usize;

    /// Applies consent gate changes in order, in one transaction. Parked
    /// events are not queue items: they do not count toward the capacity and
    /// are untouched by destination purges.
    fn apply_parked(&mut self, changes: &[ParkedChange]) -> QueueResult<()>;

    /// Every parked event, oldest first.
    fn parked(&self) -> QueueResult<Vec<ParkedEvent>>;
}
