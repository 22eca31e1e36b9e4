//! Queue coordinator.
//!
//! Owns the queue storage, the inflight registry and the consent gate on the
//! serial executor. Every read-modify-write of that state is one job, so a
//! claim can never hand out an id that is already inflight for the same
//! destination and consent routing is atomic with the store it leads to.
//! Events the consent gate parks are written to storage in the same job.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use delivery_retry_chain::CancelToken;
use dispatch_types::{ConsentDecision, DestinationId, Event, EventId};
use event_queue_sqlite_persist::{EventQueueStorage, QueueResult, StoreReport};
use flow_control_gates::{ConsentGate, ConsentRoute};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use crate::{DispatchResult, SerialExecutor};

const NOTICE_CAPACITY: usize = 256;

/// Change notifications for destination loops.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueNotice {
    /// New items were stored for these destinations.
    Stored { destinations: BTreeSet<DestinationId> },
    /// Inflight ids were dropped for these destinations.
    InflightReleased { destinations: BTreeSet<DestinationId> },
}

impl QueueNotice {
    pub fn concerns(&self, destination: &DestinationId) -> bool {
        match self {
            QueueNotice::Stored { destinations } => destinations.contains(destination),
            QueueNotice::InflightReleased { destinations } => destinations.contains(destination),
        }
    }
}

/// Pending and inflight counts for one destination.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DestinationStatus {
    pub pending: usize,
    pub inflight: usize,
}

/// How a tracked event was routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackOutcome {
    /// Stored for every registered destination.
    Enqueued,
    /// Waiting for consent.
    Held,
    /// Refused by an explicit consent decision.
    Discarded,
    /// Dropped by an after-collectors transformation.
    Dropped,
    /// No destination was registered.
    NoDestinations,
}

/// What a consent decision released.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsentSummary {
    pub replayed: usize,
    pub refired: usize,
    pub discarded: usize,
}

/// State living on the serial executor.
pub struct CoreState {
    queue: Box<dyn EventQueueStorage>,
    inflight: HashMap<DestinationId, HashSet<EventId>>,
    consent: Option<ConsentGate>,
}

impl CoreState {
    pub fn new(queue: Box<dyn EventQueueStorage>, consent: Option<ConsentGate>) -> Self {
        Self {
            queue,
            inflight: HashMap::new(),
            consent,
        }
    }

    fn store(
        &mut self,
        events: &[Event],
        destinations: &BTreeSet<DestinationId>,
    ) -> QueueResult<(StoreReport, BTreeSet<DestinationId>)> {
        let destinations: Vec<DestinationId> = destinations.iter().cloned().collect();
        let report = self.queue.store(events, &destinations)?;
        let pruned = self.prune(report.affected_ids().cloned().collect());
        Ok((report, pruned))
    }

    /// Drops inflight ids storage no longer holds for their destination.
    /// Returns the destinations that lost inflight ids.
    fn prune(&mut self, ids: Vec<EventId>) -> BTreeSet<DestinationId> {
        let mut touched = BTreeSet::new();
        if ids.is_empty() {
            return touched;
        }

        for (destination, inflight) in self.inflight.iter_mut() {
            for id in &ids {
                if !inflight.contains(id) {
                    continue;
                }
                match self.queue.contains(destination, id) {
                    Ok(false) => {
                        inflight.remove(id);
                        touched.insert(destination.clone());
                    }
                    Ok(true) => {}
                    Err(e) => {
                        warn!(destination = %destination, event_id = %id, error = %e, "Inflight check failed")
                    }
                }
            }
        }
        if !touched.is_empty() {
            debug!(destinations = touched.len(), "Pruned inflight ids removed from storage");
        }
        touched
    }

    fn inflight_counts(&self) -> HashMap<DestinationId, usize> {
        self.inflight
            .iter()
            .map(|(destination, ids)| (destination.clone(), ids.len()))
            .collect()
    }

    /// Writes the consent gate's journaled changes to storage.
    fn persist_parked(&mut self) -> QueueResult<()> {
        let Some(gate) = self.consent.as_mut() else {
            return Ok(());
        };
        let changes = gate.take_changes();
        self.queue.apply_parked(&changes)
    }

    fn store_routed(
        &mut self,
        signals: &Signals,
        events: Vec<Event>,
        destinations: &BTreeSet<DestinationId>,
    ) -> QueueResult<usize> {
        if events.is_empty() || destinations.is_empty() {
            return Ok(0);
        }
        let (report, pruned) = self.store(&events, destinations)?;
        signals.stored(destinations, report.stored);
        signals.released(self, pruned);
        Ok(report.stored)
    }
}

/// Sends notifications from the executor thread.
#[derive(Clone)]
struct Signals {
    notices: broadcast::Sender<QueueNotice>,
    inflight: Arc<watch::Sender<HashMap<DestinationId, usize>>>,
}

impl Signals {
    fn stored(&self, destinations: &BTreeSet<DestinationId>, stored: usize) {
        if stored > 0 {
            let _ = self.notices.send(QueueNotice::Stored {
                destinations: destinations.clone(),
            });
        }
    }

    fn released(&self, state: &CoreState, destinations: BTreeSet<DestinationId>) {
        self.publish_counts(state);
        if !destinations.is_empty() {
            let _ = self.notices.send(QueueNotice::InflightReleased { destinations });
        }
    }

    fn publish_counts(&self, state: &CoreState) {
        self.inflight.send_replace(state.inflight_counts());
    }
}

/// Async front of the queue, inflight registry and consent gate.
#[derive(Clone)]
pub struct QueueCoordinator {
    executor: SerialExecutor<CoreState>,
    signals: Signals,
}

impl QueueCoordinator {
    pub fn new(state: CoreState) -> DispatchResult<Self> {
        let executor = SerialExecutor::spawn("dispatch-serial", state)?;
        let (notices, _) = broadcast::channel(NOTICE_CAPACITY);
        let (inflight, _) = watch::channel(HashMap::new());
        Ok(Self {
            executor,
            signals: Signals {
                notices,
                inflight: Arc::new(inflight),
            },
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueNotice> {
        self.signals.notices.subscribe()
    }

    /// Inflight count per destination, updated after every change.
    pub fn inflight_counts(&self) -> watch::Receiver<HashMap<DestinationId, usize>> {
        self.signals.inflight.subscribe()
    }

    /// Stores `events` for `destinations`.
    pub async fn enqueue(
        &self,
        events: Vec<Event>,
        destinations: BTreeSet<DestinationId>,
    ) -> DispatchResult<usize> {
        let signals = self.signals.clone();
        let stored = self
            .executor
            .call(move |state| state.store_routed(&signals, events, &destinations))
            .await??;
        Ok(stored)
    }

    /// Claims up to `limit` events for `destination` without letting its
    /// inflight set grow past `ceiling`.
    pub async fn claim(
        &self,
        destination: &DestinationId,
        limit: usize,
        ceiling: usize,
    ) -> DispatchResult<Vec<Event>> {
        let signals = self.signals.clone();
        let destination = destination.clone();
        let claimed = self
            .executor
            .call(move |state| -> QueueResult<Vec<Event>> {
                let inflight = state.inflight.entry(destination.clone()).or_default();
                let room = ceiling.saturating_sub(inflight.len()).min(limit);
                if room == 0 {
                    return Ok(Vec::new());
                }

                let excluding = inflight.clone();
                let events = state.queue.claim(&destination, room, &excluding)?;
                if events.is_empty() {
                    return Ok(events);
                }

                let inflight = state.inflight.entry(destination.clone()).or_default();
                inflight.extend(events.iter().map(|e| e.id().clone()));
                debug!(
                    destination = %destination,
                    claimed = events.len(),
                    inflight = inflight.len(),
                    "Claimed events"
                );
                signals.publish_counts(state);
                Ok(events)
            })
            .await??;
        Ok(claimed)
    }

    /// Releases `ids` for `destination`: inflight first, then storage.
    ///
    /// Ignored when `token` was cancelled by the time the job runs.
    pub async fn release(
        &self,
        destination: &DestinationId,
        ids: Vec<EventId>,
        token: Option<CancelToken>,
    ) -> DispatchResult<usize> {
        let signals = self.signals.clone();
        let destination = destination.clone();
        let released = self
            .executor
            .call(move |state| -> QueueResult<usize> {
                if token.as_ref().is_some_and(CancelToken::is_cancelled) {
                    debug!(destination = %destination, ids = ids.len(), "Ignoring cancelled release");
                    return Ok(0);
                }

                if let Some(inflight) = state.inflight.get_mut(&destination) {
                    for id in &ids {
                        inflight.remove(id);
                    }
                }
                let released = state.queue.release(&ids, &destination)?;
                signals.released(state, BTreeSet::from([destination]));
                Ok(released)
            })
            .await??;
        Ok(released)
    }

    /// Forgets every inflight id of `destination`.
    pub async fn clear_inflight(&self, destination: &DestinationId) -> DispatchResult<usize> {
        let signals = self.signals.clone();
        let target = destination.clone();
        let cleared = self
            .executor
            .call(move |state| {
                let cleared = state
                    .inflight
                    .remove(&target)
                    .map_or(0, |ids| ids.len());
                signals.publish_counts(state);
                cleared
            })
            .await?;
        if cleared > 0 {
            info!(destination = %destination, cleared, "Cleared inflight events");
        }
        Ok(cleared)
    }

    pub async fn resize(&self, capacity: usize) -> DispatchResult<Vec<EventId>> {
        let signals = self.signals.clone();
        let evicted = self
            .executor
            .call(move |state| -> QueueResult<Vec<EventId>> {
                let evicted = state.queue.resize(capacity)?;
                let pruned = state.prune(evicted.clone());
                signals.released(state, pruned);
                if let Some(consent) = state.consent.as_mut() {
                    consent.set_held_capacity(capacity);
                }
                state.persist_parked()?;
                Ok(evicted)
            })
            .await??;
        Ok(evicted)
    }

    pub async fn set_expiration(&self, ttl: Option<Duration>) -> DispatchResult<Vec<EventId>> {
        let signals = self.signals.clone();
        let expired = self
            .executor
            .call(move |state| -> QueueResult<Vec<EventId>> {
                let expired = state.queue.set_expiration(ttl)?;
                let pruned = state.prune(expired.clone());
                signals.released(state, pruned);
                Ok(expired)
            })
            .await??;
        Ok(expired)
    }

    /// Deletes pending rows of destinations not in `allowed`.
    pub async fn purge_destinations_not_in(
        &self,
        allowed: BTreeSet<DestinationId>,
    ) -> DispatchResult<Vec<EventId>> {
        let signals = self.signals.clone();
        let deleted = self
            .executor
            .call(move |state| -> QueueResult<Vec<EventId>> {
                let allowed: Vec<DestinationId> = allowed.into_iter().collect();
                let deleted = state.queue.delete_for_destinations_not_in(&allowed)?;
                state
                    .inflight
                    .retain(|destination, _| allowed.contains(destination));
                signals.publish_counts(state);
                Ok(deleted)
            })
            .await??;
        if !deleted.is_empty() {
            info!(deleted = deleted.len(), "Purged events for unknown destinations");
        }
        Ok(deleted)
    }

    /// Routes `event` through the consent gate (if any) and stores it for
    /// `destinations`.
    pub async fn route(
        &self,
        event: Event,
        destinations: BTreeSet<DestinationId>,
    ) -> DispatchResult<TrackOutcome> {
        let signals = self.signals.clone();
        let outcome = self
            .executor
            .call(move |state| -> QueueResult<TrackOutcome> {
                let (event, outcome) = match state.consent.as_mut() {
                    None => (Some(event), TrackOutcome::Enqueued),
                    Some(gate) => match gate.route(event) {
                        ConsentRoute::Enqueue(stamped) => (Some(stamped), TrackOutcome::Enqueued),
                        ConsentRoute::Held => (None, TrackOutcome::Held),
                        ConsentRoute::Discarded => (None, TrackOutcome::Discarded),
                    },
                };
                if let Some(event) = event {
                    state.store_routed(&signals, vec![event], &destinations)?;
                }
                state.persist_parked()?;
                Ok(outcome)
            })
            .await??;
        Ok(outcome)
    }

    /// Applies a consent decision and stores what it releases.
    ///
    /// Replayed events go to `destinations`; refire copies go to the
    /// configured refire destinations that are in `destinations`.
    pub async fn apply_consent(
        &self,
        decision: ConsentDecision,
        all_purposes: BTreeSet<String>,
        destinations: BTreeSet<DestinationId>,
    ) -> DispatchResult<ConsentSummary> {
        let signals = self.signals.clone();
        let summary = self
            .executor
            .call(move |state| -> QueueResult<ConsentSummary> {
                let Some(gate) = state.consent.as_mut() else {
                    return Ok(ConsentSummary::default());
                };
                gate.set_all_purposes(all_purposes);
                let outcome = gate.apply_decision(decision);
                let refire_destinations: BTreeSet<DestinationId> = gate
                    .refire_destinations()
                    .intersection(&destinations)
                    .cloned()
                    .collect();

                let summary = ConsentSummary {
                    replayed: outcome.normal.len(),
                    refired: outcome.refire.len(),
                    discarded: outcome.discarded,
                };
                state.store_routed(&signals, outcome.normal, &destinations)?;
                state.store_routed(&signals, outcome.refire, &refire_destinations)?;
                state.persist_parked()?;
                Ok(summary)
            })
            .await??;
        Ok(summary)
    }

    /// Reloads the events the consent gate parked before a restart.
    pub async fn restore_parked(&self) -> DispatchResult<usize> {
        let restored = self
            .executor
            .call(|state| -> QueueResult<usize> {
                let parked = state.queue.parked()?;
                let count = parked.len();
                let Some(gate) = state.consent.as_mut() else {
                    if count > 0 {
                        warn!(parked = count, "Consent not configured, parked events left in storage");
                    }
                    return Ok(0);
                };
                gate.restore(parked);
                state.persist_parked()?;
                Ok(count)
            })
            .await??;
        Ok(restored)
    }

    /// Pending and inflight counts for every destination that has either.
    pub async fn status(&self) -> DispatchResult<BTreeMap<DestinationId, DestinationStatus>> {
        let status = self
            .executor
            .call(|state| -> QueueResult<BTreeMap<DestinationId, DestinationStatus>> {
                let mut status = BTreeMap::new();
                for destination in state.queue.pending_destinations()? {
                    let pending = state.queue.count_for(&destination)?;
                    status.insert(
                        destination,
                        DestinationStatus {
                            pending,
                            inflight: 0,
                        },
                    );
                }
                for (destination, ids) in &state.inflight {
                    if ids.is_empty() {
                        continue;
                    }
                    status
                        .entry(destination.clone())
                        .or_insert_with(DestinationStatus::default)
                        .inflight = ids.len();
                }
                Ok(status)
            })
            .await??;
        Ok(status)
    }

    /// Number of distinct stored events.
    pub async fn count(&self) -> DispatchResult<usize> {
        Ok(self.executor.call(|state| state.queue.count()).await??)
    }

    /// Events held by the consent gate.
    pub async fn held_count(&self) -> DispatchResult<usize> {
        self.executor
            .call(|state| state.consent.as_ref().map_or(0, ConsentGate::held_count))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dispatch_config_and_utils::ConsentConfig;
    use dispatch_types::EventData;
    use event_queue_sqlite_persist::SqliteEventQueue;
    use tempfile::tempdir;

    fn coordinator(capacity: usize) -> QueueCoordinator {
        let queue = SqliteEventQueue::open_in_memory(capacity).unwrap();
        QueueCoordinator::new(CoreState::new(Box::new(queue), None)).unwrap()
    }

    fn dests(names: &[&str]) -> BTreeSet<DestinationId> {
        names.iter().map(|n| DestinationId::from(*n)).collect()
    }

    fn events(n: usize) -> Vec<Event> {
        (0..n).map(|i| Event::new(format!("e{i}"), EventData::new())).collect()
    }

    #[tokio::test]
    async fn test_claim_never_returns_inflight_ids() {
        let coordinator = coordinator(10);
        let x = DestinationId::from("x");
        coordinator.enqueue(events(3), dests(&["x"])).await.unwrap();

        let first = coordinator.claim(&x, 2, 50).await.unwrap();
        let second = coordinator.claim(&x, 2, 50).await.unwrap();
        let third = coordinator.claim(&x, 2, 50).await.unwrap();

        assert_eq!(first.len(), 2);
        assert_eq!(second.len(), 1);
        assert!(third.is_empty());
        assert!(first.iter().all(|e| e.id() != second[0].id()));
    }

    #[tokio::test]
    async fn test_ceiling_limits_claims() {
        let coordinator = coordinator(10);
        let x = DestinationId::from("x");
        coordinator.enqueue(events(5), dests(&["x"])).await.unwrap();

        assert_eq!(coordinator.claim(&x, 10, 3).await.unwrap().len(), 3);
        assert!(coordinator.claim(&x, 10, 3).await.unwrap().is_empty());

        let status = coordinator.status().await.unwrap();
        assert_eq!(status[&x], DestinationStatus { pending: 5, inflight: 3 });
    }

    #[tokio::test]
    async fn test_release_frees_inflight_and_storage() {
        let coordinator = coordinator(10);
        let x = DestinationId::from("x");
        let y = DestinationId::from("y");
        coordinator.enqueue(events(1), dests(&["x", "y"])).await.unwrap();

        let claimed = coordinator.claim(&x, 1, 50).await.unwrap();
        let ids: Vec<EventId> = claimed.iter().map(|e| e.id().clone()).collect();
        assert_eq!(coordinator.release(&x, ids, None).await.unwrap(), 1);

        let status = coordinator.status().await.unwrap();
        assert!(!status.contains_key(&x));
        assert_eq!(status[&y].pending, 1);
        assert_eq!(coordinator.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_release_is_ignored() {
        let coordinator = coordinator(10);
        let x = DestinationId::from("x");
        coordinator.enqueue(events(1), dests(&["x"])).await.unwrap();
        let claimed = coordinator.claim(&x, 1, 50).await.unwrap();

        let token = CancelToken::new();
        token.cancel();
        let ids = vec![claimed[0].id().clone()];
        assert_eq!(coordinator.release(&x, ids, Some(token)).await.unwrap(), 0);
        assert_eq!(coordinator.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_eviction_prunes_inflight() {
        let coordinator = coordinator(1);
        let x = DestinationId::from("x");
        let mut counts = coordinator.inflight_counts();

        coordinator.enqueue(events(1), dests(&["x"])).await.unwrap();
        assert_eq!(coordinator.claim(&x, 1, 50).await.unwrap().len(), 1);
        assert_eq!(counts.borrow_and_update().get(&x), Some(&1));

        coordinator.enqueue(events(1), dests(&["x"])).await.unwrap();
        assert_eq!(counts.borrow_and_update().get(&x), Some(&0));

        // The replacement event is claimable.
        assert_eq!(coordinator.claim(&x, 1, 1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_stored_notice_names_destinations() {
        let coordinator = coordinator(10);
        let mut notices = coordinator.subscribe();
        coordinator.enqueue(events(1), dests(&["x", "y"])).await.unwrap();

        assert_eq!(
            notices.recv().await.unwrap(),
            QueueNotice::Stored {
                destinations: dests(&["x", "y"])
            }
        );
    }

    #[tokio::test]
    async fn test_route_through_consent() {
        let queue = SqliteEventQueue::open_in_memory(10).unwrap();
        let config = ConsentConfig {
            required_purpose: "platform".into(),
            refire_destinations: vec![DestinationId::from("refire")],
        };
        let coordinator = QueueCoordinator::new(CoreState::new(
            Box::new(queue),
            Some(ConsentGate::new(&config, 10)),
        ))
        .unwrap();
        let all = dests(&["x", "refire"]);

        let outcome = coordinator
            .route(events(1).remove(0), all.clone())
            .await
            .unwrap();
        assert_eq!(outcome, TrackOutcome::Held);
        assert_eq!(coordinator.held_count().await.unwrap(), 1);
        assert_eq!(coordinator.count().await.unwrap(), 0);

        let purposes: BTreeSet<String> = ["platform", "analytics"].into_iter().map(String::from).collect();
        let summary = coordinator
            .apply_consent(ConsentDecision::implicit(["platform"]), purposes.clone(), all.clone())
            .await
            .unwrap();
        assert_eq!(summary.replayed, 1);
        assert_eq!(coordinator.count().await.unwrap(), 1);

        let summary = coordinator
            .apply_consent(ConsentDecision::explicit(["platform", "analytics"]), purposes, all)
            .await
            .unwrap();
        assert_eq!(summary, ConsentSummary { replayed: 0, refired: 1, discarded: 0 });

        let status = coordinator.status().await.unwrap();
        assert_eq!(status[&DestinationId::from("x")].pending, 1);
        assert_eq!(status[&DestinationId::from("refire")].pending, 2);
    }

    #[tokio::test]
    async fn test_parked_events_reload_after_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("queue.sqlite");
        let config = ConsentConfig {
            required_purpose: "platform".into(),
            refire_destinations: vec![DestinationId::from("refire")],
        };
        let open = |path: &std::path::Path| {
            let queue = SqliteEventQueue::open(path, 10).unwrap();
            QueueCoordinator::new(CoreState::new(
                Box::new(queue),
                Some(ConsentGate::new(&config, 10)),
            ))
            .unwrap()
        };

        {
            let coordinator = open(&path);
            for event in events(2) {
                coordinator.route(event, dests(&["x"])).await.unwrap();
            }
            assert_eq!(coordinator.held_count().await.unwrap(), 2);
        }

        let coordinator = open(&path);
        assert_eq!(coordinator.held_count().await.unwrap(), 0);
        assert_eq!(coordinator.restore_parked().await.unwrap(), 2);
        assert_eq!(coordinator.held_count().await.unwrap(), 2);

        let purposes: BTreeSet<String> = ["platform"].into_iter().map(String::from).collect();
        let summary = coordinator
            .apply_consent(ConsentDecision::explicit(["platform"]), purposes, dests(&["x"]))
            .await
            .unwrap();
        assert_eq!(summary.replayed, 2);
        assert_eq!(coordinator.count().await.unwrap(), 2);
    }
}
