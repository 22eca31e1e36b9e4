//! Scenario tests for the dispatch core.
//!
//! - `capacity.rs`  - queue bound shared across destinations, resizing
//! - `delivery.rs`  - inflight ceiling, acknowledgements, failures, drops
//! - `barriers.rs`  - suspension and reopen of destination loops
//! - `consent.rs`   - held events, refusal, refire copies
//! - `lifecycle.rs` - start, removal, collectors, shutdown

mod barriers;
mod consent;

use std::sync::Arc;
use std::time::Duration;

use delivery_retry_chain::{DeliveryAcks, DeliveryError, Dispatcher};
use dispatch_config_and_utils::{ConfigHandle, DispatchConfig};
use dispatch_types::{DestinationId, Event, EventData, EventId};
use event_queue_sqlite_persist::SqliteEventQueue;
use parking_lot::Mutex;
use tokio::time::{sleep, Instant};

use crate::{DestinationStatus, DispatchCore, DispatchCoreBuilder};

/// How a [`RecordingDispatcher`] answers a `deliver` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Mode {
    Ack,
    Fail,
    /// Keeps the acks handle and never reports.
    Never,
}

/// Records every event handed to it.
pub(super) struct RecordingDispatcher {
    id: DestinationId,
    limit: Option<usize>,
    mode: Mutex<Mode>,
    events: Mutex<Vec<Event>>,
    calls: Mutex<usize>,
    kept: Mutex<Vec<(DeliveryAcks, Vec<EventId>)>>,
}

impl RecordingDispatcher {
    pub(super) fn new(id: &str, mode: Mode) -> Arc<Self> {
        Arc::new(Self {
            id: DestinationId::from(id),
            limit: None,
            mode: Mutex::new(mode),
            events: Mutex::new(Vec::new()),
            calls: Mutex::new(0),
            kept: Mutex::new(Vec::new()),
        })
    }

    pub(super) fn with_limit(id: &str, mode: Mode, limit: usize) -> Arc<Self> {
        Arc::new(Self {
            id: DestinationId::from(id),
            limit: Some(limit),
            mode: Mutex::new(mode),
            events: Mutex::new(Vec::new()),
            calls: Mutex::new(0),
            kept: Mutex::new(Vec::new()),
        })
    }

    pub(super) fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    pub(super) fn names(&self) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .map(|e| e.name().to_string())
            .collect()
    }

    pub(super) fn count(&self) -> usize {
        self.events.lock().len()
    }

    pub(super) fn calls(&self) -> usize {
        *self.calls.lock()
    }

    pub(super) fn set_mode(&self, mode: Mode) {
        *self.mode.lock() = mode;
    }

    /// Acknowledges everything kept in `Never` mode.
    pub(super) fn ack_kept(&self) {
        for (acks, ids) in self.kept.lock().drain(..) {
            acks.delivered(ids);
        }
    }
}

impl Dispatcher for RecordingDispatcher {
    fn id(&self) -> &DestinationId {
        &self.id
    }

    fn dispatch_limit(&self) -> Option<usize> {
        self.limit
    }

    fn deliver(&self, events: Vec<Event>, acks: DeliveryAcks) {
        let ids: Vec<EventId> = events.iter().map(|e| e.id().clone()).collect();
        self.events.lock().extend(events);
        *self.calls.lock() += 1;

        let mode = *self.mode.lock();
        match mode {
            Mode::Ack => acks.delivered(ids),
            Mode::Fail => acks.failed(ids, DeliveryError::Transport("destination down".into())),
            Mode::Never => self.kept.lock().push((acks, ids)),
        }
    }
}

pub(super) fn config(adjust: impl FnOnce(&mut DispatchConfig)) -> ConfigHandle {
    let mut config = DispatchConfig::default();
    adjust(&mut config);
    ConfigHandle::new(config).unwrap()
}

/// Builder over an in-memory queue sized from `config`.
pub(super) fn builder(config: &ConfigHandle) -> DispatchCoreBuilder {
    let capacity = config.current().config.queue_capacity;
    DispatchCore::builder(config.clone())
        .storage(Box::new(SqliteEventQueue::open_in_memory(capacity).unwrap()))
}

pub(super) fn event(name: &str) -> Event {
    Event::new(name, EventData::new())
}

pub(super) fn dest(name: &str) -> DestinationId {
    DestinationId::from(name)
}

/// Polls `check` until it holds, failing the test after a few seconds.
pub(super) async fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(3);
    while !check() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        sleep(Duration::from_millis(10)).await;
    }
}

/// Polls the core's status for `destination` until it equals `expected`.
pub(super) async fn wait_for_status(
    core: &DispatchCore,
    destination: &DestinationId,
    expected: DestinationStatus,
) {
    let deadline = Instant::now() + Duration::from_secs(3);
    loop {
        let status = core.status().await.unwrap();
        let current = status.get(destination).copied().unwrap_or_default();
        if current == expected {
            return;
        }
        assert!(
            Instant::now() < deadline,
            "timed out waiting for {destination} status {expected:?}, last {current:?}"
        );
        sleep(Duration::from_millis(10)).await;
    }
}

/// Polls until the queue holds `expected` distinct events.
pub(super) async fn wait_for_count(core: &DispatchCore, expected: usize) {
    let deadline = Instant::now() + Duration::from_secs(3);
    loop {
        let count = core.coordinator().count().await.unwrap();
        if count == expected {
            return;
        }
        assert!(
            Instant::now() < deadline,
            "timed out waiting for queue count {expected}, last {count}"
        );
        sleep(Duration::from_millis(10)).await;
    }
}

/// Gives background tasks time to act on something they should ignore.
pub(super) async fn settle() {
    sleep(Duration::from_millis(100)).await;
}
