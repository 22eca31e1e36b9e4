//! Barrier suspension and reopen.

use std::sync::Arc;

use delivery_retry_chain::{DeliveryAcks, Dispatcher};
use dispatch_types::{BarrierScope, DestinationId, Event, ScopedBarrier};
use flow_control_gates::{BarrierState, SwitchBarrier};
use parking_lot::Mutex;

use super::{builder, config, dest, event, settle, wait_for_status, wait_until, Mode, RecordingDispatcher};
use crate::DestinationStatus;

#[tokio::test]
async fn barrier_closed_before_first_claim() {
    let config = config(|_| {});
    let network = Arc::new(SwitchBarrier::new("network", BarrierState::Closed));
    let x = RecordingDispatcher::new("x", Mode::Ack);
    let core = builder(&config)
        .dispatcher(x.clone())
        .barrier(network.clone())
        .scoped_barrier(ScopedBarrier::new("network", [BarrierScope::All]))
        .build()
        .unwrap();
    core.start().await.unwrap();

    core.track_and_wait(event("a")).await.unwrap();
    core.track_and_wait(event("b")).await.unwrap();
    settle().await;

    assert_eq!(x.calls(), 0);
    wait_for_status(&core, &dest("x"), DestinationStatus { pending: 2, inflight: 0 }).await;

    // Opening alone triggers the claim, no new event needed.
    network.open();
    wait_until("delivered after reopen", || x.count() == 2).await;
    assert_eq!(x.names(), vec!["a", "b"]);

    core.shutdown().await;
}

#[tokio::test]
async fn destination_scoped_barrier_blocks_only_its_destination() {
    let config = config(|_| {});
    let batching = Arc::new(SwitchBarrier::new("batching", BarrierState::Closed));
    let x = RecordingDispatcher::new("x", Mode::Ack);
    let y = RecordingDispatcher::new("y", Mode::Ack);
    let core = builder(&config)
        .dispatcher(x.clone())
        .dispatcher(y.clone())
        .barrier(batching.clone())
        .scoped_barrier(ScopedBarrier::new(
            "batching",
            [BarrierScope::Destination(dest("x"))],
        ))
        .build()
        .unwrap();
    core.start().await.unwrap();

    core.track_and_wait(event("a")).await.unwrap();
    wait_until("y delivered", || y.count() == 1).await;
    settle().await;
    assert_eq!(x.count(), 0);

    batching.open();
    wait_until("x delivered", || x.count() == 1).await;

    core.shutdown().await;
}

#[tokio::test]
async fn closing_barrier_suspends_delivery() {
    let config = config(|_| {});
    let network = Arc::new(SwitchBarrier::new("network", BarrierState::Open));
    let x = RecordingDispatcher::new("x", Mode::Ack);
    let core = builder(&config)
        .dispatcher(x.clone())
        .barrier(network.clone())
        .scoped_barrier(ScopedBarrier::new("network", [BarrierScope::All]))
        .build()
        .unwrap();
    core.start().await.unwrap();

    core.track_and_wait(event("online")).await.unwrap();
    wait_until("online delivered", || x.count() == 1).await;

    network.close();
    wait_until("gate closed", || !core.barriers().is_open(&dest("x"))).await;
    core.track_and_wait(event("offline")).await.unwrap();
    settle().await;
    assert_eq!(x.count(), 1);

    network.open();
    wait_until("offline delivered", || x.count() == 2).await;
    assert_eq!(x.names(), vec!["online", "offline"]);

    core.shutdown().await;
}

/// Closes `barrier` whenever it is handed events, then acknowledges them.
struct ClosingDispatcher {
    id: DestinationId,
    barrier: Arc<SwitchBarrier>,
    names: Mutex<Vec<String>>,
}

impl ClosingDispatcher {
    fn names(&self) -> Vec<String> {
        self.names.lock().clone()
    }
}

impl Dispatcher for ClosingDispatcher {
    fn id(&self) -> &DestinationId {
        &self.id
    }

    fn dispatch_limit(&self) -> Option<usize> {
        Some(1)
    }

    fn deliver(&self, events: Vec<Event>, acks: DeliveryAcks) {
        self.barrier.close();
        let ids = events.iter().map(|e| e.id().clone()).collect();
        self.names
            .lock()
            .extend(events.iter().map(|e| e.name().to_string()));
        acks.delivered(ids);
    }
}

#[tokio::test]
async fn barrier_closed_during_delivery_stops_the_cycle() {
    let config = config(|_| {});
    let network = Arc::new(SwitchBarrier::new("network", BarrierState::Closed));
    let x = Arc::new(ClosingDispatcher {
        id: dest("x"),
        barrier: network.clone(),
        names: Mutex::new(Vec::new()),
    });
    let core = builder(&config)
        .dispatcher(x.clone())
        .barrier(network.clone())
        .scoped_barrier(ScopedBarrier::new("network", [BarrierScope::All]))
        .build()
        .unwrap();
    core.start().await.unwrap();

    for i in 0..5 {
        core.track_and_wait(event(&format!("e{i}"))).await.unwrap();
    }

    network.open();
    wait_until("first delivery", || x.names().len() == 1).await;
    settle().await;
    assert_eq!(x.names(), vec!["e0"]);
    wait_for_status(&core, &dest("x"), DestinationStatus { pending: 4, inflight: 0 }).await;

    network.open();
    wait_until("second delivery", || x.names().len() == 2).await;
    settle().await;
    assert_eq!(x.names(), vec!["e0", "e1"]);

    core.shutdown().await;
}
