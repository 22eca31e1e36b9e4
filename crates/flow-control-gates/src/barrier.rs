//! Barrier gate.
//!
//! Each destination's gate is open when every registered barrier scoped to
//! it (directly or through `All`) is open. Scoped barriers naming a barrier
//! that is not registered are ignored.
//!
//! [`BarrierGate::is_open`] reads each barrier's current state, so a barrier
//! that closes is seen at once. Subscribers are notified by a forwarding task
//! per barrier.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use dispatch_types::{DestinationId, ScopedBarrier};
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// State published by a barrier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BarrierState {
    Open,
    Closed,
}

impl BarrierState {
    pub fn is_open(self) -> bool {
        self == BarrierState::Open
    }
}

/// A named condition that can hold back delivery.
pub trait Barrier: Send + Sync {
    fn id(&self) -> &str;

    /// Current state plus every later change.
    fn subscribe(&self) -> watch::Receiver<BarrierState>;
}

/// A barrier whose state is set by the host (connectivity, app state, tests).
pub struct SwitchBarrier {
    id: String,
    state: watch::Sender<BarrierState>,
}

impl SwitchBarrier {
    pub fn new(id: impl Into<String>, initial: BarrierState) -> Self {
        let (state, _) = watch::channel(initial);
        Self {
            id: id.into(),
            state,
        }
    }

    pub fn open(&self) {
        self.set(BarrierState::Open);
    }

    pub fn close(&self) {
        self.set(BarrierState::Closed);
    }

    pub fn set(&self, state: BarrierState) {
        let changed = self.state.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            *current = state;
            true
        });
        if changed {
            debug!(barrier_id = %self.id, ?state, "Barrier state changed");
        }
    }

    pub fn state(&self) -> BarrierState {
        *self.state.borrow()
    }
}

impl Barrier for SwitchBarrier {
    fn id(&self) -> &str {
        &self.id
    }

    fn subscribe(&self) -> watch::Receiver<BarrierState> {
        self.state.subscribe()
    }
}

struct RegisteredBarrier {
    generation: u64,
    live: watch::Receiver<BarrierState>,
    forwarder: JoinHandle<()>,
}

#[derive(Default)]
struct GateState {
    barriers: HashMap<String, RegisteredBarrier>,
    scoped: Vec<ScopedBarrier>,
    destinations: HashMap<DestinationId, watch::Sender<bool>>,
    next_generation: u64,
}

impl GateState {
    fn is_open(&self, destination: &DestinationId) -> bool {
        self.scoped
            .iter()
            .filter(|scoped| scoped.applies_to(destination))
            .filter_map(|scoped| self.barriers.get(&scoped.barrier_id))
            .all(|barrier| (*barrier.live.borrow()).is_open())
    }

    fn publish_all(&self) {
        self.publish(None);
    }

    /// Publishes every destination's gate. Destinations scoped to `touched`
    /// are notified even when the value is unchanged: a close and reopen may
    /// reach the forwarder as a single change.
    fn publish(&self, touched: Option<&str>) {
        for (destination, sender) in &self.destinations {
            let open = self.is_open(destination);
            let previous = *sender.borrow();
            let scoped_to_touched = touched.is_some_and(|id| {
                self.scoped
                    .iter()
                    .any(|scoped| scoped.barrier_id == id && scoped.applies_to(destination))
            });
            if previous != open || scoped_to_touched {
                sender.send_replace(open);
            }
            if previous != open {
                info!(destination = %destination, open, "Barrier gate changed");
            }
        }
    }
}

impl Drop for GateState {
    fn drop(&mut self) {
        for barrier in self.barriers.values() {
            barrier.forwarder.abort();
        }
    }
}

/// Aggregates barriers into a per-destination open signal.
///
/// Cloning shares the same gate.
#[derive(Clone, Default)]
pub struct BarrierGate {
    inner: Arc<Mutex<GateState>>,
}

impl BarrierGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `barrier`, replacing one with the same id.
    ///
    /// Must be called from within a Tokio runtime: a task forwards the
    /// barrier's state changes into the gate.
    pub fn register_barrier(&self, barrier: Arc<dyn Barrier>) {
        let id = barrier.id().to_string();
        let mut rx = barrier.subscribe();
        rx.borrow_and_update();
        let live = barrier.subscribe();
        let initial = *live.borrow();

        let mut state = self.inner.lock();
        let generation = state.next_generation;
        state.next_generation += 1;

        let weak = Arc::downgrade(&self.inner);
        let forward_id = id.clone();
        let forwarder = tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                rx.borrow_and_update();
                if !Self::forward(&weak, &forward_id, generation) {
                    break;
                }
            }
        });

        if let Some(previous) = state.barriers.insert(
            id.clone(),
            RegisteredBarrier {
                generation,
                live,
                forwarder,
            },
        ) {
            previous.forwarder.abort();
        }
        info!(barrier_id = %id, state = ?initial, "Registered barrier");
        state.publish_all();
    }

    /// Publishes a forwarded change. Returns false once the gate or this
    /// registration is gone.
    fn forward(weak: &Weak<Mutex<GateState>>, id: &str, generation: u64) -> bool {
        let Some(inner) = weak.upgrade() else {
            return false;
        };
        let state = inner.lock();
        match state.barriers.get(id) {
            Some(barrier) if barrier.generation == generation => {
                state.publish(Some(id));
                true
            }
            _ => false,
        }
    }

    pub fn unregister_barrier(&self, id: &str) -> bool {
        let mut state = self.inner.lock();
        match state.barriers.remove(id) {
            Some(barrier) => {
                barrier.forwarder.abort();
                info!(barrier_id = %id, "Unregistered barrier");
                state.publish_all();
                true
            }
            None => false,
        }
    }

    /// Replaces the scoped barrier list.
    pub fn set_scoped_barriers(&self, scoped: Vec<ScopedBarrier>) {
        let mut state = self.inner.lock();
        state.scoped = scoped;
        state.publish_all();
    }

    pub fn add_scoped_barrier(&self, scoped: ScopedBarrier) {
        let mut state = self.inner.lock();
        state.scoped.push(scoped);
        state.publish_all();
    }

    /// Open signal for `destination`, starting at its current value.
    pub fn subscribe(&self, destination: &DestinationId) -> watch::Receiver<bool> {
        let mut state = self.inner.lock();
        if let Some(sender) = state.destinations.get(destination) {
            return sender.subscribe();
        }
        let (sender, rx) = watch::channel(state.is_open(destination));
        state.destinations.insert(destination.clone(), sender);
        rx
    }

    /// Whether `destination` may deliver right now.
    pub fn is_open(&self, destination: &DestinationId) -> bool {
        self.inner.lock().is_open(destination)
    }

    /// Stops publishing for `destination`; its receivers see the channel close.
    pub fn remove_destination(&self, destination: &DestinationId) {
        self.inner.lock().destinations.remove(destination);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dispatch_types::BarrierScope;
    use std::time::Duration;
    use tokio::time::timeout;

    fn dest(name: &str) -> DestinationId {
        DestinationId::from(name)
    }

    async fn wait_for(rx: &mut watch::Receiver<bool>, expected: bool) {
        timeout(Duration::from_secs(2), rx.wait_for(|open| *open == expected))
            .await
            .expect("gate did not change in time")
            .unwrap();
    }

    #[tokio::test]
    async fn test_no_barriers_means_open() {
        let gate = BarrierGate::new();
        assert!(gate.is_open(&dest("x")));
        assert!(*gate.subscribe(&dest("x")).borrow());
    }

    #[tokio::test]
    async fn test_all_scope_closes_every_destination() {
        let gate = BarrierGate::new();
        let connectivity = Arc::new(SwitchBarrier::new("connectivity", BarrierState::Closed));
        gate.register_barrier(connectivity.clone());
        gate.add_scoped_barrier(ScopedBarrier::new("connectivity", [BarrierScope::All]));

        let mut x = gate.subscribe(&dest("x"));
        let mut y = gate.subscribe(&dest("y"));
        assert!(!*x.borrow());
        assert!(!*y.borrow());

        connectivity.open();
        wait_for(&mut x, true).await;
        wait_for(&mut y, true).await;
    }

    #[tokio::test]
    async fn test_destination_scope_is_isolated() {
        let gate = BarrierGate::new();
        let batching = Arc::new(SwitchBarrier::new("batching", BarrierState::Open));
        gate.register_barrier(batching.clone());
        gate.set_scoped_barriers(vec![ScopedBarrier::new(
            "batching",
            [BarrierScope::Destination(dest("x"))],
        )]);

        let mut x = gate.subscribe(&dest("x"));
        batching.close();
        wait_for(&mut x, false).await;
        assert!(gate.is_open(&dest("y")));
    }

    #[tokio::test]
    async fn test_gate_is_and_of_matching_barriers() {
        let gate = BarrierGate::new();
        let a = Arc::new(SwitchBarrier::new("a", BarrierState::Open));
        let b = Arc::new(SwitchBarrier::new("b", BarrierState::Closed));
        gate.register_barrier(a.clone());
        gate.register_barrier(b.clone());
        gate.set_scoped_barriers(vec![
            ScopedBarrier::new("a", [BarrierScope::All]),
            ScopedBarrier::new("b", [BarrierScope::All]),
        ]);

        let mut rx = gate.subscribe(&dest("x"));
        assert!(!*rx.borrow());

        b.open();
        wait_for(&mut rx, true).await;

        a.close();
        wait_for(&mut rx, false).await;
    }

    #[tokio::test]
    async fn test_unregistering_closed_barrier_opens_gate() {
        let gate = BarrierGate::new();
        gate.register_barrier(Arc::new(SwitchBarrier::new("a", BarrierState::Closed)));
        gate.add_scoped_barrier(ScopedBarrier::new("a", [BarrierScope::All]));
        assert!(!gate.is_open(&dest("x")));

        assert!(gate.unregister_barrier("a"));
        assert!(gate.is_open(&dest("x")));
        assert!(!gate.unregister_barrier("a"));
    }

    #[tokio::test]
    async fn test_scope_without_registered_barrier_is_ignored() {
        let gate = BarrierGate::new();
        gate.add_scoped_barrier(ScopedBarrier::new("missing", [BarrierScope::All]));
        assert!(gate.is_open(&dest("x")));
    }

    #[tokio::test]
    async fn test_close_is_visible_before_forwarding() {
        let gate = BarrierGate::new();
        let network = Arc::new(SwitchBarrier::new("network", BarrierState::Open));
        gate.register_barrier(network.clone());
        gate.add_scoped_barrier(ScopedBarrier::new("network", [BarrierScope::All]));
        let mut rx = gate.subscribe(&dest("x"));
        rx.borrow_and_update();

        network.close();
        assert!(!gate.is_open(&dest("x")));

        // Reopened before the forwarder ran: subscribers still wake.
        network.open();
        timeout(Duration::from_secs(2), rx.changed())
            .await
            .expect("no wake after reopen")
            .unwrap();
        assert!(*rx.borrow_and_update());
    }

    #[tokio::test]
    async fn test_replaced_barrier_stops_forwarding_old_one() {
        let gate = BarrierGate::new();
        let old = Arc::new(SwitchBarrier::new("a", BarrierState::Open));
        gate.register_barrier(old.clone());
        gate.add_scoped_barrier(ScopedBarrier::new("a", [BarrierScope::All]));

        let new = Arc::new(SwitchBarrier::new("a", BarrierState::Open));
        gate.register_barrier(new.clone());

        old.close();
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(gate.is_open(&dest("x")));

        let mut rx = gate.subscribe(&dest("x"));
        new.close();
        wait_for(&mut rx, false).await;
    }
}
