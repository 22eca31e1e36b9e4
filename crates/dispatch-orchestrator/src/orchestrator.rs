//! Per-destination dispatch loops.
//!
//! Each registered destination gets one task cycling
//! `Idle -> Claiming -> Transforming -> Delivering -> Idle`. The loop wakes on
//! new data for its destination, on inflight ids being dropped, on its barrier
//! gate opening, on acknowledgements and when a failure cooldown elapses.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use delivery_retry_chain::{AckEnvelope, CancelToken, DeliveryAcks, DeliveryReport};
use dispatch_config_and_utils::ConfigHandle;
use dispatch_types::{DestinationId, EventId};
use flow_control_gates::BarrierGate;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};
use transformation_pipeline::TransformationPipeline;

use crate::{DispatchError, ModuleRegistry, QueueCoordinator};

/// Everything a destination loop reads.
pub(crate) struct LoopShared {
    pub(crate) coordinator: QueueCoordinator,
    pub(crate) registry: Arc<ModuleRegistry>,
    pub(crate) pipeline: Arc<TransformationPipeline>,
    pub(crate) gate: BarrierGate,
    pub(crate) config: ConfigHandle,
}

struct LoopHandle {
    stop: CancelToken,
    task: JoinHandle<()>,
}

/// Owns the destination loops.
pub struct Orchestrator {
    shared: Arc<LoopShared>,
    loops: Mutex<HashMap<DestinationId, LoopHandle>>,
}

impl Orchestrator {
    pub(crate) fn new(shared: LoopShared) -> Self {
        Self {
            shared: Arc::new(shared),
            loops: Mutex::new(HashMap::new()),
        }
    }

    /// Starts the loop for `destination` unless one is already running.
    /// Returns true when a loop was spawned.
    pub fn start_destination(&self, destination: DestinationId) -> bool {
        let mut loops = self.loops.lock();
        if let Some(existing) = loops.get(&destination) {
            if !existing.task.is_finished() {
                return false;
            }
        }

        let stop = CancelToken::new();
        let shared = self.shared.clone();
        let task = tokio::spawn(run_destination(shared, destination.clone(), stop.clone()));
        loops.insert(destination, LoopHandle { stop, task });
        true
    }

    /// Stops the loop for `destination` and waits until it has cancelled its
    /// acknowledgement handles and cleared its inflight ids.
    pub async fn stop_destination(&self, destination: &DestinationId) -> bool {
        let Some(handle) = self.loops.lock().remove(destination) else {
            return false;
        };
        handle.stop.cancel();
        if let Err(e) = handle.task.await {
            error!(destination = %destination, error = %e, "Destination loop panicked");
        }
        true
    }

    pub fn running(&self) -> Vec<DestinationId> {
        self.loops
            .lock()
            .iter()
            .filter(|(_, handle)| !handle.task.is_finished())
            .map(|(destination, _)| destination.clone())
            .collect()
    }

    /// Stops every loop and waits for them.
    pub async fn shutdown(&self) {
        let handles: Vec<(DestinationId, LoopHandle)> = self.loops.lock().drain().collect();
        for (_, handle) in &handles {
            handle.stop.cancel();
        }
        for (destination, handle) in handles {
            if let Err(e) = handle.task.await {
                error!(destination = %destination, error = %e, "Destination loop panicked");
            }
        }
    }

    /// Signals every loop to stop without waiting.
    pub(crate) fn cancel_all(&self) {
        for handle in self.loops.lock().values() {
            handle.stop.cancel();
        }
    }
}

/// Minimum wait before the next claim after failed deliveries.
#[derive(Debug, Default)]
struct Cooldown {
    failures: u32,
    until: Option<Instant>,
}

impl Cooldown {
    fn fail(&mut self, base: Duration, max: Duration) -> Duration {
        self.failures = self.failures.saturating_add(1);
        let exponent = (self.failures - 1).min(31);
        let delay = base.saturating_mul(1u32 << exponent).min(max);
        self.until = Some(Instant::now() + delay);
        delay
    }

    fn reset(&mut self) {
        self.failures = 0;
        self.until = None;
    }

    fn blocks(&self) -> bool {
        self.until.is_some_and(|until| until > Instant::now())
    }
}

/// A `deliver` call whose events are not all acknowledged yet.
struct Outstanding {
    acks: DeliveryAcks,
    remaining: HashSet<EventId>,
}

enum Step {
    Idle,
    Exit,
}

struct DestinationLoop {
    shared: Arc<LoopShared>,
    destination: DestinationId,
    ack_tx: mpsc::UnboundedSender<AckEnvelope>,
    outstanding: Vec<Outstanding>,
    cooldown: Cooldown,
}

async fn run_destination(shared: Arc<LoopShared>, destination: DestinationId, stop: CancelToken) {
    let mut notices = shared.coordinator.subscribe();
    let mut gate = shared.gate.subscribe(&destination);
    let (ack_tx, mut ack_rx) = mpsc::unbounded_channel();
    let mut state = DestinationLoop {
        shared,
        destination,
        ack_tx,
        outstanding: Vec::new(),
        cooldown: Cooldown::default(),
    };
    info!(destination = %state.destination, "Destination loop started");

    let mut wake = true;
    loop {
        if wake && !stop.is_cancelled() {
            wake = false;
            gate.borrow_and_update();
            if let Step::Exit = state.cycle(&stop).await {
                break;
            }
        }

        let cooldown_until = state.cooldown.until;
        tokio::select! {
            _ = stop.cancelled() => break,
            changed = gate.changed() => {
                if changed.is_err() {
                    break;
                }
                wake = *gate.borrow();
            }
            notice = notices.recv() => match notice {
                Ok(notice) => wake = notice.concerns(&state.destination),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(destination = %state.destination, skipped, "Queue notices lagged");
                    wake = true;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            Some(envelope) = ack_rx.recv() => {
                state.acknowledge(envelope).await;
                wake = true;
            }
            _ = async {
                if let Some(until) = cooldown_until {
                    sleep_until(until).await;
                }
            }, if cooldown_until.is_some() => {
                state.cooldown.until = None;
                wake = true;
            }
        }
    }

    state.finish().await;
}

impl DestinationLoop {
    /// Claims and delivers until the queue, the ceiling or the gate stops it.
    /// The gate is checked before every claim, so a barrier closed by a
    /// delivery suspends the rest of the cycle.
    async fn cycle(&mut self, stop: &CancelToken) -> Step {
        if self.cooldown.blocks() {
            return Step::Idle;
        }

        while !stop.is_cancelled() {
            if !self.shared.gate.is_open(&self.destination) {
                debug!(destination = %self.destination, "Barrier closed, staying idle");
                return Step::Idle;
            }
            let Some(dispatcher) = self.shared.registry.dispatcher(&self.destination) else {
                info!(destination = %self.destination, "Dispatcher no longer registered");
                return Step::Exit;
            };
            let config = self.shared.config.current().config;
            let limit = dispatcher
                .dispatch_limit()
                .unwrap_or(config.default_dispatch_limit)
                .max(1);
            let ceiling = config.max_inflight_per_destination.max(1);

            let claimed = match self
                .shared
                .coordinator
                .claim(&self.destination, limit, ceiling)
                .await
            {
                Ok(claimed) => claimed,
                Err(DispatchError::ExecutorClosed) => return Step::Exit,
                Err(e) => {
                    error!(destination = %self.destination, error = %e, "Claim failed");
                    let delay = self.cooldown.fail(config.cooldown_base(), config.cooldown_max());
                    debug!(destination = %self.destination, ?delay, "Backing off after claim failure");
                    return Step::Idle;
                }
            };
            if claimed.is_empty() {
                return Step::Idle;
            }

            let claimed_ids: Vec<EventId> = claimed.iter().map(|e| e.id().clone()).collect();
            let survivors = self
                .shared
                .pipeline
                .apply_batch(claimed, &self.destination)
                .await;

            let kept: HashSet<EventId> = survivors.iter().map(|e| e.id().clone()).collect();
            let dropped: Vec<EventId> = claimed_ids
                .into_iter()
                .filter(|id| !kept.contains(id))
                .collect();
            if !dropped.is_empty() {
                debug!(
                    destination = %self.destination,
                    dropped = dropped.len(),
                    "Releasing events dropped by transformation"
                );
                if let Err(e) = self
                    .shared
                    .coordinator
                    .release(&self.destination, dropped, None)
                    .await
                {
                    error!(destination = %self.destination, error = %e, "Release failed");
                }
            }
            if survivors.is_empty() {
                continue;
            }

            let acks = DeliveryAcks::new(self.destination.clone(), self.ack_tx.clone());
            self.outstanding.push(Outstanding {
                acks: acks.clone(),
                remaining: kept,
            });
            debug!(destination = %self.destination, events = survivors.len(), "Delivering events");
            dispatcher.deliver(survivors, acks);
        }
        Step::Idle
    }

    async fn acknowledge(&mut self, envelope: AckEnvelope) {
        let AckEnvelope { report, token } = envelope;

        // Only ids handed out by this loop and not yet acknowledged.
        let mut ids = Vec::new();
        for id in report.ids() {
            if self
                .outstanding
                .iter_mut()
                .any(|outstanding| outstanding.remaining.remove(id))
            {
                ids.push(id.clone());
            }
        }
        self.outstanding.retain(|o| !o.remaining.is_empty());

        let unknown = report.ids().len() - ids.len();
        if unknown > 0 {
            warn!(
                destination = %self.destination,
                unknown,
                "Ignoring acknowledgement for events not outstanding"
            );
        }
        if ids.is_empty() {
            return;
        }

        if let Err(e) = self
            .shared
            .coordinator
            .release(&self.destination, ids, Some(token))
            .await
        {
            error!(destination = %self.destination, error = %e, "Release failed");
        }

        match report {
            DeliveryReport::Delivered(ids) => {
                debug!(destination = %self.destination, events = ids.len(), "Events delivered");
                self.cooldown.reset();
            }
            DeliveryReport::Failed { ids, error } => {
                let config = self.shared.config.current().config;
                let delay = self.cooldown.fail(config.cooldown_base(), config.cooldown_max());
                warn!(
                    destination = %self.destination,
                    events = ids.len(),
                    error = %error,
                    failures = self.cooldown.failures,
                    cooldown_ms = delay.as_millis() as u64,
                    "Delivery failed, events released"
                );
            }
        }
    }

    async fn finish(self) {
        for outstanding in &self.outstanding {
            outstanding.acks.cancel();
        }
        if let Err(e) = self
            .shared
            .coordinator
            .clear_inflight(&self.destination)
            .await
        {
            warn!(destination = %self.destination, error = %e, "Failed to clear inflight events");
        }
        info!(
            destination = %self.destination,
            cancelled = self.outstanding.len(),
            "Destination loop stopped"
        );
    }
}
