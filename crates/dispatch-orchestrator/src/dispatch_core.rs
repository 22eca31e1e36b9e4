//! The `DispatchCore` facade.
//!
//! `track` pushes events into an ordered intake channel and returns at once.
//! The intake worker enriches each event with collector data, applies the
//! after-collectors transformations and routes it through the consent gate
//! into the queue. Destination loops drain the queue independently.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use delivery_retry_chain::Dispatcher;
use dispatch_config_and_utils::{ConfigHandle, Paths};
use dispatch_types::{DestinationId, Event, ScopedBarrier, ScopedTransformation, TransformationScope};
use event_queue_sqlite_persist::{EventQueueStorage, SqliteEventQueue};
use flow_control_gates::{Barrier, BarrierGate, ConsentGate, ConsentProvider};
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use transformation_pipeline::{TransformationPipeline, Transformer};

use crate::orchestrator::LoopShared;
use crate::{
    CollectContext, Collector, CoreState, DestinationStatus, DispatchError, DispatchResult,
    ModuleRegistry, Orchestrator, QueueCoordinator, TrackOutcome,
};

struct Intake {
    event: Event,
    reply: Option<oneshot::Sender<DispatchResult<TrackOutcome>>>,
}

/// Collects the modules of a [`DispatchCore`].
pub struct DispatchCoreBuilder {
    config: ConfigHandle,
    storage: Option<Box<dyn EventQueueStorage>>,
    paths: Option<Paths>,
    registry: ModuleRegistry,
    pipeline: TransformationPipeline,
    barriers: Vec<Arc<dyn Barrier>>,
    scoped_barriers: Vec<ScopedBarrier>,
    consent_provider: Option<Arc<dyn ConsentProvider>>,
}

impl DispatchCoreBuilder {
    pub fn new(config: ConfigHandle) -> Self {
        Self {
            config,
            storage: None,
            paths: None,
            registry: ModuleRegistry::new(),
            pipeline: TransformationPipeline::new(),
            barriers: Vec::new(),
            scoped_barriers: Vec::new(),
            consent_provider: None,
        }
    }

    /// Uses `storage` instead of the SQLite queue under the data directory.
    pub fn storage(mut self, storage: Box<dyn EventQueueStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Data directory for the default SQLite queue.
    pub fn paths(mut self, paths: Paths) -> Self {
        self.paths = Some(paths);
        self
    }

    pub fn dispatcher(self, dispatcher: Arc<dyn Dispatcher>) -> Self {
        self.registry.add_dispatcher(dispatcher);
        self
    }

    pub fn collector(self, collector: Arc<dyn Collector>) -> Self {
        self.registry.add_collector(collector);
        self
    }

    pub fn transformer(self, transformer: Arc<dyn Transformer>) -> Self {
        self.pipeline.register_transformer(transformer);
        self
    }

    pub fn transformation(self, transformation: ScopedTransformation) -> Self {
        self.pipeline.register_transformation(transformation);
        self
    }

    pub fn barrier(mut self, barrier: Arc<dyn Barrier>) -> Self {
        self.barriers.push(barrier);
        self
    }

    pub fn scoped_barrier(mut self, scoped: ScopedBarrier) -> Self {
        self.scoped_barriers.push(scoped);
        self
    }

    pub fn consent_provider(mut self, provider: Arc<dyn ConsentProvider>) -> Self {
        self.consent_provider = Some(provider);
        self
    }

    /// Opens storage and wires the modules together.
    ///
    /// Must be called from within a Tokio runtime: barrier registration
    /// spawns forwarding tasks.
    pub fn build(self) -> DispatchResult<DispatchCore> {
        let snapshot = self.config.current();
        let capacity = snapshot.config.queue_capacity;

        let storage: Box<dyn EventQueueStorage> = match self.storage {
            Some(storage) => storage,
            None => {
                let paths = match self.paths {
                    Some(paths) => paths,
                    None => Paths::new()?,
                };
                let path = paths.queue_database_file();
                info!(path = %path.display(), capacity, "Opening queue database");
                Box::new(SqliteEventQueue::open(&path, capacity)?)
            }
        };

        let consent = match (&snapshot.config.consent, &self.consent_provider) {
            (Some(config), Some(_)) => Some(ConsentGate::new(config, capacity)),
            (Some(config), None) => {
                warn!(
                    required_purpose = %config.required_purpose,
                    "Consent configured without a provider, events are held until one decides"
                );
                Some(ConsentGate::new(config, capacity))
            }
            (None, Some(_)) => {
                warn!("Consent provider registered without consent config, ignoring it");
                None
            }
            (None, None) => None,
        };

        let coordinator = QueueCoordinator::new(CoreState::new(storage, consent))?;

        let gate = BarrierGate::new();
        for barrier in self.barriers {
            gate.register_barrier(barrier);
        }
        gate.set_scoped_barriers(self.scoped_barriers);

        let registry = Arc::new(self.registry);
        let pipeline = Arc::new(self.pipeline);
        let orchestrator = Orchestrator::new(LoopShared {
            coordinator: coordinator.clone(),
            registry: registry.clone(),
            pipeline: pipeline.clone(),
            gate: gate.clone(),
            config: self.config.clone(),
        });

        let (intake_tx, intake_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(DispatchCore {
            config: self.config,
            coordinator,
            registry,
            pipeline,
            gate,
            consent_provider: self.consent_provider,
            orchestrator,
            intake_tx,
            intake_rx: Mutex::new(Some(intake_rx)),
            started: AtomicBool::new(false),
            shutdown_tx,
            workers: Mutex::new(Vec::new()),
        })
    }
}

/// Entry point of the dispatch core.
///
/// Events tracked before [`DispatchCore::start`] wait in the intake channel
/// and are processed in order once it runs.
pub struct DispatchCore {
    config: ConfigHandle,
    coordinator: QueueCoordinator,
    registry: Arc<ModuleRegistry>,
    pipeline: Arc<TransformationPipeline>,
    gate: BarrierGate,
    consent_provider: Option<Arc<dyn ConsentProvider>>,
    orchestrator: Orchestrator,
    intake_tx: mpsc::UnboundedSender<Intake>,
    intake_rx: Mutex<Option<mpsc::UnboundedReceiver<Intake>>>,
    started: AtomicBool,
    shutdown_tx: broadcast::Sender<()>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl DispatchCore {
    pub fn builder(config: ConfigHandle) -> DispatchCoreBuilder {
        DispatchCoreBuilder::new(config)
    }

    /// Applies the configured capacity and expiration, purges rows for
    /// destinations that are no longer registered and reloads events parked
    /// by the consent gate, then starts the destination loops and background
    /// workers.
    pub async fn start(&self) -> DispatchResult<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(DispatchError::AlreadyStarted);
        }

        let snapshot = self.config.current();
        self.coordinator.resize(snapshot.config.queue_capacity).await?;
        self.coordinator
            .set_expiration(snapshot.config.expiration())
            .await?;
        let destinations = self.registry.destination_ids();
        self.coordinator
            .purge_destinations_not_in(destinations.clone())
            .await?;
        let restored = self.coordinator.restore_parked().await?;

        for destination in &destinations {
            self.orchestrator.start_destination(destination.clone());
        }

        let mut workers = Vec::new();
        if let Some(rx) = self.intake_rx.lock().take() {
            workers.push(self.spawn_intake(rx));
        }
        workers.push(self.spawn_config_watcher(snapshot.version));
        if let Some(provider) = self.consent_provider.clone() {
            workers.push(self.spawn_consent_watcher(provider));
        }
        self.workers.lock().extend(workers);

        info!(
            destinations = destinations.len(),
            restored,
            config_version = snapshot.version,
            "Dispatch core started"
        );
        Ok(())
    }

    /// Queues `event` for processing without waiting.
    pub fn track(&self, event: Event) -> DispatchResult<()> {
        self.intake_tx
            .send(Intake { event, reply: None })
            .map_err(|_| DispatchError::Shutdown)
    }

    /// Queues `event` and waits until it has been routed.
    pub async fn track_and_wait(&self, event: Event) -> DispatchResult<TrackOutcome> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.intake_tx
            .send(Intake {
                event,
                reply: Some(reply_tx),
            })
            .map_err(|_| DispatchError::Shutdown)?;
        reply_rx.await.map_err(|_| DispatchError::Shutdown)?
    }

    /// Registers `dispatcher` and starts its loop if the core is running.
    pub fn add_dispatcher(&self, dispatcher: Arc<dyn Dispatcher>) {
        let id = dispatcher.id().clone();
        self.registry.add_dispatcher(dispatcher);
        if self.started.load(Ordering::SeqCst) {
            self.orchestrator.start_destination(id);
        }
    }

    /// Unregisters a destination: its loop stops, outstanding acknowledgement
    /// handles are cancelled and its inflight ids are cleared. Pending rows
    /// stay until the next start purges them.
    pub async fn remove_dispatcher(&self, id: &DestinationId) -> bool {
        let removed = self.registry.remove_dispatcher(id).is_some();
        self.orchestrator.stop_destination(id).await;
        removed
    }

    pub fn add_collector(&self, collector: Arc<dyn Collector>) {
        self.registry.add_collector(collector);
    }

    pub fn config(&self) -> &ConfigHandle {
        &self.config
    }

    pub fn pipeline(&self) -> &TransformationPipeline {
        &self.pipeline
    }

    pub fn barriers(&self) -> &BarrierGate {
        &self.gate
    }

    pub fn coordinator(&self) -> &QueueCoordinator {
        &self.coordinator
    }

    pub fn destinations(&self) -> BTreeSet<DestinationId> {
        self.registry.destination_ids()
    }

    /// Destinations whose dispatch loop is running.
    pub fn running_destinations(&self) -> Vec<DestinationId> {
        self.orchestrator.running()
    }

    pub async fn status(&self) -> DispatchResult<BTreeMap<DestinationId, DestinationStatus>> {
        self.coordinator.status().await
    }

    /// Stops the destination loops and background workers. Later `track`
    /// calls fail with [`DispatchError::Shutdown`].
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
        self.intake_rx.lock().take();
        self.orchestrator.shutdown().await;

        let workers: Vec<JoinHandle<()>> = self.workers.lock().drain(..).collect();
        for worker in workers {
            if let Err(e) = worker.await {
                error!(error = %e, "Dispatch worker panicked");
            }
        }
        info!("Dispatch core shut down");
    }

    fn spawn_intake(&self, mut rx: mpsc::UnboundedReceiver<Intake>) -> JoinHandle<()> {
        let tracker = Tracker {
            coordinator: self.coordinator.clone(),
            registry: self.registry.clone(),
            pipeline: self.pipeline.clone(),
        };
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    intake = rx.recv() => {
                        let Some(Intake { event, reply }) = intake else {
                            break;
                        };
                        let result = tracker.process(event).await;
                        if let Err(e) = &result {
                            error!(error = %e, "Failed to route tracked event");
                        }
                        if let Some(reply) = reply {
                            let _ = reply.send(result);
                        }
                    }
                }
            }
            debug!("Intake worker stopped");
        })
    }

    fn spawn_config_watcher(&self, applied_version: u64) -> JoinHandle<()> {
        let mut config_rx = self.config.subscribe();
        let coordinator = self.coordinator.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut applied = applied_version;
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    changed = config_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let snapshot = config_rx.borrow_and_update().clone();
                        if snapshot.version <= applied {
                            continue;
                        }
                        applied = snapshot.version;

                        if let Err(e) = coordinator.resize(snapshot.config.queue_capacity).await {
                            error!(error = %e, "Failed to apply queue capacity");
                        }
                        if let Err(e) = coordinator.set_expiration(snapshot.config.expiration()).await {
                            error!(error = %e, "Failed to apply queue expiration");
                        }
                        info!(
                            version = snapshot.version,
                            capacity = snapshot.config.queue_capacity,
                            "Applied configuration to queue"
                        );
                    }
                }
            }
            debug!("Config watcher stopped");
        })
    }

    fn spawn_consent_watcher(&self, provider: Arc<dyn ConsentProvider>) -> JoinHandle<()> {
        let mut decisions = provider.decisions();
        let coordinator = self.coordinator.clone();
        let registry = self.registry.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut pending = decisions.borrow_and_update().clone();
            loop {
                if let Some(decision) = pending.take() {
                    match coordinator
                        .apply_consent(decision, provider.all_purposes(), registry.destination_ids())
                        .await
                    {
                        Ok(summary) => debug!(
                            replayed = summary.replayed,
                            refired = summary.refired,
                            discarded = summary.discarded,
                            "Consent decision applied"
                        ),
                        Err(e) => error!(error = %e, "Failed to apply consent decision"),
                    }
                }

                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    changed = decisions.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        pending = decisions.borrow_and_update().clone();
                    }
                }
            }
            debug!("Consent watcher stopped");
        })
    }
}

impl Drop for DispatchCore {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(());
        self.orchestrator.cancel_all();
    }
}

/// The intake worker's view of the core.
struct Tracker {
    coordinator: QueueCoordinator,
    registry: Arc<ModuleRegistry>,
    pipeline: Arc<TransformationPipeline>,
}

impl Tracker {
    async fn process(&self, event: Event) -> DispatchResult<TrackOutcome> {
        let mut event = event;
        let collectors = self.registry.collectors();
        if !collectors.is_empty() {
            let context = CollectContext {
                event_id: event.id().clone(),
                event_name: event.name().to_string(),
                timestamp_ms: event.timestamp_ms(),
            };
            for collector in collectors {
                let data = collector.collect(&context).await;
                event = event.with_additional_data(data);
            }
        }

        let Some(event) = self
            .pipeline
            .apply(event, &TransformationScope::AfterCollectors)
            .await
        else {
            return Ok(TrackOutcome::Dropped);
        };

        let destinations = self.registry.destination_ids();
        if destinations.is_empty() {
            debug!(event_id = %event.id(), "No destinations registered, event not stored");
            return Ok(TrackOutcome::NoDestinations);
        }

        let outcome = self.coordinator.route(event, destinations).await?;
        Ok(outcome)
    }
}
