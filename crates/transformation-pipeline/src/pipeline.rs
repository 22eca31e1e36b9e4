//! Scoped transformation pipeline.

use std::collections::HashMap;
use std::sync::Arc;

use dispatch_types::{DestinationId, Event, ScopedTransformation, TransformationScope};
use futures_util::future::join_all;
use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::Transformer;

type Step = (ScopedTransformation, Option<Arc<dyn Transformer>>);

/// Registry of transformers and the transformations that use them.
///
/// Registrations can change at any time; each `apply` works on the
/// registrations present when it starts.
#[derive(Default)]
pub struct TransformationPipeline {
    transformers: RwLock<HashMap<String, Arc<dyn Transformer>>>,
    transformations: RwLock<Vec<ScopedTransformation>>,
}

impl TransformationPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a transformer, replacing any with the same id.
    pub fn register_transformer(&self, transformer: Arc<dyn Transformer>) {
        let id = transformer.id().to_string();
        if self.transformers.write().insert(id.clone(), transformer).is_some() {
            debug!(transformer_id = %id, "Replaced transformer");
        }
    }

    pub fn unregister_transformer(&self, id: &str) -> bool {
        self.transformers.write().remove(id).is_some()
    }

    /// Adds a transformation at the end of the order. A transformation with the
    /// same id is replaced in place.
    pub fn register_transformation(&self, transformation: ScopedTransformation) {
        let mut transformations = self.transformations.write();
        match transformations.iter_mut().find(|t| t.id == transformation.id) {
            Some(existing) => *existing = transformation,
            None => transformations.push(transformation),
        }
    }

    pub fn unregister_transformation(&self, id: &str) -> bool {
        let mut transformations = self.transformations.write();
        let before = transformations.len();
        transformations.retain(|t| t.id != id);
        transformations.len() != before
    }

    /// Registered transformations, in application order.
    pub fn transformations(&self) -> Vec<ScopedTransformation> {
        self.transformations.read().clone()
    }

    fn steps_for(&self, scope: &TransformationScope) -> Vec<Step> {
        let transformers = self.transformers.read();
        self.transformations
            .read()
            .iter()
            .filter(|t| t.matches(scope))
            .map(|t| (t.clone(), transformers.get(&t.transformer_id).cloned()))
            .collect()
    }

    /// Runs every transformation matching `scope` over `event`, in order.
    ///
    /// Returns `None` if any transformer dropped the event. The result always
    /// carries the input event's id.
    pub async fn apply(&self, event: Event, scope: &TransformationScope) -> Option<Event> {
        let steps = self.steps_for(scope);
        if steps.is_empty() {
            return Some(event);
        }

        let original_id = event.id().clone();
        let mut current = event;
        for (transformation, transformer) in steps {
            let Some(transformer) = transformer else {
                warn!(
                    transformation_id = %transformation.id,
                    transformer_id = %transformation.transformer_id,
                    "Transformer not registered, skipping"
                );
                continue;
            };

            match transformer.transform(&transformation, current, scope).await {
                Some(next) if next.id() != &original_id => {
                    warn!(
                        transformation_id = %transformation.id,
                        event_id = %original_id,
                        "Transformer changed the event id, restoring it"
                    );
                    current = next.with_id(original_id.clone());
                }
                Some(next) => current = next,
                None => {
                    debug!(
                        transformation_id = %transformation.id,
                        event_id = %original_id,
                        "Event dropped by transformation"
                    );
                    return None;
                }
            }
        }
        Some(current)
    }

    /// Applies the destination scope to every event concurrently and returns
    /// the survivors once all of them finished.
    pub async fn apply_batch(&self, events: Vec<Event>, destination: &DestinationId) -> Vec<Event> {
        let scope = TransformationScope::Destination(destination.clone());
        join_all(events.into_iter().map(|event| self.apply(event, &scope)))
            .await
            .into_iter()
            .flatten()
            .collect()
    }
}
