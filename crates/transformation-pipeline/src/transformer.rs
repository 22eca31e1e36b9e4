//! The transformer capability.

use async_trait::async_trait;
use dispatch_types::{Event, ScopedTransformation, TransformationScope};

/// Rewrites or drops events.
///
/// One transformer may back several transformations; the registration being
/// applied and the scope it runs for are passed along with the event.
#[async_trait]
pub trait Transformer: Send + Sync {
    fn id(&self) -> &str;

    /// Returns the transformed event, or `None` to drop it for `scope`.
    async fn transform(
        &self,
        transformation: &ScopedTransformation,
        event: Event,
        scope: &TransformationScope,
    ) -> Option<Event>;
}

/// A transformer backed by a synchronous closure.
pub struct FnTransformer<F> {
    id: String,
    f: F,
}

impl<F> FnTransformer<F>
where
    F: Fn(Event, &TransformationScope) -> Option<Event> + Send + Sync,
{
    pub fn new(id: impl Into<String>, f: F) -> Self {
        Self { id: id.into(), f }
    }
}

#[async_trait]
impl<F> Transformer for FnTransformer<F>
where
    F: Fn(Event, &TransformationScope) -> Option<Event> + Send + Sync,
{
    fn id(&self) -> &str {
        &self.id
    }

    async fn transform(
        &self,
        _transformation: &ScopedTransformation,
        event: Event,
        scope: &TransformationScope,
    ) -> Option<Event> {
        (self.f)(event, scope)
    }
}
