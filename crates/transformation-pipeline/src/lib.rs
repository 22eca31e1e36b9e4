//! Transformation pipeline.
//!
//! Transformers are registered by id. Transformations bind a transformer to a
//! set of scopes; applying the pipeline for a scope threads the event through
//! every matching transformation in registration order. Returning `None`
//! drops the event for that scope only.

mod pipeline;
mod transformer;

pub use pipeline::TransformationPipeline;
pub use transformer::{FnTransformer, Transformer};
