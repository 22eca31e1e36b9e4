//! Applicability selectors shared by transformations and barriers.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::ids::DestinationId;

/// Where a transformation runs.
///
/// When applying, the pipeline is asked for either `AfterCollectors` or a
/// concrete `Destination`; `AllDestinations` only appears in registrations.
#[derive(Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransformationScope {
    AfterCollectors,
    AllDestinations,
    Destination(DestinationId),
}

impl TransformationScope {
    /// Whether a registration with this scope runs when applying `applied`.
    pub fn matches(&self, applied: &TransformationScope) -> bool {
        match (self, applied) {
            (TransformationScope::AfterCollectors, TransformationScope::AfterCollectors) => true,
            (TransformationScope::AllDestinations, TransformationScope::Destination(_)) => true,
            (TransformationScope::Destination(own), TransformationScope::Destination(target)) => {
                own == target
            }
            _ => false,
        }
    }
}

/// A transformation registration: run `transformer_id` for matching scopes.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ScopedTransformation {
    pub id: String,
    pub transformer_id: String,
    pub scopes: BTreeSet<TransformationScope>,
}

impl ScopedTransformation {
    pub fn new<I>(id: impl Into<String>, transformer_id: impl Into<String>, scopes: I) -> Self
    where
        I: IntoIterator<Item = TransformationScope>,
    {
        Self {
            id: id.into(),
            transformer_id: transformer_id.into(),
            scopes: scopes.into_iter().collect(),
        }
    }

    pub fn matches(&self, applied: &TransformationScope) -> bool {
        self.scopes.iter().any(|scope| scope.matches(applied))
    }
}

/// Where a barrier applies.
#[derive(Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BarrierScope {
    All,
    Destination(DestinationId),
}

impl BarrierScope {
    pub fn applies_to(&self, destination: &DestinationId) -> bool {
        match self {
            BarrierScope::All => true,
            BarrierScope::Destination(own) => own == destination,
        }
    }
}

/// A barrier registration: gate `barrier_id` over the listed scopes.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ScopedBarrier {
    pub barrier_id: String,
    pub scopes: BTreeSet<BarrierScope>,
}

impl ScopedBarrier {
    pub fn new<I>(barrier_id: impl Into<String>, scopes: I) -> Self
    where
        I: IntoIterator<Item = BarrierScope>,
    {
        Self {
            barrier_id: barrier_id.into(),
            scopes: scopes.into_iter().collect(),
        }
    }

    pub fn applies_to(&self, destination: &DestinationId) -> bool {
        self.scopes.iter().any(|scope| scope.applies_to(destination))
    }
}
