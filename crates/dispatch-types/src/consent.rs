//! Consent decisions supplied by the consent provider.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::{Event, EventId};

/// How a consent decision was obtained.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionKind {
    /// Inferred (e.g. regional default); may be refined later.
    Implicit,
    /// Given by the user.
    Explicit,
}

impl DecisionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionKind::Implicit => "implicit",
            DecisionKind::Explicit => "explicit",
        }
    }
}

/// The latest consent state. The last decision received wins.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ConsentDecision {
    pub kind: DecisionKind,
    pub purposes: BTreeSet<String>,
}

impl ConsentDecision {
    pub fn new<I, S>(kind: DecisionKind, purposes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            kind,
            purposes: purposes.into_iter().map(Into::into).collect(),
        }
    }

    pub fn implicit<I, S>(purposes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(DecisionKind::Implicit, purposes)
    }

    pub fn explicit<I, S>(purposes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(DecisionKind::Explicit, purposes)
    }

    pub fn allows(&self, purpose: &str) -> bool {
        self.purposes.contains(purpose)
    }

    /// True when every purpose in `all` is granted.
    pub fn covers_all(&self, all: &BTreeSet<String>) -> bool {
        all.is_subset(&self.purposes)
    }

    pub fn is_explicit(&self) -> bool {
        self.kind == DecisionKind::Explicit
    }
}

/// Why the consent gate keeps an event outside the delivery queue.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParkedKind {
    /// Waiting for a decision that grants the required purpose.
    Held,
    /// Admitted under partial consent, re-sent as purposes are granted.
    Refire,
}

impl ParkedKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParkedKind::Held => "held",
            ParkedKind::Refire => "refire",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "held" => Some(ParkedKind::Held),
            "refire" => Some(ParkedKind::Refire),
            _ => None,
        }
    }
}

/// An event the consent gate keeps until a decision releases it.
#[derive(Clone, Debug, PartialEq)]
pub struct ParkedEvent {
    pub kind: ParkedKind,
    pub event: Event,
    /// Purposes already sent for this event. Empty for held events.
    pub processed: BTreeSet<String>,
    /// Refire copies sent so far.
    pub refired: u32,
}

impl ParkedEvent {
    pub fn held(event: Event) -> Self {
        Self {
            kind: ParkedKind::Held,
            event,
            processed: BTreeSet::new(),
            refired: 0,
        }
    }
}

/// One change to the parked set, replayed against storage in order.
#[derive(Clone, Debug, PartialEq)]
pub enum ParkedChange {
    /// Inserts or updates the entry keyed by kind and event id. An update
    /// keeps the entry's position.
    Put(ParkedEvent),
    Remove { kind: ParkedKind, id: EventId },
    Clear(ParkedKind),
}
