//! The event record and the queue item that carries it.

use std::collections::BTreeSet;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::ids::{DestinationId, EventId};

/// A JSON-like payload value (null, bool, number, string, array or map).
pub type Value = serde_json::Value;

/// Ordered key/value payload of an event.
pub type EventData = serde_json::Map<String, Value>;

/// An immutable tracked event.
///
/// Events are never mutated in place. Transformations derive a new event via
/// [`Event::with_data`] and friends, which keep the original [`EventId`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Event {
    id: EventId,
    name: String,
    #[serde(default)]
    data: EventData,
    timestamp_ms: i64,
}

impl Event {
    /// Creates a new event with a fresh id, stamped with the current time.
    pub fn new(name: impl Into<String>, data: EventData) -> Self {
        Self {
            id: EventId::new(),
            name: name.into(),
            data,
            timestamp_ms: Utc::now().timestamp_millis(),
        }
    }

    /// Rebuilds an event from its stored parts.
    pub fn from_parts(
        id: EventId,
        name: impl Into<String>,
        data: EventData,
        timestamp_ms: i64,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            data,
            timestamp_ms,
        }
    }

    pub fn id(&self) -> &EventId {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn data(&self) -> &EventData {
        &self.data
    }

    pub fn timestamp_ms(&self) -> i64 {
        self.timestamp_ms
    }

    /// Looks up a single payload entry.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    /// Returns a copy of this event with its payload replaced.
    pub fn with_data(&self, data: EventData) -> Self {
        Self {
            data,
            ..self.clone()
        }
    }

    /// Returns a copy of this event under a different name.
    pub fn with_name(&self, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..self.clone()
        }
    }

    /// Returns a copy with the given entries set, overwriting existing keys.
    pub fn with_entries<I, K>(&self, entries: I) -> Self
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        let mut data = self.data.clone();
        for (key, value) in entries {
            data.insert(key.into(), value);
        }
        self.with_data(data)
    }

    /// Returns a copy with `extra` added underneath the existing payload.
    ///
    /// Keys already present on the event keep their value.
    pub fn with_additional_data(&self, extra: EventData) -> Self {
        let mut data = self.data.clone();
        for (key, value) in extra {
            data.entry(key).or_insert(value);
        }
        self.with_data(data)
    }

    /// Returns a copy carrying a different id.
    pub fn with_id(&self, id: EventId) -> Self {
        Self {
            id,
            ..self.clone()
        }
    }
}

/// A stored event and the destinations that have not yet handled it.
///
/// `destinations` is never empty for an item that exists in storage.
#[derive(Clone, Debug, PartialEq)]
pub struct QueueItem {
    pub event: Event,
    pub destinations: BTreeSet<DestinationId>,
}
