//! Consent gate.
//!
//! Routing of a tracked event under the latest decision:
//!
//! | decision                                  | route     |
//! |-------------------------------------------|-----------|
//! | none, or implicit without required purpose | held      |
//! | explicit without required purpose          | discarded |
//! | grants required purpose                    | enqueued  |
//!
//! While consent is implicit and partial, enqueued events keep a refire copy
//! that records the purposes already processed for it. Each later decision
//! granting new purposes re-sends the copy to the refire destinations stamped
//! with just those purposes. Held events and refire copies share one bound.

use std::collections::{BTreeSet, VecDeque};

use dispatch_config_and_utils::ConsentConfig;
use dispatch_types::{
    ConsentDecision, DestinationId, Event, EventId, ParkedChange, ParkedEvent, ParkedKind, Value,
};
use parking_lot::RwLock;
use tokio::sync::watch;
use tracing::{debug, info, warn};

pub const CONSENT_TYPE_KEY: &str = "consent_type";
pub const PURPOSES_ALL_KEY: &str = "purposes_with_consent_all";
pub const PURPOSES_PROCESSED_KEY: &str = "purposes_with_consent_processed";
pub const PURPOSES_UNPROCESSED_KEY: &str = "purposes_with_consent_unprocessed";

/// Source of consent decisions.
pub trait ConsentProvider: Send + Sync {
    /// Latest decision plus every later one. `None` until the user or a
    /// default has decided.
    fn decisions(&self) -> watch::Receiver<Option<ConsentDecision>>;

    /// Every purpose the host knows about.
    fn all_purposes(&self) -> BTreeSet<String>;
}

/// Provider driven directly by the host application.
pub struct ManualConsentProvider {
    decision: watch::Sender<Option<ConsentDecision>>,
    all_purposes: RwLock<BTreeSet<String>>,
}

impl ManualConsentProvider {
    pub fn new<I, S>(all_purposes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let (decision, _) = watch::channel(None);
        Self {
            decision,
            all_purposes: RwLock::new(all_purposes.into_iter().map(Into::into).collect()),
        }
    }

    /// Publishes a new decision. The last one wins.
    pub fn decide(&self, decision: ConsentDecision) {
        info!(
            kind = decision.kind.as_str(),
            purposes = decision.purposes.len(),
            "Consent decision updated"
        );
        self.decision.send_replace(Some(decision));
    }

    pub fn current(&self) -> Option<ConsentDecision> {
        self.decision.borrow().clone()
    }

    pub fn set_all_purposes(&self, purposes: BTreeSet<String>) {
        *self.all_purposes.write() = purposes;
    }
}

impl ConsentProvider for ManualConsentProvider {
    fn decisions(&self) -> watch::Receiver<Option<ConsentDecision>> {
        self.decision.subscribe()
    }

    fn all_purposes(&self) -> BTreeSet<String> {
        self.all_purposes.read().clone()
    }
}

/// Where a tracked event goes.
#[derive(Debug, Clone, PartialEq)]
pub enum ConsentRoute {
    /// Stamped event, ready for the normal destinations.
    Enqueue(Event),
    /// Waiting for a decision that grants the required purpose.
    Held,
    /// Refused by an explicit decision.
    Discarded,
}

/// Events released by a decision.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConsentOutcome {
    /// Replayed held events, stamped for the normal destinations.
    pub normal: Vec<Event>,
    /// Refire copies, stamped with newly granted purposes only.
    pub refire: Vec<Event>,
    /// Held events and refire copies dropped by an explicit refusal.
    pub discarded: usize,
}

impl ConsentOutcome {
    pub fn is_empty(&self) -> bool {
        self.normal.is_empty() && self.refire.is_empty() && self.discarded == 0
    }
}

#[derive(Debug, Clone)]
struct RefireCopy {
    event: Event,
    processed: BTreeSet<String>,
    refired: u32,
}

impl RefireCopy {
    /// Each refire is a distinct queue item, so it cannot replace the
    /// original still pending for normal destinations.
    fn next_id(&mut self) -> EventId {
        self.refired += 1;
        EventId::from_string(format!("{}:refire:{}", self.event.id(), self.refired))
    }

    fn parked(&self) -> ParkedEvent {
        ParkedEvent {
            kind: ParkedKind::Refire,
            event: self.event.clone(),
            processed: self.processed.clone(),
            refired: self.refired,
        }
    }
}

/// Consent state machine.
///
/// Not synchronised; the owner runs it on a single execution context together
/// with the queue so routing and enqueueing happen atomically. Every change to
/// the held events and refire copies is journaled; the owner drains the
/// journal with [`ConsentGate::take_changes`] and persists it.
pub struct ConsentGate {
    required_purpose: String,
    refire_destinations: BTreeSet<DestinationId>,
    all_purposes: BTreeSet<String>,
    decision: Option<ConsentDecision>,
    held: VecDeque<Event>,
    refire_copies: VecDeque<RefireCopy>,
    held_capacity: usize,
    changes: Vec<ParkedChange>,
}

impl ConsentGate {
    /// `held_capacity` bounds the held events and the refire copies; the
    /// oldest entry is dropped when either is full.
    pub fn new(config: &ConsentConfig, held_capacity: usize) -> Self {
        Self {
            required_purpose: config.required_purpose.clone(),
            refire_destinations: config.refire_destinations.iter().cloned().collect(),
            all_purposes: BTreeSet::new(),
            decision: None,
            held: VecDeque::new(),
            refire_copies: VecDeque::new(),
            held_capacity: held_capacity.max(1),
            changes: Vec::new(),
        }
    }

    pub fn set_all_purposes(&mut self, purposes: BTreeSet<String>) {
        self.all_purposes = purposes;
    }

    pub fn set_held_capacity(&mut self, capacity: usize) {
        self.held_capacity = capacity.max(1);
        self.trim();
    }

    pub fn refire_destinations(&self) -> &BTreeSet<DestinationId> {
        &self.refire_destinations
    }

    pub fn decision(&self) -> Option<&ConsentDecision> {
        self.decision.as_ref()
    }

    pub fn held_count(&self) -> usize {
        self.held.len()
    }

    pub fn refire_count(&self) -> usize {
        self.refire_copies.len()
    }

    /// Reloads events parked by an earlier run, oldest first. Entries over
    /// capacity are dropped.
    pub fn restore(&mut self, parked: Vec<ParkedEvent>) {
        for entry in parked {
            match entry.kind {
                ParkedKind::Held => self.held.push_back(entry.event),
                ParkedKind::Refire => self.refire_copies.push_back(RefireCopy {
                    event: entry.event,
                    processed: entry.processed,
                    refired: entry.refired,
                }),
            }
        }
        self.trim();
        info!(
            held = self.held.len(),
            refire = self.refire_copies.len(),
            "Restored consent parked events"
        );
    }

    /// Changes since the last call, in the order they happened.
    pub fn take_changes(&mut self) -> Vec<ParkedChange> {
        std::mem::take(&mut self.changes)
    }

    /// Routes one tracked event under the current decision.
    pub fn route(&mut self, event: Event) -> ConsentRoute {
        let Some(decision) = self.decision.clone() else {
            self.hold(event);
            return ConsentRoute::Held;
        };

        if decision.allows(&self.required_purpose) {
            return ConsentRoute::Enqueue(self.admit(event, &decision));
        }
        if decision.is_explicit() {
            debug!(event_id = %event.id(), "Event discarded, consent refused");
            return ConsentRoute::Discarded;
        }
        self.hold(event);
        ConsentRoute::Held
    }

    /// Records `decision` and returns the events it releases.
    pub fn apply_decision(&mut self, decision: ConsentDecision) -> ConsentOutcome {
        let mut outcome = ConsentOutcome::default();

        if !decision.allows(&self.required_purpose) {
            if decision.is_explicit() {
                outcome.discarded = self.held.len() + self.refire_copies.len();
                self.held.clear();
                self.refire_copies.clear();
                if outcome.discarded > 0 {
                    self.changes.push(ParkedChange::Clear(ParkedKind::Held));
                    self.changes.push(ParkedChange::Clear(ParkedKind::Refire));
                    info!(
                        discarded = outcome.discarded,
                        "Explicit consent refusal, dropped pending events"
                    );
                }
            }
            self.decision = Some(decision);
            return outcome;
        }

        // Existing copies first, so copies created by this replay are not
        // refired for the same decision.
        for copy in &mut self.refire_copies {
            let newly: BTreeSet<String> = decision
                .purposes
                .difference(&copy.processed)
                .cloned()
                .collect();
            if newly.is_empty() {
                continue;
            }
            let id = copy.next_id();
            let stamped = stamp(&copy.event, &decision, &copy.processed, &newly).with_id(id);
            outcome.refire.push(stamped);
            copy.processed.extend(newly);
            self.changes.push(ParkedChange::Put(copy.parked()));
        }

        if decision.is_explicit() || decision.covers_all(&self.all_purposes) {
            if !self.refire_copies.is_empty() {
                debug!(
                    released = self.refire_copies.len(),
                    "Consent settled, releasing refire copies"
                );
                self.refire_copies.clear();
                self.changes.push(ParkedChange::Clear(ParkedKind::Refire));
            }
        }

        if !self.held.is_empty() {
            self.changes.push(ParkedChange::Clear(ParkedKind::Held));
        }
        let held: Vec<Event> = self.held.drain(..).collect();
        for event in held {
            let admitted = self.admit(event, &decision);
            outcome.normal.push(admitted);
        }

        if !outcome.normal.is_empty() || !outcome.refire.is_empty() {
            info!(
                replayed = outcome.normal.len(),
                refired = outcome.refire.len(),
                kind = decision.kind.as_str(),
                "Consent decision released events"
            );
        }
        self.decision = Some(decision);
        outcome
    }

    /// Stamps an admitted event and keeps a refire copy when consent may
    /// still grow.
    fn admit(&mut self, event: Event, decision: &ConsentDecision) -> Event {
        if self.retains_refire(decision) {
            let copy = RefireCopy {
                event: event.clone(),
                processed: decision.purposes.clone(),
                refired: 0,
            };
            self.changes.push(ParkedChange::Put(copy.parked()));
            match self
                .refire_copies
                .iter_mut()
                .find(|existing| existing.event.id() == event.id())
            {
                Some(existing) => *existing = copy,
                None => self.refire_copies.push_back(copy),
            }
            self.trim();
        }
        stamp(&event, decision, &BTreeSet::new(), &decision.purposes)
    }

    fn retains_refire(&self, decision: &ConsentDecision) -> bool {
        !decision.is_explicit()
            && !self.refire_destinations.is_empty()
            && !decision.covers_all(&self.all_purposes)
    }

    fn hold(&mut self, event: Event) {
        debug!(event_id = %event.id(), "Event held until consent");
        self.changes
            .push(ParkedChange::Put(ParkedEvent::held(event.clone())));
        match self.held.iter_mut().find(|held| held.id() == event.id()) {
            Some(existing) => *existing = event,
            None => self.held.push_back(event),
        }
        self.trim();
    }

    /// Drops the oldest held events and refire copies over capacity.
    fn trim(&mut self) {
        while self.held.len() > self.held_capacity {
            let Some(dropped) = self.held.pop_front() else {
                break;
            };
            warn!(
                event_id = %dropped.id(),
                capacity = self.held_capacity,
                "Consent hold queue full, dropping oldest event"
            );
            self.changes.push(ParkedChange::Remove {
                kind: ParkedKind::Held,
                id: dropped.id().clone(),
            });
        }
        while self.refire_copies.len() > self.held_capacity {
            let Some(dropped) = self.refire_copies.pop_front() else {
                break;
            };
            warn!(
                event_id = %dropped.event.id(),
                capacity = self.held_capacity,
                "Refire copies full, dropping oldest copy"
            );
            self.changes.push(ParkedChange::Remove {
                kind: ParkedKind::Refire,
                id: dropped.event.id().clone(),
            });
        }
    }
}

fn purpose_list(purposes: &BTreeSet<String>) -> Value {
    Value::Array(purposes.iter().cloned().map(Value::String).collect())
}

fn stamp(
    event: &Event,
    decision: &ConsentDecision,
    processed: &BTreeSet<String>,
    unprocessed: &BTreeSet<String>,
) -> Event {
    event.with_entries([
        (CONSENT_TYPE_KEY, Value::String(decision.kind.as_str().to_string())),
        (PURPOSES_ALL_KEY, purpose_list(&decision.purposes)),
        (PURPOSES_PROCESSED_KEY, purpose_list(processed)),
        (PURPOSES_UNPROCESSED_KEY, purpose_list(unprocessed)),
    ])
}
