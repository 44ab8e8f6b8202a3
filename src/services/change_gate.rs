//! Last-acted filter for downstream consumers
//!
//! Persistence and announcements must not act merely because an event fired,
//! only when the value they care about differs from what they last acted on.
//! The projection maps the full state to that comparison key: identity for
//! persistence, the public-open boolean for announcements.

use crate::domain::{OpenValue, OpenValueTs};
use crate::services::event_bus::Topic;
use rustc_hash::FxHashMap;

/// What `should_act` returns for the very first observation of a topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirstObservation {
    /// Record the value and act on it (persistence-style consumers that seed
    /// their baseline from storage).
    Act,
    /// Record the value as the baseline and stay silent (the announcer must
    /// never announce on process startup).
    Baseline,
}

pub struct ChangeGate<K: PartialEq> {
    project: Box<dyn Fn(&OpenValueTs) -> K + Send>,
    first: FirstObservation,
    last_acted: FxHashMap<Topic, K>,
}

impl<K: PartialEq> ChangeGate<K> {
    pub fn new(
        first: FirstObservation,
        project: impl Fn(&OpenValueTs) -> K + Send + 'static,
    ) -> Self {
        Self { project: Box::new(project), first, last_acted: FxHashMap::default() }
    }

    /// Pre-record a last-acted value, e.g. the newest persisted row per place.
    pub fn seed(&mut self, topic: Topic, value: &OpenValueTs) {
        let key = (self.project)(value);
        self.last_acted.insert(topic, key);
    }

    /// Whether a last-acted value exists for the topic.
    pub fn has_baseline(&self, topic: Topic) -> bool {
        self.last_acted.contains_key(&topic)
    }

    /// Compare the projected value against the last-acted one for this topic;
    /// record it and return true only if it differs.
    pub fn should_act(&mut self, topic: Topic, value: &OpenValueTs) -> bool {
        let key = (self.project)(value);
        match self.last_acted.get(&topic).map(|last| *last == key) {
            Some(true) => false,
            Some(false) => {
                self.last_acted.insert(topic, key);
                true
            }
            None => {
                self.last_acted.insert(topic, key);
                self.first == FirstObservation::Act
            }
        }
    }
}

impl ChangeGate<OpenValue> {
    /// Value projection: every raw state transition counts, but a repeated
    /// value with a fresh timestamp does not.
    pub fn by_value(first: FirstObservation) -> Self {
        Self::new(first, |v| v.value)
    }
}

impl ChangeGate<bool> {
    /// Public-visibility projection: only open <-> non-open transitions count.
    pub fn public_visibility(first: FirstObservation) -> Self {
        Self::new(first, |v| v.value.is_public_open())
    }
}
