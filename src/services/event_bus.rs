//! Topic-keyed publish/subscribe dispatcher
//!
//! Decouples the raw feed adapters from all downstream consumers
//! (persistence, announcer, status stream). `emit` runs the handlers
//! synchronously on the calling task against a snapshot of the
//! registration list, so handlers may subscribe/unsubscribe reentrantly.

use crate::domain::Place;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::error;

/// Event categories. The string values double as query parameters of the
/// status stream endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    Mqtt,
    SpaceOpen,
    WorkshopOpen,
    LabOpen,
    SpaceDevices,
    PowerUsage,
}

impl Topic {
    pub const ALL: [Topic; 6] = [
        Topic::Mqtt,
        Topic::SpaceOpen,
        Topic::WorkshopOpen,
        Topic::LabOpen,
        Topic::SpaceDevices,
        Topic::PowerUsage,
    ];

    /// Topics that carry an open-state change for a place.
    pub const OPEN_STATE: [Topic; 3] = [Topic::SpaceOpen, Topic::WorkshopOpen, Topic::LabOpen];

    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::Mqtt => "mqtt",
            Topic::SpaceOpen => "spaceOpen",
            Topic::WorkshopOpen => "workshopOpen",
            Topic::LabOpen => "labOpen",
            Topic::SpaceDevices => "spaceDevices",
            Topic::PowerUsage => "powerUsage",
        }
    }

    /// The persisted place behind an open-state topic, if any.
    pub fn place(&self) -> Option<Place> {
        match self {
            Topic::SpaceOpen => Some(Place::Space),
            Topic::WorkshopOpen => Some(Place::Workshop),
            Topic::LabOpen => Some(Place::Lab),
            _ => None,
        }
    }
}

impl Place {
    pub fn topic(&self) -> Topic {
        match self {
            Place::Space => Topic::SpaceOpen,
            Place::Workshop => Topic::WorkshopOpen,
            Place::Lab => Topic::LabOpen,
        }
    }
}

/// Handed out by `subscribe`, used only for removal.
pub type RegistrationId = u64;

type Handler = Arc<dyn Fn(Topic) + Send + Sync>;

struct ListEntry {
    id: RegistrationId,
    handler: Handler,
}

#[derive(Default)]
struct Registry {
    id_counter: RegistrationId,
    listeners: FxHashMap<Topic, Vec<ListEntry>>,
}

pub struct EventBus {
    registry: RwLock<Registry>,
}

impl EventBus {
    pub fn new() -> Self {
        Self { registry: RwLock::new(Registry::default()) }
    }

    /// Register a handler for a topic. Handlers run in registration order.
    pub fn subscribe(
        &self,
        topic: Topic,
        handler: impl Fn(Topic) + Send + Sync + 'static,
    ) -> RegistrationId {
        let mut registry = self.registry.write();
        registry.id_counter += 1;
        let id = registry.id_counter;
        registry
            .listeners
            .entry(topic)
            .or_default()
            .push(ListEntry { id, handler: Arc::new(handler) });
        id
    }

    /// Invoke every handler currently registered for the topic, on the
    /// calling task. A handler registered while an emit is in flight is not
    /// guaranteed to see that emit. A panicking handler does not stop its
    /// siblings.
    pub fn emit(&self, topic: Topic) {
        let snapshot: Vec<Handler> = {
            let registry = self.registry.read();
            match registry.listeners.get(&topic) {
                Some(entries) => entries.iter().map(|e| Arc::clone(&e.handler)).collect(),
                None => return,
            }
        };

        for handler in snapshot {
            if catch_unwind(AssertUnwindSafe(|| handler(topic))).is_err() {
                error!(topic = %topic.as_str(), "event_handler_panicked");
            }
        }
    }

    /// Remove one registration across all topics. Removing an unknown or
    /// already-removed id is a no-op.
    pub fn unsubscribe(&self, id: RegistrationId) {
        let mut registry = self.registry.write();
        for entries in registry.listeners.values_mut() {
            entries.retain(|e| e.id != id);
        }
    }

    #[cfg(test)]
    pub(crate) fn listener_count(&self, topic: Topic) -> usize {
        self.registry.read().listeners.get(&topic).map_or(0, Vec::len)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_emit_invokes_subscribed_handler_once() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));

        let c = Arc::clone(&count);
        bus.subscribe(Topic::SpaceOpen, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(Topic::SpaceOpen);
        bus.emit(Topic::SpaceOpen);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_emit_other_topic_does_not_invoke() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));

        let c = Arc::clone(&count);
        bus.subscribe(Topic::SpaceOpen, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(Topic::PowerUsage);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_handlers_run_in_registration_order() {
        let bus = EventBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..4 {
            let o = Arc::clone(&order);
            bus.subscribe(Topic::SpaceDevices, move |_| o.lock().push(i));
        }

        bus.emit(Topic::SpaceDevices);
        assert_eq!(*order.lock(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));

        let c = Arc::clone(&count);
        let id = bus.subscribe(Topic::SpaceOpen, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(Topic::SpaceOpen);
        bus.unsubscribe(id);
        bus.emit(Topic::SpaceOpen);

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unsubscribe_unknown_id_is_noop() {
        let bus = EventBus::new();
        bus.unsubscribe(42);

        let id = bus.subscribe(Topic::Mqtt, |_| {});
        bus.unsubscribe(id);
        // removing twice must not error or remove anything else
        bus.unsubscribe(id);
    }

    #[test]
    fn test_panicking_handler_does_not_stop_siblings() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));

        bus.subscribe(Topic::SpaceOpen, |_| panic!("boom"));
        let c = Arc::clone(&count);
        bus.subscribe(Topic::SpaceOpen, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(Topic::SpaceOpen);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_subscribe_from_handler_does_not_deadlock() {
        let bus = Arc::new(EventBus::new());
        let count = Arc::new(AtomicUsize::new(0));

        let b = Arc::clone(&bus);
        let c = Arc::clone(&count);
        bus.subscribe(Topic::SpaceOpen, move |_| {
            let c2 = Arc::clone(&c);
            b.subscribe(Topic::SpaceOpen, move |_| {
                c2.fetch_add(1, Ordering::SeqCst);
            });
        });

        // the handler added during this emit is not invoked by it
        bus.emit(Topic::SpaceOpen);
        assert_eq!(count.load(Ordering::SeqCst), 0);

        bus.emit(Topic::SpaceOpen);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_concurrent_emit_and_subscribe() {
        let bus = Arc::new(EventBus::new());
        let count = Arc::new(AtomicUsize::new(0));

        let emitter = {
            let bus = Arc::clone(&bus);
            std::thread::spawn(move || {
                for _ in 0..500 {
                    bus.emit(Topic::PowerUsage);
                }
            })
        };
        let subscriber = {
            let bus = Arc::clone(&bus);
            let count = Arc::clone(&count);
            std::thread::spawn(move || {
                for _ in 0..100 {
                    let c = Arc::clone(&count);
                    let id = bus.subscribe(Topic::PowerUsage, move |_| {
                        c.fetch_add(1, Ordering::SeqCst);
                    });
                    bus.unsubscribe(id);
                }
            })
        };

        emitter.join().unwrap();
        subscriber.join().unwrap();
    }
}
