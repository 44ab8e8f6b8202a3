//! Derives the canonical public space state from the raw feeds
//!
//! Two independently-updating feeds flow in here: the current open state and
//! the upcoming ("next") open state. Every accepted update re-arms one shared
//! 500ms coalescer; the debounced recomputation combines both feeds into the
//! single value the rest of the system sees, including the synthetic
//! `closing` state, and emits exactly one event per recomputation.

use crate::domain::{AppState, OpenValue, OpenValueTs, Place};
use crate::services::debounce::Debouncer;
use crate::services::event_bus::{EventBus, Topic};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Quiet period shared by both feeds; rapid-fire updates to either collapse
/// into one recomputation.
pub const RECOMPUTE_QUIET_PERIOD: Duration = Duration::from_millis(500);

#[derive(Default)]
struct Feeds {
    current: Option<OpenValueTs>,
    upcoming: Option<OpenValueTs>,
}

/// The part the debounced recomputation runs against.
struct ReconcilerShared {
    state: Arc<AppState>,
    bus: Arc<EventBus>,
    feeds: Mutex<Feeds>,
}

pub struct SpaceStateReconciler {
    shared: Arc<ReconcilerShared>,
    debounce: Debouncer,
}

impl SpaceStateReconciler {
    pub fn new(state: Arc<AppState>, bus: Arc<EventBus>) -> Self {
        Self::with_quiet_period(state, bus, RECOMPUTE_QUIET_PERIOD)
    }

    pub(crate) fn with_quiet_period(
        state: Arc<AppState>,
        bus: Arc<EventBus>,
        quiet: Duration,
    ) -> Self {
        Self {
            shared: Arc::new(ReconcilerShared { state, bus, feeds: Mutex::new(Feeds::default()) }),
            debounce: Debouncer::new(quiet),
        }
    }

    /// A new value arrived on the current-state feed.
    pub fn update_current(&self, value: OpenValue) {
        debug!(value = %value, "current_feed_update");
        self.shared.feeds.lock().current = Some(OpenValueTs::now(value));
        self.schedule_recompute();
    }

    /// A new value arrived on the upcoming-state feed.
    pub fn update_upcoming(&self, value: OpenValue) {
        debug!(value = %value, "upcoming_feed_update");
        self.shared.feeds.lock().upcoming = Some(OpenValueTs::now(value));
        self.schedule_recompute();
    }

    /// An empty payload on the upcoming-state feed unsets it.
    pub fn clear_upcoming(&self) {
        info!("upcoming_feed_cleared");
        self.shared.feeds.lock().upcoming = None;
        self.schedule_recompute();
    }

    fn schedule_recompute(&self) {
        let shared = Arc::clone(&self.shared);
        self.debounce.trigger(move || shared.recompute());
    }
}

impl ReconcilerShared {
    fn recompute(&self) {
        let (current, upcoming) = {
            let feeds = self.feeds.lock();
            (feeds.current, feeds.upcoming)
        };

        let Some(current) = current else {
            warn!("recompute_without_current_feed");
            return;
        };

        let derived = if !current.value.is_public_open() {
            // once the space is non-public the upcoming feed is irrelevant
            current
        } else {
            match upcoming {
                Some(upcoming)
                    if matches!(
                        upcoming.value,
                        OpenValue::None | OpenValue::Keyholder | OpenValue::Member
                    ) =>
                {
                    OpenValueTs::now(OpenValue::Closing)
                }
                _ => current,
            }
        };

        self.publish(derived);
    }

    fn publish(&self, derived: OpenValueTs) {
        info!(state = %derived.value, "space_open_state_changed");
        self.state.set_open(Place::Space, derived);
        self.bus.emit(Topic::SpaceOpen);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Reconciler with debouncing disabled, so updates recompute inline.
    fn sync_reconciler() -> (Arc<AppState>, Arc<EventBus>, SpaceStateReconciler) {
        let state = Arc::new(AppState::new());
        let bus = Arc::new(EventBus::new());
        let reconciler =
            SpaceStateReconciler::with_quiet_period(state.clone(), bus.clone(), Duration::ZERO);
        (state, bus, reconciler)
    }

    fn emit_counter(bus: &EventBus) -> Arc<AtomicUsize> {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        bus.subscribe(Topic::SpaceOpen, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        count
    }

    #[test]
    fn test_open_with_upcoming_none_becomes_closing() {
        let (state, _, reconciler) = sync_reconciler();

        reconciler.update_current(OpenValue::Open);
        reconciler.update_upcoming(OpenValue::None);

        assert_eq!(state.open_for_place(Place::Space).value, OpenValue::Closing);
    }

    #[test]
    fn test_open_with_upcoming_keyholder_becomes_closing() {
        let (state, _, reconciler) = sync_reconciler();

        reconciler.update_current(OpenValue::OpenPlus);
        reconciler.update_upcoming(OpenValue::Keyholder);

        assert_eq!(state.open_for_place(Place::Space).value, OpenValue::Closing);
    }

    #[test]
    fn test_open_with_upcoming_open_plus_stays_open() {
        let (state, _, reconciler) = sync_reconciler();

        reconciler.update_current(OpenValue::Open);
        reconciler.update_upcoming(OpenValue::OpenPlus);

        assert_eq!(state.open_for_place(Place::Space).value, OpenValue::Open);
    }

    #[test]
    fn test_non_public_current_ignores_upcoming() {
        let (state, _, reconciler) = sync_reconciler();

        reconciler.update_upcoming(OpenValue::None);
        reconciler.update_current(OpenValue::Member);

        assert_eq!(state.open_for_place(Place::Space).value, OpenValue::Member);
    }

    #[test]
    fn test_clearing_upcoming_reverts_closing() {
        let (state, _, reconciler) = sync_reconciler();

        reconciler.update_current(OpenValue::Open);
        reconciler.update_upcoming(OpenValue::None);
        assert_eq!(state.open_for_place(Place::Space).value, OpenValue::Closing);

        reconciler.clear_upcoming();
        assert_eq!(state.open_for_place(Place::Space).value, OpenValue::Open);
    }

    #[test]
    fn test_no_recompute_without_current_feed() {
        let (state, bus, reconciler) = sync_reconciler();
        let emits = emit_counter(&bus);

        reconciler.update_upcoming(OpenValue::None);
        reconciler.clear_upcoming();

        assert_eq!(emits.load(Ordering::SeqCst), 0);
        assert_eq!(state.open_for_place(Place::Space).timestamp, 0);
    }

    #[test]
    fn test_emits_once_per_recomputation() {
        let (_, bus, reconciler) = sync_reconciler();
        let emits = emit_counter(&bus);

        reconciler.update_current(OpenValue::Open);
        reconciler.update_current(OpenValue::None);

        // debounce disabled: every update is its own recomputation
        assert_eq!(emits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_derived_state_keeps_current_timestamp() {
        let (state, _, reconciler) = sync_reconciler();

        reconciler.update_current(OpenValue::Member);
        let published = state.open_for_place(Place::Space);
        let current = reconciler.shared.feeds.lock().current.unwrap();

        assert_eq!(published, current);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_update_burst_recomputes_once() {
        let state = Arc::new(AppState::new());
        let bus = Arc::new(EventBus::new());
        let reconciler = SpaceStateReconciler::with_quiet_period(
            state.clone(),
            bus.clone(),
            Duration::from_millis(50),
        );
        let emits = emit_counter(&bus);

        reconciler.update_current(OpenValue::Open);
        reconciler.update_upcoming(OpenValue::OpenPlus);
        reconciler.update_upcoming(OpenValue::None);
        reconciler.update_current(OpenValue::Open);

        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(emits.load(Ordering::SeqCst), 1);
        assert_eq!(state.open_for_place(Place::Space).value, OpenValue::Closing);
    }
}
