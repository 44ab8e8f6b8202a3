//! Public open/closed announcements
//!
//! Listens to the open-state topics and pushes a human readable message to a
//! webhook sink whenever the publicly visible state of a place actually
//! changed. Layered behind a change gate (open -> open+ is not a visible
//! change, and the very first observation after startup only establishes the
//! baseline) and a per-topic debouncer, so a flapping state within the quiet
//! period produces at most one message - or none, if it flapped back.

use crate::domain::{AppState, OpenValueTs, Place};
use crate::infra::config::AnnouncerConfig;
use crate::services::change_gate::{ChangeGate, FirstObservation};
use crate::services::debounce::Debouncer;
use crate::services::event_bus::{EventBus, Topic};
use async_trait::async_trait;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

/// Where announcements end up. The webhook implementation posts to a
/// messaging service; the mocking implementation only records.
#[async_trait]
pub trait AnnounceSink: Send + Sync {
    async fn send(&self, message: &str) -> anyhow::Result<()>;
}

pub struct WebhookSink {
    client: reqwest::Client,
    url: String,
}

impl WebhookSink {
    pub fn new(url: String) -> Self {
        Self { client: reqwest::Client::new(), url }
    }
}

#[async_trait]
impl AnnounceSink for WebhookSink {
    async fn send(&self, message: &str) -> anyhow::Result<()> {
        let response = self
            .client
            .post(&self.url)
            .json(&serde_json::json!({ "status": message }))
            .send()
            .await?;
        response.error_for_status()?;
        Ok(())
    }
}

/// Does everything except the actual webhook call.
#[derive(Default)]
pub struct MockSink {
    pub sent: Mutex<Vec<String>>,
}

#[async_trait]
impl AnnounceSink for MockSink {
    async fn send(&self, message: &str) -> anyhow::Result<()> {
        info!(message = %message, mock = true, "announcement");
        self.sent.lock().push(message.to_string());
        Ok(())
    }
}

pub struct Announcer {
    state: Arc<AppState>,
    sink: Arc<dyn AnnounceSink>,
    gate: Mutex<ChangeGate<bool>>,
    debouncers: Mutex<FxHashMap<Topic, Arc<Debouncer>>>,
    delay: Duration,
}

impl Announcer {
    /// Register the announcer on the bus. Returns None when disabled.
    pub fn start(
        config: &AnnouncerConfig,
        bus: &EventBus,
        state: Arc<AppState>,
    ) -> Option<Arc<Self>> {
        if !config.enabled {
            return None;
        }

        info!(mocking = config.mocking, delay_secs = config.delay_secs, "announcer_started");
        let sink: Arc<dyn AnnounceSink> = if config.mocking {
            Arc::new(MockSink::default())
        } else {
            Arc::new(WebhookSink::new(config.webhook_url.clone()))
        };

        Some(Self::with_sink(bus, state, sink, Duration::from_secs(config.delay_secs)))
    }

    pub fn with_sink(
        bus: &EventBus,
        state: Arc<AppState>,
        sink: Arc<dyn AnnounceSink>,
        delay: Duration,
    ) -> Arc<Self> {
        let announcer = Arc::new(Self {
            state,
            sink,
            gate: Mutex::new(ChangeGate::public_visibility(FirstObservation::Baseline)),
            debouncers: Mutex::new(FxHashMap::default()),
            delay,
        });

        for topic in Topic::OPEN_STATE {
            let a = Arc::clone(&announcer);
            bus.subscribe(topic, move |topic| Self::on_open_state_change(&a, topic));
        }

        announcer
    }

    fn on_open_state_change(this: &Arc<Self>, topic: Topic) {
        let Some(place) = topic.place() else { return };
        let value = this.state.open_for_place(place);

        // app start case: record the baseline and stop here, the system must
        // never announce the state it merely booted into
        {
            let mut gate = this.gate.lock();
            if !gate.has_baseline(topic) {
                gate.seed(topic, &value);
                debug!(place = %place, "announcement_baseline_recorded");
                return;
            }
        }

        let announcer = Arc::clone(this);
        let debouncer = this.debouncer_for(topic);
        // the gate is re-checked when the debouncer fires, not now: only the
        // transition that survives the quiet period counts
        debouncer.trigger(move || announcer.announce_if_changed(topic, place, value));
    }

    /// One debouncer per topic, created lazily.
    fn debouncer_for(&self, topic: Topic) -> Arc<Debouncer> {
        Arc::clone(
            self.debouncers
                .lock()
                .entry(topic)
                .or_insert_with(|| Arc::new(Debouncer::new(self.delay))),
        )
    }

    fn announce_if_changed(&self, topic: Topic, place: Place, value: OpenValueTs) {
        if !self.gate.lock().should_act(topic, &value) {
            info!(place = %place, state = %value.value, "not_announcing_same_visible_state");
            return;
        }

        let message = announcement_message(place, &value);
        debug!(message = %message, "sending_announcement");

        let sink = Arc::clone(&self.sink);
        tokio::spawn(async move {
            if let Err(e) = sink.send(&message).await {
                error!(error = %e, "announcement_send_failed");
            }
        });
    }
}

fn announcement_message(place: Place, value: &OpenValueTs) -> String {
    let clock = format_clock(value.timestamp);
    if value.value.is_public_open() {
        format!(
            "{} is open since {} o'clock, come over! Details at https://status.example.org/",
            place.display_name(),
            clock
        )
    } else {
        format!(
            "{} closed at {} o'clock. Details at https://status.example.org/",
            place.display_name(),
            clock
        )
    }
}

fn format_clock(timestamp: i64) -> String {
    use time::format_description::well_known::Rfc3339;
    use time::OffsetDateTime;

    let format = time::macros::format_description!("[hour]:[minute]");
    OffsetDateTime::from_unix_timestamp(timestamp)
        .ok()
        .and_then(|t| t.format(&format).ok())
        // Rfc3339 as a last resort keeps the message sendable
        .or_else(|| OffsetDateTime::now_utc().format(&Rfc3339).ok())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::OpenValue;

    const DELAY: Duration = Duration::from_millis(50);

    struct Fixture {
        state: Arc<AppState>,
        bus: Arc<EventBus>,
        sink: Arc<MockSink>,
        _announcer: Arc<Announcer>,
    }

    fn fixture(delay: Duration) -> Fixture {
        let state = Arc::new(AppState::new());
        let bus = Arc::new(EventBus::new());
        let sink = Arc::new(MockSink::default());
        let announcer =
            Announcer::with_sink(&bus, Arc::clone(&state), sink.clone(), delay);
        Fixture { state, bus, sink, _announcer: announcer }
    }

    impl Fixture {
        fn transition(&self, value: OpenValue, timestamp: i64) {
            self.state.set_open(Place::Space, OpenValueTs::new(value, timestamp));
            self.bus.emit(Topic::SpaceOpen);
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_first_observation_never_announces() {
        let f = fixture(DELAY);

        f.transition(OpenValue::Open, 100);
        tokio::time::sleep(DELAY * 4).await;

        assert!(f.sink.sent.lock().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_public_transition_announces_once() {
        let f = fixture(DELAY);

        f.transition(OpenValue::Open, 100); // baseline
        f.transition(OpenValue::None, 200);
        tokio::time::sleep(DELAY * 4).await;

        let sent = f.sink.sent.lock();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].contains("closed"), "got: {}", sent[0]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_flap_within_quiet_period_announces_nothing() {
        let f = fixture(DELAY);

        f.transition(OpenValue::Open, 100); // baseline: public
        // open -> member -> open within one window nets to "still public"
        f.transition(OpenValue::Member, 200);
        f.transition(OpenValue::Open, 210);
        tokio::time::sleep(DELAY * 4).await;

        assert!(f.sink.sent.lock().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_open_plus_is_not_a_visible_change() {
        let f = fixture(DELAY);

        f.transition(OpenValue::Open, 100); // baseline
        f.transition(OpenValue::OpenPlus, 200);
        tokio::time::sleep(DELAY * 4).await;

        assert!(f.sink.sent.lock().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_zero_delay_announces_immediately() {
        let f = fixture(Duration::ZERO);

        f.transition(OpenValue::Open, 100); // baseline
        f.transition(OpenValue::None, 200);
        // send task still hops through the runtime
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(f.sink.sent.lock().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_reopening_later_announces_again() {
        let f = fixture(DELAY);

        f.transition(OpenValue::Open, 100); // baseline
        f.transition(OpenValue::None, 200);
        tokio::time::sleep(DELAY * 4).await;
        f.transition(OpenValue::OpenPlus, 300);
        tokio::time::sleep(DELAY * 4).await;

        let sent = f.sink.sent.lock();
        assert_eq!(sent.len(), 2);
        assert!(sent[1].contains("open since"), "got: {}", sent[1]);
    }

    #[test]
    fn test_announcement_message_contains_clock() {
        // 2016-12-30 15:17:00 UTC
        let value = OpenValueTs::new(OpenValue::Open, 1483111020);
        let message = announcement_message(Place::Space, &value);
        assert!(message.contains("15:17"), "got: {message}");
        assert!(message.starts_with("The Space"));
    }
}
