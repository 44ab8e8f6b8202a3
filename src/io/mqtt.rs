//! MQTT client for receiving the raw space telemetry feeds
//!
//! Subscribes to the configured state/devices/power topics and routes every
//! payload to the live state, the reconciler and the event bus. The space
//! open state goes through the reconciler (debounced, combined with the
//! upcoming feed); the other places are plain parse-store-emit feeds.

use crate::domain::state::{PeopleAndDevices, PowerCircuit, PowerValueTs};
use crate::domain::{epoch_secs, AppState, OpenValue, OpenValueTs, Place};
use crate::infra::config::{Config, MqttTopics};
use crate::services::event_bus::{EventBus, Topic};
use crate::services::reconciler::SpaceStateReconciler;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Start the MQTT client and route incoming messages until shutdown.
pub async fn start_mqtt_client(
    config: &Config,
    state: Arc<AppState>,
    bus: Arc<EventBus>,
    reconciler: Arc<SpaceStateReconciler>,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // unique client id so a restarted instance does not kick its own session
    let client_id = format!("space-status-{}", Uuid::now_v7().simple());
    let mut mqttoptions = MqttOptions::new(client_id, &config.mqtt.host, config.mqtt.port);
    mqttoptions.set_keep_alive(Duration::from_secs(10));

    if let (Some(username), Some(password)) = (&config.mqtt.username, &config.mqtt.password) {
        mqttoptions.set_credentials(username, password);
    }

    let (client, mut eventloop) = AsyncClient::new(mqttoptions, 100);
    let topics = config.mqtt.topics.clone();

    info!(host = %config.mqtt.host, port = %config.mqtt.port, "mqtt_client_started");

    loop {
        tokio::select! {
            // Check for shutdown signal
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("mqtt_shutdown");
                    return Ok(());
                }
            }
            // Process MQTT events
            result = eventloop.poll() => {
                match result {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("mqtt_connected");
                        state.set_mqtt_connected(true);
                        bus.emit(Topic::Mqtt);

                        // (re)establish subscriptions on every connect
                        for topic in [
                            &topics.state_space,
                            &topics.state_space_next,
                            &topics.state_workshop,
                            &topics.state_lab,
                            &topics.devices,
                            &topics.power_front,
                            &topics.power_back,
                            &topics.broker_online,
                        ] {
                            if let Err(e) = client.subscribe(topic.as_str(), QoS::AtMostOnce).await {
                                error!(error = %e, topic = %topic, "mqtt_subscribe_failed");
                            }
                        }
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        match std::str::from_utf8(&publish.payload) {
                            Ok(payload) => route_message(
                                &topics, &state, &bus, &reconciler, &publish.topic, payload,
                            ),
                            Err(e) => {
                                warn!(error = %e, topic = %publish.topic, "invalid_utf8_payload");
                            }
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!(error = %e, "mqtt_error");
                        if state.mqtt_snapshot().connected {
                            state.set_mqtt_connected(false);
                            bus.emit(Topic::Mqtt);
                        }
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        }
    }
}

/// Dispatch one message to the matching feed handler.
pub(crate) fn route_message(
    topics: &MqttTopics,
    state: &Arc<AppState>,
    bus: &Arc<EventBus>,
    reconciler: &Arc<SpaceStateReconciler>,
    topic: &str,
    payload: &str,
) {
    if topic == topics.state_space {
        on_space_state(reconciler, topic, payload);
    } else if topic == topics.state_space_next {
        on_space_state_next(reconciler, topic, payload);
    } else if topic == topics.state_workshop {
        on_place_state(state, bus, Place::Workshop, topic, payload);
    } else if topic == topics.state_lab {
        on_place_state(state, bus, Place::Lab, topic, payload);
    } else if topic == topics.devices {
        on_devices(state, bus, payload);
    } else if topic == topics.power_front {
        on_power(state, bus, PowerCircuit::Front, topic, payload);
    } else if topic == topics.power_back {
        on_power(state, bus, PowerCircuit::Back, topic, payload);
    } else if topic == topics.broker_online {
        debug!(payload = %payload, "space_broker_online");
        state.set_space_broker_online(payload == "1");
        bus.emit(Topic::Mqtt);
    } else {
        warn!(topic = %topic, "unexpected_topic");
    }
}

fn on_space_state(reconciler: &Arc<SpaceStateReconciler>, topic: &str, payload: &str) {
    if payload.is_empty() {
        debug!(topic = %topic, "empty_payload");
        return;
    }
    match payload.parse::<OpenValue>() {
        Ok(value) => {
            info!(topic = %topic, value = %value, "space_state_message");
            reconciler.update_current(value);
        }
        Err(e) => warn!(error = %e, topic = %topic, "invalid_open_value"),
    }
}

fn on_space_state_next(reconciler: &Arc<SpaceStateReconciler>, topic: &str, payload: &str) {
    // the upcoming state can be unset, an empty payload clears it
    if payload.is_empty() {
        info!(topic = %topic, "empty_payload_clears_upcoming");
        reconciler.clear_upcoming();
        return;
    }
    match payload.parse::<OpenValue>() {
        Ok(value) => {
            info!(topic = %topic, value = %value, "space_state_next_message");
            reconciler.update_upcoming(value);
        }
        Err(e) => warn!(error = %e, topic = %topic, "invalid_open_value"),
    }
}

fn on_place_state(
    state: &Arc<AppState>,
    bus: &Arc<EventBus>,
    place: Place,
    topic: &str,
    payload: &str,
) {
    if payload.is_empty() {
        debug!(topic = %topic, "empty_payload");
        return;
    }
    match payload.parse::<OpenValue>() {
        Ok(value) => {
            info!(place = %place, value = %value, "new_open_state");
            state.set_open(place, OpenValueTs::now(value));
            bus.emit(place.topic());
        }
        Err(e) => warn!(error = %e, topic = %topic, "invalid_open_value"),
    }
}

fn on_devices(state: &Arc<AppState>, bus: &Arc<EventBus>, payload: &str) {
    let devices: PeopleAndDevices = match serde_json::from_str(payload) {
        Ok(devices) => devices,
        Err(e) => {
            warn!(error = %e, payload = %payload, "invalid_devices_payload");
            return;
        }
    };

    debug!(people = devices.people_count, devices = devices.device_count, "new_devices_data");
    state.set_devices(devices, epoch_secs());
    bus.emit(Topic::SpaceDevices);
}

fn on_power(
    state: &Arc<AppState>,
    bus: &Arc<EventBus>,
    circuit: PowerCircuit,
    topic: &str,
    payload: &str,
) {
    let milliwatts: f64 = match payload.trim().parse() {
        Ok(value) => value,
        Err(e) => {
            warn!(error = %e, topic = %topic, payload = %payload, "invalid_power_value");
            return;
        }
    };

    let value = PowerValueTs { value: milliwatts / 1000.0, timestamp: epoch_secs() };
    state.set_power(circuit, value);
    bus.emit(Topic::PowerUsage);
}
