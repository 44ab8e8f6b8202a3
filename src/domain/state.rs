//! Shared live state record
//!
//! One mutex-guarded section per concern. The record is owned by the wiring
//! layer and shared via `Arc`; writers update their own section and emit the
//! matching event, readers take cloned snapshots.

use crate::domain::open_value::{OpenValue, OpenValueTs, Place};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Broker connectivity as shown on the dashboard.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct MqttState {
    pub connected: bool,
    #[serde(rename = "spaceBrokerOnline")]
    pub space_broker_online: bool,
}

/// Open state of all tracked places.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct OpenState {
    pub space: OpenValueTs,
    pub workshop: OpenValueTs,
    pub lab: OpenValueTs,
}

impl OpenState {
    pub fn for_place(&self, place: Place) -> OpenValueTs {
        match place {
            Place::Space => self.space,
            Place::Workshop => self.workshop,
            Place::Lab => self.lab,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresentDevice {
    pub name: String,
    #[serde(default)]
    pub location: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresentPerson {
    pub name: String,
    #[serde(default)]
    pub devices: Vec<PresentDevice>,
}

/// Payload of the devices feed, also served as-is over the web API.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeopleAndDevices {
    #[serde(default)]
    pub people: Vec<PresentPerson>,
    #[serde(default)]
    pub people_count: u32,
    #[serde(default)]
    pub device_count: u32,
    #[serde(default)]
    pub unknown_devices_count: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct SpaceDevices {
    #[serde(flatten)]
    pub data: PeopleAndDevices,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct PowerValueTs {
    pub value: f64,
    pub timestamp: i64,
}

/// Which power circuit a reading belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerCircuit {
    Front,
    Back,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct PowerUsage {
    pub front: PowerValueTs,
    pub back: PowerValueTs,
}

/// The live state of the whole system.
pub struct AppState {
    mqtt: Mutex<MqttState>,
    open: Mutex<OpenState>,
    devices: Mutex<SpaceDevices>,
    power: Mutex<PowerUsage>,
}

impl AppState {
    pub fn new() -> Self {
        let unset = OpenValueTs::new(OpenValue::None, 0);
        Self {
            mqtt: Mutex::new(MqttState { connected: false, space_broker_online: false }),
            open: Mutex::new(OpenState { space: unset, workshop: unset, lab: unset }),
            devices: Mutex::new(SpaceDevices { data: PeopleAndDevices::default(), timestamp: 0 }),
            power: Mutex::new(PowerUsage {
                front: PowerValueTs { value: 0.0, timestamp: 0 },
                back: PowerValueTs { value: 0.0, timestamp: 0 },
            }),
        }
    }

    pub fn mqtt_snapshot(&self) -> MqttState {
        *self.mqtt.lock()
    }

    pub fn set_mqtt_connected(&self, connected: bool) {
        let mut mqtt = self.mqtt.lock();
        mqtt.connected = connected;
        if !connected {
            mqtt.space_broker_online = false;
        }
    }

    pub fn set_space_broker_online(&self, online: bool) {
        self.mqtt.lock().space_broker_online = online;
    }

    pub fn open_snapshot(&self) -> OpenState {
        *self.open.lock()
    }

    pub fn open_for_place(&self, place: Place) -> OpenValueTs {
        self.open.lock().for_place(place)
    }

    pub fn set_open(&self, place: Place, value: OpenValueTs) {
        let mut open = self.open.lock();
        match place {
            Place::Space => open.space = value,
            Place::Workshop => open.workshop = value,
            Place::Lab => open.lab = value,
        }
    }

    pub fn devices_snapshot(&self) -> SpaceDevices {
        self.devices.lock().clone()
    }

    pub fn set_devices(&self, data: PeopleAndDevices, timestamp: i64) {
        *self.devices.lock() = SpaceDevices { data, timestamp };
    }

    pub fn power_snapshot(&self) -> PowerUsage {
        *self.power.lock()
    }

    pub fn set_power(&self, circuit: PowerCircuit, value: PowerValueTs) {
        let mut power = self.power.lock();
        match circuit {
            PowerCircuit::Front => power.front = value,
            PowerCircuit::Back => power.back = value,
        }
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self::new()
    }
}
