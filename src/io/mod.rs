//! IO modules - external system interfaces
//!
//! This module contains all external IO operations:
//! - `mqtt` - MQTT client for receiving the raw telemetry feeds
//! - `store` - SQLite persistence for state transitions and presence samples
//! - `announcer` - public open/closed announcements via a webhook sink
//! - `web` - JSON endpoints and the SSE status stream

pub mod announcer;
pub mod mqtt;
pub mod store;
pub mod web;

// Re-export commonly used types
pub use announcer::{AnnounceSink, Announcer};
pub use mqtt::start_mqtt_client;
pub use store::{start_devices_sampler, start_open_state_recorder, Store};
pub use web::start_web_server;
