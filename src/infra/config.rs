//! Configuration loading from TOML files
//!
//! Config file is selected via the --config command line argument, falling
//! back to config/dev.toml. A missing or broken file logs a warning and
//! falls back to the built-in defaults.

use anyhow::Context;
use serde::Deserialize;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Deserialize)]
pub struct MqttConfig {
    #[serde(default = "default_mqtt_host")]
    pub host: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub topics: MqttTopics,
}

fn default_mqtt_host() -> String {
    "localhost".to_string()
}

fn default_mqtt_port() -> u16 {
    1883
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: default_mqtt_host(),
            port: default_mqtt_port(),
            username: None,
            password: None,
            topics: MqttTopics::default(),
        }
    }
}

/// Broker topics the daemon subscribes to.
#[derive(Debug, Clone, Deserialize)]
pub struct MqttTopics {
    #[serde(default = "default_topic_state_space")]
    pub state_space: String,
    #[serde(default = "default_topic_state_space_next")]
    pub state_space_next: String,
    #[serde(default = "default_topic_state_workshop")]
    pub state_workshop: String,
    #[serde(default = "default_topic_state_lab")]
    pub state_lab: String,
    #[serde(default = "default_topic_devices")]
    pub devices: String,
    #[serde(default = "default_topic_power_front")]
    pub power_front: String,
    #[serde(default = "default_topic_power_back")]
    pub power_back: String,
    #[serde(default = "default_topic_broker_online")]
    pub broker_online: String,
}

fn default_topic_state_space() -> String {
    "space/state/open".to_string()
}

fn default_topic_state_space_next() -> String {
    "space/state/open/next".to_string()
}

fn default_topic_state_workshop() -> String {
    "workshop/state/open".to_string()
}

fn default_topic_state_lab() -> String {
    "lab/state/open".to_string()
}

fn default_topic_devices() -> String {
    "space/devices".to_string()
}

fn default_topic_power_front() -> String {
    "space/power/front".to_string()
}

fn default_topic_power_back() -> String {
    "space/power/back".to_string()
}

fn default_topic_broker_online() -> String {
    "space/broker/online".to_string()
}

impl Default for MqttTopics {
    fn default() -> Self {
        Self {
            state_space: default_topic_state_space(),
            state_space_next: default_topic_state_space_next(),
            state_workshop: default_topic_state_workshop(),
            state_lab: default_topic_state_lab(),
            devices: default_topic_devices(),
            power_front: default_topic_power_front(),
            power_back: default_topic_power_back(),
            broker_online: default_topic_broker_online(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DbConfig {
    /// SQLite database file
    #[serde(default = "default_db_path")]
    pub path: String,
    /// Interval for sampling device/people counts into the devices table
    #[serde(default = "default_save_devices_interval")]
    pub save_devices_interval_secs: u64,
}

fn default_db_path() -> String {
    "space-status.db".to_string()
}

fn default_save_devices_interval() -> u64 {
    300
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            save_devices_interval_secs: default_save_devices_interval(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AnnouncerConfig {
    #[serde(default)]
    pub enabled: bool,
    /// If true, everything runs except the actual webhook call. Useful for
    /// developing.
    #[serde(default)]
    pub mocking: bool,
    #[serde(default)]
    pub webhook_url: String,
    /// Delay announcing after a state change for this long; it is also the
    /// minimum time between two announcements. 0 disables the delay.
    #[serde(default = "default_announce_delay")]
    pub delay_secs: u64,
}

fn default_announce_delay() -> u64 {
    300
}

impl Default for AnnouncerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            mocking: false,
            webhook_url: String::new(),
            delay_secs: default_announce_delay(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebConfig {
    #[serde(default = "default_web_bind")]
    pub bind: String,
    #[serde(default = "default_web_port")]
    pub port: u16,
}

fn default_web_bind() -> String {
    "0.0.0.0".to_string()
}

fn default_web_port() -> u16 {
    8080
}

impl Default for WebConfig {
    fn default() -> Self {
        Self { bind: default_web_bind(), port: default_web_port() }
    }
}

/// Embedded dev broker, off by default.
#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_broker_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_broker_port")]
    pub port: u16,
}

fn default_broker_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_broker_port() -> u16 {
    1883
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind_address: default_broker_bind_address(),
            port: default_broker_port(),
        }
    }
}

/// Main configuration struct used throughout the application
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub db: DbConfig,
    #[serde(default)]
    pub announcer: AnnouncerConfig,
    #[serde(default)]
    pub web: WebConfig,
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(skip)]
    config_file: String,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let mut config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        config.config_file = path.display().to_string();

        Ok(config)
    }

    /// Load configuration - tries the TOML file first, falls back to defaults
    pub fn load(path: &str) -> Self {
        match Self::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Warning: {e:#}. Using defaults.");
                Self { config_file: "default".to_string(), ..Self::default() }
            }
        }
    }

    pub fn config_file(&self) -> &str {
        &self.config_file
    }
}
