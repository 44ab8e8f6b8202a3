//! Open-state values shared by the feeds, the persistence layer and the web API

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Get current epoch seconds
#[inline]
pub fn epoch_secs() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs() as i64
}

/// Open state of a place as reported by the sensors, plus the derived
/// `closing` value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpenValue {
    #[serde(rename = "none")]
    None,
    #[serde(rename = "keyholder")]
    Keyholder,
    #[serde(rename = "member")]
    Member,
    #[serde(rename = "open")]
    Open,
    #[serde(rename = "open+")]
    OpenPlus,
    /// Never arrives from a sensor; computed from the current and upcoming
    /// feeds by the reconciler.
    #[serde(rename = "closing")]
    Closing,
}

impl OpenValue {
    pub fn as_str(&self) -> &'static str {
        match self {
            OpenValue::None => "none",
            OpenValue::Keyholder => "keyholder",
            OpenValue::Member => "member",
            OpenValue::Open => "open",
            OpenValue::OpenPlus => "open+",
            OpenValue::Closing => "closing",
        }
    }

    /// True if the place should be shown as 'open' for the public.
    #[inline]
    pub fn is_public_open(&self) -> bool {
        matches!(self, OpenValue::Open | OpenValue::OpenPlus)
    }
}

impl std::fmt::Display for OpenValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("invalid open value: {0:?}")]
pub struct ParseOpenValueError(pub String);

impl std::str::FromStr for OpenValue {
    type Err = ParseOpenValueError;

    /// Parses a raw feed payload. `closing` is not accepted, it only exists
    /// as a computed state.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(OpenValue::None),
            "keyholder" => Ok(OpenValue::Keyholder),
            "member" => Ok(OpenValue::Member),
            "open" => Ok(OpenValue::Open),
            "open+" => Ok(OpenValue::OpenPlus),
            // legacy spellings some clients still send
            "" | "closed" | "off" => Ok(OpenValue::None),
            "opened" | "on" => Ok(OpenValue::Open),
            other => Err(ParseOpenValueError(other.to_string())),
        }
    }
}

/// An open value together with the epoch seconds it was observed/derived at.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct OpenValueTs {
    #[serde(rename = "state")]
    pub value: OpenValue,
    pub timestamp: i64,
}

impl OpenValueTs {
    pub fn new(value: OpenValue, timestamp: i64) -> Self {
        Self { value, timestamp }
    }

    /// Stamp a value with the current wall clock.
    pub fn now(value: OpenValue) -> Self {
        Self::new(value, epoch_secs())
    }
}

/// A place whose open state is tracked and persisted independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Place {
    Space,
    Workshop,
    Lab,
}

impl Place {
    pub fn as_str(&self) -> &'static str {
        match self {
            Place::Space => "space",
            Place::Workshop => "workshop",
            Place::Lab => "lab",
        }
    }

    /// Human readable name used in public announcements.
    pub fn display_name(&self) -> &'static str {
        match self {
            Place::Space => "The Space",
            Place::Workshop => "The Bike Workshop",
            Place::Lab => "The Electronics Lab",
        }
    }
}

impl std::str::FromStr for Place {
    type Err = ParseOpenValueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "space" => Ok(Place::Space),
            "workshop" => Ok(Place::Workshop),
            "lab" => Ok(Place::Lab),
            other => Err(ParseOpenValueError(other.to_string())),
        }
    }
}

impl std::fmt::Display for Place {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_canonical_values() {
        assert_eq!("none".parse::<OpenValue>().unwrap(), OpenValue::None);
        assert_eq!("keyholder".parse::<OpenValue>().unwrap(), OpenValue::Keyholder);
        assert_eq!("member".parse::<OpenValue>().unwrap(), OpenValue::Member);
        assert_eq!("open".parse::<OpenValue>().unwrap(), OpenValue::Open);
        assert_eq!("open+".parse::<OpenValue>().unwrap(), OpenValue::OpenPlus);
    }

    #[test]
    fn test_parse_legacy_values() {
        assert_eq!("".parse::<OpenValue>().unwrap(), OpenValue::None);
        assert_eq!("closed".parse::<OpenValue>().unwrap(), OpenValue::None);
        assert_eq!("off".parse::<OpenValue>().unwrap(), OpenValue::None);
        assert_eq!("opened".parse::<OpenValue>().unwrap(), OpenValue::Open);
        assert_eq!("on".parse::<OpenValue>().unwrap(), OpenValue::Open);
    }

    #[test]
    fn test_parse_invalid_values() {
        assert!("moin".parse::<OpenValue>().is_err());
        assert!("openx".parse::<OpenValue>().is_err());
        // computed only, never valid as raw input
        assert!("closing".parse::<OpenValue>().is_err());
    }

    #[test]
    fn test_is_public_open() {
        assert!(OpenValue::Open.is_public_open());
        assert!(OpenValue::OpenPlus.is_public_open());
        assert!(!OpenValue::None.is_public_open());
        assert!(!OpenValue::Keyholder.is_public_open());
        assert!(!OpenValue::Member.is_public_open());
        assert!(!OpenValue::Closing.is_public_open());
    }

    #[test]
    fn test_open_value_ts_json_shape() {
        let ts = OpenValueTs::new(OpenValue::OpenPlus, 1483055820);
        let json = serde_json::to_string(&ts).unwrap();
        assert_eq!(json, r#"{"state":"open+","timestamp":1483055820}"#);
    }

    #[test]
    fn test_place_roundtrip() {
        assert_eq!("space".parse::<Place>().unwrap(), Place::Space);
        assert_eq!("workshop".parse::<Place>().unwrap(), Place::Workshop);
        assert_eq!("lab".parse::<Place>().unwrap(), Place::Lab);
        assert!("garage".parse::<Place>().is_err());
    }
}
