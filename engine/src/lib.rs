//! Roomwatch Fusion Engine
//!
//! Fuses partial air-quality, power and presence readings into per-room
//! snapshots, checks them against operating thresholds and infers whether
//! each room is occupied.

pub mod aggregator;
pub mod context;
pub mod dispatch;
pub mod faults;
pub mod occupancy;
pub mod reading;
pub mod router;

use chrono::{DateTime, Utc};
use roomwatch_io::IoError;
use serde::{Deserialize, Serialize};
use std::fmt;

pub use dispatch::{Collaborators, DispatchOutcome, Dispatcher, EngineConfig, RoomState};
pub use faults::{FaultEvaluator, FaultReport, FaultRule, FaultRules, Rule};
pub use occupancy::{Occupancy, OccupancyConfig, OccupancyEngine};
pub use reading::RawReading;
pub use router::{RoomRouter, Routed};

/// Snapshot fields that are persisted and checked for faults
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Datapoint {
    Temperature,
    Humidity,
    Co2,
    Power,
    PresenceState,
    Sensitivity,
    OnlineStatus,
}

impl Datapoint {
    pub const ALL: [Datapoint; 7] = [
        Datapoint::Temperature,
        Datapoint::Humidity,
        Datapoint::Co2,
        Datapoint::Power,
        Datapoint::PresenceState,
        Datapoint::Sensitivity,
        Datapoint::OnlineStatus,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Datapoint::Temperature => "temperature",
            Datapoint::Humidity => "humidity",
            Datapoint::Co2 => "co2",
            Datapoint::Power => "power",
            Datapoint::PresenceState => "presence_state",
            Datapoint::Sensitivity => "sensitivity",
            Datapoint::OnlineStatus => "online_status",
        }
    }
}

impl fmt::Display for Datapoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single field value as received from a sensor.
///
/// `Null` marks a reading that was absent at snapshot assembly time. Fields
/// left out of a payload, JSON `null` and the string `"null"` all decode to it.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    #[default]
    Null,
    Number(f64),
    Text(String),
}

impl FieldValue {
    pub fn from_json(value: Option<&serde_json::Value>) -> Self {
        use serde_json::Value;

        match value {
            None | Some(Value::Null) => FieldValue::Null,
            Some(Value::Number(n)) => n.as_f64().map(FieldValue::Number).unwrap_or_default(),
            Some(Value::String(s)) if s == "null" => FieldValue::Null,
            Some(Value::String(s)) => FieldValue::Text(s.clone()),
            Some(other) => FieldValue::Text(other.to_string()),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }

    /// Numeric view; text is parsed, null has none
    pub fn as_f64(&self) -> Option<f64> {
        self.coerce_f64().ok().flatten()
    }

    /// Numeric coercion used by range rules
    pub fn coerce_f64(&self) -> std::result::Result<Option<f64>, std::num::ParseFloatError> {
        match self {
            FieldValue::Null => Ok(None),
            FieldValue::Number(n) => Ok(Some(*n)),
            FieldValue::Text(s) => s.trim().parse().map(Some),
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Null => f.write_str("null"),
            FieldValue::Number(n) => write!(f, "{}", n),
            FieldValue::Text(s) => f.write_str(s),
        }
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        FieldValue::Number(value)
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Text(value.to_string())
    }
}

/// Presence radar states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceState {
    Occupied,
    Unoccupied,
    /// Still body detected, not enough motion to call it occupied
    Passive,
}

impl PresenceState {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "occupied" => Some(PresenceState::Occupied),
            "unoccupied" => Some(PresenceState::Unoccupied),
            "passive" => Some(PresenceState::Passive),
            _ => None,
        }
    }
}

/// Unified per-room reading, produced once per presence message
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Snapshot {
    pub room_id: String,
    pub timestamp: DateTime<Utc>,
    pub temperature: FieldValue,
    pub humidity: FieldValue,
    pub co2: FieldValue,
    pub power: FieldValue,
    pub presence_state: FieldValue,
    pub sensitivity: FieldValue,
    pub online_status: FieldValue,
}

impl Snapshot {
    /// Snapshot with every field null
    pub fn empty(room_id: &str, timestamp: DateTime<Utc>) -> Self {
        Self {
            room_id: room_id.to_string(),
            timestamp,
            temperature: FieldValue::Null,
            humidity: FieldValue::Null,
            co2: FieldValue::Null,
            power: FieldValue::Null,
            presence_state: FieldValue::Null,
            sensitivity: FieldValue::Null,
            online_status: FieldValue::Null,
        }
    }

    pub fn field(&self, datapoint: Datapoint) -> &FieldValue {
        match datapoint {
            Datapoint::Temperature => &self.temperature,
            Datapoint::Humidity => &self.humidity,
            Datapoint::Co2 => &self.co2,
            Datapoint::Power => &self.power,
            Datapoint::PresenceState => &self.presence_state,
            Datapoint::Sensitivity => &self.sensitivity,
            Datapoint::OnlineStatus => &self.online_status,
        }
    }

    /// All datapoint fields in declaration order
    pub fn fields(&self) -> impl Iterator<Item = (Datapoint, &FieldValue)> + '_ {
        Datapoint::ALL.into_iter().map(move |d| (d, self.field(d)))
    }

    /// Parsed presence state; `None` for null or unrecognized values
    pub fn presence(&self) -> Option<PresenceState> {
        self.presence_state.as_text().and_then(PresenceState::parse)
    }
}

/// Error types
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Collaborator error: {0}")]
    Io(#[from] IoError),

    #[error("Malformed message on {topic}: {reason}")]
    Malformed { topic: String, reason: String },

    #[error("Room mismatch: topic names {topic_room}, body names {body_room}")]
    RoomMismatch { topic_room: String, body_room: String },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn null_sentinel_covers_absent_and_explicit_null() {
        assert_eq!(FieldValue::from_json(None), FieldValue::Null);
        assert_eq!(FieldValue::from_json(Some(&json!(null))), FieldValue::Null);
        assert_eq!(FieldValue::from_json(Some(&json!("null"))), FieldValue::Null);
        assert_eq!(FieldValue::from_json(Some(&json!(0))), FieldValue::Number(0.0));
        assert_eq!(FieldValue::from_json(Some(&json!(""))), FieldValue::Text(String::new()));
    }

    #[test]
    fn numeric_coercion() {
        assert_eq!(FieldValue::from("24.5").as_f64(), Some(24.5));
        assert_eq!(FieldValue::from("warm").as_f64(), None);
        assert!(FieldValue::from("warm").coerce_f64().is_err());
        assert_eq!(FieldValue::Null.coerce_f64(), Ok(None));
    }

    #[test]
    fn snapshot_fields_follow_datapoint_order() {
        let snapshot = Snapshot::empty("room101", Utc::now());
        let names: Vec<_> = snapshot.fields().map(|(d, _)| d.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "temperature",
                "humidity",
                "co2",
                "power",
                "presence_state",
                "sensitivity",
                "online_status"
            ]
        );
    }
}
