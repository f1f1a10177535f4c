//! Inbound sensor readings
//!
//! Decodes `{ "room_id": ..., "data": {...} }` bodies into typed partial
//! readings. Missing keys become the null sentinel; only an undecodable body
//! or a room/topic disagreement rejects the message.

use crate::{EngineError, FieldValue, Result};
use roomwatch_io::topic::parse_sensor_topic;
use roomwatch_io::SensorType;
use serde::Deserialize;
use serde_json::{Map, Value};

/// Older power meters report under this key
const LEGACY_POWER_KEY: &str = "power_kw_power_meter";

#[derive(Debug, Clone, PartialEq, Default)]
pub struct AirQualityReading {
    pub temperature: FieldValue,
    pub humidity: FieldValue,
    pub co2: FieldValue,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct PowerReading {
    pub power: FieldValue,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct PresenceReading {
    pub presence_state: FieldValue,
    pub sensitivity: FieldValue,
    pub online_status: FieldValue,
}

/// One sensor type's payload for one room
#[derive(Debug, Clone, PartialEq)]
pub enum RawReading {
    AirQuality(AirQualityReading),
    Power(PowerReading),
    Presence(PresenceReading),
}

impl RawReading {
    pub fn sensor_type(&self) -> SensorType {
        match self {
            RawReading::AirQuality(_) => SensorType::Iaq,
            RawReading::Power(_) => SensorType::Power,
            RawReading::Presence(_) => SensorType::Presence,
        }
    }

    /// Build a typed reading from the `data` object of a message
    pub fn from_data(sensor_type: SensorType, data: &Map<String, Value>) -> Self {
        match sensor_type {
            SensorType::Iaq => RawReading::AirQuality(AirQualityReading {
                temperature: FieldValue::from_json(data.get("temperature")),
                humidity: FieldValue::from_json(data.get("humidity")),
                co2: FieldValue::from_json(data.get("co2")),
            }),
            SensorType::Power => RawReading::Power(PowerReading {
                power: FieldValue::from_json(data.get("power").or_else(|| data.get(LEGACY_POWER_KEY))),
            }),
            SensorType::Presence => RawReading::Presence(PresenceReading {
                presence_state: FieldValue::from_json(data.get("presence_state")),
                sensitivity: FieldValue::from_json(data.get("sensitivity")),
                online_status: FieldValue::from_json(data.get("online_status")),
            }),
        }
    }
}

#[derive(Debug, Deserialize)]
struct Envelope {
    room_id: String,
    /// Absent and `null` both mean an empty reading
    #[serde(default)]
    data: Option<Map<String, Value>>,
}

/// A decoded inbound message
#[derive(Debug, Clone, PartialEq)]
pub struct InboundReading {
    pub room_id: String,
    pub reading: RawReading,
}

impl InboundReading {
    /// Decode a delivery body received on a sensor topic
    pub fn decode(topic: &str, payload: &[u8]) -> Result<Self> {
        let (topic_room, sensor_type) = parse_sensor_topic(topic).map_err(|e| EngineError::Malformed {
            topic: topic.to_string(),
            reason: e.to_string(),
        })?;

        let envelope: Envelope =
            serde_json::from_slice(payload).map_err(|e| EngineError::Malformed {
                topic: topic.to_string(),
                reason: e.to_string(),
            })?;

        if envelope.room_id != topic_room {
            return Err(EngineError::RoomMismatch {
                topic_room: topic_room.to_string(),
                body_room: envelope.room_id,
            });
        }

        let data = envelope.data.unwrap_or_default();
        Ok(Self {
            reading: RawReading::from_data(sensor_type, &data),
            room_id: envelope.room_id,
        })
    }
}
