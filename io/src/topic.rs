//! Routing keys
//!
//! Sensor data arrives on `<room_id>.<sensor_type>`; alerts leave on
//! `<room_id>.fault` and `<room_id>.occupancy`.

use crate::{IoError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Inbound sensor stream kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SensorType {
    /// Indoor air quality: temperature, humidity, CO₂
    Iaq,
    /// Power meter
    Power,
    /// Presence radar
    Presence,
}

impl SensorType {
    pub const ALL: [SensorType; 3] = [SensorType::Iaq, SensorType::Power, SensorType::Presence];

    pub fn as_str(&self) -> &'static str {
        match self {
            SensorType::Iaq => "iaq",
            SensorType::Power => "power",
            SensorType::Presence => "presence",
        }
    }
}

impl fmt::Display for SensorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SensorType {
    type Err = IoError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "iaq" => Ok(SensorType::Iaq),
            "power" => Ok(SensorType::Power),
            "presence" => Ok(SensorType::Presence),
            other => Err(IoError::InvalidTopic(format!("unknown sensor type '{}'", other))),
        }
    }
}

pub fn sensor_topic(room_id: &str, sensor_type: SensorType) -> String {
    format!("{}.{}", room_id, sensor_type)
}

pub fn fault_topic(room_id: &str) -> String {
    format!("{}.fault", room_id)
}

pub fn occupancy_topic(room_id: &str) -> String {
    format!("{}.occupancy", room_id)
}

/// Split a sensor routing key into room id and sensor type.
///
/// The sensor type is the segment after the last dot, so room ids may
/// themselves contain dots.
pub fn parse_sensor_topic(topic: &str) -> Result<(&str, SensorType)> {
    let (room_id, kind) = topic
        .rsplit_once('.')
        .ok_or_else(|| IoError::InvalidTopic(format!("missing sensor type in '{}'", topic)))?;

    if room_id.is_empty() {
        return Err(IoError::InvalidTopic(format!("missing room id in '{}'", topic)));
    }

    Ok((room_id, kind.parse()?))
}

/// Every sensor topic for a set of rooms
pub fn subscriptions<'a>(rooms: impl IntoIterator<Item = &'a String>) -> Vec<String> {
    rooms
        .into_iter()
        .flat_map(|room| SensorType::ALL.iter().map(move |t| sensor_topic(room, *t)))
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_sensor_topics() {
        assert_eq!(
            parse_sensor_topic("room101.presence").ok(),
            Some(("room101", SensorType::Presence))
        );
        assert_eq!(
            parse_sensor_topic("building.a.room7.iaq").ok(),
            Some(("building.a.room7", SensorType::Iaq))
        );
    }

    #[test]
    fn rejects_bad_topics() {
        assert!(parse_sensor_topic("room101").is_err());
        assert!(parse_sensor_topic(".power").is_err());
        assert!(parse_sensor_topic("room101.fault").is_err());
    }

    #[test]
    fn builds_outbound_topics() {
        assert_eq!(fault_topic("room101"), "room101.fault");
        assert_eq!(occupancy_topic("room101"), "room101.occupancy");
        assert_eq!(sensor_topic("room102", SensorType::Power), "room102.power");
    }

    #[test]
    fn subscribes_to_every_stream() {
        let rooms = vec!["room101".to_string(), "room102".to_string()];
        let topics = subscriptions(&rooms);

        assert_eq!(topics.len(), 6);
        assert!(topics.contains(&"room102.iaq".to_string()));
    }
}
