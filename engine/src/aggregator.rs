//! Room Snapshot Aggregator
//!
//! Buffers the latest air-quality and power readings of a room and merges
//! them with each presence reading into a [`Snapshot`]. Presence is the
//! heartbeat: it is the only reading that produces output.

use crate::reading::{AirQualityReading, PowerReading, PresenceReading, RawReading};
use crate::Snapshot;
use chrono::{DateTime, Utc};

/// Unconsumed air-quality and power readings of one room
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RoomAggregationBuffer {
    air_quality: Option<AirQualityReading>,
    power: Option<PowerReading>,
}

impl RoomAggregationBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one reading into the buffer.
    ///
    /// Air-quality and power readings replace any unconsumed reading of the
    /// same type and yield nothing. A presence reading always yields exactly
    /// one snapshot and then empties the buffer, so buffered readings are
    /// used by at most one snapshot.
    pub fn observe(
        &mut self,
        room_id: &str,
        reading: RawReading,
        timestamp: DateTime<Utc>,
    ) -> Option<Snapshot> {
        match reading {
            RawReading::AirQuality(air_quality) => {
                if self.air_quality.replace(air_quality).is_some() {
                    tracing::trace!(room_id, "Overwriting unconsumed air-quality reading");
                }
                None
            }
            RawReading::Power(power) => {
                if self.power.replace(power).is_some() {
                    tracing::trace!(room_id, "Overwriting unconsumed power reading");
                }
                None
            }
            RawReading::Presence(presence) => Some(self.emit(room_id, presence, timestamp)),
        }
    }

    fn emit(&mut self, room_id: &str, presence: PresenceReading, timestamp: DateTime<Utc>) -> Snapshot {
        let mut snapshot = Snapshot::empty(room_id, timestamp);
        snapshot.presence_state = presence.presence_state;
        snapshot.sensitivity = presence.sensitivity;
        snapshot.online_status = presence.online_status;

        // Hard reset: both slots are cleared whether or not they were used.
        match (self.air_quality.take(), self.power.take()) {
            (Some(air_quality), Some(power)) => {
                snapshot.temperature = air_quality.temperature;
                snapshot.humidity = air_quality.humidity;
                snapshot.co2 = air_quality.co2;
                snapshot.power = power.power;
            }
            (air_quality, power) => {
                tracing::debug!(
                    room_id,
                    has_air_quality = air_quality.is_some(),
                    has_power = power.is_some(),
                    "Presence-only snapshot"
                );
            }
        }

        snapshot
    }

    pub fn is_empty(&self) -> bool {
        self.air_quality.is_none() && self.power.is_none()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::FieldValue;
    use chrono::{Duration, TimeZone};

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_744_388_100 + secs, 0).unwrap()
    }

    fn iaq(temperature: f64, humidity: f64, co2: f64) -> RawReading {
        RawReading::AirQuality(AirQualityReading {
            temperature: FieldValue::Number(temperature),
            humidity: FieldValue::Number(humidity),
            co2: FieldValue::Number(co2),
        })
    }

    fn power(kw: f64) -> RawReading {
        RawReading::Power(PowerReading {
            power: FieldValue::Number(kw),
        })
    }

    fn presence(state: &str) -> RawReading {
        RawReading::Presence(PresenceReading {
            presence_state: state.into(),
            sensitivity: FieldValue::Number(100.0),
            online_status: "online".into(),
        })
    }

    #[test]
    fn only_presence_emits() {
        let mut buffer = RoomAggregationBuffer::new();

        assert_eq!(buffer.observe("room101", iaq(24.0, 55.0, 620.0), at(0)), None);
        assert_eq!(buffer.observe("room101", power(4.2), at(1)), None);
        assert!(!buffer.is_empty());

        let snapshot = buffer.observe("room101", presence("occupied"), at(2)).unwrap();
        assert_eq!(snapshot.room_id, "room101");
        assert_eq!(snapshot.timestamp, at(2));
        assert_eq!(snapshot.temperature, FieldValue::Number(24.0));
        assert_eq!(snapshot.humidity, FieldValue::Number(55.0));
        assert_eq!(snapshot.co2, FieldValue::Number(620.0));
        assert_eq!(snapshot.power, FieldValue::Number(4.2));
        assert_eq!(snapshot.presence_state, FieldValue::from("occupied"));
        assert!(buffer.is_empty());
    }

    #[test]
    fn one_snapshot_per_presence_reading() {
        let mut buffer = RoomAggregationBuffer::new();
        let sequence = vec![
            presence("passive"),
            iaq(22.0, 50.0, 500.0),
            presence("passive"),
            power(5.0),
            power(5.5),
            iaq(23.0, 51.0, 510.0),
            presence("occupied"),
            presence("occupied"),
            iaq(23.0, 51.0, 520.0),
        ];

        let snapshots: Vec<_> = sequence
            .into_iter()
            .enumerate()
            .filter_map(|(i, r)| buffer.observe("room101", r, at(i as i64)))
            .collect();

        assert_eq!(snapshots.len(), 4);
        assert!(snapshots[0].co2.is_null());
        assert!(snapshots[1].co2.is_null());
        assert_eq!(snapshots[2].co2, FieldValue::Number(510.0));
        assert_eq!(snapshots[2].power, FieldValue::Number(5.5));
        assert!(snapshots[3].co2.is_null());
    }

    #[test]
    fn partial_buffer_is_discarded() {
        let mut buffer = RoomAggregationBuffer::new();
        buffer.observe("room101", iaq(24.0, 55.0, 620.0), at(0));

        let first = buffer.observe("room101", presence("occupied"), at(1)).unwrap();
        assert!(first.temperature.is_null());
        assert!(first.power.is_null());
        assert_eq!(first.online_status, FieldValue::from("online"));

        // The air-quality reading was consumed even though it was not used.
        buffer.observe("room101", power(4.0), at(2));
        let second = buffer.observe("room101", presence("occupied"), at(3)).unwrap();
        assert!(second.co2.is_null());
        assert!(second.power.is_null());
    }

    #[test]
    fn empty_buffer_still_emits() {
        let mut buffer = RoomAggregationBuffer::new();
        let snapshot = buffer
            .observe("room9", presence("unoccupied"), at(0) + Duration::seconds(5))
            .unwrap();

        assert_eq!(snapshot.fields().filter(|(_, v)| v.is_null()).count(), 4);
    }
}
