//! Dispatch Layer
//!
//! Drives one reading through the aggregator and, when a snapshot comes out,
//! through the fault evaluator and the occupancy engine. Outputs are handed
//! to the collaborators before the call returns.

use crate::aggregator::RoomAggregationBuffer;
use crate::context::RoomContext;
use crate::faults::{FaultEvaluator, FaultReport, FaultRule, FaultRules, Rule};
use crate::occupancy::{Occupancy, OccupancyConfig, OccupancyEngine};
use crate::{EngineError, RawReading, Result, Snapshot};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use roomwatch_io::{
    topic, FactSink, OccupancyAlert, Publisher, RoomSensorsRow, RoomStateRow, SensorType,
    StateSink, TimeSeriesFact,
};
use serde::Serialize;
use std::sync::Arc;

/// Engine settings shared by every room
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Reference zone for local hours and persisted datetimes
    pub timezone: Tz,
    pub occupancy: OccupancyConfig,
    pub faults: FaultRules,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            timezone: chrono_tz::Asia::Bangkok,
            occupancy: OccupancyConfig::default(),
            faults: FaultRules::default(),
        }
    }
}

impl EngineConfig {
    /// Reject settings the cascade and rule table cannot work with
    pub fn validate(&self) -> Result<()> {
        let occupancy = &self.occupancy;
        if occupancy.history_capacity < 2 {
            return Err(EngineError::InvalidConfig(format!(
                "history_capacity must be at least 2, got {}",
                occupancy.history_capacity
            )));
        }
        if occupancy.night_start_hour > 23 || occupancy.night_end_hour > 23 {
            return Err(EngineError::InvalidConfig(format!(
                "night window hours must be 0-23, got {}-{}",
                occupancy.night_start_hour, occupancy.night_end_hour
            )));
        }

        for FaultRule { datapoint, rule } in &self.faults.rules {
            match rule {
                Rule::Range {
                    min: Some(min),
                    max: Some(max),
                } if min > max => {
                    return Err(EngineError::InvalidConfig(format!(
                        "{} range is empty: {} > {}",
                        datapoint, min, max
                    )));
                }
                Rule::Range { min: None, max: None } => {
                    return Err(EngineError::InvalidConfig(format!("{} range has no bounds", datapoint)));
                }
                Rule::Allowed { values } if values.is_empty() => {
                    return Err(EngineError::InvalidConfig(format!(
                        "{} allow-list is empty",
                        datapoint
                    )));
                }
                _ => {}
            }
        }
        Ok(())
    }
}

/// External collaborators the dispatcher writes to
#[derive(Clone)]
pub struct Collaborators {
    pub publisher: Arc<dyn Publisher>,
    pub facts: Arc<dyn FactSink>,
    pub states: Arc<dyn StateSink>,
}

/// Everything the engine remembers about one room
#[derive(Debug, Clone)]
pub struct RoomState {
    pub buffer: RoomAggregationBuffer,
    pub context: RoomContext,
}

/// What happened to one reading
#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    pub room_id: String,
    pub sensor_type: SensorType,
    /// Present only for presence readings
    pub snapshot: Option<Snapshot>,
    pub faults: Option<FaultReport>,
    pub occupancy: Occupancy,
    /// Collaborator writes that failed and were dropped
    pub failed_writes: usize,
}

impl DispatchOutcome {
    fn buffered(room_id: &str, sensor_type: SensorType) -> Self {
        Self {
            room_id: room_id.to_string(),
            sensor_type,
            snapshot: None,
            faults: None,
            occupancy: Occupancy::Unchanged,
            failed_writes: 0,
        }
    }
}

pub struct Dispatcher {
    faults: FaultEvaluator,
    occupancy: OccupancyEngine,
    timezone: Tz,
    collaborators: Collaborators,
}

impl Dispatcher {
    pub fn new(config: EngineConfig, collaborators: Collaborators) -> Self {
        Self {
            faults: FaultEvaluator::new(config.faults),
            occupancy: OccupancyEngine::new(config.occupancy, config.timezone),
            timezone: config.timezone,
            collaborators,
        }
    }

    pub fn new_room(&self) -> RoomState {
        RoomState {
            buffer: RoomAggregationBuffer::new(),
            context: self.occupancy.new_context(),
        }
    }

    pub fn fault_rules(&self) -> &[FaultRule] {
        self.faults.rules()
    }

    /// Process one reading for a room.
    ///
    /// Must not run concurrently for the same `state`. The in-memory state is
    /// updated before any write is attempted and is kept when writes fail.
    pub async fn handle(
        &self,
        state: &mut RoomState,
        room_id: &str,
        reading: RawReading,
        received_at: DateTime<Utc>,
    ) -> DispatchOutcome {
        let sensor_type = reading.sensor_type();

        let Some(snapshot) = state.buffer.observe(room_id, reading, received_at) else {
            tracing::trace!(room_id, %sensor_type, "Reading buffered");
            return DispatchOutcome::buffered(room_id, sensor_type);
        };

        let report = self.faults.evaluate(&snapshot);
        let occupancy = self.occupancy.infer(&mut state.context, &snapshot);

        let failed_writes = self.emit(&snapshot, &report, occupancy, sensor_type).await;

        DispatchOutcome {
            room_id: room_id.to_string(),
            sensor_type,
            snapshot: Some(snapshot),
            faults: Some(report),
            occupancy,
            failed_writes,
        }
    }

    async fn emit(
        &self,
        snapshot: &Snapshot,
        report: &FaultReport,
        occupancy: Occupancy,
        trigger: SensorType,
    ) -> usize {
        let mut failed = 0;
        let room_id = snapshot.room_id.as_str();
        let local = snapshot.timestamp.with_timezone(&self.timezone).fixed_offset();

        for (datapoint, value) in snapshot.fields() {
            let fact = TimeSeriesFact {
                timestamp: snapshot.timestamp.timestamp(),
                datetime: local.to_rfc3339(),
                device_id: room_id.to_string(),
                datapoint: datapoint.as_str().to_string(),
                value: value.to_string(),
            };
            if let Err(e) = self.collaborators.facts.append(fact).await {
                tracing::error!(room_id, %datapoint, "Failed to insert fact: {}", e);
                failed += 1;
            }
        }

        let text = |v: &crate::FieldValue| (!v.is_null()).then(|| v.to_string());
        let sensors = RoomSensorsRow {
            room_id: room_id.to_string(),
            timestamp: snapshot.timestamp.timestamp(),
            datetime: local,
            temperature: snapshot.temperature.as_f64(),
            humidity: snapshot.humidity.as_f64(),
            co2: snapshot.co2.as_f64(),
            power: snapshot.power.as_f64(),
            presence_state: text(&snapshot.presence_state),
        };
        if let Err(e) = self.collaborators.states.upsert_room_sensors(sensors).await {
            tracing::error!(room_id, "Failed to upsert room sensors: {}", e);
            failed += 1;
        }

        if report.is_pass() {
            tracing::info!(room_id, "No faults detected");
        } else {
            let alert = report.to_alert();
            match self.publish_json(topic::fault_topic(room_id), &alert).await {
                Ok(()) => tracing::warn!(
                    room_id,
                    datapoint = %alert.datapoint,
                    "Fault alert sent: {}",
                    alert.faults.join("; ")
                ),
                Err(e) => {
                    tracing::error!(room_id, "Failed to publish fault alert: {}", e);
                    failed += 1;
                }
            }
        }

        let Some(is_occupied) = occupancy.as_bool() else {
            tracing::info!(room_id, "No clear occupancy decision, holding last state");
            return failed;
        };

        let alert = OccupancyAlert {
            room_id: room_id.to_string(),
            timestamp: snapshot.timestamp.timestamp(),
            is_occupied,
            datapoint: trigger.as_str().to_string(),
        };
        match self.publish_json(topic::occupancy_topic(room_id), &alert).await {
            Ok(()) => tracing::info!(room_id, is_occupied, source = %trigger, "Occupancy published"),
            Err(e) => {
                tracing::error!(room_id, "Failed to publish occupancy: {}", e);
                failed += 1;
            }
        }

        let row = RoomStateRow {
            room_id: room_id.to_string(),
            is_occupied,
            vacancy_last_updated: local,
            datapoint: trigger.as_str().to_string(),
            health_status: report.health(),
            datapoint_last_updated: local,
        };
        if let Err(e) = self.collaborators.states.upsert_room_state(row).await {
            tracing::error!(room_id, "Failed to upsert room state: {}", e);
            failed += 1;
        }

        failed
    }

    async fn publish_json<T: Serialize>(&self, topic: String, body: &T) -> roomwatch_io::Result<()> {
        let payload = serde_json::to_vec(body)?;
        self.collaborators.publisher.publish(&topic, payload).await
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::reading::{AirQualityReading, PowerReading, PresenceReading};
    use crate::{Datapoint, FieldValue};
    use chrono::TimeZone;
    use roomwatch_io::memory::{MemoryFactSink, MemoryPublisher, MemoryStateSink};
    use roomwatch_io::HealthStatus;

    struct Harness {
        publisher: Arc<MemoryPublisher>,
        facts: Arc<MemoryFactSink>,
        states: Arc<MemoryStateSink>,
        dispatcher: Dispatcher,
    }

    fn harness() -> Harness {
        let publisher = Arc::new(MemoryPublisher::new());
        let facts = Arc::new(MemoryFactSink::new());
        let states = Arc::new(MemoryStateSink::new());
        let dispatcher = Dispatcher::new(
            EngineConfig::default(),
            Collaborators {
                publisher: publisher.clone(),
                facts: facts.clone(),
                states: states.clone(),
            },
        );
        Harness {
            publisher,
            facts,
            states,
            dispatcher,
        }
    }

    fn at(secs: i64) -> DateTime<Utc> {
        // 2025-04-11 14:00:00 in Bangkok
        Utc.with_ymd_and_hms(2025, 4, 11, 7, 0, 0).unwrap() + chrono::Duration::seconds(secs)
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

    fn presence(state: &str, online: &str) -> RawReading {
        RawReading::Presence(PresenceReading {
            presence_state: state.into(),
            sensitivity: FieldValue::Number(100.0),
            online_status: online.into(),
        })
    }

    #[test]
    fn default_config_is_valid() {
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_unusable_config() {
        let mut config = EngineConfig::default();
        config.occupancy.history_capacity = 1;
        assert!(matches!(config.validate(), Err(EngineError::InvalidConfig(_))));

        let mut config = EngineConfig::default();
        config.occupancy.night_start_hour = 24;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.faults.rules[0].rule = Rule::range(30.0, 20.0);
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.faults.rules.push(FaultRule {
            datapoint: Datapoint::OnlineStatus,
            rule: Rule::Allowed { values: Vec::new() },
        });
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn room101_end_to_end() {
        let h = harness();
        let mut room = h.dispatcher.new_room();

        let first = h.dispatcher.handle(&mut room, "room101", iaq(24.0, 55.0, 620.0), at(0)).await;
        assert!(first.snapshot.is_none());
        h.dispatcher.handle(&mut room, "room101", power(4.2), at(1)).await;
        let outcome = h
            .dispatcher
            .handle(&mut room, "room101", presence("occupied", "online"), at(2))
            .await;

        let snapshot = outcome.snapshot.unwrap();
        assert!(snapshot.fields().all(|(_, v)| !v.is_null()));
        assert!(outcome.faults.unwrap().is_pass());
        assert_eq!(outcome.occupancy, Occupancy::Occupied);
        assert_eq!(outcome.failed_writes, 0);

        let facts = h.facts.facts();
        assert_eq!(facts.len(), Datapoint::ALL.len());
        assert!(facts.iter().all(|f| f.device_id == "room101"));
        let co2 = facts.iter().find(|f| f.datapoint == "co2").unwrap();
        assert_eq!(co2.value, "620");
        assert_eq!(co2.datetime, "2025-04-11T14:00:02+07:00");

        assert_eq!(h.states.state_upserts(), 1);
        let row = h.states.room_state("room101", "presence").unwrap();
        assert!(row.is_occupied);
        assert_eq!(row.health_status, HealthStatus::Healthy);
        assert_eq!(h.states.room_sensors().len(), 1);

        assert!(h.publisher.messages_on("room101.fault").is_empty());
        let occupancy = h.publisher.messages_on("room101.occupancy");
        assert_eq!(occupancy.len(), 1);
        assert_eq!(occupancy[0]["is_occupied"], true);
        assert_eq!(occupancy[0]["datapoint"], "presence");
        assert_eq!(occupancy[0]["timestamp"], at(2).timestamp());
    }

    #[tokio::test]
    async fn faults_are_published_only_when_violated() {
        let h = harness();
        let mut room = h.dispatcher.new_room();

        h.dispatcher.handle(&mut room, "room102", iaq(24.0, 55.0, 1600.0), at(0)).await;
        h.dispatcher.handle(&mut room, "room102", power(4.2), at(1)).await;
        let outcome = h
            .dispatcher
            .handle(&mut room, "room102", presence("occupied", "offline"), at(2))
            .await;

        let alerts = h.publisher.messages_on("room102.fault");
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0]["datapoint"], "co2,online_status");
        assert_eq!(alerts[0]["faults"].as_array().unwrap().len(), 2);
        assert_eq!(outcome.faults.unwrap().datapoints.len(), 2);

        let row = h.states.room_state("room102", "presence").unwrap();
        assert_eq!(row.health_status, HealthStatus::Critical);
    }

    #[test]
    fn unchanged_decision_is_not_published() {
        let h = harness();
        let mut room = h.dispatcher.new_room();

        let outcome = tokio_test::block_on(h.dispatcher.handle(
            &mut room,
            "room101",
            presence("passive", "online"),
            at(0),
        ));

        assert_eq!(outcome.occupancy, Occupancy::Unchanged);
        assert!(h.publisher.messages_on("room101.occupancy").is_empty());
        assert_eq!(h.states.state_upserts(), 0);
        // The presence-only snapshot is still persisted and flagged.
        assert_eq!(h.facts.facts().len(), 7);
        assert_eq!(h.publisher.messages_on("room101.fault").len(), 1);
    }

    #[tokio::test]
    async fn write_failures_do_not_roll_back_decisions() {
        let h = harness();
        h.publisher.set_failing(true);
        h.facts.set_failing(true);
        h.states.set_failing(true);
        let mut room = h.dispatcher.new_room();

        let outcome = h
            .dispatcher
            .handle(&mut room, "room101", presence("occupied", "online"), at(0))
            .await;

        assert_eq!(outcome.occupancy, Occupancy::Occupied);
        // 7 facts, sensors row, fault alert, occupancy alert, state row
        assert_eq!(outcome.failed_writes, 11);
        assert_eq!(room.context.last_decision(), Some(true));

        // Once the collaborators recover, hysteresis uses the kept decision.
        h.publisher.set_failing(false);
        h.states.set_failing(false);
        let outcome = h
            .dispatcher
            .handle(&mut room, "room101", presence("passive", "online"), at(60))
            .await;
        assert_eq!(outcome.occupancy, Occupancy::Occupied);
        assert_eq!(h.publisher.messages_on("room101.occupancy").len(), 1);
    }
}
