//! JSON-lines persistence
//!
//! Facts and fused sensor rows are appended to `facts.jsonl` and
//! `room_sensors.jsonl`. Room state is a small keyed table rewritten to
//! `room_states.json` on every upsert.

use crate::{
    BoxFuture, FactSink, IoError, Result, RoomSensorsRow, RoomStateRow, StateSink, TimeSeriesFact,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs::{create_dir_all, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub const FACTS_FILE: &str = "facts.jsonl";
pub const ROOM_STATES_FILE: &str = "room_states.json";
pub const ROOM_SENSORS_FILE: &str = "room_sensors.jsonl";

fn poisoned<T>(_: T) -> IoError {
    IoError::Persistence("writer lock poisoned".into())
}

/// Append-only JSON-lines file
struct LineLog {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
}

impl LineLog {
    fn open(path: PathBuf) -> Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    fn append(&self, record: &impl Serialize) -> Result<()> {
        let json = serde_json::to_string(record)?;
        let mut writer = self.writer.lock().map_err(poisoned)?;
        writeln!(writer, "{}", json)?;
        writer.flush()?;
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        self.writer.lock().map_err(poisoned)?.flush()?;
        Ok(())
    }
}

/// Append-only fact log
pub struct JsonLinesFactSink {
    log: LineLog,
}

impl JsonLinesFactSink {
    pub fn open(base_path: &Path) -> Result<Self> {
        create_dir_all(base_path)?;
        let log = LineLog::open(base_path.join(FACTS_FILE))?;

        tracing::info!("Appending time-series facts to {:?}", log.path);

        Ok(Self { log })
    }

    pub fn path(&self) -> &Path {
        &self.log.path
    }

    pub fn flush(&self) -> Result<()> {
        self.log.flush()
    }
}

impl FactSink for JsonLinesFactSink {
    fn append(&self, fact: TimeSeriesFact) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move { self.log.append(&fact) })
    }
}

/// Keyed table persisted as a JSON array of rows
struct Table<K, V> {
    path: PathBuf,
    rows: BTreeMap<K, V>,
}

impl<K: Ord, V: Serialize + DeserializeOwned> Table<K, V> {
    fn load(path: PathBuf, key: impl Fn(&V) -> K) -> Result<Self> {
        let mut rows = BTreeMap::new();

        if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            let stored: Vec<V> = serde_json::from_str(&content)?;
            for row in stored {
                rows.insert(key(&row), row);
            }
            tracing::debug!("Loaded {} rows from {:?}", rows.len(), path);
        }

        Ok(Self { path, rows })
    }

    fn upsert(&mut self, key: K, row: V) -> Result<()> {
        self.rows.insert(key, row);

        let values: Vec<&V> = self.rows.values().collect();
        let json = serde_json::to_string_pretty(&values)?;

        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

/// Room state table and sensor row log on disk
pub struct JsonStateStore {
    states: Mutex<Table<(String, String), RoomStateRow>>,
    // One row per snapshot, never rewritten
    sensors: LineLog,
}

impl JsonStateStore {
    pub fn open(base_path: &Path) -> Result<Self> {
        create_dir_all(base_path)?;

        let states = Table::load(base_path.join(ROOM_STATES_FILE), |r: &RoomStateRow| {
            (r.room_id.clone(), r.datapoint.clone())
        })?;
        let sensors = LineLog::open(base_path.join(ROOM_SENSORS_FILE))?;

        tracing::info!(
            "Room state table ready in {:?} ({} rows)",
            base_path,
            states.rows.len()
        );

        Ok(Self {
            states: Mutex::new(states),
            sensors,
        })
    }
}

impl StateSink for JsonStateStore {
    fn upsert_room_state(&self, row: RoomStateRow) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let key = (row.room_id.clone(), row.datapoint.clone());
            self.states.lock().map_err(poisoned)?.upsert(key, row)
        })
    }

    fn upsert_room_sensors(&self, row: RoomSensorsRow) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move { self.sensors.append(&row) })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::HealthStatus;
    use chrono::{FixedOffset, TimeZone};

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "roomwatch-{}-{}-{}",
            name,
            std::process::id(),
            chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
        ));
        create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn facts_are_appended_as_lines() {
        let dir = scratch_dir("facts");
        let sink = JsonLinesFactSink::open(&dir).unwrap();

        for datapoint in ["temperature", "co2"] {
            tokio_test::block_on(sink.append(TimeSeriesFact {
                timestamp: 1_744_388_100,
                datetime: "2025-04-11T23:15:00+07:00".into(),
                device_id: "room101".into(),
                datapoint: datapoint.into(),
                value: "24".into(),
            }))
            .unwrap();
        }

        let content = std::fs::read_to_string(sink.path()).unwrap();
        let lines: Vec<TimeSeriesFact> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1].datapoint, "co2");

        std::fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn state_rows_survive_reopen() {
        let dir = scratch_dir("states");
        let at = FixedOffset::east_opt(7 * 3600)
            .unwrap()
            .with_ymd_and_hms(2025, 4, 11, 23, 15, 0)
            .unwrap();
        let row = |occupied| RoomStateRow {
            room_id: "room101".into(),
            is_occupied: occupied,
            vacancy_last_updated: at,
            datapoint: "presence".into(),
            health_status: HealthStatus::Warning,
            datapoint_last_updated: at,
        };

        {
            let store = JsonStateStore::open(&dir).unwrap();
            tokio_test::block_on(store.upsert_room_state(row(true))).unwrap();
            tokio_test::block_on(store.upsert_room_state(row(false))).unwrap();
        }

        let content = std::fs::read_to_string(dir.join(ROOM_STATES_FILE)).unwrap();
        let rows: Vec<RoomStateRow> = serde_json::from_str(&content).unwrap();
        assert_eq!(rows, vec![row(false)]);

        let reopened = JsonStateStore::open(&dir).unwrap();
        assert_eq!(reopened.states.lock().unwrap().rows.len(), 1);

        std::fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn sensor_rows_are_appended_across_reopen() {
        let dir = scratch_dir("sensors");
        let at = FixedOffset::east_opt(7 * 3600)
            .unwrap()
            .with_ymd_and_hms(2025, 4, 11, 23, 15, 0)
            .unwrap();
        let row = |timestamp| RoomSensorsRow {
            room_id: "room101".into(),
            timestamp,
            datetime: at,
            temperature: Some(24.0),
            humidity: None,
            co2: Some(620.0),
            power: None,
            presence_state: Some("occupied".into()),
        };

        {
            let store = JsonStateStore::open(&dir).unwrap();
            for timestamp in 0..100 {
                tokio_test::block_on(store.upsert_room_sensors(row(timestamp))).unwrap();
            }
        }
        let store = JsonStateStore::open(&dir).unwrap();
        tokio_test::block_on(store.upsert_room_sensors(row(100))).unwrap();

        let content = std::fs::read_to_string(dir.join(ROOM_SENSORS_FILE)).unwrap();
        let rows: Vec<RoomSensorsRow> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(rows.len(), 101);
        assert_eq!(rows[0], row(0));
        assert_eq!(rows[100], row(100));

        std::fs::remove_dir_all(dir).ok();
    }
}
