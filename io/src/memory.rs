//! In-process collaborators
//!
//! Keep everything they are handed so replays and tests can inspect the
//! output of the engine. Each can be switched into a failing mode.

use crate::{
    Acknowledge, BoxFuture, FactSink, IoError, Publisher, Result, RoomSensorsRow, RoomStateRow,
    StateSink, TimeSeriesFact,
};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Publisher that records every message
#[derive(Default)]
pub struct MemoryPublisher {
    published: Mutex<Vec<(String, Vec<u8>)>>,
    failing: AtomicBool,
}

impl MemoryPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent publish fail
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// All published (topic, payload) pairs in order
    pub fn published(&self) -> Vec<(String, Vec<u8>)> {
        lock(&self.published).clone()
    }

    /// Decoded JSON bodies published on one topic
    pub fn messages_on(&self, topic: &str) -> Vec<serde_json::Value> {
        lock(&self.published)
            .iter()
            .filter(|(t, _)| t == topic)
            .filter_map(|(_, payload)| serde_json::from_slice(payload).ok())
            .collect()
    }
}

impl Publisher for MemoryPublisher {
    fn publish<'a>(&'a self, topic: &'a str, payload: Vec<u8>) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            if self.failing.load(Ordering::SeqCst) {
                return Err(IoError::Publish(format!("broker unavailable for {}", topic)));
            }
            lock(&self.published).push((topic.to_string(), payload));
            Ok(())
        })
    }
}

/// Time-series sink that keeps facts in memory
#[derive(Default)]
pub struct MemoryFactSink {
    facts: Mutex<Vec<TimeSeriesFact>>,
    failing: AtomicBool,
}

impl MemoryFactSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn facts(&self) -> Vec<TimeSeriesFact> {
        lock(&self.facts).clone()
    }
}

impl FactSink for MemoryFactSink {
    fn append(&self, fact: TimeSeriesFact) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if self.failing.load(Ordering::SeqCst) {
                return Err(IoError::Persistence("time-series store unavailable".into()));
            }
            lock(&self.facts).push(fact);
            Ok(())
        })
    }
}

/// Keyed state tables held in memory
#[derive(Default)]
pub struct MemoryStateSink {
    states: Mutex<BTreeMap<(String, String), RoomStateRow>>,
    sensors: Mutex<BTreeMap<(String, i64), RoomSensorsRow>>,
    upserts: AtomicUsize,
    failing: AtomicBool,
}

impl MemoryStateSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Current room state rows
    pub fn room_states(&self) -> Vec<RoomStateRow> {
        lock(&self.states).values().cloned().collect()
    }

    pub fn room_state(&self, room_id: &str, datapoint: &str) -> Option<RoomStateRow> {
        lock(&self.states)
            .get(&(room_id.to_string(), datapoint.to_string()))
            .cloned()
    }

    /// Current fused sensor rows
    pub fn room_sensors(&self) -> Vec<RoomSensorsRow> {
        lock(&self.sensors).values().cloned().collect()
    }

    /// Number of successful room state upserts, including overwrites
    pub fn state_upserts(&self) -> usize {
        self.upserts.load(Ordering::SeqCst)
    }
}

impl StateSink for MemoryStateSink {
    fn upsert_room_state(&self, row: RoomStateRow) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if self.failing.load(Ordering::SeqCst) {
                return Err(IoError::Persistence("state store unavailable".into()));
            }
            let key = (row.room_id.clone(), row.datapoint.clone());
            lock(&self.states).insert(key, row);
            self.upserts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    fn upsert_room_sensors(&self, row: RoomSensorsRow) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if self.failing.load(Ordering::SeqCst) {
                return Err(IoError::Persistence("state store unavailable".into()));
            }
            let key = (row.room_id.clone(), row.timestamp);
            lock(&self.sensors).insert(key, row);
            Ok(())
        })
    }
}

/// Counts acknowledgments handed out through [`AckCounter::handle`]
#[derive(Clone, Default)]
pub struct AckCounter {
    acked: Arc<AtomicUsize>,
}

impl AckCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle(&self) -> Box<dyn Acknowledge> {
        Box::new(CountingAck {
            acked: self.acked.clone(),
        })
    }

    pub fn count(&self) -> usize {
        self.acked.load(Ordering::SeqCst)
    }
}

struct CountingAck {
    acked: Arc<AtomicUsize>,
}

impl Acknowledge for CountingAck {
    fn ack(self: Box<Self>) -> BoxFuture<'static, Result<()>> {
        Box::pin(async move {
            self.acked.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }
}
