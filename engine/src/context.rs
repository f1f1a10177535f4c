//! Occupancy Context
//!
//! Rolling per-room state behind the occupancy cascade: a bounded CO₂
//! history, the last presence signal and the last emitted decision.

use crate::Snapshot;
use chrono::{DateTime, Utc};
use std::collections::VecDeque;

pub const DEFAULT_HISTORY_CAPACITY: usize = 10;

/// Bounded FIFO of timestamped CO₂ samples
#[derive(Debug, Clone)]
pub struct Co2History {
    samples: VecDeque<(DateTime<Utc>, f64)>,
    capacity: usize,
}

impl Co2History {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Add sample, evicting the oldest when full
    pub fn push(&mut self, timestamp: DateTime<Utc>, co2: f64) {
        if self.samples.len() >= self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back((timestamp, co2));
    }

    /// Rate of change between the oldest and newest sample, in ppm/minute.
    ///
    /// 0.0 means "no trend information": fewer than two samples, or no time
    /// between them.
    pub fn slope(&self) -> f64 {
        let (Some((t1, v1)), Some((t2, v2))) = (self.samples.front(), self.samples.back()) else {
            return 0.0;
        };
        if self.samples.len() < 2 {
            return 0.0;
        }

        let minutes = (*t2 - *t1).num_milliseconds() as f64 / 60_000.0;
        if minutes == 0.0 {
            return 0.0;
        }
        (v2 - v1) / minutes
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Trend data handed to the inference cascade
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrendSummary {
    pub co2_slope: f64,
    /// Seconds since the room was last seen `occupied`; `None` if never
    pub seconds_since_last_presence: Option<f64>,
    pub last_decision: Option<bool>,
}

/// Per-room occupancy context
#[derive(Debug, Clone)]
pub struct RoomContext {
    history: Co2History,
    last_presence_state: Option<String>,
    last_presence_time: Option<DateTime<Utc>>,
    last_occupied_time: Option<DateTime<Utc>>,
    last_decision: Option<bool>,
}

impl Default for RoomContext {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }
}

impl RoomContext {
    pub fn new(history_capacity: usize) -> Self {
        Self {
            history: Co2History::new(history_capacity),
            last_presence_state: None,
            last_presence_time: None,
            last_occupied_time: None,
            last_decision: None,
        }
    }

    /// Fold a snapshot into the context and summarize the trend
    pub fn record(&mut self, snapshot: &Snapshot) -> TrendSummary {
        if let Some(co2) = snapshot.co2.as_f64() {
            self.history.push(snapshot.timestamp, co2);
        }

        if !snapshot.presence_state.is_null() {
            let state = snapshot.presence_state.to_string();
            if state == "occupied" {
                self.last_occupied_time = Some(snapshot.timestamp);
            }
            self.last_presence_state = Some(state);
            self.last_presence_time = Some(snapshot.timestamp);
        }

        TrendSummary {
            co2_slope: self.history.slope(),
            seconds_since_last_presence: self
                .last_occupied_time
                .map(|t| (snapshot.timestamp - t).num_milliseconds() as f64 / 1000.0),
            last_decision: self.last_decision,
        }
    }

    pub fn last_decision(&self) -> Option<bool> {
        self.last_decision
    }

    pub fn set_last_decision(&mut self, decision: Option<bool>) {
        self.last_decision = decision;
    }

    pub fn last_presence(&self) -> Option<(&str, DateTime<Utc>)> {
        self.last_presence_state
            .as_deref()
            .zip(self.last_presence_time)
    }

    pub fn history(&self) -> &Co2History {
        &self.history
    }
}
