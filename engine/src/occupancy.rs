//! Occupancy Inference
//!
//! Prioritized rule cascade over the presence signal, CO₂ level and CO₂
//! trend. When the signals are inconclusive the last decision is held.

use crate::context::{RoomContext, TrendSummary, DEFAULT_HISTORY_CAPACITY};
use crate::{PresenceState, Snapshot};
use chrono::Timelike;
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

/// Cascade thresholds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OccupancyConfig {
    /// CO₂ samples kept per room for the slope
    pub history_capacity: usize,
    /// Passive: CO₂ (ppm) above which the room counts as occupied
    pub passive_co2_ppm: f64,
    /// Passive: slope (ppm/min) above which the room counts as occupied
    pub passive_slope: f64,
    /// Passive at night: CO₂ (ppm) above which the room counts as occupied
    pub night_co2_ppm: f64,
    /// Local hour the night window starts (inclusive)
    pub night_start_hour: u32,
    /// Local hour the night window ends (exclusive)
    pub night_end_hour: u32,
    /// Unoccupied: CO₂ (ppm) above which the room is still occupied
    pub unoccupied_co2_ppm: f64,
    /// Unoccupied: slope (ppm/min) above which the room is still occupied
    pub unoccupied_slope: f64,
    /// Unoccupied: CO₂ (ppm) below which a falling trend means vacant
    pub vacant_co2_ppm: f64,
    /// Unoccupied: seconds after the last `occupied` signal that still count
    pub presence_grace_secs: f64,
}

impl Default for OccupancyConfig {
    fn default() -> Self {
        Self {
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            passive_co2_ppm: 700.0,
            passive_slope: 1.0,
            night_co2_ppm: 650.0,
            night_start_hour: 22,
            night_end_hour: 8,
            unoccupied_co2_ppm: 800.0,
            unoccupied_slope: 2.0,
            vacant_co2_ppm: 600.0,
            presence_grace_secs: 300.0,
        }
    }
}

impl OccupancyConfig {
    pub fn is_night(&self, hour: u32) -> bool {
        if self.night_start_hour <= self.night_end_hour {
            hour >= self.night_start_hour && hour < self.night_end_hour
        } else {
            hour >= self.night_start_hour || hour < self.night_end_hour
        }
    }
}

/// Cascade output
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Occupancy {
    Occupied,
    Vacant,
    /// Hold whatever was published last; nothing was ever decided
    Unchanged,
}

impl Occupancy {
    pub fn from_decision(decision: Option<bool>) -> Self {
        match decision {
            Some(true) => Occupancy::Occupied,
            Some(false) => Occupancy::Vacant,
            None => Occupancy::Unchanged,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Occupancy::Occupied => Some(true),
            Occupancy::Vacant => Some(false),
            Occupancy::Unchanged => None,
        }
    }
}

/// Which cascade branch fired
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Branch {
    PresenceOccupied,
    PassiveCo2,
    PassiveNightCo2,
    PassiveNightHold,
    PassiveHold,
    UnoccupiedCo2,
    UnoccupiedFalling,
    UnoccupiedRecentPresence,
    UnoccupiedHold,
    UnknownHold,
}

/// Inputs of one cascade evaluation
#[derive(Debug, Clone, Copy)]
pub struct Signals {
    pub presence: Option<PresenceState>,
    pub co2: Option<f64>,
    pub hour: u32,
    pub trend: TrendSummary,
}

/// Evaluate the cascade. First matching branch wins.
///
/// A null CO₂ reading carries no information: it satisfies neither an
/// "above" nor a "below" comparison.
pub fn decide(config: &OccupancyConfig, signals: &Signals) -> (Occupancy, Branch) {
    let slope = signals.trend.co2_slope;
    let above = |limit: f64| signals.co2.map(|c| c > limit).unwrap_or(false);
    let below = |limit: f64| signals.co2.map(|c| c < limit).unwrap_or(false);
    let hold = Occupancy::from_decision(signals.trend.last_decision);

    match signals.presence {
        Some(PresenceState::Occupied) => (Occupancy::Occupied, Branch::PresenceOccupied),

        Some(PresenceState::Passive) => {
            if above(config.passive_co2_ppm) || slope > config.passive_slope {
                (Occupancy::Occupied, Branch::PassiveCo2)
            } else if config.is_night(signals.hour) && above(config.night_co2_ppm) {
                (Occupancy::Occupied, Branch::PassiveNightCo2)
            } else if config.is_night(signals.hour) {
                (hold, Branch::PassiveNightHold)
            } else {
                (hold, Branch::PassiveHold)
            }
        }

        Some(PresenceState::Unoccupied) => {
            let recent = signals
                .trend
                .seconds_since_last_presence
                .map(|secs| secs < config.presence_grace_secs)
                .unwrap_or(false);

            if above(config.unoccupied_co2_ppm) || slope > config.unoccupied_slope {
                (Occupancy::Occupied, Branch::UnoccupiedCo2)
            } else if below(config.vacant_co2_ppm) && slope < 0.0 {
                (Occupancy::Vacant, Branch::UnoccupiedFalling)
            } else if recent {
                (Occupancy::Occupied, Branch::UnoccupiedRecentPresence)
            } else {
                (hold, Branch::UnoccupiedHold)
            }
        }

        None => (hold, Branch::UnknownHold),
    }
}

/// Runs the cascade against a room's context
#[derive(Debug, Clone)]
pub struct OccupancyEngine {
    config: OccupancyConfig,
    timezone: Tz,
}

impl OccupancyEngine {
    pub fn new(config: OccupancyConfig, timezone: Tz) -> Self {
        Self { config, timezone }
    }

    pub fn config(&self) -> &OccupancyConfig {
        &self.config
    }

    /// Fresh context sized for this engine
    pub fn new_context(&self) -> RoomContext {
        RoomContext::new(self.config.history_capacity)
    }

    /// Infer occupancy for the snapshot's room.
    ///
    /// The returned value always becomes the room's last decision, so
    /// replaying a snapshot is idempotent.
    pub fn infer(&self, context: &mut RoomContext, snapshot: &Snapshot) -> Occupancy {
        let trend = context.record(snapshot);
        let signals = Signals {
            presence: snapshot.presence(),
            co2: snapshot.co2.as_f64(),
            hour: snapshot.timestamp.with_timezone(&self.timezone).hour(),
            trend,
        };

        let (occupancy, branch) = decide(&self.config, &signals);
        context.set_last_decision(occupancy.as_bool());

        tracing::debug!(
            room_id = %snapshot.room_id,
            presence = %snapshot.presence_state,
            co2 = ?signals.co2,
            slope = trend.co2_slope,
            hour = signals.hour,
            ?branch,
            ?occupancy,
            "Occupancy inferred"
        );

        occupancy
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::FieldValue;
    use chrono::{DateTime, Duration, TimeZone, Utc};

    fn signals(presence: Option<PresenceState>, co2: Option<f64>, slope: f64, hour: u32) -> Signals {
        Signals {
            presence,
            co2,
            hour,
            trend: TrendSummary {
                co2_slope: slope,
                seconds_since_last_presence: None,
                last_decision: None,
            },
        }
    }

    fn decide_default(s: Signals) -> Occupancy {
        decide(&OccupancyConfig::default(), &s).0
    }

    #[test]
    fn occupied_presence_always_wins() {
        for (co2, slope, hour) in [(None, 0.0, 3), (Some(300.0), -5.0, 14), (Some(2000.0), 9.0, 23)] {
            let s = signals(Some(PresenceState::Occupied), co2, slope, hour);
            assert_eq!(decide(&OccupancyConfig::default(), &s), (Occupancy::Occupied, Branch::PresenceOccupied));
        }
    }

    #[test]
    fn passive_cascade() {
        use PresenceState::Passive;

        assert_eq!(decide_default(signals(Some(Passive), Some(750.0), 0.0, 14)), Occupancy::Occupied);
        assert_eq!(decide_default(signals(Some(Passive), Some(500.0), 1.5, 14)), Occupancy::Occupied);
        assert_eq!(decide_default(signals(Some(Passive), Some(680.0), 0.0, 23)), Occupancy::Occupied);
        assert_eq!(decide_default(signals(Some(Passive), Some(680.0), 0.0, 14)), Occupancy::Unchanged);
        assert_eq!(decide_default(signals(Some(Passive), Some(500.0), 0.0, 14)), Occupancy::Unchanged);

        let mut held = signals(Some(Passive), Some(600.0), 0.0, 2);
        held.trend.last_decision = Some(false);
        assert_eq!(
            decide(&OccupancyConfig::default(), &held),
            (Occupancy::Vacant, Branch::PassiveNightHold)
        );
    }

    #[test]
    fn unoccupied_cascade() {
        use PresenceState::Unoccupied;

        // CO₂ above 800 fires before the falling-trend branch is considered.
        assert_eq!(decide_default(signals(Some(Unoccupied), Some(900.0), 0.0, 14)), Occupancy::Occupied);
        assert_eq!(decide_default(signals(Some(Unoccupied), Some(500.0), 2.5, 14)), Occupancy::Occupied);
        assert_eq!(decide_default(signals(Some(Unoccupied), Some(550.0), -0.5, 14)), Occupancy::Vacant);

        let mut recent = signals(Some(Unoccupied), Some(650.0), 0.0, 14);
        recent.trend.seconds_since_last_presence = Some(120.0);
        assert_eq!(
            decide(&OccupancyConfig::default(), &recent),
            (Occupancy::Occupied, Branch::UnoccupiedRecentPresence)
        );

        recent.trend.seconds_since_last_presence = Some(301.0);
        recent.trend.last_decision = Some(true);
        assert_eq!(
            decide(&OccupancyConfig::default(), &recent),
            (Occupancy::Occupied, Branch::UnoccupiedHold)
        );
    }

    #[test]
    fn null_co2_satisfies_no_comparison() {
        let s = signals(Some(PresenceState::Unoccupied), None, -3.0, 14);
        assert_eq!(decide(&OccupancyConfig::default(), &s), (Occupancy::Unchanged, Branch::UnoccupiedHold));
    }

    #[test]
    fn unknown_presence_holds() {
        let mut s = signals(None, Some(1200.0), 5.0, 14);
        assert_eq!(decide_default(s), Occupancy::Unchanged);
        s.trend.last_decision = Some(true);
        assert_eq!(decide(&OccupancyConfig::default(), &s), (Occupancy::Occupied, Branch::UnknownHold));
    }

    #[test]
    fn night_window_wraps_midnight() {
        let config = OccupancyConfig::default();
        assert!(config.is_night(22));
        assert!(config.is_night(0));
        assert!(config.is_night(7));
        assert!(!config.is_night(8));
        assert!(!config.is_night(21));
    }

    fn at_local(hour: u32) -> DateTime<Utc> {
        chrono_tz::Asia::Bangkok
            .with_ymd_and_hms(2025, 4, 11, hour, 0, 0)
            .unwrap()
            .with_timezone(&Utc)
    }

    fn snapshot(timestamp: DateTime<Utc>, presence: &str, co2: Option<f64>) -> Snapshot {
        let mut s = Snapshot::empty("room101", timestamp);
        s.presence_state = presence.into();
        s.co2 = co2.map(FieldValue::Number).unwrap_or_default();
        s
    }

    #[test]
    fn hour_comes_from_reference_zone() {
        let engine = OccupancyEngine::new(OccupancyConfig::default(), chrono_tz::Asia::Bangkok);

        // 23:00 in Bangkok is 16:00 UTC; only the local hour is night.
        let mut context = engine.new_context();
        assert_eq!(
            engine.infer(&mut context, &snapshot(at_local(23), "passive", Some(680.0))),
            Occupancy::Occupied
        );

        let mut context = engine.new_context();
        assert_eq!(
            engine.infer(&mut context, &snapshot(at_local(14), "passive", Some(680.0))),
            Occupancy::Unchanged
        );
    }

    #[test]
    fn no_prior_decision_holds_unchanged() {
        let engine = OccupancyEngine::new(OccupancyConfig::default(), chrono_tz::Asia::Bangkok);
        let mut context = engine.new_context();

        let outcome = engine.infer(&mut context, &snapshot(at_local(14), "passive", Some(500.0)));
        assert_eq!(outcome, Occupancy::Unchanged);
        assert_eq!(context.last_decision(), None);
    }

    #[test]
    fn hysteresis_carries_last_decision() {
        let engine = OccupancyEngine::new(OccupancyConfig::default(), chrono_tz::Asia::Bangkok);
        let mut context = engine.new_context();
        let start = at_local(14);

        assert_eq!(engine.infer(&mut context, &snapshot(start, "occupied", None)), Occupancy::Occupied);

        // Passive during the day with low CO₂ keeps the room occupied.
        let later = start + Duration::minutes(20);
        assert_eq!(engine.infer(&mut context, &snapshot(later, "passive", Some(500.0))), Occupancy::Occupied);

        // Unoccupied past the grace period with falling CO₂ vacates it.
        let falling = later + Duration::minutes(10);
        assert_eq!(engine.infer(&mut context, &snapshot(falling, "unoccupied", Some(450.0))), Occupancy::Vacant);
        assert_eq!(context.last_decision(), Some(false));
    }

    #[test]
    fn recently_occupied_room_stays_occupied() {
        let engine = OccupancyEngine::new(OccupancyConfig::default(), chrono_tz::Asia::Bangkok);
        let mut context = engine.new_context();
        let start = at_local(14);

        engine.infer(&mut context, &snapshot(start, "occupied", None));
        let soon = start + Duration::seconds(90);
        assert_eq!(engine.infer(&mut context, &snapshot(soon, "unoccupied", None)), Occupancy::Occupied);
    }

    #[test]
    fn replay_is_idempotent() {
        let engine = OccupancyEngine::new(OccupancyConfig::default(), chrono_tz::Asia::Bangkok);
        let mut context = engine.new_context();
        let s = snapshot(at_local(10), "unoccupied", Some(900.0));

        let first = engine.infer(&mut context, &s);
        let second = engine.infer(&mut context, &s);

        assert_eq!(first, Occupancy::Occupied);
        assert_eq!(second, Occupancy::Occupied);
        assert_eq!(context.last_decision(), second.as_bool());
    }
}
