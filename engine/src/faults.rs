//! Fault Detection
//!
//! Static threshold and allowed-value rules applied to every snapshot.

use crate::{Datapoint, FieldValue, Snapshot};
use chrono::{DateTime, Utc};
use roomwatch_io::{FaultAlert, HealthStatus};
use serde::{Deserialize, Serialize};

/// One check against a single datapoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Rule {
    /// Numeric floor and/or ceiling, both inclusive
    Range {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        min: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max: Option<f64>,
    },
    /// Enumerated allow-list of text values
    Allowed { values: Vec<String> },
}

impl Rule {
    pub fn range(min: f64, max: f64) -> Self {
        Rule::Range {
            min: Some(min),
            max: Some(max),
        }
    }

    pub fn floor(min: f64) -> Self {
        Rule::Range {
            min: Some(min),
            max: None,
        }
    }

    pub fn allowed(values: &[&str]) -> Self {
        Rule::Allowed {
            values: values.iter().map(|v| v.to_string()).collect(),
        }
    }

    /// Violation messages for a value; empty when the value passes
    pub fn check(&self, datapoint: Datapoint, value: &FieldValue) -> Vec<String> {
        if value.is_null() {
            return vec![format!("{} is missing or null.", datapoint)];
        }

        match self {
            Rule::Range { min, max } => {
                let number = match value.coerce_f64() {
                    Ok(Some(number)) => number,
                    Ok(None) => return vec![format!("{} is missing or null.", datapoint)],
                    Err(e) => return vec![format!("{} invalid value: {} ({})", datapoint, value, e)],
                };

                let mut violations = Vec::new();
                if let Some(min) = min {
                    if number < *min {
                        violations.push(format!("{} below min: {} < {}", datapoint, value, min));
                    }
                }
                if let Some(max) = max {
                    if number > *max {
                        violations.push(format!("{} above max: {} > {}", datapoint, value, max));
                    }
                }
                violations
            }

            Rule::Allowed { values } => {
                let allowed = value
                    .as_text()
                    .map(|text| values.iter().any(|v| v == text))
                    .unwrap_or(false);

                if allowed {
                    Vec::new()
                } else {
                    vec![format!("{} value not allowed: {}", datapoint, value)]
                }
            }
        }
    }
}

/// A rule bound to the datapoint it checks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaultRule {
    pub datapoint: Datapoint,
    pub rule: Rule,
}

/// Ordered rule table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaultRules {
    pub rules: Vec<FaultRule>,
}

impl Default for FaultRules {
    fn default() -> Self {
        let rule = |datapoint, rule| FaultRule { datapoint, rule };

        Self {
            rules: vec![
                rule(Datapoint::Temperature, Rule::range(18.0, 27.0)),
                rule(Datapoint::Humidity, Rule::range(30.0, 65.0)),
                rule(Datapoint::Co2, Rule::range(400.0, 1500.0)),
                rule(Datapoint::Power, Rule::range(3.0, 10.0)),
                rule(Datapoint::Sensitivity, Rule::floor(50.0)),
                rule(
                    Datapoint::PresenceState,
                    Rule::allowed(&["occupied", "unoccupied", "passive"]),
                ),
                rule(Datapoint::OnlineStatus, Rule::allowed(&["online"])),
            ],
        }
    }
}

/// Result of checking one snapshot
#[derive(Debug, Clone, PartialEq)]
pub struct FaultReport {
    pub room_id: String,
    pub timestamp: DateTime<Utc>,
    /// Violation messages in rule order
    pub violations: Vec<String>,
    /// Offending datapoints, each listed once in first-violation order
    pub datapoints: Vec<Datapoint>,
}

impl FaultReport {
    pub fn is_pass(&self) -> bool {
        self.violations.is_empty()
    }

    /// An offline or misreporting presence device outranks out-of-range
    /// environment values.
    pub fn health(&self) -> HealthStatus {
        if self.is_pass() {
            HealthStatus::Healthy
        } else if self.datapoints.contains(&Datapoint::OnlineStatus) {
            HealthStatus::Critical
        } else {
            HealthStatus::Warning
        }
    }

    pub fn to_alert(&self) -> FaultAlert {
        FaultAlert {
            room_id: self.room_id.clone(),
            timestamp: self.timestamp.timestamp(),
            faults: self.violations.clone(),
            datapoint: self
                .datapoints
                .iter()
                .map(|d| d.as_str())
                .collect::<Vec<_>>()
                .join(","),
        }
    }
}

/// Applies a rule table to snapshots
#[derive(Debug, Clone, Default)]
pub struct FaultEvaluator {
    rules: FaultRules,
}

impl FaultEvaluator {
    pub fn new(rules: FaultRules) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &[FaultRule] {
        &self.rules.rules
    }

    /// Check every rule; nothing short-circuits
    pub fn evaluate(&self, snapshot: &Snapshot) -> FaultReport {
        let mut violations = Vec::new();
        let mut datapoints = Vec::new();

        for FaultRule { datapoint, rule } in &self.rules.rules {
            let found = rule.check(*datapoint, snapshot.field(*datapoint));
            if found.is_empty() {
                continue;
            }

            violations.extend(found);
            if !datapoints.contains(datapoint) {
                datapoints.push(*datapoint);
            }
        }

        if !violations.is_empty() {
            tracing::debug!(
                room_id = %snapshot.room_id,
                count = violations.len(),
                "Fault rules violated"
            );
        }

        FaultReport {
            room_id: snapshot.room_id.clone(),
            timestamp: snapshot.timestamp,
            violations,
            datapoints,
        }
    }
}
