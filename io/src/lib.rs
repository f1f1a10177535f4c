//! Roomwatch Collaborator Layer
//!
//! Provides the transport and persistence seams used by the Roomwatch
//! fusion and inference engine.
//!
//! # Modules
//!
//! - [`topic`] - routing keys for sensor, fault and occupancy topics
//! - [`memory`] - in-process collaborators that keep everything they receive
//! - [`jsonl`] - JSON-lines fact and sensor logs, keyed room state table on disk
//!
//! # Example
//!
//! ```rust,no_run
//! use roomwatch_io::{memory::MemoryPublisher, topic, Publisher};
//!
//! #[tokio::main]
//! async fn main() {
//!     let publisher = MemoryPublisher::new();
//!     let body = br#"{"room_id":"room101"}"#.to_vec();
//!
//!     publisher.publish(&topic::fault_topic("room101"), body).await.unwrap();
//!     println!("{} messages published", publisher.published().len());
//! }
//! ```

use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;

pub mod jsonl;
pub mod memory;
pub mod topic;

pub use topic::SensorType;

/// Boxed future returned by collaborator methods
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Outbound side of the message transport
pub trait Publisher: Send + Sync {
    /// Publish a payload on a topic
    fn publish<'a>(&'a self, topic: &'a str, payload: Vec<u8>) -> BoxFuture<'a, Result<()>>;
}

/// Append-only time-series store
pub trait FactSink: Send + Sync {
    /// Append one immutable fact
    fn append(&self, fact: TimeSeriesFact) -> BoxFuture<'_, Result<()>>;
}

/// Keyed room state store
pub trait StateSink: Send + Sync {
    /// Upsert an occupancy/health row keyed by (room_id, datapoint)
    fn upsert_room_state(&self, row: RoomStateRow) -> BoxFuture<'_, Result<()>>;

    /// Upsert a fused sensor row keyed by (room_id, timestamp)
    fn upsert_room_sensors(&self, row: RoomSensorsRow) -> BoxFuture<'_, Result<()>>;
}

/// Manual acknowledgment of one inbound delivery
pub trait Acknowledge: Send {
    /// Confirm the delivery to the transport
    fn ack(self: Box<Self>) -> BoxFuture<'static, Result<()>>;
}

/// Acknowledgment for deliveries that did not come from a broker
pub struct NoAck;

impl Acknowledge for NoAck {
    fn ack(self: Box<Self>) -> BoxFuture<'static, Result<()>> {
        Box::pin(async { Ok(()) })
    }
}

/// One raw delivery from the transport
pub struct Delivery {
    pub topic: String,
    pub payload: Vec<u8>,
    pub ack: Box<dyn Acknowledge>,
}

impl Delivery {
    pub fn new(topic: impl Into<String>, payload: Vec<u8>, ack: Box<dyn Acknowledge>) -> Self {
        Self {
            topic: topic.into(),
            payload,
            ack,
        }
    }

    /// Delivery that needs no acknowledgment (replays, tests)
    pub fn unacked(topic: impl Into<String>, payload: Vec<u8>) -> Self {
        Self::new(topic, payload, Box::new(NoAck))
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("topic", &self.topic)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

/// One datapoint of a fused snapshot, as stored in the time-series sink
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeSeriesFact {
    /// Unix seconds
    pub timestamp: i64,
    /// ISO-8601 with offset, in the reference time zone
    pub datetime: String,
    pub device_id: String,
    pub datapoint: String,
    pub value: String,
}

/// Room health derived from the fault report of the same snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Warning,
    Critical,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Warning => "warning",
            HealthStatus::Critical => "critical",
        }
    }
}

/// Occupancy state row, keyed by (room_id, datapoint)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomStateRow {
    pub room_id: String,
    pub is_occupied: bool,
    pub vacancy_last_updated: DateTime<FixedOffset>,
    pub datapoint: String,
    pub health_status: HealthStatus,
    pub datapoint_last_updated: DateTime<FixedOffset>,
}

/// Fused sensor values of one snapshot, keyed by (room_id, timestamp)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomSensorsRow {
    pub room_id: String,
    pub timestamp: i64,
    pub datetime: DateTime<FixedOffset>,
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub co2: Option<f64>,
    pub power: Option<f64>,
    pub presence_state: Option<String>,
}

/// Body published on `<room_id>.fault`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaultAlert {
    pub room_id: String,
    pub timestamp: i64,
    pub faults: Vec<String>,
    /// Comma separated offending datapoints
    pub datapoint: String,
}

/// Body published on `<room_id>.occupancy`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OccupancyAlert {
    pub room_id: String,
    pub timestamp: i64,
    pub is_occupied: bool,
    pub datapoint: String,
}

/// Collaborator error types
#[derive(Debug, thiserror::Error)]
pub enum IoError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid topic: {0}")]
    InvalidTopic(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Persistence failed: {0}")]
    Persistence(String),

    #[error("Acknowledgment failed: {0}")]
    Ack(String),
}

pub type Result<T> = std::result::Result<T, IoError>;
