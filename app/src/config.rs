// Application Configuration

use anyhow::{bail, Context, Result};
use chrono_tz::Tz;
use roomwatch_engine::{EngineConfig, FaultRules, OccupancyConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Rooms to subscribe to
    #[serde(default = "default_rooms")]
    pub rooms: Vec<String>,

    /// IANA time zone used for local hours and persisted datetimes
    #[serde(default = "default_timezone")]
    pub timezone: String,

    /// Directory for the fact log and state tables
    #[serde(default = "default_data_dir")]
    pub data_directory: String,

    /// Broker connection
    #[serde(default)]
    pub mqtt: MqttConfig,

    /// Occupancy cascade thresholds
    #[serde(default)]
    pub occupancy: OccupancyConfig,

    /// Fault rule table
    #[serde(default)]
    pub faults: FaultRules,

    /// Path to config file (for reference)
    #[serde(skip)]
    pub config_path: PathBuf,
}

/// MQTT broker settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    #[serde(default = "default_mqtt_host")]
    pub host: String,

    #[serde(default = "default_mqtt_port")]
    pub port: u16,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    /// Client id; kept stable so the broker resumes the session
    #[serde(default = "default_client_id")]
    pub client_id: String,

    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,

    /// Capacity of the client request queue
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

fn default_rooms() -> Vec<String> { vec!["room101".to_string(), "room102".to_string()] }
fn default_timezone() -> String { "Asia/Bangkok".to_string() }
fn default_data_dir() -> String { "/var/lib/roomwatch/data".to_string() }
fn default_mqtt_host() -> String { "localhost".to_string() }
fn default_mqtt_port() -> u16 { 1883 }
fn default_client_id() -> String { "roomwatch".to_string() }
fn default_keep_alive() -> u64 { 30 }
fn default_channel_capacity() -> usize { 64 }

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: default_mqtt_host(),
            port: default_mqtt_port(),
            username: None,
            password: None,
            client_id: default_client_id(),
            keep_alive_secs: default_keep_alive(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            rooms: default_rooms(),
            timezone: default_timezone(),
            data_directory: default_data_dir(),
            mqtt: MqttConfig::default(),
            occupancy: OccupancyConfig::default(),
            faults: FaultRules::default(),
            config_path: PathBuf::new(),
        }
    }
}

impl AppConfig {
    /// Load configuration from standard paths
    pub fn load() -> Result<Self> {
        let config_paths = [
            PathBuf::from("/etc/roomwatch/config.toml"),
            dirs::config_dir()
                .map(|p| p.join("roomwatch/config.toml"))
                .unwrap_or_default(),
            PathBuf::from("./config.toml"),
        ];

        for path in &config_paths {
            if path.exists() {
                return Self::load_from(path);
            }
        }

        tracing::warn!("No configuration file found, using defaults");
        Ok(Self::default())
    }

    /// Load configuration from specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let mut config: AppConfig =
            toml::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))?;
        config.config_path = path.to_path_buf();
        Ok(config)
    }

    /// Generate example configuration
    pub fn example() -> Result<String> {
        let config = Self {
            rooms: vec!["room101".to_string(), "room102".to_string(), "room103".to_string()],
            mqtt: MqttConfig {
                username: Some("roomwatch".to_string()),
                password: Some("changeme".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };

        Ok(toml::to_string_pretty(&config)?)
    }

    pub fn timezone(&self) -> Result<Tz> {
        self.timezone
            .parse::<Tz>()
            .map_err(|e| anyhow::anyhow!("Invalid timezone {:?}: {}", self.timezone, e))
    }

    /// Engine settings, validated
    pub fn engine_config(&self) -> Result<EngineConfig> {
        let config = EngineConfig {
            timezone: self.timezone()?,
            occupancy: self.occupancy.clone(),
            faults: self.faults.clone(),
        };
        config.validate()?;
        Ok(config)
    }

    /// Room ids end up in subscription filters, so wildcards are not allowed
    pub fn validate_rooms(&self) -> Result<()> {
        if self.rooms.is_empty() {
            bail!("No rooms configured");
        }
        for room in &self.rooms {
            if room.is_empty() || room.contains(['#', '+']) {
                bail!("Invalid room id {:?}", room);
            }
        }
        Ok(())
    }
}

/// Helper for getting config directories
mod dirs {
    use std::path::PathBuf;

    pub fn config_dir() -> Option<PathBuf> {
        std::env::var("XDG_CONFIG_HOME")
            .ok()
            .map(PathBuf::from)
            .or_else(|| {
                std::env::var("HOME")
                    .ok()
                    .map(|h| PathBuf::from(h).join(".config"))
            })
    }
}
