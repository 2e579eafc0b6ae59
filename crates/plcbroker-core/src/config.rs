//! Configuration management for the PLC broker.
//!
//! This module provides the configuration system, which supports:
//! - Loading from YAML files
//! - Environment variable overrides (`PLCBROKER__SECTION__KEY`)
//! - Validation of all settings at load time
//! - Device and tag definitions, write queue limits, reconnect backoff,
//!   archive sink, API and logging settings
//!
//! Configuration is static for the lifetime of the process.

use crate::error::{ConfigError, Result};
use crate::types::{DataType, DeviceId, PlcValue, TagId};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::Level;

/// Main application configuration.
///
/// # Examples
///
/// ```no_run
/// use plcbroker_core::config::AppConfig;
///
/// // Load from file
/// let config = AppConfig::from_file("plcbroker.yaml").unwrap();
///
/// // Validate before use
/// config.validate().unwrap();
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    /// Controllers owned by this broker
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,

    /// Tag cache settings
    #[serde(default)]
    pub cache: CacheConfig,

    /// Write coordinator settings
    #[serde(default)]
    pub write: WriteConfig,

    /// Reconnect backoff settings
    #[serde(default)]
    pub backoff: BackoffConfig,

    /// Controller link settings
    #[serde(default)]
    pub connection: ConnectionConfig,

    /// Archive sink settings
    #[serde(default)]
    pub archive: ArchiveConfig,

    /// API server configuration
    #[serde(default)]
    pub api: ApiConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Creates a new default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::LoadFailed {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;

        Self::from_yaml(&contents)
    }

    /// Loads configuration from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML cannot be parsed.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| {
            ConfigError::InvalidFormat {
                reason: e.to_string(),
            }
            .into()
        })
    }

    /// Loads configuration using the `config` crate, layering environment
    /// variables (`PLCBROKER__API__PORT=9000`) over the file.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration cannot be loaded or merged.
    pub fn from_config_builder<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let config = config::Config::builder()
            .add_source(config::File::from(path).required(true))
            .add_source(
                config::Environment::with_prefix("PLCBROKER")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| ConfigError::LoadFailed {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;

        config.try_deserialize().map_err(|e| {
            ConfigError::InvalidFormat {
                reason: e.to_string(),
            }
            .into()
        })
    }

    /// Validates the configuration.
    ///
    /// Checks for:
    /// - At least one device configured
    /// - No duplicate device ids or tag names
    /// - Non-empty tag lists and non-zero intervals
    /// - Sane write, backoff and API settings
    ///
    /// # Errors
    ///
    /// Returns an error if validation fails.
    pub fn validate(&self) -> Result<()> {
        if self.devices.is_empty() {
            return Err(ConfigError::NoDevices.into());
        }

        let mut seen_ids = HashSet::new();
        for device in &self.devices {
            if !seen_ids.insert(&device.id) {
                return Err(ConfigError::DuplicateDevice {
                    id: device.id.to_string(),
                }
                .into());
            }
            device.validate()?;
        }

        if let Some(0) = self.cache.freshness_window_ms {
            return Err(ConfigError::invalid_value(
                "cache.freshness_window_ms",
                "Freshness window cannot be 0",
            )
            .into());
        }

        self.write.validate()?;
        self.backoff.validate()?;

        if self.connection.io_timeout_ms == 0 {
            return Err(ConfigError::invalid_value(
                "connection.io_timeout_ms",
                "I/O timeout cannot be 0",
            )
            .into());
        }

        if self.archive.enabled && self.archive.channel_capacity == 0 {
            return Err(ConfigError::invalid_value(
                "archive.channel_capacity",
                "Channel capacity cannot be 0",
            )
            .into());
        }

        self.api.validate()?;
        if self.api.request_timeout_secs.saturating_mul(1000) <= self.write.timeout_ms {
            return Err(ConfigError::invalid_value(
                "api.request_timeout_secs",
                format!(
                    "Request timeout ({}s) must exceed write.timeout_ms ({}ms)",
                    self.api.request_timeout_secs, self.write.timeout_ms
                ),
            )
            .into());
        }
        self.logging.parse_level()?;

        Ok(())
    }

    /// Returns a device configuration by id.
    pub fn get_device(&self, id: &DeviceId) -> Option<&DeviceConfig> {
        self.devices.iter().find(|d| &d.id == id)
    }

    /// Returns all enabled devices.
    pub fn enabled_devices(&self) -> Vec<&DeviceConfig> {
        self.devices.iter().filter(|d| d.enabled).collect()
    }

    /// Returns the freshness window for a device's tags.
    ///
    /// Defaults to three poll intervals when not set globally.
    pub fn freshness_window(&self, device: &DeviceConfig) -> Duration {
        match self.cache.freshness_window_ms {
            Some(ms) => Duration::from_millis(ms),
            None => device.poll_interval() * 3,
        }
    }
}

/// A single controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Unique device identifier used in API paths
    pub id: DeviceId,

    /// Human-readable name
    #[serde(default)]
    pub name: Option<String>,

    /// Controller network address
    pub address: String,

    /// Controller port
    #[serde(default = "default_device_port")]
    pub port: u16,

    /// Disabled devices are listed but never connected or polled
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Driver kind used to talk to the controller
    #[serde(default = "default_driver")]
    pub driver: String,

    /// Poll interval in milliseconds
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Tags exposed by this device
    #[serde(default)]
    pub tags: Vec<TagConfig>,
}

fn default_device_port() -> u16 {
    5020
}

fn default_driver() -> String {
    "simulated".to_string()
}

fn default_poll_interval() -> u64 {
    1000
}

fn default_true() -> bool {
    true
}

impl DeviceConfig {
    /// Creates a device with default settings and no tags.
    pub fn new(id: impl Into<DeviceId>, address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            address: address.into(),
            port: default_device_port(),
            enabled: true,
            driver: default_driver(),
            poll_interval_ms: default_poll_interval(),
            tags: Vec::new(),
        }
    }

    /// Adds a tag definition.
    pub fn with_tag(mut self, tag: TagConfig) -> Self {
        self.tags.push(tag);
        self
    }

    /// Sets the poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Returns the poll interval as a Duration.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Returns the `address:port` endpoint of the controller.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }

    /// Returns a tag definition by id.
    pub fn get_tag(&self, tag: &TagId) -> Option<&TagConfig> {
        self.tags.iter().find(|t| &t.name == tag)
    }

    /// Validates the device configuration.
    pub fn validate(&self) -> Result<()> {
        let id = self.id.to_string();

        if id.is_empty() || id.contains('/') {
            return Err(ConfigError::invalid_device(
                id,
                "Device id must be non-empty and contain no '/'",
            )
            .into());
        }

        if self.address.is_empty() {
            return Err(ConfigError::invalid_device(id, "Address cannot be empty").into());
        }

        if self.poll_interval_ms == 0 {
            return Err(ConfigError::invalid_device(id, "Poll interval cannot be 0").into());
        }

        if self.tags.is_empty() {
            return Err(ConfigError::invalid_device(id, "At least one tag is required").into());
        }

        let mut seen = HashSet::new();
        for tag in &self.tags {
            if !seen.insert(&tag.name) {
                return Err(ConfigError::DuplicateTag {
                    device: id,
                    tag: tag.name.to_string(),
                }
                .into());
            }

            if let Some(ref initial) = tag.initial {
                if initial.clone().coerce(tag.data_type).is_none() {
                    return Err(ConfigError::invalid_device(
                        id,
                        format!(
                            "Initial value of '{}' does not match type {}",
                            tag.name, tag.data_type
                        ),
                    )
                    .into());
                }
            }
        }

        Ok(())
    }
}

/// A tag definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TagConfig {
    /// Tag identifier
    pub name: TagId,

    /// Declared data type
    #[serde(rename = "type")]
    pub data_type: DataType,

    /// Engineering unit
    #[serde(default)]
    pub unit: Option<String>,

    /// Description
    #[serde(default)]
    pub description: Option<String>,

    /// Whether clients may write this tag
    #[serde(default = "default_true")]
    pub writable: bool,

    /// Starting value for the simulated driver
    #[serde(default)]
    pub initial: Option<PlcValue>,
}

impl TagConfig {
    /// Creates a writable tag with no unit.
    pub fn new(name: impl Into<TagId>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
            unit: None,
            description: None,
            writable: true,
            initial: None,
        }
    }

    /// Sets the engineering unit.
    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }

    /// Marks the tag read-only.
    pub fn read_only(mut self) -> Self {
        self.writable = false;
        self
    }

    /// Sets the starting value.
    pub fn with_initial(mut self, value: PlcValue) -> Self {
        self.initial = Some(value);
        self
    }
}

/// Tag cache settings.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CacheConfig {
    /// Age after which a cached value is stale; three poll intervals if unset
    #[serde(default)]
    pub freshness_window_ms: Option<u64>,
}

/// Write coordinator settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteConfig {
    /// How long a caller waits for a write acknowledgment
    #[serde(default = "default_write_timeout")]
    pub timeout_ms: u64,

    /// Maximum queued plus in-flight writes per device
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
}

fn default_write_timeout() -> u64 {
    5000
}

fn default_queue_depth() -> usize {
    50
}

impl Default for WriteConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_write_timeout(),
            queue_depth: default_queue_depth(),
        }
    }
}

impl WriteConfig {
    /// Returns the write timeout as a Duration.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    fn validate(&self) -> Result<()> {
        if self.timeout_ms == 0 {
            return Err(ConfigError::invalid_value("write.timeout_ms", "Timeout cannot be 0").into());
        }
        if self.queue_depth == 0 {
            return Err(
                ConfigError::invalid_value("write.queue_depth", "Queue depth cannot be 0").into(),
            );
        }
        Ok(())
    }
}

/// Reconnect backoff settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// Delay before the first reconnect attempt
    #[serde(default = "default_backoff_initial")]
    pub initial_ms: u64,

    /// Upper bound on the delay
    #[serde(default = "default_backoff_max")]
    pub max_ms: u64,

    /// Growth factor per failed attempt
    #[serde(default = "default_backoff_multiplier")]
    pub multiplier: f64,
}

fn default_backoff_initial() -> u64 {
    1000
}

fn default_backoff_max() -> u64 {
    60_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_ms: default_backoff_initial(),
            max_ms: default_backoff_max(),
            multiplier: default_backoff_multiplier(),
        }
    }
}

impl BackoffConfig {
    fn validate(&self) -> Result<()> {
        if self.initial_ms == 0 {
            return Err(ConfigError::invalid_value("backoff.initial_ms", "Delay cannot be 0").into());
        }
        if self.max_ms < self.initial_ms {
            return Err(ConfigError::invalid_value(
                "backoff.max_ms",
                "Maximum delay must be at least the initial delay",
            )
            .into());
        }
        if self.multiplier.is_nan() || self.multiplier < 1.0 {
            return Err(ConfigError::invalid_value(
                "backoff.multiplier",
                "Multiplier must be at least 1.0",
            )
            .into());
        }
        Ok(())
    }
}

/// Controller link settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Bound on any single driver call
    #[serde(default = "default_io_timeout")]
    pub io_timeout_ms: u64,
}

fn default_io_timeout() -> u64 {
    10_000
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            io_timeout_ms: default_io_timeout(),
        }
    }
}

impl ConnectionConfig {
    /// Returns the I/O timeout as a Duration.
    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }
}

/// Archive sink settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveConfig {
    /// Whether tag updates are written to a JSON-lines file
    #[serde(default)]
    pub enabled: bool,

    /// Output file path
    #[serde(default = "default_archive_path")]
    pub path: PathBuf,

    /// Updates buffered before new ones are dropped
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

fn default_archive_path() -> PathBuf {
    PathBuf::from("./data/tag_updates.jsonl")
}

fn default_channel_capacity() -> usize {
    10_000
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: default_archive_path(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

/// API server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// API server bind address
    #[serde(default = "default_api_host")]
    pub host: String,

    /// API server port
    #[serde(default = "default_api_port")]
    pub port: u16,

    /// Whether to enable CORS
    #[serde(default = "default_true")]
    pub cors: bool,

    /// Request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8080
}

fn default_request_timeout() -> u64 {
    30
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
            cors: true,
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl ApiConfig {
    /// Validates the API configuration.
    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            return Err(ConfigError::invalid_value("api.port", "Port cannot be 0").into());
        }
        if self.request_timeout_secs == 0 {
            return Err(ConfigError::invalid_value(
                "api.request_timeout_secs",
                "Request timeout cannot be 0",
            )
            .into());
        }

        Ok(())
    }

    /// Returns the API server bind address.
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: "text" or "json"
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> LogFormat {
    LogFormat::Text
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl LoggingConfig {
    /// Parses the log level string to a tracing Level.
    pub fn parse_level(&self) -> Result<Level> {
        self.level.parse().map_err(|_| {
            ConfigError::invalid_value("logging.level", format!("Invalid log level: {}", self.level))
                .into()
        })
    }
}

/// Log format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable text format
    Text,
    /// JSON format for structured logging
    Json,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PlcBrokerError;

    fn press1() -> DeviceConfig {
        DeviceConfig::new("press1", "192.168.150.22")
            .with_tag(TagConfig::new("temp", DataType::Float).with_unit("degC"))
            .with_tag(TagConfig::new("setpoint", DataType::Float))
    }

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert!(config.devices.is_empty());
        assert_eq!(config.write.timeout_ms, 5000);
        assert_eq!(config.write.queue_depth, 50);
        assert_eq!(config.backoff.initial_ms, 1000);
        assert_eq!(config.backoff.max_ms, 60_000);
        assert_eq!(config.connection.io_timeout(), Duration::from_secs(10));
        assert_eq!(config.api.port, 8080);
    }

    #[test]
    fn test_validation_no_devices() {
        let config = AppConfig::default();
        assert!(matches!(
            config.validate(),
            Err(PlcBrokerError::Config(ConfigError::NoDevices))
        ));
    }

    #[test]
    fn test_validation_duplicate_devices() {
        let mut config = AppConfig::default();
        config.devices.push(press1());
        config.devices.push(press1());

        assert!(matches!(
            config.validate(),
            Err(PlcBrokerError::Config(ConfigError::DuplicateDevice { .. }))
        ));
    }

    #[test]
    fn test_validation_duplicate_tags() {
        let mut config = AppConfig::default();
        config
            .devices
            .push(press1().with_tag(TagConfig::new("temp", DataType::Int)));

        assert!(matches!(
            config.validate(),
            Err(PlcBrokerError::Config(ConfigError::DuplicateTag { .. }))
        ));
    }

    #[test]
    fn test_validation_rejects_zero_values() {
        let mut config = AppConfig::default();
        config.devices.push(press1());
        assert!(config.validate().is_ok());

        config.write.queue_depth = 0;
        assert!(config.validate().is_err());
        config.write.queue_depth = 50;

        config.devices[0].poll_interval_ms = 0;
        assert!(config.validate().is_err());
        config.devices[0].poll_interval_ms = 1000;

        config.api.port = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_request_timeout_must_outlast_write_timeout() {
        let mut config = AppConfig::default();
        config.devices.push(press1());

        config.api.request_timeout_secs = 0;
        assert!(matches!(
            config.validate(),
            Err(PlcBrokerError::Config(ConfigError::InvalidValue { .. }))
        ));

        config.api.request_timeout_secs = 1;
        config.write.timeout_ms = 3000;
        assert!(config.validate().is_err());

        config.write.timeout_ms = 1000;
        assert!(config.validate().is_err());

        config.write.timeout_ms = 999;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_empty_tags() {
        let mut config = AppConfig::default();
        config.devices.push(DeviceConfig::new("press1", "10.0.0.1"));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_freshness_window_defaults_to_three_polls() {
        let mut config = AppConfig::default();
        config
            .devices
            .push(press1().with_poll_interval(Duration::from_millis(500)));

        let device = &config.devices[0];
        assert_eq!(config.freshness_window(device), Duration::from_millis(1500));

        config.cache.freshness_window_ms = Some(200);
        let device = &config.devices[0];
        assert_eq!(config.freshness_window(device), Duration::from_millis(200));
    }

    #[test]
    fn test_config_from_yaml() {
        let yaml = r#"
devices:
  - id: press1
    name: Stamping press
    address: 192.168.150.22
    poll_interval_ms: 250
    tags:
      - name: temp
        type: float
        unit: degC
        writable: false
      - name: setpoint
        type: float
        initial: 75.0
  - id: mixer
    address: 192.168.150.23
    port: 502
    enabled: false
    tags:
      - name: running
        type: bool

write:
  timeout_ms: 2000
  queue_depth: 10

logging:
  level: debug
  format: json
"#;

        let config = AppConfig::from_yaml(yaml).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.devices.len(), 2);

        let press = &config.devices[0];
        assert_eq!(press.port, 5020);
        assert_eq!(press.driver, "simulated");
        assert!(!press.tags[0].writable);
        assert_eq!(press.tags[0].unit.as_deref(), Some("degC"));
        assert_eq!(press.tags[1].initial, Some(PlcValue::Float(75.0)));

        assert_eq!(config.enabled_devices().len(), 1);
        assert_eq!(config.write.queue_depth, 10);
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.logging.parse_level().unwrap(), Level::DEBUG);
    }

    #[test]
    fn test_initial_value_type_checked() {
        let mut config = AppConfig::default();
        config.devices.push(
            DeviceConfig::new("press1", "10.0.0.1").with_tag(
                TagConfig::new("running", DataType::Bool).with_initial(PlcValue::Int(1)),
            ),
        );
        assert!(config.validate().is_err());
    }
}
