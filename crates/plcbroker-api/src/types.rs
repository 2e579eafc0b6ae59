//! API request and response types with OpenAPI schema generation

use chrono::{DateTime, Utc};
use plcbroker_core::config::{DeviceConfig, TagConfig};
use plcbroker_core::{DataType, DeviceId, DeviceState, DeviceStatus, PlcValue, TagValue};
use plcbroker_pool::MetricsSnapshot;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use utoipa::ToSchema;

// ============================================================================
// Tag Values
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, PartialEq)]
pub struct TagValueResponse {
    /// Device identifier
    pub device: String,

    /// Tag identifier
    pub tag: String,

    /// Last known value, null until the tag has been read once
    #[schema(value_type = Object)]
    pub value: Option<PlcValue>,

    /// Engineering unit
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,

    /// Time of the read or acknowledged write that produced `value`
    pub timestamp: Option<DateTime<Utc>>,

    /// True when the value may no longer reflect the controller
    pub stale: bool,
}

impl TagValueResponse {
    pub fn new(value: TagValue, definition: Option<&TagConfig>) -> Self {
        Self {
            device: value.device.to_string(),
            tag: value.tag.to_string(),
            value: value.value,
            unit: definition.and_then(|d| d.unit.clone()),
            timestamp: value.timestamp,
            stale: value.stale,
        }
    }
}

/// Cached values of every enabled device, keyed by device id
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema, PartialEq)]
pub struct AllDeviceTags(pub BTreeMap<String, Vec<TagValueResponse>>);

#[derive(Debug, Default, Deserialize)]
pub struct TagFilterQuery {
    /// Comma-separated tag names
    pub tags: Option<String>,
}

impl TagFilterQuery {
    /// Requested tag names, or `None` for all tags.
    pub fn names(&self) -> Option<Vec<&str>> {
        self.tags.as_deref().map(|tags| {
            tags.split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .collect()
        })
    }
}

// ============================================================================
// Writes
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct WriteRequestBody {
    /// New value; must match the tag's declared type
    #[schema(value_type = Object)]
    pub value: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WriteResponse {
    /// Whether the controller acknowledged the write
    pub accepted: bool,

    /// Acknowledgment time, null on failure
    pub applied_at: Option<DateTime<Utc>>,

    /// Value written, after conversion to the tag's type
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Object)]
    pub value: Option<PlcValue>,

    /// Error code on failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Human-readable failure reason
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl WriteResponse {
    pub fn applied(value: PlcValue, applied_at: DateTime<Utc>) -> Self {
        Self {
            accepted: true,
            applied_at: Some(applied_at),
            value: Some(value),
            error: None,
            message: None,
        }
    }

    pub fn failed(error: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            accepted: false,
            applied_at: None,
            value: None,
            error: Some(error.into()),
            message: Some(message.into()),
        }
    }
}

// ============================================================================
// Health
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeviceHealthResponse {
    pub device: String,

    /// Disconnected, Connecting, Healthy or Degraded
    #[schema(value_type = String)]
    pub state: DeviceState,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,

    /// Consecutive failed connection attempts
    pub backoff_attempts: u32,

    /// Last successful operation against the device
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update: Option<DateTime<Utc>>,

    /// When the state last changed
    pub last_transition: DateTime<Utc>,
}

impl DeviceHealthResponse {
    pub fn new(device: &DeviceId, status: DeviceStatus) -> Self {
        Self {
            device: device.to_string(),
            state: status.state,
            last_error: status.last_error,
            backoff_attempts: status.backoff_attempts,
            last_update: status.last_success,
            last_transition: status.last_transition,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, ToSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    /// Every enabled device is healthy
    Ok,
    /// At least one enabled device is not healthy
    Degraded,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ServiceHealth {
    pub status: ServiceStatus,

    /// Service version
    pub version: String,

    pub uptime_seconds: u64,

    pub devices: Vec<DeviceHealthResponse>,

    #[schema(value_type = Object)]
    pub counters: MetricsSnapshot,

    pub timestamp: DateTime<Utc>,
}

// ============================================================================
// Device Configuration
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TagInfo {
    pub name: String,

    #[serde(rename = "type")]
    #[schema(value_type = String)]
    pub data_type: DataType,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    pub writable: bool,
}

impl From<&TagConfig> for TagInfo {
    fn from(tag: &TagConfig) -> Self {
        Self {
            name: tag.name.to_string(),
            data_type: tag.data_type,
            unit: tag.unit.clone(),
            description: tag.description.clone(),
            writable: tag.writable,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    pub id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    pub address: String,
    pub port: u16,
    pub enabled: bool,

    /// Driver kind
    pub driver: String,

    pub poll_interval_ms: u64,

    #[schema(value_type = String)]
    pub state: DeviceState,

    pub tags: Vec<TagInfo>,
}

impl DeviceInfo {
    pub fn new(config: &DeviceConfig, state: DeviceState) -> Self {
        Self {
            id: config.id.to_string(),
            name: config.name.clone(),
            address: config.address.clone(),
            port: config.port,
            enabled: config.enabled,
            driver: config.driver.clone(),
            poll_interval_ms: config.poll_interval_ms,
            state,
            tags: config.tags.iter().map(TagInfo::from).collect(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct DeviceList {
    pub devices: Vec<DeviceInfo>,
    pub total: usize,
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ErrorResponse {
    /// Error code
    pub error: String,

    /// Human-readable error message
    pub message: String,

    /// Timestamp
    pub timestamp: DateTime<Utc>,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            message: message.into(),
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_failure_body() {
        let body = serde_json::to_value(WriteResponse::failed(
            "device_unavailable",
            "Device press1 is unavailable",
        ))
        .unwrap();

        assert_eq!(body["accepted"], false);
        assert!(body["appliedAt"].is_null());
        assert_eq!(body["error"], "device_unavailable");
        assert!(body.get("value").is_none());
    }

    #[test]
    fn test_tag_filter_query() {
        let query = TagFilterQuery {
            tags: Some("temp, setpoint,,".to_string()),
        };
        assert_eq!(query.names(), Some(vec!["temp", "setpoint"]));
        assert_eq!(TagFilterQuery::default().names(), None);
    }

    #[test]
    fn test_health_omits_empty_fields() {
        let body = serde_json::to_value(DeviceHealthResponse::new(
            &DeviceId::from("press1"),
            DeviceStatus::new(),
        ))
        .unwrap();

        assert_eq!(body["state"], "Disconnected");
        assert_eq!(body["backoffAttempts"], 0);
        assert!(body.get("lastError").is_none());
    }
}
