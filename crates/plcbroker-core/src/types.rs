//! Core types for the PLC broker.
//!
//! This module defines the fundamental types used throughout the system:
//! device and tag identifiers, typed tag values, the device health state
//! machine, and the cached tag view returned to API clients.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::BrokerError;

/// Identifier of a configured controller.
///
/// # Examples
///
/// ```
/// use plcbroker_core::types::DeviceId;
///
/// let id = DeviceId::from("press1");
/// assert_eq!(id.as_str(), "press1");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    /// Creates a new device identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for DeviceId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Opaque identifier of a tag on a device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TagId(String);

impl TagId {
    /// Creates a new tag identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TagId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TagId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for TagId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Declared data type of a tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Bool,
    Int,
    Float,
    String,
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataType::Bool => write!(f, "bool"),
            DataType::Int => write!(f, "int"),
            DataType::Float => write!(f, "float"),
            DataType::String => write!(f, "string"),
        }
    }
}

/// A typed tag value.
///
/// Serialized untagged so API clients see plain JSON scalars.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PlcValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
}

impl PlcValue {
    /// Returns the data type of this value.
    pub fn data_type(&self) -> DataType {
        match self {
            PlcValue::Bool(_) => DataType::Bool,
            PlcValue::Int(_) => DataType::Int,
            PlcValue::Float(_) => DataType::Float,
            PlcValue::String(_) => DataType::String,
        }
    }

    /// Converts this value to the declared type of a tag.
    ///
    /// Integers widen to floats; every other mismatch is refused.
    pub fn coerce(self, target: DataType) -> Option<PlcValue> {
        match (self, target) {
            (PlcValue::Int(v), DataType::Float) => Some(PlcValue::Float(v as f64)),
            (value, target) if value.data_type() == target => Some(value),
            _ => None,
        }
    }

    /// Parses a JSON value submitted by a client into the declared type of
    /// `tag`.
    pub fn from_json(
        tag: &TagId,
        value: &serde_json::Value,
        target: DataType,
    ) -> Result<PlcValue, BrokerError> {
        let invalid = |reason: &str| BrokerError::InvalidValue {
            tag: tag.clone(),
            expected: target.to_string(),
            reason: reason.to_string(),
        };

        let parsed = match value {
            serde_json::Value::Bool(b) => PlcValue::Bool(*b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    PlcValue::Int(i)
                } else if let Some(f) = n.as_f64() {
                    PlcValue::Float(f)
                } else {
                    return Err(invalid("number out of range"));
                }
            }
            serde_json::Value::String(s) => PlcValue::String(s.clone()),
            serde_json::Value::Null => return Err(invalid("got null")),
            serde_json::Value::Array(_) | serde_json::Value::Object(_) => {
                return Err(invalid("got a structured value"))
            }
        };

        let found = parsed.data_type();
        parsed
            .coerce(target)
            .ok_or_else(|| invalid(&format!("got {}", found)))
    }
}

impl fmt::Display for PlcValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlcValue::Bool(v) => write!(f, "{}", v),
            PlcValue::Int(v) => write!(f, "{}", v),
            PlcValue::Float(v) => write!(f, "{}", v),
            PlcValue::String(v) => write!(f, "{}", v),
        }
    }
}

/// Health state of a device link.
///
/// ```text
/// Disconnected -> Connecting -> Healthy <-> Degraded
/// ```
///
/// A device in any state other than `Healthy` fails `acquire` fast.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceState {
    /// No session; initial state and the state after shutdown
    Disconnected,
    /// First connection attempt in progress
    Connecting,
    /// Session established and serving operations
    Healthy,
    /// Session lost; reconnecting with backoff
    Degraded,
}

impl DeviceState {
    /// Returns true if the device accepts operations.
    pub fn is_healthy(&self) -> bool {
        matches!(self, DeviceState::Healthy)
    }

    /// Returns true if the state machine allows moving to `next`.
    pub fn can_transition_to(&self, next: DeviceState) -> bool {
        use DeviceState::*;
        match (self, next) {
            (_, Disconnected) => true,
            (Disconnected, Connecting) => true,
            (Connecting, Healthy) | (Connecting, Degraded) => true,
            (Healthy, Degraded) => true,
            (Degraded, Healthy) => true,
            _ => false,
        }
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceState::Disconnected => write!(f, "Disconnected"),
            DeviceState::Connecting => write!(f, "Connecting"),
            DeviceState::Healthy => write!(f, "Healthy"),
            DeviceState::Degraded => write!(f, "Degraded"),
        }
    }
}

/// Snapshot of a device's health.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceStatus {
    /// Current state
    pub state: DeviceState,

    /// Most recent error reported for the device
    pub last_error: Option<String>,

    /// Consecutive failed connection attempts since the last success
    pub backoff_attempts: u32,

    /// When the state last changed
    pub last_transition: DateTime<Utc>,

    /// When the device last completed an operation successfully
    pub last_success: Option<DateTime<Utc>>,
}

impl DeviceStatus {
    /// Creates the initial status of a configured device.
    pub fn new() -> Self {
        Self {
            state: DeviceState::Disconnected,
            last_error: None,
            backoff_attempts: 0,
            last_transition: Utc::now(),
            last_success: None,
        }
    }
}

impl Default for DeviceStatus {
    fn default() -> Self {
        Self::new()
    }
}

/// A cached tag value as seen by readers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TagValue {
    pub device: DeviceId,
    pub tag: TagId,

    /// Last known value; `None` until the first successful read
    pub value: Option<PlcValue>,

    /// Time of the read (or acknowledged write) that produced `value`
    pub timestamp: Option<DateTime<Utc>>,

    /// True when the value can no longer be trusted to reflect the hardware
    pub stale: bool,
}

/// Origin of a tag update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateSource {
    Poll,
    Write,
}

/// A new tag value published to archive sinks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TagUpdate {
    pub device: DeviceId,
    pub tag: TagId,
    pub value: PlcValue,
    pub timestamp: DateTime<Utc>,
    pub source: UpdateSource,
}
