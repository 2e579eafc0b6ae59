//! Error types for the PLC broker.
//!
//! Errors fall into three families:
//!
//! - [`DriverError`]: raw failures reported by a controller driver. These never
//!   reach API clients directly.
//! - [`BrokerError`]: the classified outcomes the core hands to the API layer.
//!   Every driver fault is translated into one of these before leaving the
//!   connection manager or the write coordinator.
//! - [`ConfigError`]: load-time configuration problems.
//!
//! All errors are serializable so they can be embedded in API responses and
//! structured logs.

use serde::{Deserialize, Serialize};
use std::io;
use thiserror::Error;

use crate::types::{DeviceId, TagId};

/// Result type alias using PlcBrokerError as the error type.
pub type Result<T> = std::result::Result<T, PlcBrokerError>;

/// Top-level error type for broker setup and lifecycle operations.
#[derive(Debug, Error, Serialize, Deserialize)]
#[serde(tag = "type", content = "details")]
pub enum PlcBrokerError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Controller driver errors
    #[error("Driver error: {0}")]
    Driver(#[from] DriverError),

    /// Classified request outcomes
    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    /// I/O errors
    #[error("I/O error: {message}")]
    Io { message: String },

    /// Internal errors that shouldn't normally occur
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<io::Error> for PlcBrokerError {
    fn from(err: io::Error) -> Self {
        PlcBrokerError::Io {
            message: err.to_string(),
        }
    }
}

/// Errors reported by a controller driver.
///
/// Drivers are opaque per controller family; this enum is the common
/// vocabulary they translate their own error codes into.
#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq)]
pub enum DriverError {
    /// Failed to establish a session with the controller
    #[error("Failed to connect to {address}: {reason}")]
    ConnectFailed { address: String, reason: String },

    /// Transport-level failure on an established session
    #[error("I/O failure: {reason}")]
    Io { reason: String },

    /// The controller did not answer within the I/O timeout
    #[error("{operation} timed out after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    /// The controller answered with an explicit error
    #[error("Controller rejected request: {reason}")]
    Rejected { code: Option<i32>, reason: String },

    /// The controller does not know the addressed tag
    #[error("Unknown tag: {tag}")]
    UnknownTag { tag: String },

    /// The driver does not implement the requested operation
    #[error("Unsupported operation: {operation}")]
    Unsupported { operation: String },

    /// The session is not connected
    #[error("Not connected")]
    NotConnected,
}

impl DriverError {
    /// Creates a connect failure.
    pub fn connect_failed(address: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ConnectFailed {
            address: address.into(),
            reason: reason.into(),
        }
    }

    /// Creates a transport failure.
    pub fn io(reason: impl Into<String>) -> Self {
        Self::Io {
            reason: reason.into(),
        }
    }

    /// Creates a rejection without a controller error code.
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self::Rejected {
            code: None,
            reason: reason.into(),
        }
    }

    /// Creates a timeout error.
    pub fn timeout(operation: impl Into<String>, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    /// Returns true if the session can no longer be trusted and must be torn
    /// down and re-established.
    pub fn is_link_fault(&self) -> bool {
        matches!(
            self,
            DriverError::ConnectFailed { .. }
                | DriverError::Io { .. }
                | DriverError::Timeout { .. }
                | DriverError::NotConnected
        )
    }

    /// Returns true if the controller explicitly refused the operation.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            DriverError::Rejected { .. }
                | DriverError::UnknownTag { .. }
                | DriverError::Unsupported { .. }
        )
    }
}

/// Classified outcome of a read or write request.
///
/// This is the only error type the API layer ever sees from the core, and
/// each variant maps to exactly one HTTP status code.
#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq)]
pub enum BrokerError {
    /// No usable connection to the device
    #[error("Device {device} unavailable: {reason}")]
    DeviceUnavailable { device: DeviceId, reason: String },

    /// No acknowledgment within the bound; the real outcome is unknown
    #[error("Write to {device}/{tag} timed out after {timeout_ms}ms")]
    Timeout {
        device: DeviceId,
        tag: TagId,
        timeout_ms: u64,
    },

    /// The controller or the broker refused the operation
    #[error("Write to {device}/{tag} rejected: {reason}")]
    Rejected {
        device: DeviceId,
        tag: TagId,
        reason: String,
    },

    /// The device's write queue is full
    #[error("Write queue for {device} is full ({depth} pending)")]
    Backpressure { device: DeviceId, depth: usize },

    /// Unconfigured device or tag
    #[error("{}", not_found_message(.device, .tag))]
    NotFound { device: DeviceId, tag: Option<TagId> },

    /// The submitted value does not match the tag's declared type
    #[error("Invalid value for {tag}: expected {expected}, {reason}")]
    InvalidValue {
        tag: TagId,
        expected: String,
        reason: String,
    },
}

fn not_found_message(device: &DeviceId, tag: &Option<TagId>) -> String {
    match tag {
        Some(tag) => format!("Tag {}/{} is not configured", device, tag),
        None => format!("Device {} is not configured", device),
    }
}

impl BrokerError {
    /// Creates a device unavailable error.
    pub fn unavailable(device: &DeviceId, reason: impl Into<String>) -> Self {
        Self::DeviceUnavailable {
            device: device.clone(),
            reason: reason.into(),
        }
    }

    /// Creates a not found error for a device.
    pub fn device_not_found(device: &DeviceId) -> Self {
        Self::NotFound {
            device: device.clone(),
            tag: None,
        }
    }

    /// Creates a not found error for a tag.
    pub fn tag_not_found(device: &DeviceId, tag: &TagId) -> Self {
        Self::NotFound {
            device: device.clone(),
            tag: Some(tag.clone()),
        }
    }

    /// Translates a driver failure on a write into the classified taxonomy.
    pub fn from_write_failure(device: &DeviceId, tag: &TagId, err: &DriverError) -> Self {
        match err {
            DriverError::Timeout { timeout_ms, .. } => Self::Timeout {
                device: device.clone(),
                tag: tag.clone(),
                timeout_ms: *timeout_ms,
            },
            DriverError::Rejected { .. }
            | DriverError::UnknownTag { .. }
            | DriverError::Unsupported { .. } => Self::Rejected {
                device: device.clone(),
                tag: tag.clone(),
                reason: err.to_string(),
            },
            DriverError::ConnectFailed { .. } | DriverError::Io { .. } | DriverError::NotConnected => {
                Self::unavailable(device, err.to_string())
            }
        }
    }

    /// Short machine-readable code used in API error bodies and metrics labels.
    pub fn code(&self) -> &'static str {
        match self {
            BrokerError::DeviceUnavailable { .. } => "device_unavailable",
            BrokerError::Timeout { .. } => "timeout",
            BrokerError::Rejected { .. } => "rejected",
            BrokerError::Backpressure { .. } => "backpressure",
            BrokerError::NotFound { .. } => "not_found",
            BrokerError::InvalidValue { .. } => "invalid_value",
        }
    }
}

/// Errors related to configuration.
#[derive(Debug, Error, Serialize, Deserialize)]
pub enum ConfigError {
    /// Failed to load configuration
    #[error("Failed to load configuration from {path}: {reason}")]
    LoadFailed { path: String, reason: String },

    /// Invalid configuration format
    #[error("Invalid configuration format: {reason}")]
    InvalidFormat { reason: String },

    /// Invalid configuration value
    #[error("Invalid configuration value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },

    /// No devices configured
    #[error("No devices configured")]
    NoDevices,

    /// Duplicate device id
    #[error("Duplicate device id: {id}")]
    DuplicateDevice { id: String },

    /// Duplicate tag within a device
    #[error("Duplicate tag '{tag}' on device '{device}'")]
    DuplicateTag { device: String, tag: String },

    /// Invalid device configuration
    #[error("Invalid device configuration for '{device}': {reason}")]
    InvalidDeviceConfig { device: String, reason: String },

    /// No driver registered for a device's driver kind
    #[error("No driver registered for kind '{kind}' (device '{device}')")]
    UnknownDriver { device: String, kind: String },
}

impl ConfigError {
    /// Creates an invalid value error.
    pub fn invalid_value(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Creates an invalid device configuration error.
    pub fn invalid_device(device: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidDeviceConfig {
            device: device.into(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_driver_error_link_fault() {
        assert!(DriverError::io("broken pipe").is_link_fault());
        assert!(DriverError::timeout("read", 10_000).is_link_fault());
        assert!(DriverError::NotConnected.is_link_fault());
        assert!(!DriverError::rejected("out of range").is_link_fault());
        assert!(DriverError::UnknownTag { tag: "D9".into() }.is_rejection());
    }

    #[test]
    fn test_write_failure_classification() {
        let device = DeviceId::from("press1");
        let tag = TagId::from("setpoint");

        let err = BrokerError::from_write_failure(&device, &tag, &DriverError::timeout("write", 500));
        assert!(matches!(err, BrokerError::Timeout { timeout_ms: 500, .. }));

        let err = BrokerError::from_write_failure(&device, &tag, &DriverError::rejected("range"));
        assert!(matches!(err, BrokerError::Rejected { .. }));

        let err = BrokerError::from_write_failure(&device, &tag, &DriverError::io("reset"));
        assert!(matches!(err, BrokerError::DeviceUnavailable { .. }));
    }

    #[test]
    fn test_not_found_display() {
        let device = DeviceId::from("press1");
        let err = BrokerError::device_not_found(&device);
        assert_eq!(err.to_string(), "Device press1 is not configured");

        let err = BrokerError::tag_not_found(&device, &TagId::from("temp"));
        assert_eq!(err.to_string(), "Tag press1/temp is not configured");
        assert_eq!(err.code(), "not_found");
    }

    #[test]
    fn test_error_serialization() {
        let err = PlcBrokerError::Broker(BrokerError::Backpressure {
            device: DeviceId::from("press1"),
            depth: 50,
        });
        let json = serde_json::to_string(&err).unwrap();
        assert!(json.contains("Backpressure"));
        assert!(json.contains("press1"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "file not found");
        let err: PlcBrokerError = io_err.into();
        assert!(matches!(err, PlcBrokerError::Io { .. }));
    }
}
