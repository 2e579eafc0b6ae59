//! # PLC Broker Core
//!
//! Core types, error handling, and configuration for the PLC broker.
//!
//! This crate provides the foundational building blocks shared by every other
//! crate in the workspace:
//!
//! - **Types**: device and tag identifiers, typed tag values, device health
//!   states, and the cached `TagValue` view handed to API clients.
//! - **Errors**: the classified outcome taxonomy (`DeviceUnavailable`,
//!   `Timeout`, `Rejected`, `Backpressure`, `NotFound`) plus driver and
//!   configuration errors, all built with `thiserror`.
//! - **Configuration**: YAML configuration with environment variable
//!   overrides and load-time validation. Configuration is static for the
//!   lifetime of the process.
//!
//! ## Example
//!
//! ```
//! use plcbroker_core::config::AppConfig;
//!
//! let config = AppConfig::from_yaml(r#"
//! devices:
//!   - id: press1
//!     address: 192.168.150.22
//!     tags:
//!       - name: temp
//!         type: float
//!         unit: degC
//! "#).unwrap();
//!
//! assert!(config.validate().is_ok());
//! ```

pub mod config;
pub mod error;
pub mod types;

// Re-export commonly used types for convenience
pub use config::AppConfig;
pub use error::{BrokerError, ConfigError, DriverError, PlcBrokerError, Result};
pub use types::{
    DataType, DeviceId, DeviceState, DeviceStatus, PlcValue, TagId, TagUpdate, TagValue,
    UpdateSource,
};
