//! # plcbroker-driver
//!
//! The controller link contract and its in-process implementation.
//!
//! - [`PlcDriver`]: a single exclusive session to one controller with
//!   connect / disconnect / read / write primitives. Drivers translate their
//!   own error codes into [`DriverError`](plcbroker_core::DriverError).
//! - [`DriverFactory`]: creates a fresh driver for every connection attempt,
//!   so a failed session is always replaced rather than repaired.
//! - [`DriverRegistry`]: maps the `driver` kind named in device configuration
//!   to a factory.
//! - [`backoff`]: exponential reconnect delay calculation.
//! - [`simulated`]: an in-memory controller with fault injection.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use plcbroker_driver::{DriverRegistry, simulated::SimulatedFactory};
//!
//! let mut registry = DriverRegistry::new();
//! registry.register("simulated", Arc::new(SimulatedFactory::new()));
//! assert!(registry.get("simulated").is_some());
//! ```

pub mod backoff;
pub mod driver;
pub mod simulated;

pub use backoff::{calculate_backoff, ReconnectConfig};
pub use driver::{DriverFactory, DriverRegistry, PlcDriver};
