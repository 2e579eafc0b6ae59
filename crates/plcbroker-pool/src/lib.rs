//! PLC Broker Runtime
//!
//! Device sessions, polling, caching and write serialization for the PLC
//! broker.
//!
//! # Architecture
//!
//! ```text
//!                   ┌──────────────────────────────────┐
//!                   │            Broker                │
//!                   │          (broker.rs)             │
//!                   └──┬──────────┬─────────────┬──────┘
//!                      │          │             │
//!        ┌─────────────▼──┐  ┌────▼─────────┐  ┌▼─────────────────┐
//!        │ PollScheduler  │  │  TagCache    │  │ WriteCoordinator │
//!        │ (poller.rs)    ├─►│  (cache.rs)  │◄─┤ (writer.rs)      │
//!        │ - task/device  │  │  - DashMap   │  │ - FIFO/device    │
//!        │ - own interval │  │  - staleness │  │ - 1 in flight    │
//!        └───────┬────────┘  └──────────────┘  └────────┬─────────┘
//!                │                                      │
//!                │     ┌──────────────────────────┐     │
//!                └────►│ DeviceConnectionManager  │◄────┘
//!                      │ (connection.rs)          │
//!                      │ - session task/device    │
//!                      │ - reconnect w/ backoff   │
//!                      │ - HealthRegistry         │
//!                      └────────────┬─────────────┘
//!                                   │
//!                          PlcDriver (one session)
//! ```
//!
//! Every poll result and acknowledged write is also published to an
//! [`ArchiveSink`](sink::ArchiveSink).
//!
//! # Example Usage
//!
//! ```rust,no_run
//! use plcbroker_core::config::AppConfig;
//! use plcbroker_driver::{simulated::SimulatedFactory, DriverRegistry};
//! use plcbroker_pool::Broker;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = AppConfig::from_file("config/plcbroker.yaml")?;
//!
//!     let mut drivers = DriverRegistry::new();
//!     drivers.register("simulated", Arc::new(SimulatedFactory::new()));
//!
//!     let broker = Broker::new(config, &drivers)?;
//!     broker.start();
//!
//!     tokio::signal::ctrl_c().await?;
//!     broker.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod broker;
pub mod cache;
pub mod connection;
pub mod health;
pub mod metrics;
pub mod poller;
pub mod sink;
pub mod writer;

pub use broker::Broker;
pub use cache::TagCache;
pub use connection::{DeviceConnectionManager, DeviceSession, ReadBatch};
pub use health::HealthRegistry;
pub use crate::metrics::{install_prometheus, BrokerMetrics, MetricsSnapshot};
pub use poller::{DevicePoller, PollOutcome, PollScheduler};
pub use sink::{spawn_jsonl_writer, ArchiveSink, ChannelSink, TracingSink};
pub use writer::{WriteCoordinator, WriteReceipt};
