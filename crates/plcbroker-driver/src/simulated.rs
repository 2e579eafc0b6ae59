//! In-memory controller.
//!
//! A [`SimulatedController`] holds the tag table of one device and survives
//! across sessions, the way a physical controller outlives the TCP links made
//! to it. [`SimulatedDriver`] is one session to it. Faults can be injected at
//! runtime, and the controller records how many sessions and operations were
//! ever live at once so exclusivity can be asserted from tests.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use plcbroker_core::config::DeviceConfig;
use plcbroker_core::{DataType, DeviceId, DriverError, PlcValue, TagId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::driver::{DriverFactory, PlcDriver};

/// Modbus "illegal data value" exception code.
const REJECT_CODE: i32 = 3;

/// State of one simulated controller.
#[derive(Debug)]
pub struct SimulatedController {
    device: DeviceId,
    address: String,
    values: Mutex<HashMap<TagId, PlcValue>>,

    batch: AtomicBool,
    fail_connect: AtomicBool,
    fail_reads: AtomicBool,
    reject_writes: AtomicBool,
    discard_writes: AtomicBool,
    read_delay_ms: AtomicU64,
    write_delay_ms: AtomicU64,

    live_sessions: AtomicUsize,
    max_live_sessions: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,

    connects: AtomicU64,
    reads: AtomicU64,
    writes: AtomicU64,
}

impl SimulatedController {
    /// Creates a controller whose tag table is seeded from the device's tag
    /// definitions.
    pub fn new(device: &DeviceConfig) -> Self {
        let values = device
            .tags
            .iter()
            .map(|tag| {
                let value = tag
                    .initial
                    .clone()
                    .and_then(|v| v.coerce(tag.data_type))
                    .unwrap_or_else(|| zero_value(tag.data_type));
                (tag.name.clone(), value)
            })
            .collect();

        Self {
            device: device.id.clone(),
            address: device.endpoint(),
            values: Mutex::new(values),
            batch: AtomicBool::new(true),
            fail_connect: AtomicBool::new(false),
            fail_reads: AtomicBool::new(false),
            reject_writes: AtomicBool::new(false),
            discard_writes: AtomicBool::new(false),
            read_delay_ms: AtomicU64::new(0),
            write_delay_ms: AtomicU64::new(0),
            live_sessions: AtomicUsize::new(0),
            max_live_sessions: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            connects: AtomicU64::new(0),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        }
    }

    pub fn device(&self) -> &DeviceId {
        &self.device
    }

    /// Current value of a tag on the controller.
    pub fn value(&self, tag: &TagId) -> Option<PlcValue> {
        self.values.lock().get(tag).cloned()
    }

    /// Change a tag as if the process moved it.
    pub fn set_value(&self, tag: impl Into<TagId>, value: PlcValue) {
        self.values.lock().insert(tag.into(), value);
    }

    pub fn set_batch(&self, enabled: bool) {
        self.batch.store(enabled, Ordering::SeqCst);
    }

    /// Refuse new sessions.
    pub fn fail_connect(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::SeqCst);
    }

    /// Fail every read with a transport error.
    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Answer every write with an exception response.
    pub fn reject_writes(&self, reject: bool) {
        self.reject_writes.store(reject, Ordering::SeqCst);
    }

    /// Acknowledge writes without changing the tag.
    pub fn discard_writes(&self, discard: bool) {
        self.discard_writes.store(discard, Ordering::SeqCst);
    }

    pub fn set_read_delay(&self, delay: Duration) {
        self.read_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn set_write_delay(&self, delay: Duration) {
        self.write_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Sessions currently open.
    pub fn live_sessions(&self) -> usize {
        self.live_sessions.load(Ordering::SeqCst)
    }

    /// Highest number of sessions ever open at once.
    pub fn max_live_sessions(&self) -> usize {
        self.max_live_sessions.load(Ordering::SeqCst)
    }

    /// Highest number of operations ever executing at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn connect_count(&self) -> u64 {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn read_count(&self) -> u64 {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    fn open_session(&self) {
        let live = self.live_sessions.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_live_sessions.fetch_max(live, Ordering::SeqCst);
        self.connects.fetch_add(1, Ordering::SeqCst);
    }

    fn close_session(&self) {
        self.live_sessions.fetch_sub(1, Ordering::SeqCst);
    }

    fn begin_operation(&self) -> OperationGuard<'_> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        OperationGuard { controller: self }
    }

    async fn delay(&self, delay_ms: &AtomicU64) {
        let ms = delay_ms.load(Ordering::SeqCst);
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
    }

    fn read_value(&self, tag: &TagId) -> Result<PlcValue, DriverError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(DriverError::io("connection reset by peer"));
        }
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.value(tag).ok_or_else(|| DriverError::UnknownTag {
            tag: tag.to_string(),
        })
    }
}

fn zero_value(data_type: DataType) -> PlcValue {
    match data_type {
        DataType::Bool => PlcValue::Bool(false),
        DataType::Int => PlcValue::Int(0),
        DataType::Float => PlcValue::Float(0.0),
        DataType::String => PlcValue::String(String::new()),
    }
}

/// Marks one operation as executing on the controller until dropped.
struct OperationGuard<'a> {
    controller: &'a SimulatedController,
}

impl Drop for OperationGuard<'_> {
    fn drop(&mut self) {
        self.controller.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// One session to a [`SimulatedController`].
pub struct SimulatedDriver {
    controller: Arc<SimulatedController>,
    connected: bool,
}

impl SimulatedDriver {
    pub fn new(controller: Arc<SimulatedController>) -> Self {
        Self {
            controller,
            connected: false,
        }
    }

    fn ensure_connected(&self) -> Result<(), DriverError> {
        if self.connected {
            Ok(())
        } else {
            Err(DriverError::NotConnected)
        }
    }
}

#[async_trait]
impl PlcDriver for SimulatedDriver {
    async fn connect(&mut self) -> Result<(), DriverError> {
        if self.connected {
            return Ok(());
        }
        if self.controller.fail_connect.load(Ordering::SeqCst) {
            return Err(DriverError::connect_failed(
                &self.controller.address,
                "connection refused",
            ));
        }

        self.controller.open_session();
        self.connected = true;
        debug!(device = %self.controller.device, "Simulated session opened");
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), DriverError> {
        if self.connected {
            self.connected = false;
            self.controller.close_session();
            debug!(device = %self.controller.device, "Simulated session closed");
        }
        Ok(())
    }

    fn supports_batch(&self) -> bool {
        self.controller.batch.load(Ordering::SeqCst)
    }

    async fn read_tags(&mut self, tags: &[TagId]) -> Result<Vec<PlcValue>, DriverError> {
        self.ensure_connected()?;
        if !self.supports_batch() {
            return Err(DriverError::Unsupported {
                operation: "read_tags".to_string(),
            });
        }

        let _op = self.controller.begin_operation();
        self.controller.delay(&self.controller.read_delay_ms).await;
        tags.iter().map(|tag| self.controller.read_value(tag)).collect()
    }

    async fn read_tag(&mut self, tag: &TagId) -> Result<PlcValue, DriverError> {
        self.ensure_connected()?;

        let _op = self.controller.begin_operation();
        self.controller.delay(&self.controller.read_delay_ms).await;
        self.controller.read_value(tag)
    }

    async fn write_tag(&mut self, tag: &TagId, value: &PlcValue) -> Result<(), DriverError> {
        self.ensure_connected()?;

        let _op = self.controller.begin_operation();
        self.controller.delay(&self.controller.write_delay_ms).await;

        if self.controller.reject_writes.load(Ordering::SeqCst) {
            return Err(DriverError::Rejected {
                code: Some(REJECT_CODE),
                reason: "illegal data value".to_string(),
            });
        }

        let mut values = self.controller.values.lock();
        let slot = values.get_mut(tag).ok_or_else(|| DriverError::UnknownTag {
            tag: tag.to_string(),
        })?;
        if !self.controller.discard_writes.load(Ordering::SeqCst) {
            *slot = value.clone();
        }
        self.controller.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}

impl Drop for SimulatedDriver {
    fn drop(&mut self) {
        if self.connected {
            self.controller.close_session();
        }
    }
}

/// Factory for simulated drivers.
///
/// Controllers are created on first use and shared by every later session to
/// the same device.
#[derive(Debug, Default)]
pub struct SimulatedFactory {
    controllers: DashMap<DeviceId, Arc<SimulatedController>>,
    sequential_only: bool,
}

impl SimulatedFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Factory whose controllers only support single-tag reads.
    pub fn sequential() -> Self {
        Self {
            controllers: DashMap::new(),
            sequential_only: true,
        }
    }

    /// Returns the controller for `device`, creating it if needed.
    pub fn register(&self, device: &DeviceConfig) -> Arc<SimulatedController> {
        self.controllers
            .entry(device.id.clone())
            .or_insert_with(|| {
                let controller = SimulatedController::new(device);
                controller.set_batch(!self.sequential_only);
                Arc::new(controller)
            })
            .clone()
    }

    /// Returns the controller for `device` if one has been created.
    pub fn controller(&self, device: &DeviceId) -> Option<Arc<SimulatedController>> {
        self.controllers.get(device).map(|c| c.clone())
    }
}

impl DriverFactory for SimulatedFactory {
    fn create(&self, device: &DeviceConfig) -> Result<Box<dyn PlcDriver>, DriverError> {
        Ok(Box::new(SimulatedDriver::new(self.register(device))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use plcbroker_core::config::TagConfig;

    fn press1() -> DeviceConfig {
        DeviceConfig::new("press1", "127.0.0.1")
            .with_tag(
                TagConfig::new("temp", DataType::Float).with_initial(PlcValue::Float(72.5)),
            )
            .with_tag(TagConfig::new("setpoint", DataType::Float))
    }

    #[tokio::test]
    async fn test_seeded_values() {
        let factory = SimulatedFactory::new();
        let mut driver = factory.create(&press1()).unwrap();
        driver.connect().await.unwrap();

        assert_eq!(
            driver.read_tag(&TagId::from("temp")).await.unwrap(),
            PlcValue::Float(72.5)
        );
        assert_eq!(
            driver.read_tag(&TagId::from("setpoint")).await.unwrap(),
            PlcValue::Float(0.0)
        );
    }

    #[tokio::test]
    async fn test_requires_connection() {
        let factory = SimulatedFactory::new();
        let mut driver = factory.create(&press1()).unwrap();

        let err = driver.read_tag(&TagId::from("temp")).await.unwrap_err();
        assert_eq!(err, DriverError::NotConnected);
    }

    #[tokio::test]
    async fn test_batch_read_and_write() {
        let factory = SimulatedFactory::new();
        let mut driver = factory.create(&press1()).unwrap();
        driver.connect().await.unwrap();
        assert!(driver.supports_batch());

        driver
            .write_tag(&TagId::from("setpoint"), &PlcValue::Float(80.0))
            .await
            .unwrap();

        let values = driver
            .read_tags(&[TagId::from("temp"), TagId::from("setpoint")])
            .await
            .unwrap();
        assert_eq!(values, vec![PlcValue::Float(72.5), PlcValue::Float(80.0)]);

        let controller = factory.controller(&DeviceId::from("press1")).unwrap();
        assert_eq!(controller.write_count(), 1);
        assert_eq!(controller.read_count(), 2);
    }

    #[tokio::test]
    async fn test_sequential_factory_refuses_batch() {
        let factory = SimulatedFactory::sequential();
        let mut driver = factory.create(&press1()).unwrap();
        driver.connect().await.unwrap();

        assert!(!driver.supports_batch());
        assert!(driver.read_tags(&[TagId::from("temp")]).await.is_err());
    }

    #[tokio::test]
    async fn test_fault_injection() {
        let factory = SimulatedFactory::new();
        let controller = factory.register(&press1());
        let mut driver = factory.create(&press1()).unwrap();

        controller.fail_connect(true);
        let err = driver.connect().await.unwrap_err();
        assert!(err.is_link_fault());

        controller.fail_connect(false);
        driver.connect().await.unwrap();

        controller.fail_reads(true);
        let err = driver.read_tag(&TagId::from("temp")).await.unwrap_err();
        assert!(matches!(err, DriverError::Io { .. }));

        controller.reject_writes(true);
        let err = driver
            .write_tag(&TagId::from("setpoint"), &PlcValue::Float(1.0))
            .await
            .unwrap_err();
        assert!(matches!(err, DriverError::Rejected { code: Some(3), .. }));
    }

    #[tokio::test]
    async fn test_unknown_tag() {
        let factory = SimulatedFactory::new();
        let mut driver = factory.create(&press1()).unwrap();
        driver.connect().await.unwrap();

        let err = driver
            .write_tag(&TagId::from("missing"), &PlcValue::Int(1))
            .await
            .unwrap_err();
        assert!(err.is_rejection());
    }

    #[tokio::test]
    async fn test_session_accounting() {
        let factory = SimulatedFactory::new();
        let controller = factory.register(&press1());

        let mut first = factory.create(&press1()).unwrap();
        first.connect().await.unwrap();
        assert_eq!(controller.live_sessions(), 1);

        drop(first);
        assert_eq!(controller.live_sessions(), 0);

        let mut second = factory.create(&press1()).unwrap();
        second.connect().await.unwrap();
        second.disconnect().await.unwrap();

        assert_eq!(controller.live_sessions(), 0);
        assert_eq!(controller.max_live_sessions(), 1);
        assert_eq!(controller.connect_count(), 2);
    }
}
