//! Device Connection Manager
//!
//! Owns one session task per enabled device. The session task is the only
//! owner of that device's driver: it connects, executes operations sent to
//! it over a bounded channel strictly one at a time, and on a link fault
//! drops the driver and reconnects with exponential backoff. Callers never
//! touch a driver directly; [`DeviceConnectionManager::acquire`] hands out a
//! [`DeviceSession`], a cloneable handle that submits operations to the
//! session task and awaits their replies.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use plcbroker_core::config::{AppConfig, DeviceConfig};
use plcbroker_core::{
    BrokerError, ConfigError, DeviceId, DeviceState, DeviceStatus, DriverError, PlcValue, TagId,
};
use plcbroker_driver::{calculate_backoff, DriverFactory, DriverRegistry, PlcDriver, ReconnectConfig};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::health::HealthRegistry;
use crate::metrics::BrokerMetrics;

/// Operations a session task can execute.
const SESSION_CHANNEL_CAPACITY: usize = 8;

/// How long shutdown waits for each background task.
pub(crate) const TASK_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Values read in one poll, stamped when the controller answered.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadBatch {
    pub values: Vec<PlcValue>,
    pub timestamp: DateTime<Utc>,
}

enum DeviceOp {
    Read {
        tags: Arc<[TagId]>,
        reply: oneshot::Sender<Result<ReadBatch, DriverError>>,
    },
    Write {
        tag: TagId,
        value: PlcValue,
        reply: oneshot::Sender<Result<DateTime<Utc>, DriverError>>,
    },
}

impl DeviceOp {
    fn reject(self, error: DriverError) {
        match self {
            DeviceOp::Read { reply, .. } => {
                let _ = reply.send(Err(error));
            }
            DeviceOp::Write { reply, .. } => {
                let _ = reply.send(Err(error));
            }
        }
    }
}

/// Serialized access to one device's session.
///
/// Every operation is executed by the device's session task, so operations
/// from different holders never overlap on the wire.
#[derive(Clone)]
pub struct DeviceSession {
    tx: flume::Sender<DeviceOp>,
}

impl DeviceSession {
    /// Read `tags`, in one request if the driver supports batching.
    pub async fn read_tags(&self, tags: Arc<[TagId]>) -> Result<ReadBatch, DriverError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send_async(DeviceOp::Read { tags, reply })
            .await
            .map_err(|_| DriverError::NotConnected)?;
        rx.await.map_err(|_| DriverError::NotConnected)?
    }

    /// Write one tag, returning when the controller acknowledged it.
    ///
    /// Dropping the returned future does not cancel the write once it has
    /// been handed to the session task.
    pub async fn write_tag(&self, tag: TagId, value: PlcValue) -> Result<DateTime<Utc>, DriverError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send_async(DeviceOp::Write { tag, value, reply })
            .await
            .map_err(|_| DriverError::NotConnected)?;
        rx.await.map_err(|_| DriverError::NotConnected)?
    }
}

struct ManagedDevice {
    config: Arc<DeviceConfig>,
    factory: Arc<dyn DriverFactory>,
    tx: flume::Sender<DeviceOp>,
    rx: Mutex<Option<flume::Receiver<DeviceOp>>>,
}

/// Owns the connection of every configured device.
pub struct DeviceConnectionManager {
    devices: HashMap<DeviceId, ManagedDevice>,
    health: Arc<HealthRegistry>,
    metrics: Arc<BrokerMetrics>,
    reconnect: ReconnectConfig,
    io_timeout: Duration,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl DeviceConnectionManager {
    /// Create the manager. Fails if a device names a driver kind that is not
    /// registered.
    pub fn new(
        config: &AppConfig,
        drivers: &DriverRegistry,
        health: Arc<HealthRegistry>,
        metrics: Arc<BrokerMetrics>,
    ) -> Result<Self, ConfigError> {
        let mut devices = HashMap::new();
        for device in &config.devices {
            let factory = drivers
                .get(&device.driver)
                .ok_or_else(|| ConfigError::UnknownDriver {
                    device: device.id.to_string(),
                    kind: device.driver.clone(),
                })?;

            let (tx, rx) = flume::bounded(SESSION_CHANNEL_CAPACITY);
            devices.insert(
                device.id.clone(),
                ManagedDevice {
                    config: Arc::new(device.clone()),
                    factory,
                    tx,
                    rx: Mutex::new(Some(rx)),
                },
            );
        }

        Ok(Self {
            devices,
            health,
            metrics,
            reconnect: ReconnectConfig::from(&config.backoff),
            io_timeout: config.connection.io_timeout(),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Spawn a session task for every enabled device.
    ///
    /// Calling this more than once has no effect.
    pub fn start(&self) {
        let mut tasks = self.tasks.lock();
        for device in self.devices.values() {
            if !device.config.enabled {
                debug!(device = %device.config.id, "Device disabled, not connecting");
                continue;
            }
            let Some(ops) = device.rx.lock().take() else {
                continue;
            };

            let task = SessionTask {
                config: Arc::clone(&device.config),
                factory: Arc::clone(&device.factory),
                health: Arc::clone(&self.health),
                metrics: Arc::clone(&self.metrics),
                reconnect: self.reconnect.clone(),
                io_timeout: self.io_timeout,
                cancel: self.cancel.child_token(),
            };
            tasks.push(tokio::spawn(task.run(ops)));
        }
    }

    /// Get serialized access to a device's connection.
    ///
    /// Fails fast with `DeviceUnavailable` unless the device is `Healthy`;
    /// never waits for a reconnect.
    pub fn acquire(&self, device: &DeviceId) -> Result<DeviceSession, BrokerError> {
        let managed = self
            .devices
            .get(device)
            .ok_or_else(|| BrokerError::device_not_found(device))?;

        if !managed.config.enabled {
            return Err(BrokerError::unavailable(device, "device is disabled"));
        }

        let status = self
            .health
            .status(device)
            .ok_or_else(|| BrokerError::device_not_found(device))?;
        if !status.state.is_healthy() {
            let reason = match status.last_error {
                Some(err) => format!("device is {}: {}", status.state, err),
                None => format!("device is {}", status.state),
            };
            return Err(BrokerError::unavailable(device, reason));
        }

        Ok(DeviceSession {
            tx: managed.tx.clone(),
        })
    }

    /// Report a failed operation against a device.
    ///
    /// Link faults degrade the device, which makes its session task tear the
    /// driver down and reconnect. Controller rejections are only recorded.
    pub fn report_failure(&self, device: &DeviceId, error: &DriverError) {
        if error.is_link_fault() {
            self.health.mark_degraded(device, &error.to_string());
        } else {
            debug!(device = %device, error = %error, "Controller rejected operation");
            self.health.record_error(device, &error.to_string());
        }
    }

    pub fn health(&self, device: &DeviceId) -> Option<DeviceStatus> {
        self.health.status(device)
    }

    /// Statuses of all devices in configuration order.
    pub fn snapshot(&self) -> Vec<(DeviceId, DeviceStatus)> {
        self.health.snapshot()
    }

    pub fn device_config(&self, device: &DeviceId) -> Option<&DeviceConfig> {
        self.devices.get(device).map(|d| d.config.as_ref())
    }

    /// Stop every session task, disconnecting live sessions.
    pub async fn shutdown(&self) {
        info!("Shutting down device connections");
        self.cancel.cancel();
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        join_tasks("session", tasks).await;
    }
}

/// Wait for background tasks, abandoning any that outlive the join timeout.
pub(crate) async fn join_tasks(kind: &str, tasks: Vec<JoinHandle<()>>) {
    for mut task in tasks {
        tokio::select! {
            _ = &mut task => {}
            _ = tokio::time::sleep(TASK_JOIN_TIMEOUT) => {
                warn!(kind = kind, "Task did not complete in time, aborting");
                task.abort();
            }
        }
    }
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionExit {
    Shutdown,
    LinkLost,
}

struct SessionTask {
    config: Arc<DeviceConfig>,
    factory: Arc<dyn DriverFactory>,
    health: Arc<HealthRegistry>,
    metrics: Arc<BrokerMetrics>,
    reconnect: ReconnectConfig,
    io_timeout: Duration,
    cancel: CancellationToken,
}

impl SessionTask {
    fn id(&self) -> &DeviceId {
        &self.config.id
    }

    async fn run(self, ops: flume::Receiver<DeviceOp>) {
        let Some(mut status_rx) = self.health.subscribe(self.id()) else {
            return;
        };

        info!(
            device = %self.id(),
            endpoint = %self.config.endpoint(),
            driver = %self.config.driver,
            "Session task started"
        );

        let mut attempt: u32 = 0;
        let mut connected_before = false;

        while !self.cancel.is_cancelled() {
            self.health.mark_connecting(self.id());

            match self.connect().await {
                Ok(mut driver) => {
                    if connected_before || attempt > 0 {
                        self.metrics.record_reconnect(self.id().as_str());
                        info!(device = %self.id(), attempts = attempt, "Reconnected");
                    }
                    connected_before = true;
                    attempt = 0;
                    self.health.mark_healthy(self.id());
                    status_rx.borrow_and_update();

                    let exit = self.serve(driver.as_mut(), &ops, &mut status_rx).await;

                    if let Ok(Err(e)) =
                        tokio::time::timeout(self.io_timeout, driver.disconnect()).await
                    {
                        debug!(device = %self.id(), error = %e, "Disconnect failed");
                    }
                    drop(driver);

                    if exit == SessionExit::Shutdown {
                        break;
                    }
                }
                Err(e) => {
                    warn!(device = %self.id(), attempt = attempt + 1, error = %e, "Connection attempt failed");
                    self.health.mark_degraded(self.id(), &e.to_string());
                }
            }

            let delay = calculate_backoff(attempt, &self.reconnect);
            attempt = attempt.saturating_add(1);
            self.health.set_backoff_attempts(self.id(), attempt);
            debug!(device = %self.id(), delay_ms = delay.as_millis() as u64, "Reconnecting after backoff");

            if !self.back_off(delay, &ops).await {
                break;
            }
        }

        self.health.mark_disconnected(self.id());
        info!(device = %self.id(), "Session task stopped");
    }

    /// Create a fresh driver and connect it. The previous driver is always
    /// dropped before this is called.
    async fn connect(&self) -> Result<Box<dyn PlcDriver>, DriverError> {
        let mut driver = self.factory.create(&self.config)?;
        self.with_timeout("connect", driver.connect()).await?;
        Ok(driver)
    }

    async fn serve(
        &self,
        driver: &mut dyn PlcDriver,
        ops: &flume::Receiver<DeviceOp>,
        status_rx: &mut watch::Receiver<DeviceStatus>,
    ) -> SessionExit {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return SessionExit::Shutdown,
                _ = wait_unhealthy(status_rx) => {
                    info!(device = %self.id(), "Device degraded externally, dropping session");
                    return SessionExit::LinkLost;
                }
                op = ops.recv_async() => match op {
                    Ok(op) => {
                        if self.execute(driver, op).await.is_err() {
                            return SessionExit::LinkLost;
                        }
                    }
                    Err(_) => return SessionExit::Shutdown,
                },
            }
        }
    }

    /// Execute one operation. Returns `Err` if the session must be torn down.
    async fn execute(&self, driver: &mut dyn PlcDriver, op: DeviceOp) -> Result<(), ()> {
        match op {
            DeviceOp::Read { tags, reply } => {
                let result = self
                    .with_timeout("read", read_all(driver, &tags))
                    .await
                    .map(|values| ReadBatch {
                        values,
                        timestamp: Utc::now(),
                    });
                let outcome = self.settle(result.as_ref().err());
                let _ = reply.send(result);
                outcome
            }
            DeviceOp::Write { tag, value, reply } => {
                let result = self
                    .with_timeout("write", driver.write_tag(&tag, &value))
                    .await
                    .map(|()| Utc::now());
                let outcome = self.settle(result.as_ref().err());
                let _ = reply.send(result);
                outcome
            }
        }
    }

    /// Update health after an operation, before its caller sees the result.
    fn settle(&self, error: Option<&DriverError>) -> Result<(), ()> {
        match error {
            None => {
                self.health.record_success(self.id());
                Ok(())
            }
            Some(e) if e.is_link_fault() => {
                self.health.mark_degraded(self.id(), &e.to_string());
                Err(())
            }
            Some(e) => {
                self.health.record_error(self.id(), &e.to_string());
                Ok(())
            }
        }
    }

    /// Sleep for `delay`, refusing any operation that arrives meanwhile.
    /// Returns false on shutdown.
    async fn back_off(&self, delay: Duration, ops: &flume::Receiver<DeviceOp>) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return false,
                _ = &mut sleep => return true,
                op = ops.recv_async() => match op {
                    Ok(op) => op.reject(DriverError::NotConnected),
                    Err(_) => return false,
                },
            }
        }
    }

    async fn with_timeout<T>(
        &self,
        operation: &str,
        fut: impl Future<Output = Result<T, DriverError>>,
    ) -> Result<T, DriverError> {
        match tokio::time::timeout(self.io_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(DriverError::timeout(
                operation,
                self.io_timeout.as_millis() as u64,
            )),
        }
    }
}

/// Resolves once the device is no longer `Healthy`.
async fn wait_unhealthy(status_rx: &mut watch::Receiver<DeviceStatus>) {
    if status_rx
        .wait_for(|status| status.state != DeviceState::Healthy)
        .await
        .is_err()
    {
        std::future::pending::<()>().await;
    }
}

async fn read_all(driver: &mut dyn PlcDriver, tags: &[TagId]) -> Result<Vec<PlcValue>, DriverError> {
    if driver.supports_batch() {
        let values = driver.read_tags(tags).await?;
        if values.len() != tags.len() {
            return Err(DriverError::io(format!(
                "batch read returned {} values for {} tags",
                values.len(),
                tags.len()
            )));
        }
        return Ok(values);
    }

    let mut values = Vec::with_capacity(tags.len());
    for tag in tags {
        values.push(driver.read_tag(tag).await?);
    }
    Ok(values)
}
