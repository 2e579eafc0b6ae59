//! Write Coordinator
//!
//! Serializes client writes per device. Each device has a bounded FIFO and a
//! single worker that dispatches one write at a time and waits for the
//! controller's acknowledgment (or the write timeout) before taking the next.
//! The bound counts queued plus in-flight requests; a submission beyond it is
//! refused immediately with `Backpressure`.
//!
//! Validation happens before anything is queued: unknown device or tag,
//! read-only tag, wrong value type and unhealthy device all fail without a
//! queue entry.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use plcbroker_core::config::AppConfig;
use plcbroker_core::{BrokerError, DeviceId, PlcValue, TagId, TagUpdate, UpdateSource};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::TagCache;
use crate::connection::{join_tasks, DeviceConnectionManager};
use crate::metrics::BrokerMetrics;
use crate::sink::ArchiveSink;

/// Acknowledged write.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteReceipt {
    pub device: DeviceId,
    pub tag: TagId,
    pub value: PlcValue,
    /// When the controller acknowledged the write
    pub applied_at: DateTime<Utc>,
}

struct WriteRequest {
    tag: TagId,
    value: PlcValue,
    deadline: Instant,
    reply: oneshot::Sender<Result<DateTime<Utc>, BrokerError>>,
}

struct DeviceQueue {
    tx: flume::Sender<WriteRequest>,
    rx: Mutex<Option<flume::Receiver<WriteRequest>>>,
    /// Queued plus in-flight requests
    pending: Arc<AtomicUsize>,
}

/// Shared state used by submitters and workers.
struct WriterContext {
    manager: Arc<DeviceConnectionManager>,
    cache: Arc<TagCache>,
    sink: Arc<dyn ArchiveSink>,
    metrics: Arc<BrokerMetrics>,
    timeout: Duration,
}

/// Per-device write queues and their workers.
pub struct WriteCoordinator {
    queues: HashMap<DeviceId, DeviceQueue>,
    ctx: Arc<WriterContext>,
    depth: usize,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl WriteCoordinator {
    pub fn new(
        config: &AppConfig,
        manager: Arc<DeviceConnectionManager>,
        cache: Arc<TagCache>,
        sink: Arc<dyn ArchiveSink>,
        metrics: Arc<BrokerMetrics>,
    ) -> Self {
        let depth = config.write.queue_depth;
        let queues = config
            .enabled_devices()
            .into_iter()
            .map(|device| {
                let (tx, rx) = flume::bounded(depth);
                (
                    device.id.clone(),
                    DeviceQueue {
                        tx,
                        rx: Mutex::new(Some(rx)),
                        pending: Arc::new(AtomicUsize::new(0)),
                    },
                )
            })
            .collect();

        Self {
            queues,
            ctx: Arc::new(WriterContext {
                manager,
                cache,
                sink,
                metrics,
                timeout: config.write.timeout(),
            }),
            depth,
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Spawn one worker per device queue. Calling this more than once has no
    /// effect.
    pub fn start(&self) {
        let mut tasks = self.tasks.lock();
        for (device, queue) in &self.queues {
            let Some(rx) = queue.rx.lock().take() else {
                continue;
            };
            let worker = WriteWorker {
                device: device.clone(),
                rx,
                pending: Arc::clone(&queue.pending),
                ctx: Arc::clone(&self.ctx),
            };
            tasks.push(tokio::spawn(worker.run(self.cancel.child_token())));
        }
    }

    /// Submit a write and wait for its outcome, at most the write timeout.
    ///
    /// If the caller stops waiting, a write already handed to the device is
    /// not cancelled.
    pub async fn submit(
        &self,
        device: &DeviceId,
        tag: &TagId,
        value: PlcValue,
    ) -> Result<WriteReceipt, BrokerError> {
        let result = self.submit_inner(device, tag, value).await;
        let outcome = match &result {
            Ok(_) => "ok",
            Err(e) => e.code(),
        };
        self.ctx.metrics.record_write(device.as_str(), outcome);
        result
    }

    async fn submit_inner(
        &self,
        device: &DeviceId,
        tag: &TagId,
        value: PlcValue,
    ) -> Result<WriteReceipt, BrokerError> {
        let ctx = &self.ctx;
        if ctx.cache.device_tags(device).is_none() {
            return Err(BrokerError::device_not_found(device));
        }
        let definition = ctx
            .cache
            .tag_definition(device, tag)
            .ok_or_else(|| BrokerError::tag_not_found(device, tag))?;

        if !definition.writable {
            return Err(BrokerError::Rejected {
                device: device.clone(),
                tag: tag.clone(),
                reason: "tag is read-only".to_string(),
            });
        }

        let found = value.data_type();
        let value = value
            .coerce(definition.data_type)
            .ok_or_else(|| BrokerError::InvalidValue {
                tag: tag.clone(),
                expected: definition.data_type.to_string(),
                reason: format!("got {}", found),
            })?;

        // Fail fast without a queue entry
        ctx.manager.acquire(device)?;

        let queue = self
            .queues
            .get(device)
            .ok_or_else(|| BrokerError::unavailable(device, "device is disabled"))?;

        if queue
            .pending
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < self.depth).then_some(n + 1)
            })
            .is_err()
        {
            debug!(device = %device, tag = %tag, depth = self.depth, "Write queue full");
            return Err(BrokerError::Backpressure {
                device: device.clone(),
                depth: self.depth,
            });
        }

        let (reply, reply_rx) = oneshot::channel();
        let request = WriteRequest {
            tag: tag.clone(),
            value: value.clone(),
            deadline: Instant::now() + ctx.timeout,
            reply,
        };
        if queue.tx.try_send(request).is_err() {
            queue.pending.fetch_sub(1, Ordering::SeqCst);
            return Err(BrokerError::unavailable(device, "write queue closed"));
        }

        match tokio::time::timeout(ctx.timeout, reply_rx).await {
            Ok(Ok(Ok(applied_at))) => Ok(WriteReceipt {
                device: device.clone(),
                tag: tag.clone(),
                value,
                applied_at,
            }),
            Ok(Ok(Err(e))) => Err(e),
            Ok(Err(_)) => Err(BrokerError::unavailable(device, "write worker stopped")),
            Err(_) => {
                ctx.cache.mark_stale(device, tag);
                Err(BrokerError::Timeout {
                    device: device.clone(),
                    tag: tag.clone(),
                    timeout_ms: ctx.timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Queued plus in-flight writes for a device.
    pub fn queue_len(&self, device: &DeviceId) -> usize {
        self.queues
            .get(device)
            .map(|q| q.pending.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    /// Stop the workers. Requests still queued are resolved as unavailable.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        join_tasks("write worker", tasks).await;
    }
}

struct WriteWorker {
    device: DeviceId,
    rx: flume::Receiver<WriteRequest>,
    pending: Arc<AtomicUsize>,
    ctx: Arc<WriterContext>,
}

impl WriteWorker {
    async fn run(self, cancel: CancellationToken) {
        info!(device = %self.device, "Write worker started");

        loop {
            let request = tokio::select! {
                _ = cancel.cancelled() => break,
                request = self.rx.recv_async() => match request {
                    Ok(request) => request,
                    Err(_) => break,
                },
            };

            let result = self.dispatch(&request).await;
            self.pending.fetch_sub(1, Ordering::SeqCst);
            let _ = request.reply.send(result);
        }

        for request in self.rx.drain() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            let _ = request
                .reply
                .send(Err(BrokerError::unavailable(&self.device, "broker shutting down")));
        }

        info!(device = %self.device, "Write worker stopped");
    }

    async fn dispatch(&self, request: &WriteRequest) -> Result<DateTime<Utc>, BrokerError> {
        let device = &self.device;
        let tag = &request.tag;
        let timed_out = || BrokerError::Timeout {
            device: device.clone(),
            tag: tag.clone(),
            timeout_ms: self.ctx.timeout.as_millis() as u64,
        };

        // The caller has already been told the write timed out
        if Instant::now() >= request.deadline {
            debug!(device = %device, tag = %tag, "Discarding expired write");
            return Err(timed_out());
        }

        // Queued writes fail fast once the device has left Healthy
        let session = self.ctx.manager.acquire(device)?;

        let write = session.write_tag(tag.clone(), request.value.clone());
        match tokio::time::timeout_at(request.deadline, write).await {
            Ok(Ok(applied_at)) => {
                self.ctx
                    .cache
                    .apply_write(device, tag, request.value.clone(), applied_at);
                self.ctx.sink.publish(TagUpdate {
                    device: device.clone(),
                    tag: tag.clone(),
                    value: request.value.clone(),
                    timestamp: applied_at,
                    source: UpdateSource::Write,
                });
                debug!(device = %device, tag = %tag, value = %request.value, "Write acknowledged");
                Ok(applied_at)
            }
            Ok(Err(e)) => {
                warn!(device = %device, tag = %tag, error = %e, "Write failed");
                self.ctx.manager.report_failure(device, &e);
                let err = BrokerError::from_write_failure(device, tag, &e);
                if matches!(err, BrokerError::Timeout { .. }) {
                    self.ctx.cache.mark_stale(device, tag);
                }
                Err(err)
            }
            Err(_) => {
                warn!(device = %device, tag = %tag, "Write not acknowledged in time");
                self.ctx.cache.mark_stale(device, tag);
                Err(timed_out())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::HealthRegistry;
    use crate::sink::TracingSink;
    use plcbroker_core::config::{DeviceConfig, TagConfig};
    use plcbroker_core::{DataType, DeviceState};
    use plcbroker_driver::simulated::{SimulatedController, SimulatedFactory};
    use plcbroker_driver::{DriverFactory, DriverRegistry};

    struct Fixture {
        manager: Arc<DeviceConnectionManager>,
        cache: Arc<TagCache>,
        writer: Arc<WriteCoordinator>,
        controller: Arc<SimulatedController>,
        device: DeviceId,
    }

    impl Fixture {
        async fn shutdown(&self) {
            self.writer.shutdown().await;
            self.manager.shutdown().await;
        }
    }

    async fn fixture(configure: impl FnOnce(&mut AppConfig)) -> Fixture {
        let mut config = AppConfig::default();
        config.devices.push(
            DeviceConfig::new("press1", "127.0.0.1")
                .with_tag(TagConfig::new("temp", DataType::Float).read_only())
                .with_tag(TagConfig::new("setpoint", DataType::Float).with_initial(PlcValue::Float(70.0)))
                .with_tag(TagConfig::new("running", DataType::Bool)),
        );
        config.backoff.initial_ms = 20;
        config.backoff.max_ms = 50;
        config.write.timeout_ms = 500;
        configure(&mut config);

        let factory = Arc::new(SimulatedFactory::new());
        let controller = factory.register(&config.devices[0]);
        let mut drivers = DriverRegistry::new();
        drivers.register("simulated", factory as Arc<dyn DriverFactory>);

        let device = DeviceId::from("press1");
        let health = Arc::new(HealthRegistry::new([device.clone()]));
        let metrics = Arc::new(BrokerMetrics::new());
        let manager = Arc::new(
            DeviceConnectionManager::new(&config, &drivers, Arc::clone(&health), Arc::clone(&metrics))
                .unwrap(),
        );
        let cache = Arc::new(TagCache::new(&config, Arc::clone(&health)));
        let writer = Arc::new(WriteCoordinator::new(
            &config,
            Arc::clone(&manager),
            Arc::clone(&cache),
            Arc::new(TracingSink),
            metrics,
        ));

        manager.start();
        writer.start();

        let deadline = std::time::Instant::now() + Duration::from_secs(3);
        while health.state(&device) != Some(DeviceState::Healthy) {
            assert!(std::time::Instant::now() < deadline, "device never became healthy");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        Fixture {
            manager,
            cache,
            writer,
            controller,
            device,
        }
    }

    #[tokio::test]
    async fn test_write_success_updates_cache() {
        let f = fixture(|_| {}).await;
        let setpoint = TagId::from("setpoint");

        let receipt = f
            .writer
            .submit(&f.device, &setpoint, PlcValue::Float(80.0))
            .await
            .unwrap();
        assert_eq!(receipt.value, PlcValue::Float(80.0));

        // Read-your-write before the next poll
        let cached = f.cache.get(&f.device, &setpoint).unwrap();
        assert_eq!(cached.value, Some(PlcValue::Float(80.0)));
        assert_eq!(cached.timestamp, Some(receipt.applied_at));
        assert!(!cached.stale);

        assert_eq!(f.controller.value(&setpoint), Some(PlcValue::Float(80.0)));
        assert_eq!(f.writer.queue_len(&f.device), 0);
        f.shutdown().await;
    }

    #[tokio::test]
    async fn test_int_widens_to_float() {
        let f = fixture(|_| {}).await;
        let receipt = f
            .writer
            .submit(&f.device, &TagId::from("setpoint"), PlcValue::Int(80))
            .await
            .unwrap();
        assert_eq!(receipt.value, PlcValue::Float(80.0));
        f.shutdown().await;
    }

    #[tokio::test]
    async fn test_validation_before_queueing() {
        let f = fixture(|_| {}).await;

        let err = f
            .writer
            .submit(&DeviceId::from("mixer"), &TagId::from("x"), PlcValue::Int(1))
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::NotFound { tag: None, .. }));

        let err = f
            .writer
            .submit(&f.device, &TagId::from("pressure"), PlcValue::Int(1))
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::NotFound { tag: Some(_), .. }));

        let err = f
            .writer
            .submit(&f.device, &TagId::from("temp"), PlcValue::Float(1.0))
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::Rejected { .. }));

        let err = f
            .writer
            .submit(&f.device, &TagId::from("running"), PlcValue::String("on".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::InvalidValue { .. }));

        assert_eq!(f.controller.write_count(), 0);
        f.shutdown().await;
    }

    #[tokio::test]
    async fn test_controller_rejection() {
        let f = fixture(|_| {}).await;
        f.controller.reject_writes(true);

        let err = f
            .writer
            .submit(&f.device, &TagId::from("setpoint"), PlcValue::Float(999.0))
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::Rejected { .. }));

        // Rejection does not take the device down
        let status = f.manager.health(&f.device).unwrap();
        assert_eq!(status.state, DeviceState::Healthy);
        assert!(status.last_error.is_some());
        f.shutdown().await;
    }

    #[tokio::test]
    async fn test_degraded_device_fails_without_queueing() {
        let f = fixture(|_| {}).await;
        f.controller.fail_connect(true);
        f.manager
            .report_failure(&f.device, &plcbroker_core::DriverError::io("reset"));

        let err = f
            .writer
            .submit(&f.device, &TagId::from("setpoint"), PlcValue::Float(80.0))
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::DeviceUnavailable { .. }));
        assert_eq!(f.writer.queue_len(&f.device), 0);
        f.shutdown().await;
    }

    #[tokio::test]
    async fn test_timeout_marks_stale() {
        let f = fixture(|c| {
            c.write.timeout_ms = 50;
            c.connection.io_timeout_ms = 2000;
        })
        .await;
        let setpoint = TagId::from("setpoint");
        f.cache
            .put(&f.device, &setpoint, PlcValue::Float(70.0), Utc::now());
        f.controller.set_write_delay(Duration::from_millis(300));

        let err = f
            .writer
            .submit(&f.device, &setpoint, PlcValue::Float(80.0))
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::Timeout { .. }));
        assert!(f.cache.get(&f.device, &setpoint).unwrap().stale);

        // The write itself still lands on the controller
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(f.controller.value(&setpoint), Some(PlcValue::Float(80.0)));
        f.shutdown().await;
    }

    #[tokio::test]
    async fn test_backpressure_at_bound() {
        let f = fixture(|c| {
            c.write.queue_depth = 3;
            c.write.timeout_ms = 5000;
        })
        .await;
        f.controller.set_write_delay(Duration::from_millis(100));
        let setpoint = TagId::from("setpoint");

        let mut handles = Vec::new();
        for i in 0..3 {
            let writer = Arc::clone(&f.writer);
            let device = f.device.clone();
            let tag = setpoint.clone();
            handles.push(tokio::spawn(async move {
                writer.submit(&device, &tag, PlcValue::Float(i as f64)).await
            }));
        }

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while f.writer.queue_len(&f.device) < 3 {
            assert!(std::time::Instant::now() < deadline);
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        let err = f
            .writer
            .submit(&f.device, &setpoint, PlcValue::Float(99.0))
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::Backpressure { depth: 3, .. }));

        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(f.controller.max_in_flight(), 1);
        assert_eq!(f.controller.write_count(), 3);
        assert_eq!(f.writer.queue_len(&f.device), 0);
        f.shutdown().await;
    }

    #[tokio::test]
    async fn test_queued_writes_fail_when_device_degrades() {
        let f = fixture(|c| c.write.timeout_ms = 5000).await;
        f.controller.set_write_delay(Duration::from_millis(150));
        let setpoint = TagId::from("setpoint");

        let first = {
            let writer = Arc::clone(&f.writer);
            let device = f.device.clone();
            let tag = setpoint.clone();
            tokio::spawn(async move { writer.submit(&device, &tag, PlcValue::Float(1.0)).await })
        };
        let second = {
            let writer = Arc::clone(&f.writer);
            let device = f.device.clone();
            let tag = setpoint.clone();
            tokio::spawn(async move { writer.submit(&device, &tag, PlcValue::Float(2.0)).await })
        };

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while f.writer.queue_len(&f.device) < 2 {
            assert!(std::time::Instant::now() < deadline);
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        f.controller.fail_connect(true);
        f.manager
            .report_failure(&f.device, &plcbroker_core::DriverError::io("link lost"));

        let started = std::time::Instant::now();
        let results = [first.await.unwrap(), second.await.unwrap()];
        assert!(started.elapsed() < Duration::from_secs(2));

        // Whichever write was not yet on the wire fails fast as unavailable
        assert!(results
            .iter()
            .any(|r| matches!(r, Err(BrokerError::DeviceUnavailable { .. }))));
        f.shutdown().await;
    }
}
