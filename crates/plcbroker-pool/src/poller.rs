//! Poll Scheduler
//!
//! One polling task per enabled device, each on its own interval, so a slow
//! or stalled controller never delays the others. A cycle reads every tag of
//! the device through its session, stores the results in the cache and
//! publishes them to the archive sink. Any read error is reported to the
//! connection manager and ends the cycle; cached values are kept and simply
//! read as stale.

use parking_lot::Mutex;
use plcbroker_core::config::AppConfig;
use plcbroker_core::{DeviceId, TagId, TagUpdate, UpdateSource};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::TagCache;
use crate::connection::{join_tasks, DeviceConnectionManager};
use crate::metrics::BrokerMetrics;
use crate::sink::ArchiveSink;

/// Result of one poll cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// All tags read; the number of cache entries updated
    Updated(usize),
    /// Device not healthy, nothing attempted
    Skipped,
    /// A read failed and was reported
    Failed,
}

/// Polls one device.
pub struct DevicePoller {
    device: DeviceId,
    tags: Arc<[TagId]>,
    interval: Duration,
    manager: Arc<DeviceConnectionManager>,
    cache: Arc<TagCache>,
    sink: Arc<dyn ArchiveSink>,
    metrics: Arc<BrokerMetrics>,
}

impl DevicePoller {
    /// Run a single poll cycle.
    pub async fn poll_once(&self) -> PollOutcome {
        let session = match self.manager.acquire(&self.device) {
            Ok(session) => session,
            Err(e) => {
                debug!(device = %self.device, reason = %e, "Skipping poll cycle");
                return PollOutcome::Skipped;
            }
        };

        let batch = match session.read_tags(Arc::clone(&self.tags)).await {
            Ok(batch) => batch,
            Err(e) => {
                warn!(device = %self.device, error = %e, "Poll failed");
                self.manager.report_failure(&self.device, &e);
                self.metrics.record_poll_error(self.device.as_str());
                return PollOutcome::Failed;
            }
        };

        let mut updated = 0;
        for (tag, value) in self.tags.iter().zip(batch.values) {
            if self
                .cache
                .put(&self.device, tag, value.clone(), batch.timestamp)
            {
                updated += 1;
            }
            self.sink.publish(TagUpdate {
                device: self.device.clone(),
                tag: tag.clone(),
                value,
                timestamp: batch.timestamp,
                source: UpdateSource::Poll,
            });
        }

        self.metrics.record_poll(self.device.as_str());
        PollOutcome::Updated(updated)
    }

    async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            device = %self.device,
            interval_ms = self.interval.as_millis() as u64,
            tags = self.tags.len(),
            "Poller started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.poll_once().await;
                }
            }
        }

        info!(device = %self.device, "Poller stopped");
    }
}

/// Runs a [`DevicePoller`] for every enabled device.
pub struct PollScheduler {
    pollers: Mutex<Vec<DevicePoller>>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl PollScheduler {
    pub fn new(
        config: &AppConfig,
        manager: Arc<DeviceConnectionManager>,
        cache: Arc<TagCache>,
        sink: Arc<dyn ArchiveSink>,
        metrics: Arc<BrokerMetrics>,
    ) -> Self {
        let pollers = config
            .enabled_devices()
            .into_iter()
            .filter_map(|device| {
                Some(DevicePoller {
                    device: device.id.clone(),
                    tags: cache.tag_ids(&device.id)?,
                    interval: device.poll_interval(),
                    manager: Arc::clone(&manager),
                    cache: Arc::clone(&cache),
                    sink: Arc::clone(&sink),
                    metrics: Arc::clone(&metrics),
                })
            })
            .collect();

        Self {
            pollers: Mutex::new(pollers),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Spawn the polling tasks. Calling this more than once has no effect.
    pub fn start(&self) {
        let pollers: Vec<_> = self.pollers.lock().drain(..).collect();
        let mut tasks = self.tasks.lock();
        for poller in pollers {
            tasks.push(tokio::spawn(poller.run(self.cancel.child_token())));
        }
    }

    /// The poller of one device, if it has not been started.
    #[cfg(test)]
    pub(crate) fn take_poller(&self, device: &DeviceId) -> Option<DevicePoller> {
        let mut pollers = self.pollers.lock();
        let index = pollers.iter().position(|p| &p.device == device)?;
        Some(pollers.remove(index))
    }

    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        join_tasks("poller", tasks).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::HealthRegistry;
    use crate::sink::ChannelSink;
    use plcbroker_core::config::{DeviceConfig, TagConfig};
    use plcbroker_core::{DataType, DeviceState, PlcValue};
    use plcbroker_driver::simulated::SimulatedFactory;
    use plcbroker_driver::DriverRegistry;
    use std::time::Instant;

    struct Fixture {
        manager: Arc<DeviceConnectionManager>,
        cache: Arc<TagCache>,
        scheduler: PollScheduler,
        factory: Arc<SimulatedFactory>,
        updates: flume::Receiver<TagUpdate>,
        device: DeviceId,
    }

    fn fixture(factory: SimulatedFactory) -> Fixture {
        let mut config = AppConfig::default();
        config.devices.push(
            DeviceConfig::new("press1", "127.0.0.1")
                .with_poll_interval(Duration::from_millis(20))
                .with_tag(TagConfig::new("temp", DataType::Float).with_initial(PlcValue::Float(72.5)))
                .with_tag(TagConfig::new("count", DataType::Int).with_initial(PlcValue::Int(7))),
        );
        config.backoff.initial_ms = 20;
        config.backoff.max_ms = 50;

        let factory = Arc::new(factory);
        let mut drivers = DriverRegistry::new();
        drivers.register("simulated", Arc::clone(&factory) as Arc<dyn plcbroker_driver::DriverFactory>);

        let health = Arc::new(HealthRegistry::new([DeviceId::from("press1")]));
        let metrics = Arc::new(BrokerMetrics::new());
        let manager = Arc::new(
            DeviceConnectionManager::new(&config, &drivers, Arc::clone(&health), Arc::clone(&metrics))
                .unwrap(),
        );
        let cache = Arc::new(TagCache::new(&config, health));
        let (sink, updates) = ChannelSink::new(1024);
        let scheduler = PollScheduler::new(
            &config,
            Arc::clone(&manager),
            Arc::clone(&cache),
            Arc::new(sink),
            metrics,
        );

        Fixture {
            manager,
            cache,
            scheduler,
            factory,
            updates,
            device: DeviceId::from("press1"),
        }
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(3);
        while !condition() {
            assert!(Instant::now() < deadline, "condition not met in time");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn test_poll_skipped_when_unhealthy() {
        let f = fixture(SimulatedFactory::new());
        let poller = f.scheduler.take_poller(&f.device).unwrap();

        assert_eq!(poller.poll_once().await, PollOutcome::Skipped);
    }

    #[tokio::test]
    async fn test_poll_updates_cache_and_sink() {
        let f = fixture(SimulatedFactory::new());
        let poller = f.scheduler.take_poller(&f.device).unwrap();
        f.manager.start();
        wait_until(|| f.manager.health(&f.device).unwrap().state == DeviceState::Healthy).await;

        assert_eq!(poller.poll_once().await, PollOutcome::Updated(2));

        let temp = f.cache.get(&f.device, &TagId::from("temp")).unwrap();
        assert_eq!(temp.value, Some(PlcValue::Float(72.5)));
        assert!(!temp.stale);

        let updates: Vec<_> = f.updates.drain().collect();
        assert_eq!(updates.len(), 2);
        assert!(updates.iter().all(|u| u.source == UpdateSource::Poll));

        f.manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_sequential_reads_without_batch() {
        let f = fixture(SimulatedFactory::sequential());
        let poller = f.scheduler.take_poller(&f.device).unwrap();
        f.manager.start();
        wait_until(|| f.manager.health(&f.device).unwrap().state == DeviceState::Healthy).await;

        assert_eq!(poller.poll_once().await, PollOutcome::Updated(2));
        let count = f.cache.get(&f.device, &TagId::from("count")).unwrap();
        assert_eq!(count.value, Some(PlcValue::Int(7)));

        f.manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_read_error_reports_failure_and_keeps_values() {
        let f = fixture(SimulatedFactory::new());
        let poller = f.scheduler.take_poller(&f.device).unwrap();
        f.manager.start();
        wait_until(|| f.manager.health(&f.device).unwrap().state == DeviceState::Healthy).await;
        poller.poll_once().await;

        let controller = f.factory.controller(&f.device).unwrap();
        controller.fail_connect(true);
        controller.fail_reads(true);

        assert_eq!(poller.poll_once().await, PollOutcome::Failed);
        assert_eq!(
            f.manager.health(&f.device).unwrap().state,
            DeviceState::Degraded
        );

        let temp = f.cache.get(&f.device, &TagId::from("temp")).unwrap();
        assert_eq!(temp.value, Some(PlcValue::Float(72.5)));
        assert!(temp.stale);

        f.manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_scheduler_tracks_controller() {
        let f = fixture(SimulatedFactory::new());
        f.manager.start();
        f.scheduler.start();

        wait_until(|| {
            f.cache
                .get(&f.device, &TagId::from("temp"))
                .map(|v| v.value == Some(PlcValue::Float(72.5)))
                .unwrap_or(false)
        })
        .await;

        let controller = f.factory.controller(&f.device).unwrap();
        controller.set_value("temp", PlcValue::Float(75.0));

        wait_until(|| {
            f.cache
                .get(&f.device, &TagId::from("temp"))
                .map(|v| v.value == Some(PlcValue::Float(75.0)))
                .unwrap_or(false)
        })
        .await;

        f.scheduler.shutdown().await;
        f.manager.shutdown().await;
    }
}
