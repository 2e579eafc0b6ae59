//! Broker
//!
//! Wires the connection manager, tag cache, poll scheduler and write
//! coordinator together and owns their lifecycle.

use parking_lot::Mutex;
use plcbroker_core::config::AppConfig;
use plcbroker_core::{Result, TagUpdate};
use plcbroker_driver::DriverRegistry;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::cache::TagCache;
use crate::connection::{join_tasks, DeviceConnectionManager};
use crate::health::HealthRegistry;
use crate::metrics::BrokerMetrics;
use crate::poller::PollScheduler;
use crate::sink::{spawn_jsonl_writer, ArchiveSink, ChannelSink, TracingSink};
use crate::writer::WriteCoordinator;

/// JSON-lines archive waiting to be started.
struct PendingArchive {
    path: PathBuf,
    rx: flume::Receiver<TagUpdate>,
}

/// The running broker.
pub struct Broker {
    config: Arc<AppConfig>,
    health: Arc<HealthRegistry>,
    metrics: Arc<BrokerMetrics>,
    manager: Arc<DeviceConnectionManager>,
    cache: Arc<TagCache>,
    writer: Arc<WriteCoordinator>,
    poller: PollScheduler,
    archive: Mutex<Option<PendingArchive>>,
    archive_cancel: CancellationToken,
    archive_task: Mutex<Option<JoinHandle<()>>>,
    started: AtomicBool,
}

impl Broker {
    /// Validate `config` and build the broker. Updates go to the JSON-lines
    /// archive when it is enabled, otherwise to the log.
    pub fn new(config: AppConfig, drivers: &DriverRegistry) -> Result<Self> {
        if config.archive.enabled {
            let (sink, rx) = ChannelSink::new(config.archive.channel_capacity);
            let pending = PendingArchive {
                path: config.archive.path.clone(),
                rx,
            };
            let broker = Self::with_sink(config, drivers, Arc::new(sink))?;
            *broker.archive.lock() = Some(pending);
            Ok(broker)
        } else {
            Self::with_sink(config, drivers, Arc::new(TracingSink))
        }
    }

    /// Build the broker publishing updates to a caller-supplied sink.
    pub fn with_sink(
        config: AppConfig,
        drivers: &DriverRegistry,
        sink: Arc<dyn ArchiveSink>,
    ) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);

        let health = Arc::new(HealthRegistry::new(
            config.devices.iter().map(|d| d.id.clone()),
        ));
        let metrics = Arc::new(BrokerMetrics::new());
        let manager = Arc::new(DeviceConnectionManager::new(
            &config,
            drivers,
            Arc::clone(&health),
            Arc::clone(&metrics),
        )?);
        let cache = Arc::new(TagCache::new(&config, Arc::clone(&health)));
        let writer = Arc::new(WriteCoordinator::new(
            &config,
            Arc::clone(&manager),
            Arc::clone(&cache),
            Arc::clone(&sink),
            Arc::clone(&metrics),
        ));
        let poller = PollScheduler::new(
            &config,
            Arc::clone(&manager),
            Arc::clone(&cache),
            sink,
            Arc::clone(&metrics),
        );

        Ok(Self {
            config,
            health,
            metrics,
            manager,
            cache,
            writer,
            poller,
            archive: Mutex::new(None),
            archive_cancel: CancellationToken::new(),
            archive_task: Mutex::new(None),
            started: AtomicBool::new(false),
        })
    }

    /// Start connecting, polling and accepting writes. Must be called from
    /// within a Tokio runtime; subsequent calls have no effect.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Some(archive) = self.archive.lock().take() {
            let task = spawn_jsonl_writer(archive.path, archive.rx, self.archive_cancel.clone());
            *self.archive_task.lock() = Some(task);
        }

        self.manager.start();
        self.writer.start();
        self.poller.start();

        info!(
            devices = self.config.enabled_devices().len(),
            tags = self.cache.len(),
            "Broker started"
        );
    }

    /// Stop polling, fail outstanding writes, close every session and flush
    /// the archive.
    pub async fn shutdown(&self) {
        info!("Shutting down broker");
        self.poller.shutdown().await;
        self.writer.shutdown().await;
        self.manager.shutdown().await;

        self.archive_cancel.cancel();
        let task = self.archive_task.lock().take();
        if let Some(task) = task {
            join_tasks("archive writer", vec![task]).await;
        }
        info!("Broker stopped");
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<TagCache> {
        &self.cache
    }

    pub fn writer(&self) -> &Arc<WriteCoordinator> {
        &self.writer
    }

    pub fn manager(&self) -> &Arc<DeviceConnectionManager> {
        &self.manager
    }

    pub fn health(&self) -> &Arc<HealthRegistry> {
        &self.health
    }

    pub fn metrics(&self) -> &Arc<BrokerMetrics> {
        &self.metrics
    }
}
