//! Archive sinks
//!
//! Every polled value and acknowledged write is published to an
//! [`ArchiveSink`]. Publishing is fire-and-forget: a sink must never block
//! the poller or a write worker, so the channel sink drops updates when its
//! buffer is full and counts them.

use flume::{Receiver, Sender, TrySendError};
use metrics::counter;
use plcbroker_core::TagUpdate;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Write-only consumer of tag updates.
pub trait ArchiveSink: Send + Sync {
    /// Hand off an update. Must not block.
    fn publish(&self, update: TagUpdate);
}

/// Logs every update at debug level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl ArchiveSink for TracingSink {
    fn publish(&self, update: TagUpdate) {
        debug!(
            device = %update.device,
            tag = %update.tag,
            value = %update.value,
            source = ?update.source,
            "Tag update"
        );
    }
}

/// Buffers updates in a bounded channel, dropping new ones when full.
#[derive(Debug)]
pub struct ChannelSink {
    tx: Sender<TagUpdate>,
    dropped: AtomicU64,
}

impl ChannelSink {
    /// Create a sink and the receiving end a consumer drains.
    pub fn new(capacity: usize) -> (Self, Receiver<TagUpdate>) {
        let (tx, rx) = flume::bounded(capacity);
        (
            Self {
                tx,
                dropped: AtomicU64::new(0),
            },
            rx,
        )
    }

    /// Updates dropped because the buffer was full or the consumer was gone.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl ArchiveSink for ChannelSink {
    fn publish(&self, update: TagUpdate) {
        match self.tx.try_send(update) {
            Ok(()) => {}
            Err(TrySendError::Full(update)) => {
                let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                counter!("plc_sink_dropped_total").increment(1);
                // Warn on the first drop and every thousandth after
                if total % 1000 == 1 {
                    warn!(
                        device = %update.device,
                        tag = %update.tag,
                        dropped = total,
                        "Archive channel full, dropping tag update"
                    );
                }
            }
            Err(TrySendError::Disconnected(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                counter!("plc_sink_dropped_total").increment(1);
            }
        }
    }
}

/// Append updates from `rx` to `path` as JSON lines until `cancel` fires,
/// then flush whatever is still buffered.
pub fn spawn_jsonl_writer(
    path: PathBuf,
    rx: Receiver<TagUpdate>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                error!(path = %parent.display(), error = %e, "Failed to create archive directory");
                return;
            }
        }

        let mut file = match OpenOptions::new().create(true).append(true).open(&path).await {
            Ok(file) => file,
            Err(e) => {
                error!(path = %path.display(), error = %e, "Failed to open archive file");
                return;
            }
        };
        info!(path = %path.display(), "Archive writer started");

        loop {
            let update = tokio::select! {
                _ = cancel.cancelled() => break,
                update = rx.recv_async() => match update {
                    Ok(update) => update,
                    Err(_) => break,
                },
            };
            write_line(&mut file, &update).await;
        }

        for update in rx.drain() {
            write_line(&mut file, &update).await;
        }
        if let Err(e) = file.flush().await {
            warn!(error = %e, "Failed to flush archive file");
        }
        info!(path = %path.display(), "Archive writer stopped");
    })
}

async fn write_line(file: &mut tokio::fs::File, update: &TagUpdate) {
    let mut line = match serde_json::to_string(update) {
        Ok(line) => line,
        Err(e) => {
            warn!(error = %e, "Failed to serialize tag update");
            return;
        }
    };
    line.push('\n');
    if let Err(e) = file.write_all(line.as_bytes()).await {
        warn!(error = %e, "Failed to write tag update");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use plcbroker_core::{PlcValue, UpdateSource};

    fn update(value: f64) -> TagUpdate {
        TagUpdate {
            device: "press1".into(),
            tag: "temp".into(),
            value: PlcValue::Float(value),
            timestamp: Utc::now(),
            source: UpdateSource::Poll,
        }
    }

    #[test]
    fn test_channel_sink_drops_when_full() {
        let (sink, rx) = ChannelSink::new(2);
        sink.publish(update(1.0));
        sink.publish(update(2.0));
        sink.publish(update(3.0));

        assert_eq!(sink.dropped(), 1);
        assert_eq!(rx.len(), 2);
        assert_eq!(rx.try_recv().unwrap().value, PlcValue::Float(1.0));
    }

    #[tokio::test]
    async fn test_jsonl_writer() {
        let path = std::env::temp_dir()
            .join(format!("plcbroker-{}", uuid::Uuid::new_v4()))
            .join("updates.jsonl");
        let (sink, rx) = ChannelSink::new(16);
        let cancel = CancellationToken::new();
        let task = spawn_jsonl_writer(path.clone(), rx, cancel.clone());

        sink.publish(update(72.5));
        sink.publish(update(73.0));
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        cancel.cancel();
        task.await.unwrap();

        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        let lines: Vec<TagUpdate> = contents
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].value, PlcValue::Float(72.5));
        assert_eq!(lines[1].source, UpdateSource::Poll);

        let _ = tokio::fs::remove_dir_all(path.parent().unwrap()).await;
    }
}
