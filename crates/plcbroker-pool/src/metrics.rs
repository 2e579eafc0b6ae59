//! Metrics Collection
//!
//! Counters for polling, writes and reconnects, kept both as in-process
//! atomics (for the `/health` summary) and as `metrics` counters for the
//! Prometheus exporter.

use metrics::{counter, describe_counter};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Broker metrics collector
#[derive(Debug)]
pub struct BrokerMetrics {
    polls: AtomicU64,
    poll_errors: AtomicU64,
    writes_ok: AtomicU64,
    writes_failed: AtomicU64,
    reconnects: AtomicU64,
    start_time: Instant,
}

impl BrokerMetrics {
    pub fn new() -> Self {
        describe_counter!("plc_polls_total", "Total successful poll cycles");
        describe_counter!("plc_poll_errors_total", "Total failed poll cycles");
        describe_counter!("plc_writes_total", "Total write requests by outcome");
        describe_counter!(
            "plc_reconnects_total",
            "Total successful reconnects after a lost or failed session"
        );
        describe_counter!(
            "plc_sink_dropped_total",
            "Total tag updates dropped because the archive channel was full"
        );

        Self {
            polls: AtomicU64::new(0),
            poll_errors: AtomicU64::new(0),
            writes_ok: AtomicU64::new(0),
            writes_failed: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn record_poll(&self, device: &str) {
        self.polls.fetch_add(1, Ordering::Relaxed);
        counter!("plc_polls_total", "device" => device.to_string()).increment(1);
    }

    pub fn record_poll_error(&self, device: &str) {
        self.poll_errors.fetch_add(1, Ordering::Relaxed);
        counter!("plc_poll_errors_total", "device" => device.to_string()).increment(1);
    }

    /// Record the outcome of a write request; `outcome` is `ok` or an error
    /// code.
    pub fn record_write(&self, device: &str, outcome: &'static str) {
        if outcome == "ok" {
            self.writes_ok.fetch_add(1, Ordering::Relaxed);
        } else {
            self.writes_failed.fetch_add(1, Ordering::Relaxed);
        }
        counter!(
            "plc_writes_total",
            "device" => device.to_string(),
            "outcome" => outcome
        )
        .increment(1);
    }

    pub fn record_reconnect(&self, device: &str) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
        counter!("plc_reconnects_total", "device" => device.to_string()).increment(1);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime_secs: self.start_time.elapsed().as_secs(),
            polls: self.polls.load(Ordering::Relaxed),
            poll_errors: self.poll_errors.load(Ordering::Relaxed),
            writes_ok: self.writes_ok.load(Ordering::Relaxed),
            writes_failed: self.writes_failed.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
        }
    }
}

impl Default for BrokerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of the broker counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub uptime_secs: u64,
    pub polls: u64,
    pub poll_errors: u64,
    pub writes_ok: u64,
    pub writes_failed: u64,
    pub reconnects: u64,
}

/// Install the Prometheus recorder as the global metrics recorder.
///
/// The returned handle renders the text exposition format; the API serves it
/// at `/metrics`.
pub fn install_prometheus() -> anyhow::Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    info!("Prometheus metrics recorder installed");
    Ok(handle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broker_metrics() {
        let metrics = BrokerMetrics::new();
        metrics.record_poll("press1");
        metrics.record_poll("press1");
        metrics.record_poll_error("press1");
        metrics.record_write("press1", "ok");
        metrics.record_write("press1", "timeout");
        metrics.record_write("press1", "backpressure");
        metrics.record_reconnect("press1");

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.polls, 2);
        assert_eq!(snapshot.poll_errors, 1);
        assert_eq!(snapshot.writes_ok, 1);
        assert_eq!(snapshot.writes_failed, 2);
        assert_eq!(snapshot.reconnects, 1);
    }
}
