//! Reconnect backoff.

use plcbroker_core::config::BackoffConfig;
use std::time::Duration;

/// Configuration for reconnect backoff.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Initial backoff duration
    pub initial_backoff: Duration,
    /// Maximum backoff duration
    pub max_backoff: Duration,
    /// Backoff multiplier (for exponential backoff)
    pub backoff_multiplier: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            backoff_multiplier: 2.0,
        }
    }
}

impl From<&BackoffConfig> for ReconnectConfig {
    fn from(config: &BackoffConfig) -> Self {
        Self {
            initial_backoff: Duration::from_millis(config.initial_ms),
            max_backoff: Duration::from_millis(config.max_ms),
            backoff_multiplier: config.multiplier,
        }
    }
}

/// Calculate the delay before reconnect attempt number `attempt` (zero based).
pub fn calculate_backoff(attempt: u32, config: &ReconnectConfig) -> Duration {
    let exponent = attempt.min(i32::MAX as u32) as i32;
    let backoff_secs =
        config.initial_backoff.as_secs_f64() * config.backoff_multiplier.powi(exponent);
    let capped_secs = backoff_secs.min(config.max_backoff.as_secs_f64());
    Duration::from_secs_f64(capped_secs)
}
