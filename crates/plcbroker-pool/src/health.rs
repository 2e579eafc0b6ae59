//! Device Health
//!
//! Tracks the explicit health state machine of every configured device:
//!
//! ```text
//! Disconnected -> Connecting -> Healthy <-> Degraded
//! ```
//!
//! Each device's status lives in a `watch` channel so a session task can
//! react the moment something else degrades its device, and every reader
//! gets a consistent snapshot without locking.

use chrono::Utc;
use plcbroker_core::{DeviceId, DeviceState, DeviceStatus};
use std::collections::HashMap;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Health state of all configured devices.
#[derive(Debug)]
pub struct HealthRegistry {
    devices: HashMap<DeviceId, watch::Sender<DeviceStatus>>,
    order: Vec<DeviceId>,
}

impl HealthRegistry {
    /// Create a registry with every device `Disconnected`.
    pub fn new(devices: impl IntoIterator<Item = DeviceId>) -> Self {
        let mut map = HashMap::new();
        let mut order = Vec::new();
        for id in devices {
            if map.contains_key(&id) {
                continue;
            }
            let (tx, _rx) = watch::channel(DeviceStatus::new());
            map.insert(id.clone(), tx);
            order.push(id);
        }
        Self {
            devices: map,
            order,
        }
    }

    pub fn status(&self, device: &DeviceId) -> Option<DeviceStatus> {
        self.devices.get(device).map(|tx| tx.borrow().clone())
    }

    pub fn state(&self, device: &DeviceId) -> Option<DeviceState> {
        self.devices.get(device).map(|tx| tx.borrow().state)
    }

    pub fn is_healthy(&self, device: &DeviceId) -> bool {
        self.state(device).is_some_and(|s| s.is_healthy())
    }

    /// Statuses of all devices in configuration order.
    pub fn snapshot(&self) -> Vec<(DeviceId, DeviceStatus)> {
        self.order
            .iter()
            .filter_map(|id| self.status(id).map(|s| (id.clone(), s)))
            .collect()
    }

    /// Watch a device's status.
    pub fn subscribe(&self, device: &DeviceId) -> Option<watch::Receiver<DeviceStatus>> {
        self.devices.get(device).map(|tx| tx.subscribe())
    }

    /// Move to `next` if the state machine allows it, applying `update` on
    /// success. Returns true if the state changed.
    fn transition(
        &self,
        device: &DeviceId,
        next: DeviceState,
        update: impl FnOnce(&mut DeviceStatus),
    ) -> bool {
        let Some(tx) = self.devices.get(device) else {
            return false;
        };

        tx.send_if_modified(|status| {
            if status.state == next || !status.state.can_transition_to(next) {
                return false;
            }
            debug!(device = %device, from = %status.state, to = %next, "Device state transition");
            status.state = next;
            status.last_transition = Utc::now();
            update(status);
            true
        })
    }

    /// First connection attempt started. Only valid from `Disconnected`.
    pub fn mark_connecting(&self, device: &DeviceId) -> bool {
        self.transition(device, DeviceState::Connecting, |_| {})
    }

    /// Session established; resets the backoff counter.
    pub fn mark_healthy(&self, device: &DeviceId) -> bool {
        let changed = self.transition(device, DeviceState::Healthy, |status| {
            status.backoff_attempts = 0;
            status.last_success = Some(Utc::now());
        });
        if changed {
            info!(device = %device, "Device healthy");
        }
        changed
    }

    /// Session lost or could not be established.
    ///
    /// The error is recorded even when the device is already degraded.
    /// Returns true if the device was healthy (or connecting) before.
    pub fn mark_degraded(&self, device: &DeviceId, error: &str) -> bool {
        let changed = self.transition(device, DeviceState::Degraded, |status| {
            status.last_error = Some(error.to_string());
        });
        if changed {
            warn!(device = %device, error = %error, "Device degraded");
        } else {
            self.record_error(device, error);
        }
        changed
    }

    /// Session closed on shutdown.
    pub fn mark_disconnected(&self, device: &DeviceId) -> bool {
        self.transition(device, DeviceState::Disconnected, |_| {})
    }

    /// Record an error without changing state.
    pub fn record_error(&self, device: &DeviceId, error: &str) {
        if let Some(tx) = self.devices.get(device) {
            tx.send_if_modified(|status| {
                status.last_error = Some(error.to_string());
                false
            });
        }
    }

    /// Record a successful operation without changing state.
    pub fn record_success(&self, device: &DeviceId) {
        if let Some(tx) = self.devices.get(device) {
            tx.send_if_modified(|status| {
                status.last_success = Some(Utc::now());
                false
            });
        }
    }

    /// Record the number of consecutive failed connection attempts.
    pub fn set_backoff_attempts(&self, device: &DeviceId, attempts: u32) {
        if let Some(tx) = self.devices.get(device) {
            tx.send_if_modified(|status| {
                status.backoff_attempts = attempts;
                false
            });
        }
    }
}
