//! Tag Cache
//!
//! Latest known value of every configured tag. Keys are fixed when the cache
//! is built; values are replaced by polls and acknowledged writes. Lookups
//! never touch a controller and staleness is computed at read time, so a
//! value goes stale on its own once it ages past the freshness window or its
//! device leaves `Healthy`.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use plcbroker_core::config::{AppConfig, TagConfig};
use plcbroker_core::{BrokerError, DeviceId, PlcValue, TagId, TagValue};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::health::HealthRegistry;

#[derive(Debug, Clone, Default)]
struct CacheEntry {
    value: Option<PlcValue>,
    timestamp: Option<DateTime<Utc>>,
    /// Set when a write timed out and the real value is unknown
    forced_stale: bool,
}

#[derive(Debug)]
struct DeviceLayout {
    tags: Vec<TagConfig>,
    tag_ids: Arc<[TagId]>,
    freshness: chrono::Duration,
}

/// Concurrent map of (device, tag) to the last known value.
#[derive(Debug)]
pub struct TagCache {
    entries: DashMap<(DeviceId, TagId), CacheEntry>,
    layouts: HashMap<DeviceId, DeviceLayout>,
    health: Arc<HealthRegistry>,
}

impl TagCache {
    /// Build the cache with one empty entry per configured tag.
    pub fn new(config: &AppConfig, health: Arc<HealthRegistry>) -> Self {
        let entries = DashMap::new();
        let mut layouts = HashMap::new();

        for device in &config.devices {
            for tag in &device.tags {
                entries.insert((device.id.clone(), tag.name.clone()), CacheEntry::default());
            }

            let freshness = config.freshness_window(device);
            layouts.insert(
                device.id.clone(),
                DeviceLayout {
                    tags: device.tags.clone(),
                    tag_ids: device.tags.iter().map(|t| t.name.clone()).collect(),
                    freshness: chrono::Duration::from_std(freshness)
                        .unwrap_or_else(|_| chrono::Duration::weeks(52 * 100)),
                },
            );
        }

        Self {
            entries,
            layouts,
            health,
        }
    }

    /// Last known value of a tag. Never blocks on I/O.
    pub fn get(&self, device: &DeviceId, tag: &TagId) -> Result<TagValue, BrokerError> {
        let layout = self
            .layouts
            .get(device)
            .ok_or_else(|| BrokerError::device_not_found(device))?;
        let healthy = self.health.is_healthy(device);

        self.read_entry(device, tag, layout, healthy, Utc::now())
            .ok_or_else(|| BrokerError::tag_not_found(device, tag))
    }

    /// All tags of a device in configuration order.
    pub fn get_device(&self, device: &DeviceId) -> Result<Vec<TagValue>, BrokerError> {
        let layout = self
            .layouts
            .get(device)
            .ok_or_else(|| BrokerError::device_not_found(device))?;
        let healthy = self.health.is_healthy(device);
        let now = Utc::now();

        Ok(layout
            .tag_ids
            .iter()
            .filter_map(|tag| self.read_entry(device, tag, layout, healthy, now))
            .collect())
    }

    fn read_entry(
        &self,
        device: &DeviceId,
        tag: &TagId,
        layout: &DeviceLayout,
        healthy: bool,
        now: DateTime<Utc>,
    ) -> Option<TagValue> {
        let key = (device.clone(), tag.clone());
        let entry = self.entries.get(&key)?;

        let aged_out = match entry.timestamp {
            Some(ts) => now.signed_duration_since(ts) > layout.freshness,
            None => true,
        };
        let stale = entry.forced_stale || entry.value.is_none() || aged_out || !healthy;

        Some(TagValue {
            device: device.clone(),
            tag: tag.clone(),
            value: entry.value.clone(),
            timestamp: entry.timestamp,
            stale,
        })
    }

    /// Store a value read from (or acknowledged by) the controller.
    ///
    /// Ignored if an equal-or-newer value is already cached, so timestamps
    /// never go backwards. Returns true if the value was stored.
    pub fn put(
        &self,
        device: &DeviceId,
        tag: &TagId,
        value: PlcValue,
        timestamp: DateTime<Utc>,
    ) -> bool {
        let key = (device.clone(), tag.clone());
        let Some(mut entry) = self.entries.get_mut(&key) else {
            debug!(device = %device, tag = %tag, "Ignoring value for unconfigured tag");
            return false;
        };

        if entry.timestamp.is_some_and(|current| timestamp < current) {
            debug!(device = %device, tag = %tag, "Ignoring out-of-order value");
            return false;
        }

        entry.value = Some(value);
        entry.timestamp = Some(timestamp);
        entry.forced_stale = false;
        true
    }

    /// Record a value the controller just acknowledged writing. It is served
    /// until the next poll replaces it.
    pub fn apply_write(
        &self,
        device: &DeviceId,
        tag: &TagId,
        value: PlcValue,
        applied_at: DateTime<Utc>,
    ) -> bool {
        let stored = self.put(device, tag, value, applied_at);
        if !stored {
            debug!(device = %device, tag = %tag, "Write superseded by a newer poll");
        }
        stored
    }

    /// Flag a value as untrustworthy until the next successful read.
    pub fn mark_stale(&self, device: &DeviceId, tag: &TagId) {
        let key = (device.clone(), tag.clone());
        if let Some(mut entry) = self.entries.get_mut(&key) {
            entry.forced_stale = true;
        }
    }

    pub fn tag_definition(&self, device: &DeviceId, tag: &TagId) -> Option<&TagConfig> {
        self.layouts
            .get(device)?
            .tags
            .iter()
            .find(|t| &t.name == tag)
    }

    /// Tag definitions of a device in configuration order.
    pub fn device_tags(&self, device: &DeviceId) -> Option<&[TagConfig]> {
        self.layouts.get(device).map(|l| l.tags.as_slice())
    }

    /// Tag ids of a device in configuration order.
    pub fn tag_ids(&self, device: &DeviceId) -> Option<Arc<[TagId]>> {
        self.layouts.get(device).map(|l| Arc::clone(&l.tag_ids))
    }

    pub fn freshness_window(&self, device: &DeviceId) -> Option<Duration> {
        self.layouts.get(device).and_then(|l| l.freshness.to_std().ok())
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}
