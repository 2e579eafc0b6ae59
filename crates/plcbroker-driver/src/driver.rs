use async_trait::async_trait;
use plcbroker_core::config::DeviceConfig;
use plcbroker_core::{DriverError, PlcValue, TagId};
use std::collections::HashMap;
use std::sync::Arc;

/// Async trait for controller drivers.
///
/// A driver instance is one session. It is owned by exactly one task, which
/// serializes every call, so implementations need not be `Sync`.
#[async_trait]
pub trait PlcDriver: Send {
    /// Establish the session with the controller.
    async fn connect(&mut self) -> Result<(), DriverError>;

    /// Close the session and release its resources.
    async fn disconnect(&mut self) -> Result<(), DriverError>;

    /// Whether [`read_tags`](PlcDriver::read_tags) reads many tags in one
    /// request.
    fn supports_batch(&self) -> bool {
        false
    }

    /// Read several tags in one request, returning values in request order.
    async fn read_tags(&mut self, tags: &[TagId]) -> Result<Vec<PlcValue>, DriverError> {
        let _ = tags;
        Err(DriverError::Unsupported {
            operation: "read_tags".to_string(),
        })
    }

    /// Read a single tag.
    async fn read_tag(&mut self, tag: &TagId) -> Result<PlcValue, DriverError>;

    /// Write a single tag, returning once the controller has acknowledged it.
    async fn write_tag(&mut self, tag: &TagId, value: &PlcValue) -> Result<(), DriverError>;

    /// Check if the session is currently connected.
    fn is_connected(&self) -> bool;
}

/// Creates drivers for a controller family.
pub trait DriverFactory: Send + Sync {
    /// Create a fresh, unconnected driver for `device`.
    fn create(&self, device: &DeviceConfig) -> Result<Box<dyn PlcDriver>, DriverError>;
}

/// Driver factories keyed by the `driver` kind used in device configuration.
#[derive(Default, Clone)]
pub struct DriverRegistry {
    factories: HashMap<String, Arc<dyn DriverFactory>>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory, replacing any previous one of the same kind.
    pub fn register(&mut self, kind: impl Into<String>, factory: Arc<dyn DriverFactory>) {
        self.factories.insert(kind.into(), factory);
    }

    pub fn get(&self, kind: &str) -> Option<Arc<dyn DriverFactory>> {
        self.factories.get(kind).cloned()
    }

    /// Registered kinds, sorted.
    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<_> = self.factories.keys().cloned().collect();
        kinds.sort();
        kinds
    }
}

impl std::fmt::Debug for DriverRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct SingleReadDriver {
        connected: bool,
    }

    #[async_trait]
    impl PlcDriver for SingleReadDriver {
        async fn connect(&mut self) -> Result<(), DriverError> {
            self.connected = true;
            Ok(())
        }

        async fn disconnect(&mut self) -> Result<(), DriverError> {
            self.connected = false;
            Ok(())
        }

        async fn read_tag(&mut self, _tag: &TagId) -> Result<PlcValue, DriverError> {
            Ok(PlcValue::Int(1))
        }

        async fn write_tag(&mut self, _tag: &TagId, _value: &PlcValue) -> Result<(), DriverError> {
            Ok(())
        }

        fn is_connected(&self) -> bool {
            self.connected
        }
    }

    struct SingleReadFactory;

    impl DriverFactory for SingleReadFactory {
        fn create(&self, _device: &DeviceConfig) -> Result<Box<dyn PlcDriver>, DriverError> {
            Ok(Box::new(SingleReadDriver { connected: false }))
        }
    }

    #[tokio::test]
    async fn test_batch_read_unsupported_by_default() {
        let mut driver = SingleReadDriver { connected: false };
        assert!(!driver.supports_batch());

        let err = driver.read_tags(&[TagId::from("temp")]).await.unwrap_err();
        assert!(matches!(err, DriverError::Unsupported { .. }));
    }

    #[tokio::test]
    async fn test_registry_lookup() {
        let mut registry = DriverRegistry::new();
        registry.register("single", Arc::new(SingleReadFactory));

        assert!(registry.get("modbus").is_none());
        assert_eq!(registry.kinds(), vec!["single".to_string()]);

        let factory = registry.get("single").unwrap();
        let mut driver = factory
            .create(&DeviceConfig::new("press1", "127.0.0.1"))
            .unwrap();
        driver.connect().await.unwrap();
        assert!(driver.is_connected());
    }
}
