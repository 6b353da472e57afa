//! Driver Factory and Component Types
//!
//! Drivers implement [`DriverFactory`] and are registered with a
//! [`FactoryRegistry`] by the composition root:
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │            Composition Root (main.rs)        │
//! │  registry.register_factory(C867Factory);     │
//! └──────────────────────────────────────────────┘
//!                        │
//!                        ▼
//! ┌──────────────────────────────────────────────┐
//! │              DriverFactory::build()          │
//! │  Parses TOML config, connects, returns the   │
//! │  per-axis capability objects                 │
//! └──────────────────────────────────────────────┘
//! ```

use crate::capabilities::{Homeable, MacroRunner, Movable};
use crate::error::StageError;
use anyhow::Result;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

// =============================================================================
// Capability Enum (Runtime Introspection)
// =============================================================================

/// Runtime capability flags for device introspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Corresponds to [`crate::capabilities::Movable`]
    Movable,
    /// Corresponds to [`crate::capabilities::Homeable`]
    Homeable,
    /// Corresponds to [`crate::capabilities::MacroRunner`]
    MacroRunner,
}

impl Capability {
    /// Human-readable name
    pub fn name(&self) -> &'static str {
        match self {
            Self::Movable => "Movable",
            Self::Homeable => "Homeable",
            Self::MacroRunner => "Macro Runner",
        }
    }
}

// =============================================================================
// Device Components (Capability Bag)
// =============================================================================

/// One axis of a multi-axis device.
pub struct AxisComponents {
    /// Controller axis identifier (e.g. "1")
    pub id: String,
    pub movable: Arc<dyn Movable>,
    pub homeable: Option<Arc<dyn Homeable>>,
}

/// Container for capability trait objects returned by drivers.
#[derive(Default)]
pub struct DeviceComponents {
    /// Per-axis motion objects, in controller axis order
    pub axes: Vec<AxisComponents>,

    /// Device-wide macro execution
    pub macro_runner: Option<Arc<dyn MacroRunner>>,
}

impl DeviceComponents {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get list of capabilities this device supports
    pub fn capabilities(&self) -> Vec<Capability> {
        let mut caps = Vec::new();

        if !self.axes.is_empty() {
            caps.push(Capability::Movable);
        }
        if self.axes.iter().any(|a| a.homeable.is_some()) {
            caps.push(Capability::Homeable);
        }
        if self.macro_runner.is_some() {
            caps.push(Capability::MacroRunner);
        }

        caps
    }

    /// Add an axis
    pub fn with_axis(mut self, axis: AxisComponents) -> Self {
        self.axes.push(axis);
        self
    }

    /// Set MacroRunner implementation
    pub fn with_macro_runner(mut self, m: Arc<dyn MacroRunner>) -> Self {
        self.macro_runner = Some(m);
        self
    }

    /// Look up an axis by identifier.
    pub fn axis(&self, id: &str) -> Option<&AxisComponents> {
        self.axes.iter().find(|a| a.id == id)
    }
}

// =============================================================================
// Driver Factory Trait
// =============================================================================

/// Builds connected drivers from TOML configuration.
pub trait DriverFactory: Send + Sync {
    /// Config key selecting this driver (e.g. "c867")
    fn driver_type(&self) -> &'static str;

    /// Human-readable name
    fn name(&self) -> &'static str;

    /// Capabilities every built device exposes
    fn capabilities(&self) -> &'static [Capability];

    /// Check the config without touching hardware.
    fn validate(&self, config: &toml::Value) -> Result<()>;

    /// Connect and return the device's capability objects.
    fn build(&self, config: toml::Value) -> BoxFuture<'static, Result<DeviceComponents>>;
}

/// Lookup table from driver type to factory.
#[derive(Default)]
pub struct FactoryRegistry {
    factories: HashMap<&'static str, Box<dyn DriverFactory>>,
}

impl FactoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_factory(&mut self, factory: Box<dyn DriverFactory>) {
        tracing::debug!(driver_type = factory.driver_type(), "Registered driver factory");
        self.factories.insert(factory.driver_type(), factory);
    }

    pub fn get(&self, driver_type: &str) -> Option<&dyn DriverFactory> {
        self.factories.get(driver_type).map(|f| f.as_ref())
    }

    pub fn driver_types(&self) -> Vec<&'static str> {
        let mut types: Vec<_> = self.factories.keys().copied().collect();
        types.sort_unstable();
        types
    }

    /// Validate then build a device of the given type.
    pub async fn build(&self, driver_type: &str, config: toml::Value) -> Result<DeviceComponents> {
        let factory = self
            .get(driver_type)
            .ok_or_else(|| StageError::UnknownDriver(driver_type.to_string()))?;
        factory.validate(&config)?;
        factory.build(config).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullFactory;

    impl DriverFactory for NullFactory {
        fn driver_type(&self) -> &'static str {
            "null"
        }

        fn name(&self) -> &'static str {
            "Null Device"
        }

        fn capabilities(&self) -> &'static [Capability] {
            &[]
        }

        fn validate(&self, _config: &toml::Value) -> Result<()> {
            Ok(())
        }

        fn build(&self, _config: toml::Value) -> BoxFuture<'static, Result<DeviceComponents>> {
            Box::pin(async { Ok(DeviceComponents::new()) })
        }
    }

    #[test]
    fn test_capability_name() {
        assert_eq!(Capability::Movable.name(), "Movable");
        assert_eq!(Capability::MacroRunner.name(), "Macro Runner");
    }

    #[test]
    fn test_device_components_capabilities() {
        let empty = DeviceComponents::new();
        assert!(empty.capabilities().is_empty());
        assert!(empty.axis("1").is_none());
    }

    #[test]
    fn test_capability_serde() {
        let json = serde_json::to_string(&Capability::MacroRunner).unwrap();
        assert_eq!(json, "\"macro_runner\"");

        let cap: Capability = serde_json::from_str("\"homeable\"").unwrap();
        assert_eq!(cap, Capability::Homeable);
    }

    #[tokio::test]
    async fn test_registry_builds_registered_type() {
        let mut registry = FactoryRegistry::new();
        registry.register_factory(Box::new(NullFactory));
        assert_eq!(registry.driver_types(), vec!["null"]);

        let components = registry
            .build("null", toml::Value::Table(Default::default()))
            .await
            .unwrap();
        assert!(components.axes.is_empty());
    }

    #[tokio::test]
    async fn test_registry_rejects_unknown_type() {
        let registry = FactoryRegistry::new();
        let err = registry
            .build("esp300", toml::Value::Table(Default::default()))
            .await
            .err()
            .unwrap();
        assert!(err.to_string().contains("Unknown driver type 'esp300'"));
    }
}
