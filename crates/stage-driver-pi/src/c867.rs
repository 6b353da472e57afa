//! PI C-867.2U2 Two-Axis Piezo Motion Controller Driver
//!
//! Protocol Overview:
//! - Format: GCS ASCII over RS-232 / USB-CDC
//! - Baud: 115200, 8N1, no flow control
//! - Commands: `{MNEMONIC} {axis} {value}`, terminated by LF
//! - Example: "MOV 1 12.500000000" (axis 1, absolute move to 12.5 mm)
//! - Errors: not reported inline; read with `ERR?` after each command
//!
//! # Usage
//!
//! ```rust,ignore
//! use stage_driver_pi::C867Factory;
//! use stage_core::driver::DriverFactory;
//!
//! // Register the factory
//! registry.register_factory(Box::new(C867Factory));
//!
//! // Create via config
//! let config = toml::toml! {
//!     port = "/dev/ttyUSB0"
//!     axes = ["1", "2"]
//! };
//! let components = factory.build(config.into()).await?;
//! ```

use crate::axis::{AxisId, TravelLimits};
use crate::cache::Position;
use crate::codec::{Command, ParamValue};
use crate::engine::{CommandEngine, EngineTimeouts, PositionReading};
use crate::error::GcsResult;
use crate::homing::HomingState;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use stage_core::capabilities::{Homeable, MacroRunner, Movable};
use stage_core::driver::{AxisComponents, Capability, DeviceComponents, DriverFactory};
use stage_core::error::StageError;
use stage_core::serial::{open_serial_async, SerialTransport, Transport};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::instrument;

// =============================================================================
// C867Config
// =============================================================================

/// Configuration for the C-867 driver
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct C867Config {
    /// Serial port path (e.g., "/dev/ttyUSB0")
    pub port: String,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// Axes to drive, in controller order
    #[serde(default = "default_axes")]
    pub axes: Vec<AxisId>,
    /// Read deadline for ordinary replies
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Deadline for a reference move (or a reboot's startup macro) to finish
    #[serde(default = "default_home_timeout_secs")]
    pub home_timeout_secs: u64,
    /// How long to discard late bytes after a timeout
    #[serde(default = "default_resync_window_ms")]
    pub resync_window_ms: u64,
    /// Pause between reference-state polls while homing
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Per-axis travel limits replacing the controller's `TMN?`/`TMX?`
    #[serde(default)]
    pub limits: BTreeMap<String, TravelLimits>,
    /// Named raw command sequences
    #[serde(default)]
    pub macros: BTreeMap<String, Vec<String>>,
    /// Leave the joystick enabled after connecting
    #[serde(default = "default_true")]
    pub enable_joystick: bool,
    /// Refuse axes whose unit parameter is not millimeters
    #[serde(default = "default_true")]
    pub require_mm_units: bool,
    /// Treat every axis as referenced on connect (firmware startup macro
    /// already ran `FRF`)
    #[serde(default)]
    pub assume_homed: bool,
}

fn default_baud_rate() -> u32 {
    115_200
}

fn default_axes() -> Vec<AxisId> {
    ["1", "2"]
        .into_iter()
        .filter_map(|id| AxisId::parse(id).ok())
        .collect()
}

fn default_timeout_ms() -> u64 {
    5_000
}

fn default_home_timeout_secs() -> u64 {
    60
}

fn default_resync_window_ms() -> u64 {
    100
}

fn default_poll_interval_ms() -> u64 {
    100
}

fn default_true() -> bool {
    true
}

impl C867Config {
    /// Defaults for everything but the port.
    pub fn new(port: impl Into<String>) -> Self {
        Self {
            port: port.into(),
            baud_rate: default_baud_rate(),
            axes: default_axes(),
            timeout_ms: default_timeout_ms(),
            home_timeout_secs: default_home_timeout_secs(),
            resync_window_ms: default_resync_window_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            limits: BTreeMap::new(),
            macros: BTreeMap::new(),
            enable_joystick: true,
            require_mm_units: true,
            assume_homed: false,
        }
    }

    pub fn engine_timeouts(&self) -> EngineTimeouts {
        EngineTimeouts {
            command: Duration::from_millis(self.timeout_ms),
            home: Duration::from_secs(self.home_timeout_secs),
            resync_window: Duration::from_millis(self.resync_window_ms),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
        }
    }

    /// Check everything that can be checked without hardware.
    pub fn validate(&self) -> Result<()> {
        if self.axes.is_empty() {
            return Err(anyhow!("C-867 config must list at least one axis"));
        }
        let mut seen = BTreeSet::new();
        for axis in &self.axes {
            if !seen.insert(axis.as_str()) {
                return Err(anyhow!("C-867 axis '{}' listed twice", axis));
            }
        }
        if self.timeout_ms == 0 || self.home_timeout_secs == 0 || self.poll_interval_ms == 0 {
            return Err(anyhow!("C-867 timeouts must be positive"));
        }
        if self.baud_rate == 0 {
            return Err(anyhow!("C-867 baud rate must be positive"));
        }
        for (axis, limits) in &self.limits {
            if !seen.contains(axis.as_str()) {
                return Err(anyhow!("Limits given for unconfigured axis '{}'", axis));
            }
            if !limits.is_valid() {
                return Err(anyhow!(
                    "Invalid limits for axis '{}': [{}, {}]",
                    axis,
                    limits.min_mm,
                    limits.max_mm
                ));
            }
        }
        for (name, commands) in &self.macros {
            if name.trim().is_empty() {
                return Err(anyhow!("Macro names must not be empty"));
            }
            let broken = |c: &String| c.trim().is_empty() || c.trim().chars().any(char::is_control);
            if commands.iter().any(broken) {
                return Err(anyhow!(
                    "Macro '{}' contains an empty or multi-line command",
                    name
                ));
            }
        }
        Ok(())
    }
}

// =============================================================================
// C867Factory - DriverFactory implementation
// =============================================================================

/// Factory for creating C-867 driver instances.
pub struct C867Factory;

/// Static capabilities for the C-867
static C867_CAPABILITIES: &[Capability] = &[
    Capability::Movable,
    Capability::Homeable,
    Capability::MacroRunner,
];

impl DriverFactory for C867Factory {
    fn driver_type(&self) -> &'static str {
        "c867"
    }

    fn name(&self) -> &'static str {
        "PI C-867.2U2 Piezo Motion Controller"
    }

    fn capabilities(&self) -> &'static [Capability] {
        C867_CAPABILITIES
    }

    fn validate(&self, config: &toml::Value) -> Result<()> {
        let cfg: C867Config = config.clone().try_into().map_err(StageError::from)?;
        cfg.validate().map_err(|e| StageError::Configuration(format!("{e:#}")))?;
        Ok(())
    }

    fn build(&self, config: toml::Value) -> BoxFuture<'static, Result<DeviceComponents>> {
        Box::pin(async move {
            let cfg: C867Config = config.try_into().context("Invalid C-867 config")?;
            let driver = C867Driver::connect(&cfg).await?;
            Ok(driver.components())
        })
    }
}

// =============================================================================
// C867Driver
// =============================================================================

/// Driver for the PI C-867.2U2 controller.
///
/// All axes share one link. The command engine sits behind a single async
/// mutex, so concurrent callers (including [`C867Axis`] handles) run their
/// exchanges one at a time and cache updates are ordered with the commands
/// that produced them. Cloning is cheap and shares the connection.
///
/// Travel limits are mirrored outside the engine lock so the synchronous
/// [`Movable::limits`] can answer without I/O; `query_limits` refreshes the
/// mirror.
#[derive(Clone)]
pub struct C867Driver {
    engine: Arc<Mutex<CommandEngine>>,
    identity: Arc<str>,
    axes: Arc<[AxisId]>,
    limits: Arc<RwLock<BTreeMap<AxisId, TravelLimits>>>,
    macro_names: Arc<[String]>,
    enable_joystick: bool,
}

impl C867Driver {
    /// Open the configured serial port and run the connect sequence.
    ///
    /// # Errors
    /// Returns error if:
    /// - Serial port cannot be opened
    /// - Controller doesn't answer `*IDN?`
    /// - An axis reports non-millimeter units (unless disabled)
    pub async fn connect(config: &C867Config) -> Result<Self> {
        config.validate()?;

        let port = open_serial_async(&config.port, config.baud_rate, "PI C-867").await?;
        let mut transport = SerialTransport::new(Box::new(port));
        // Leftovers from a previous session would shift every reply by one
        transport
            .discard_pending(Duration::from_millis(config.resync_window_ms))
            .await;

        Self::connect_with_transport(Box::new(transport), config).await
    }

    /// Run the connect sequence over an already-open link.
    ///
    /// Identifies the controller, discovers unit, scale and travel limits of
    /// each axis, switches servo control on and sets the joystick as
    /// configured. Axes start `Unknown` unless `assume_homed` is set.
    pub async fn connect_with_transport(
        transport: Box<dyn Transport>,
        config: &C867Config,
    ) -> Result<Self> {
        config.validate()?;

        let mut engine = CommandEngine::new(transport, config.engine_timeouts())
            .with_macros(config.macros.clone());

        let identity = engine
            .identify()
            .await
            .context("C-867 did not answer identification query")?;

        let mut limits = BTreeMap::new();
        for id in &config.axes {
            let limits_override = config.limits.get(id.as_str()).copied();
            let axis = engine
                .discover_axis(id.clone(), limits_override, config.require_mm_units)
                .await
                .with_context(|| format!("Failed to read parameters of axis {}", id))?;
            limits.insert(axis.id, axis.limits);

            engine
                .set_servo(id.as_str(), true)
                .await
                .with_context(|| format!("Failed to enable servo on axis {}", id))?;
            engine
                .set_joystick(id.as_str(), config.enable_joystick)
                .await
                .with_context(|| format!("Failed to configure joystick on axis {}", id))?;

            if config.assume_homed {
                engine.mark_homed(id.as_str())?;
            }
        }

        tracing::info!(
            port = %config.port,
            identity = %identity,
            axes = config.axes.len(),
            "Connected to PI C-867"
        );

        Ok(Self {
            macro_names: engine.macro_names().into(),
            engine: Arc::new(Mutex::new(engine)),
            identity: identity.into(),
            axes: config.axes.clone().into(),
            limits: Arc::new(RwLock::new(limits)),
            enable_joystick: config.enable_joystick,
        })
    }

    /// Close the link. Other clones of this driver fail with
    /// `Disconnected` afterwards.
    pub async fn disconnect(self) -> GcsResult<()> {
        self.engine.lock().await.close().await?;
        tracing::info!("Disconnected from PI C-867");
        Ok(())
    }

    /// `*IDN?` reply captured at connect.
    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn axes(&self) -> &[AxisId] {
        &self.axes
    }

    /// Capability handle for one axis.
    pub fn axis(&self, id: &str) -> Option<C867Axis> {
        let id = self.axes.iter().find(|a| a.as_str() == id)?;
        Some(C867Axis {
            driver: self.clone(),
            id: id.clone(),
        })
    }

    /// Last known travel limits of an axis. No I/O.
    pub fn cached_limits(&self, axis: &str) -> Option<TravelLimits> {
        self.limits.read().get(axis).copied()
    }

    /// Package the driver for the factory registry.
    pub fn components(&self) -> DeviceComponents {
        let mut components = DeviceComponents::new();
        for id in self.axes.iter() {
            if let Some(axis) = self.axis(id.as_str()) {
                let axis = Arc::new(axis);
                components = components.with_axis(AxisComponents {
                    id: id.to_string(),
                    movable: axis.clone(),
                    homeable: Some(axis),
                });
            }
        }
        components.with_macro_runner(Arc::new(self.clone()))
    }

    // =========================================================================
    // Command surface
    // =========================================================================

    #[instrument(skip(self), fields(identity = %self.identity), err)]
    pub async fn home(&self, axis: &str) -> GcsResult<()> {
        self.engine.lock().await.home(axis).await
    }

    pub async fn mark_homed(&self, axis: &str) -> GcsResult<()> {
        self.engine.lock().await.mark_homed(axis)
    }

    pub async fn homing_state(&self, axis: &str) -> HomingState {
        self.engine.lock().await.state().homing().state(axis)
    }

    pub async fn move_mm(&self, axis: &str, target_mm: f64) -> GcsResult<()> {
        self.engine.lock().await.move_mm(axis, target_mm).await
    }

    pub async fn move_relative_mm(&self, axis: &str, delta_mm: f64) -> GcsResult<()> {
        self.engine
            .lock()
            .await
            .move_relative_mm(axis, delta_mm)
            .await
    }

    /// True position, or a travel limit while the axis is still moving.
    /// Never blocks waiting for motion to finish.
    pub async fn get_position_mm(&self, axis: &str) -> GcsResult<f64> {
        self.engine.lock().await.get_position_mm(axis).await
    }

    /// Like [`Self::get_position_mm`] but tells a busy report apart.
    pub async fn query_position(&self, axis: &str) -> GcsResult<PositionReading> {
        self.engine.lock().await.query_position(axis).await
    }

    /// Travel limits from the axis table. No I/O.
    pub async fn get_limits_mm(&self, axis: &str) -> GcsResult<(f64, f64)> {
        self.engine.lock().await.limits_mm(axis)
    }

    /// Cached positions. No I/O, possibly stale (see [`crate::cache`]).
    pub async fn cached_positions(&self) -> Position {
        self.engine.lock().await.positions()
    }

    pub async fn is_in_motion(&self, axis: &str) -> bool {
        self.engine.lock().await.state().is_in_motion(axis)
    }

    pub async fn last_command(&self) -> Option<Command> {
        self.engine.lock().await.state().last_command().cloned()
    }

    pub async fn execute_macro(&self, name: &str, commands: &[String]) -> GcsResult<Vec<String>> {
        self.engine.lock().await.execute_macro(name, commands).await
    }

    pub async fn run_named_macro(&self, name: &str) -> GcsResult<Vec<String>> {
        self.engine.lock().await.run_macro(name).await
    }

    pub async fn motion_status(&self) -> GcsResult<BTreeMap<AxisId, bool>> {
        self.engine.lock().await.motion_status().await
    }

    /// Re-read the controller's soft limits and use them from now on.
    pub async fn query_limits(&self, axis: &str) -> GcsResult<(f64, f64)> {
        let mut engine = self.engine.lock().await;
        let (min, max) = engine.query_limits(axis).await?;
        let id = engine.state().axis(axis)?.id.clone();
        self.limits.write().insert(id, TravelLimits::new(min, max));
        Ok((min, max))
    }

    pub async fn query_counts_per_mm(&self, axis: &str) -> GcsResult<f64> {
        self.engine.lock().await.query_counts_per_mm(axis).await
    }

    pub async fn set_velocity(&self, axis: &str, mm_per_s: f64) -> GcsResult<()> {
        self.engine.lock().await.set_velocity(axis, mm_per_s).await
    }

    pub async fn set_acceleration(&self, axis: &str, mm_per_s2: f64) -> GcsResult<()> {
        self.engine
            .lock()
            .await
            .set_acceleration(axis, mm_per_s2)
            .await
    }

    pub async fn set_deceleration(&self, axis: &str, mm_per_s2: f64) -> GcsResult<()> {
        self.engine
            .lock()
            .await
            .set_deceleration(axis, mm_per_s2)
            .await
    }

    pub async fn query_velocity(&self, axis: &str) -> GcsResult<f64> {
        self.engine.lock().await.query_velocity(axis).await
    }

    pub async fn query_acceleration(&self, axis: &str) -> GcsResult<f64> {
        self.engine.lock().await.query_acceleration(axis).await
    }

    pub async fn query_deceleration(&self, axis: &str) -> GcsResult<f64> {
        self.engine.lock().await.query_deceleration(axis).await
    }

    pub async fn set_settling_time_ms(&self, axis: &str, ms: f64) -> GcsResult<()> {
        self.engine.lock().await.set_settling_time_ms(axis, ms).await
    }

    pub async fn query_settling_time_ms(&self, axis: &str) -> GcsResult<f64> {
        self.engine.lock().await.query_settling_time_ms(axis).await
    }

    /// Returns the tolerance applied after rounding to encoder counts.
    pub async fn set_positional_tolerance_um(&self, axis: &str, um: f64) -> GcsResult<f64> {
        self.engine
            .lock()
            .await
            .set_positional_tolerance_um(axis, um)
            .await
    }

    pub async fn query_positional_tolerance_um(&self, axis: &str) -> GcsResult<f64> {
        self.engine
            .lock()
            .await
            .query_positional_tolerance_um(axis)
            .await
    }

    pub async fn get_parameter(&self, axis: &str, param: u32) -> GcsResult<String> {
        self.engine.lock().await.get_parameter(axis, param).await
    }

    pub async fn set_parameter(&self, axis: &str, param: u32, value: ParamValue) -> GcsResult<()> {
        self.engine
            .lock()
            .await
            .set_parameter(axis, param, value)
            .await
    }

    /// Reboot the controller and restore the connect-time servo and
    /// joystick settings. Every axis needs a new reference move afterwards
    /// unless the startup macro ran one and the caller confirms it.
    #[instrument(skip(self), fields(identity = %self.identity), err)]
    pub async fn reboot(&self, wait_for_startup: bool) -> GcsResult<()> {
        let mut engine = self.engine.lock().await;
        engine.reboot(wait_for_startup).await?;
        for id in self.axes.iter() {
            engine.set_servo(id.as_str(), true).await?;
            engine
                .set_joystick(id.as_str(), self.enable_joystick)
                .await?;
        }
        Ok(())
    }

    pub async fn set_servo(&self, axis: &str, enabled: bool) -> GcsResult<()> {
        self.engine.lock().await.set_servo(axis, enabled).await
    }

    pub async fn set_joystick(&self, axis: &str, enabled: bool) -> GcsResult<()> {
        self.engine.lock().await.set_joystick(axis, enabled).await
    }
}

#[async_trait]
impl MacroRunner for C867Driver {
    async fn run_macro(&self, name: &str) -> Result<Vec<String>> {
        Ok(self.run_named_macro(name).await?)
    }

    fn macro_names(&self) -> Vec<String> {
        self.macro_names.to_vec()
    }
}

// =============================================================================
// C867Axis
// =============================================================================

/// One axis of a [`C867Driver`], exposed through the capability traits.
#[derive(Clone)]
pub struct C867Axis {
    driver: C867Driver,
    id: AxisId,
}

impl C867Axis {
    pub fn id(&self) -> &AxisId {
        &self.id
    }
}

#[async_trait]
impl Movable for C867Axis {
    async fn move_abs(&self, position: f64) -> Result<()> {
        Ok(self.driver.move_mm(self.id.as_str(), position).await?)
    }

    async fn move_rel(&self, distance: f64) -> Result<()> {
        Ok(self
            .driver
            .move_relative_mm(self.id.as_str(), distance)
            .await?)
    }

    async fn position(&self) -> Result<f64> {
        Ok(self.driver.get_position_mm(self.id.as_str()).await?)
    }

    fn limits(&self) -> (f64, f64) {
        self.driver
            .cached_limits(self.id.as_str())
            .map(|limits| limits.as_tuple())
            .unwrap_or((f64::NAN, f64::NAN))
    }
}

#[async_trait]
impl Homeable for C867Axis {
    async fn home(&self) -> Result<()> {
        Ok(self.driver.home(self.id.as_str()).await?)
    }

    async fn mark_homed(&self) -> Result<()> {
        Ok(self.driver.mark_homed(self.id.as_str()).await?)
    }

    async fn is_homed(&self) -> bool {
        self.driver.homing_state(self.id.as_str()).await == HomingState::Homed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let cfg: C867Config = toml::from_str(r#"port = "/dev/ttyUSB0""#).unwrap();
        assert_eq!(cfg, C867Config::new("/dev/ttyUSB0"));
        assert_eq!(cfg.baud_rate, 115_200);
        assert_eq!(cfg.axes.len(), 2);
        assert_eq!(cfg.engine_timeouts().command, Duration::from_secs(5));
        assert_eq!(cfg.engine_timeouts().home, Duration::from_secs(60));
        assert_eq!(cfg.engine_timeouts().poll_interval, Duration::from_millis(100));
        assert!(cfg.enable_joystick);
        assert!(cfg.require_mm_units);
        assert!(!cfg.assume_homed);
    }

    #[test]
    fn test_config_limits_and_macros() {
        let cfg: C867Config = toml::from_str(
            r#"
            port = "COM3"
            axes = ["1"]

            [limits.1]
            min_mm = 2.0
            max_mm = 20.0

            [macros]
            park = ["MOV 1 0", "POS? 1"]
            "#,
        )
        .unwrap();

        cfg.validate().unwrap();
        assert_eq!(cfg.limits.get("1"), Some(&TravelLimits::new(2.0, 20.0)));
        assert_eq!(cfg.macros["park"].len(), 2);
    }

    #[test]
    fn test_validate_rejects_bad_config() {
        let mut cfg = C867Config::new("/dev/null");
        cfg.axes.push(AxisId::parse("1").unwrap());
        assert!(cfg.validate().is_err());

        let mut cfg = C867Config::new("/dev/null");
        cfg.limits
            .insert("1".to_string(), TravelLimits::new(10.0, 0.0));
        assert!(cfg.validate().is_err());

        let mut cfg = C867Config::new("/dev/null");
        cfg.limits
            .insert("3".to_string(), TravelLimits::new(0.0, 1.0));
        assert!(cfg.validate().is_err());

        let mut cfg = C867Config::new("/dev/null");
        cfg.timeout_ms = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = C867Config::new("/dev/null");
        cfg.macros.insert("bad".to_string(), vec![String::new()]);
        assert!(cfg.validate().is_err());

        let mut cfg = C867Config::new("/dev/null");
        cfg.macros
            .insert("split".to_string(), vec!["POS? 1\rPOS? 2".to_string()]);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_axis_id_in_config_is_checked() {
        let result: std::result::Result<C867Config, _> =
            toml::from_str(r#"port = "COM3"
axes = ["1 2"]"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_factory_metadata() {
        let factory = C867Factory;
        assert_eq!(factory.driver_type(), "c867");
        assert!(factory.capabilities().contains(&Capability::Homeable));

        let config = toml::Value::Table(toml::toml! {
            port = "/dev/ttyUSB0"
            axes = ["1"]
        });
        factory.validate(&config).unwrap();

        let config = toml::Value::Table(toml::toml! {
            port = "/dev/ttyUSB0"
            axes = []
        });
        let err = factory.validate(&config).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StageError>(),
            Some(StageError::Configuration(_))
        ));

        let config = toml::Value::Table(toml::toml! {
            baud_rate = 9600
        });
        let err = factory.validate(&config).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StageError>(),
            Some(StageError::ConfigParse(_))
        ));
    }
}
