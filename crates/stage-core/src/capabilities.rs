//! Atomic capability traits for motion hardware.
//!
//! Drivers implement only the capabilities they support. A two-axis stage
//! controller hands out one [`Movable`] + [`Homeable`] object per axis; all
//! of them share the controller's single link.
//!
//! # Contract
//!
//! All methods are async and must not block the runtime. None of them poll
//! in the background: every call is one explicit exchange with the hardware.

use anyhow::Result;
use async_trait::async_trait;

/// Capability: Motion Control
///
/// Devices that move to a position (linear stages, rotation mounts).
///
/// # Contract
/// - Positions are in device-native units (millimeters for linear stages)
/// - `move_abs`/`move_rel` return once the controller accepted the command,
///   not when motion has finished
/// - `position()` may return an approximate value while the device moves
#[async_trait]
pub trait Movable: Send + Sync {
    /// Move to absolute position
    ///
    /// # Returns
    /// - Ok(()) if motion initiated successfully
    /// - Err if position is out of range, axis not homed, or hardware error
    async fn move_abs(&self, position: f64) -> Result<()>;

    /// Move relative to current position
    async fn move_rel(&self, distance: f64) -> Result<()>;

    /// Get current position
    ///
    /// Current position in device-native units.
    /// May be approximate if device is currently moving.
    async fn position(&self) -> Result<f64>;

    /// Travel range as `(min, max)` in device-native units.
    fn limits(&self) -> (f64, f64);
}

/// Capability: Reference Move
///
/// Devices that need a homing run before absolute coordinates are valid.
#[async_trait]
pub trait Homeable: Send + Sync {
    /// Run the reference move and wait for the controller to acknowledge it.
    async fn home(&self) -> Result<()>;

    /// Record that the device was homed out of band (e.g. by a firmware
    /// startup macro).
    async fn mark_homed(&self) -> Result<()>;

    /// Whether absolute moves are currently permitted.
    async fn is_homed(&self) -> bool;
}

/// Capability: Named Command Sequences
///
/// Controllers that accept raw command macros for startup or recovery.
#[async_trait]
pub trait MacroRunner: Send + Sync {
    /// Run a named macro. Returns the reply lines of any queries it contains.
    async fn run_macro(&self, name: &str) -> Result<Vec<String>>;

    /// Names of the macros this device knows about.
    fn macro_names(&self) -> Vec<String>;
}
