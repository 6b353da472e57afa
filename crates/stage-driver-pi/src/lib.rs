//! PI C-867.2U2 piezo stage driver for pi-stage.
//!
//! The controller speaks GCS, an ASCII request/response protocol with
//! LF-terminated lines. Errors are not reported inline: each command is
//! followed by an `ERR?` query whose `0` reply acknowledges it.
//!
//! Layers, bottom-up:
//!
//! - [`codec`]: command encoding and reply decoding, no I/O
//! - [`engine`]: one exchange at a time over a [`stage_core::serial::Transport`],
//!   owning the [`cache`] and the [`homing`] interlock
//! - [`c867`]: the connect sequence, a shared handle for concurrent callers,
//!   capability objects and the [`C867Factory`] for config-driven setup
//! - [`sim`]: an in-process controller for tests and dry runs
//!
//! # Busy positions
//!
//! While a move is executing, the controller may answer `POS?` with the
//! travel limit in the direction of motion instead of the true position.
//! [`engine::CommandEngine::query_position`] returns that as
//! [`engine::PositionReading::Busy`] without waiting or retrying, and the
//! position cache keeps the commanded target.

pub mod axis;
pub mod c867;
pub mod cache;
pub mod codec;
pub mod engine;
pub mod error;
pub mod homing;
pub mod sim;

pub use axis::{Axis, AxisId, ProfileLimits, TravelLimits};
pub use c867::{C867Axis, C867Config, C867Driver, C867Factory};
pub use cache::{Position, PositionCache};
pub use codec::ParamValue;
pub use engine::{CommandEngine, EngineTimeouts, PositionReading};
pub use error::{GcsError, GcsResult};
pub use homing::HomingState;
pub use sim::{SimHandle, SimulatedController};
