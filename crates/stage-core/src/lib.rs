//! `stage-core`
//!
//! Shared building blocks for motion-stage drivers: the byte [`serial::Transport`]
//! the protocol engines talk through, capability traits ([`capabilities::Movable`],
//! [`capabilities::Homeable`], [`capabilities::MacroRunner`]), the
//! [`driver::DriverFactory`] plugin interface, and error types.
//!
//! Driver crates (e.g. `stage-driver-pi`) depend on this crate and nothing
//! depends on them except the composition root.

pub mod capabilities;
pub mod driver;
pub mod error;
pub mod serial;

pub use error::{StageError, StageResult, TransportError};
