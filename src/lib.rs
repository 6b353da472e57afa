//! # pi-stage
//!
//! Control of PI C-867 two-axis piezo stages over the GCS serial protocol.
//!
//! - **`stage_core`**: transport, capability traits and the driver factory
//!   interface shared by stage drivers
//! - **`stage_driver_pi`**: the C-867 codec, command engine, driver facade
//!   and simulated controller
//! - **`config`**: file + environment configuration for the `pi_stage` binary
//! - **`logging`**: tracing subscriber setup

pub mod config;
pub mod logging;

pub use stage_core;
pub use stage_driver_pi;

use stage_core::driver::FactoryRegistry;
use stage_driver_pi::C867Factory;

/// Registry with every stage driver this crate ships.
pub fn default_registry() -> FactoryRegistry {
    let mut registry = FactoryRegistry::new();
    registry.register_factory(Box::new(C867Factory));
    registry
}
