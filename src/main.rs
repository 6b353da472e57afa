//! CLI entry point for pi-stage
//!
//! Connects to a C-867 (or a simulated one), optionally runs the reference
//! move on every axis, prints identity, travel limits and positions, and
//! disconnects.
//!
//! # Usage
//!
//! ```bash
//! pi_stage --config config/pi_stage.toml --home
//! pi_stage --simulate --log-format compact
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use pi_stage::config::{AppConfig, DEFAULT_CONFIG_PATH};
use pi_stage::logging::{self, OutputFormat, TracingConfig};
use stage_driver_pi::{C867Config, C867Driver, PositionReading, SimulatedController};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "pi_stage")]
#[command(about = "Inspect and reference a PI C-867 piezo stage", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Talk to an in-process simulated controller instead of a serial port
    #[arg(long)]
    simulate: bool,

    /// Run the reference move on every axis before reporting
    #[arg(long)]
    home: bool,

    /// Log output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Pretty)]
    log_format: OutputFormat,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let (config, load_error) = match AppConfig::load_from(&cli.config) {
        Ok(config) => (config, None),
        // Simulation needs no port, so it can run without a config file
        Err(e) if cli.simulate => (AppConfig::new(C867Config::new("simulated")), Some(e)),
        Err(e) => {
            return Err(e).with_context(|| format!("Loading {}", cli.config.display()))
        }
    };
    config.validate()?;

    let tracing_config = TracingConfig::from_app_config(&config)
        .map_err(anyhow::Error::msg)?
        .with_format(cli.log_format);
    logging::init(tracing_config).map_err(anyhow::Error::msg)?;

    if let Some(e) = load_error {
        tracing::warn!(error = %e, "No usable config file, using defaults for simulation");
    }
    tracing::info!(app = %config.application.name, simulate = cli.simulate, "Starting");

    let driver = if cli.simulate {
        let (transport, _sim) = SimulatedController::new().spawn();
        C867Driver::connect_with_transport(transport, &config.controller).await?
    } else {
        C867Driver::connect(&config.controller)
            .await
            .with_context(|| format!("Connecting to C-867 on {}", config.controller.port))?
    };

    println!("Identity: {}", driver.identity());

    for axis in driver.axes() {
        let axis = axis.as_str();
        if cli.home {
            driver
                .home(axis)
                .await
                .with_context(|| format!("Reference move of axis {axis}"))?;
        }

        let (min, max) = driver.get_limits_mm(axis).await?;
        let position = match driver.query_position(axis).await? {
            PositionReading::Settled(mm) => format!("{mm:.6} mm"),
            PositionReading::Busy(limit) => format!("moving (toward {limit:.3} mm)"),
        };
        println!(
            "Axis {axis}: limits [{min:.3}, {max:.3}] mm, homed: {}, position: {position}",
            driver.homing_state(axis).await == stage_driver_pi::HomingState::Homed
        );
    }

    driver.disconnect().await?;
    Ok(())
}
