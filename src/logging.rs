//! Tracing setup for the `pi_stage` binary.
//!
//! Library crates only emit `tracing` events; this module installs the
//! subscriber. The configured level applies to this workspace's crates
//! (`pi_stage`, `stage_core`, `stage_driver_pi`); everything else logs at
//! `warn`. `RUST_LOG` replaces the whole filter when set.
//!
//! # Example
//! ```no_run
//! use pi_stage::logging::{self, OutputFormat, TracingConfig};
//! use tracing::Level;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = TracingConfig::new(Level::DEBUG).with_format(OutputFormat::Json);
//! logging::init(config)?;
//! # Ok(())
//! # }
//! ```

use crate::config::{AppConfig, LOG_LEVELS};
use std::str::FromStr;
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer, Registry,
};

/// Output format for tracing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum OutputFormat {
    /// Pretty-printed format with colors (for development)
    #[default]
    Pretty,
    /// Single-line format without colors
    Compact,
    /// JSON lines for log aggregation
    Json,
}

/// Tracing configuration options
#[derive(Debug, Clone)]
pub struct TracingConfig {
    pub level: Level,
    pub format: OutputFormat,
    /// Emit span NEW/CLOSE events (shows per-command timing)
    pub with_span_events: bool,
    pub with_file_and_line: bool,
    /// ANSI colors, Pretty format only
    pub with_ansi: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: OutputFormat::Pretty,
            with_span_events: false,
            with_file_and_line: false,
            with_ansi: true,
        }
    }
}

impl TracingConfig {
    pub fn new(level: Level) -> Self {
        Self {
            level,
            ..Default::default()
        }
    }

    /// Level from the `[application]` section of the configuration.
    pub fn from_app_config(config: &AppConfig) -> Result<Self, String> {
        Ok(Self::new(parse_log_level(&config.application.log_level)?))
    }

    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_span_events(mut self, enabled: bool) -> Self {
        self.with_span_events = enabled;
        self
    }

    pub fn with_ansi(mut self, enabled: bool) -> Self {
        self.with_ansi = enabled;
        self
    }

    pub fn with_file_and_line(mut self, enabled: bool) -> Self {
        self.with_file_and_line = enabled;
        self
    }

    /// Filter directives used when `RUST_LOG` is unset.
    pub fn filter_directives(&self) -> String {
        let level = self.level.as_str().to_lowercase();
        WORKSPACE_TARGETS
            .iter()
            .fold("warn".to_string(), |acc, target| format!("{acc},{target}={level}"))
    }
}

/// Log targets that follow the configured level.
const WORKSPACE_TARGETS: &[&str] = &["pi_stage", "stage_core", "stage_driver_pi"];

/// Install the global subscriber.
///
/// Idempotent: if a subscriber is already installed (e.g. by a test
/// harness), returns `Ok(())`.
pub fn init(config: TracingConfig) -> Result<(), String> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.filter_directives()));

    let span_events = if config.with_span_events {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    let layer: Box<dyn Layer<Registry> + Send + Sync> = match config.format {
        OutputFormat::Pretty => fmt::layer()
            .pretty()
            .with_span_events(span_events)
            .with_file(config.with_file_and_line)
            .with_line_number(config.with_file_and_line)
            .with_ansi(config.with_ansi)
            .boxed(),
        OutputFormat::Compact => fmt::layer()
            .compact()
            .with_span_events(span_events)
            .with_file(config.with_file_and_line)
            .with_line_number(config.with_file_and_line)
            .with_ansi(false)
            .boxed(),
        OutputFormat::Json => fmt::layer()
            .json()
            .with_span_events(span_events)
            .with_file(config.with_file_and_line)
            .with_line_number(config.with_file_and_line)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(layer.with_filter(env_filter))
        .try_init()
        .or_else(|e| {
            if e.to_string().contains("global default trace dispatcher has already been set") {
                Ok(())
            } else {
                Err(format!("Failed to initialize tracing: {}", e))
            }
        })
}

/// Parse a `log_level` value (case-insensitive) into a tracing level.
///
/// Numeric levels accepted by `tracing` are rejected; the config file only
/// documents the names.
pub fn parse_log_level(level: &str) -> Result<Level, String> {
    let name = level.to_lowercase();
    if !LOG_LEVELS.contains(&name.as_str()) {
        return Err(format!(
            "Invalid log level '{}'. Must be one of: {}",
            level,
            LOG_LEVELS.join(", ")
        ));
    }
    Level::from_str(&name).map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use stage_driver_pi::C867Config;

    #[test]
    fn test_parse_log_level() {
        assert_eq!(parse_log_level("trace"), Ok(Level::TRACE));
        assert_eq!(parse_log_level("Debug"), Ok(Level::DEBUG));
        assert_eq!(parse_log_level("WARN"), Ok(Level::WARN));
        assert!(parse_log_level("loud").is_err());
        assert!(parse_log_level("3").is_err());
    }

    #[test]
    fn test_filter_directives_quiet_dependencies() {
        let config = TracingConfig::new(Level::DEBUG);
        assert_eq!(
            config.filter_directives(),
            "warn,pi_stage=debug,stage_core=debug,stage_driver_pi=debug"
        );
    }

    #[test]
    fn test_tracing_config_from_app_config() {
        let mut app = AppConfig::new(C867Config::new("/dev/ttyUSB0"));
        app.application.log_level = "debug".to_string();

        let config = TracingConfig::from_app_config(&app).unwrap();
        assert_eq!(config.level, Level::DEBUG);
        assert_eq!(config.format, OutputFormat::Pretty);
    }

    #[test]
    fn test_tracing_config_builder() {
        let config = TracingConfig::new(Level::WARN)
            .with_format(OutputFormat::Json)
            .with_span_events(true)
            .with_file_and_line(true)
            .with_ansi(false);

        assert_eq!(config.level, Level::WARN);
        assert_eq!(config.format, OutputFormat::Json);
        assert!(config.with_span_events);
        assert!(config.with_file_and_line);
        assert!(!config.with_ansi);
    }

    #[test]
    fn test_init_is_idempotent() {
        let config = TracingConfig::new(Level::ERROR).with_format(OutputFormat::Compact);
        assert!(init(config.clone()).is_ok());
        assert!(init(config).is_ok());
    }
}
