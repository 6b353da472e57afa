//! Application configuration using Figment
//!
//! Configuration is loaded from:
//! 1. a TOML file (base configuration)
//! 2. Environment variables prefixed with `PI_STAGE_`, nested keys separated
//!    by a double underscore (`PI_STAGE_APPLICATION__LOG_LEVEL=debug`,
//!    `PI_STAGE_CONTROLLER__PORT=/dev/ttyUSB1`)
//!
//! # Example
//! ```no_run
//! use pi_stage::config::AppConfig;
//!
//! let config = AppConfig::load_from("config/pi_stage.toml")?;
//! config.validate()?;
//! println!("Controller port: {}", config.controller.port);
//! # Ok::<(), pi_stage::config::ConfigError>(())
//! ```

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use stage_driver_pi::C867Config;
use std::path::Path;
use thiserror::Error;

/// Default location of the configuration file
pub const DEFAULT_CONFIG_PATH: &str = "config/pi_stage.toml";

/// Environment variable prefix
pub const ENV_PREFIX: &str = "PI_STAGE_";

/// Valid `log_level` values
pub const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(Box<figment::Error>),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl From<figment::Error> for ConfigError {
    fn from(e: figment::Error) -> Self {
        Self::Load(Box::new(e))
    }
}

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Stage controller settings
    pub controller: C867Config,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_name() -> String {
    "pi-stage".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
        }
    }
}

impl AppConfig {
    /// Default application settings around a controller configuration.
    pub fn new(controller: C867Config) -> Self {
        Self {
            application: ApplicationConfig::default(),
            controller,
        }
    }

    /// Load configuration from [`DEFAULT_CONFIG_PATH`] and environment variables
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    ///
    /// A missing file is not an error by itself; the environment may supply
    /// every required key.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        Ok(Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), ConfigError> {
        crate::logging::parse_log_level(&self.application.log_level)
            .map_err(ConfigError::Invalid)?;

        if self.controller.port.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "controller.port must not be empty".to_string(),
            ));
        }

        self.controller
            .validate()
            .map_err(|e| ConfigError::Invalid(format!("{e:#}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_validation() {
        let config = AppConfig::new(C867Config::new("/dev/ttyUSB0"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = AppConfig::new(C867Config::new("/dev/ttyUSB0"));
        config.application.log_level = "verbose".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        config.application.log_level = "DEBUG".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_controller_errors_surface() {
        let mut config = AppConfig::new(C867Config::new("/dev/ttyUSB0"));
        config.controller.axes.clear();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("at least one axis"));

        let config = AppConfig::new(C867Config::new("  "));
        assert!(config.validate().is_err());
    }
}
