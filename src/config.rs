//! Configuration management for systemcalc
//!
//! Local process configuration loaded from YAML with defaults and
//! validation. This covers only what lives on the local filesystem (GPIO
//! path, serial source, timer periods, logging); user-facing settings such
//! as the battery-service selection come from the settings service on the
//! bus and are handled by `crate::settings`.

use crate::error::{Result, SystemCalcError};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Device instance for the published service
    pub device_instance: u32,

    /// Path to the relay GPIO value file. The CCGX uses gpio182; other
    /// boards may route the relay to a different pin.
    pub relay_gpio_file: String,

    /// Sysfs file holding the MAC address used as the node identity
    pub serial_source: String,

    /// Aggregation tick period in milliseconds
    pub update_interval_ms: u64,

    /// Relay reflection period in milliseconds
    pub relay_poll_interval_ms: u64,

    /// Liveness supervision period in milliseconds
    pub supervision_interval_ms: u64,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Base log level (TRACE, DEBUG, INFO, WARN, ERROR)
    pub level: String,

    /// Emit JSON-formatted log lines
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "INFO".to_string(),
            json_format: false,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device_instance: 0,
            relay_gpio_file: "/sys/class/gpio/gpio182/value".to_string(),
            serial_source: "/sys/class/net/eth0/address".to_string(),
            update_interval_ms: 1000,
            relay_poll_interval_ms: 5000,
            supervision_interval_ms: 60000,
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from the default locations
    pub fn load() -> Result<Self> {
        let default_paths = [
            "systemcalc.yaml",
            "/data/systemcalc.yaml",
            "/etc/systemcalc/config.yaml",
        ];

        for path in &default_paths {
            if Path::new(path).exists() {
                return Self::from_file(path);
            }
        }

        // Fall back to default configuration
        Ok(Config::default())
    }

    /// Load configuration using an optional override path. When `Some`, the
    /// file must exist and be valid; there is no fallback to defaults.
    pub fn load_with_override(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) => Self::from_file(p),
            None => Self::load(),
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.relay_gpio_file.is_empty() {
            return Err(SystemCalcError::validation(
                "relay_gpio_file",
                "Path cannot be empty",
            ));
        }

        if self.update_interval_ms == 0 {
            return Err(SystemCalcError::validation(
                "update_interval_ms",
                "Must be greater than 0",
            ));
        }

        if self.relay_poll_interval_ms == 0 {
            return Err(SystemCalcError::validation(
                "relay_poll_interval_ms",
                "Must be greater than 0",
            ));
        }

        if self.supervision_interval_ms == 0 {
            return Err(SystemCalcError::validation(
                "supervision_interval_ms",
                "Must be greater than 0",
            ));
        }

        Ok(())
    }
}
