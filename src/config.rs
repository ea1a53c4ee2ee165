//! Configuration System using Figment
//!
//! Configuration is layered, later sources overriding earlier ones:
//! 1. Built-in defaults
//! 2. A TOML file (`config/geoelec.toml` unless told otherwise)
//! 3. Environment variables prefixed with `GEOELEC_`, `__` separating nesting
//!
//! # Example
//! ```no_run
//! use geoelec_daq::config::AppConfig;
//!
//! // GEOELEC_DEVICE__PORT=/dev/ttyACM0 overrides device.port
//! let config = AppConfig::load()?;
//! println!("Device port: {}", config.device.port);
//! # Ok::<(), geoelec_daq::error::GeoError>(())
//! ```

use crate::error::{AppResult, ConfigurationError};
use crate::tunables::DeviceTunables;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/geoelec.toml";

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "GEOELEC_";

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Board connection
    pub device: DeviceSettings,
    /// Acquisition tunables
    pub tunables: DeviceTunables,
    /// Result files
    pub storage: StorageConfig,
    /// Operator shell
    pub presentation: PresentationConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Log output format (pretty, compact, json)
    pub log_format: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "GeoElec DAQ".to_string(),
            log_level: "info".to_string(),
            log_format: "compact".to_string(),
        }
    }
}

/// Which device implementation to open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeviceBackend {
    #[default]
    Serial,
    Simulated,
}

/// Board connection settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceSettings {
    /// Device implementation
    pub backend: DeviceBackend,
    /// Serial port path (e.g. "/dev/ttyUSB0", "COM5")
    pub port: String,
    /// Serial speed
    pub baud_rate: u32,
    /// Number of electrodes wired to the relay matrix
    pub nprobe: u32,
    /// Wait for the first reply line of a query
    pub response_timeout_ms: u64,
    /// Quiet period that ends a reply
    pub idle_gap_ms: u64,
    /// Wait between opening all relays and applying a pattern
    pub relay_settle_ms: u64,
    /// Wait between injection-voltage polls while discharging
    pub discharge_poll_ms: u64,
    /// Polls before a discharge gives up
    pub discharge_max_polls: u32,
    /// ADC samples averaged per reading (1-50)
    pub averaging: u32,
    /// Soft-calibrate current and shunt offsets after opening
    pub calibrate_on_start: bool,
    /// Readings averaged by the soft calibration
    pub calibration_samples: u32,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            backend: DeviceBackend::Serial,
            port: "/dev/ttyUSB0".to_string(),
            baud_rate: 9600,
            nprobe: 16,
            response_timeout_ms: 1000,
            idle_gap_ms: 100,
            relay_settle_ms: 500,
            discharge_poll_ms: 1000,
            discharge_max_polls: 30,
            averaging: 20,
            calibrate_on_start: true,
            calibration_samples: 5,
        }
    }
}

/// Result file settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Output directory for result files
    pub output_dir: PathBuf,
    /// Write a result file after every run
    pub save_results: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("."),
            save_results: true,
        }
    }
}

/// Operator shell settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PresentationConfig {
    /// Snapshot poll interval while a run is active
    pub poll_interval_ms: u64,
    /// Layers generated by the `wenner` command when none is given
    pub wenner_layers: u32,
}

impl Default for PresentationConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 100,
            wenner_layers: 4,
        }
    }
}

impl AppConfig {
    /// Load from the default file and the environment
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    ///
    /// A missing file is not an error; defaults and the environment still apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let config: AppConfig = Self::figment(path.as_ref()).extract()?;
        config.validate()?;
        Ok(config)
    }

    /// The provider stack, exposed for callers that want to merge more layers.
    pub fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(ConfigurationError::InvalidSetting(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.application.log_format.as_str()) {
            return Err(ConfigurationError::InvalidSetting(format!(
                "Invalid log_format '{}'. Must be one of: {}",
                self.application.log_format,
                valid_formats.join(", ")
            )));
        }

        if self.device.nprobe < 2 {
            return Err(ConfigurationError::InvalidSetting(format!(
                "Invalid nprobe {}. Need at least 2 electrodes",
                self.device.nprobe
            )));
        }

        if self.device.baud_rate == 0 || self.device.response_timeout_ms == 0 {
            return Err(ConfigurationError::InvalidSetting(
                "baud_rate and response_timeout_ms must be positive".to_string(),
            ));
        }

        if self.device.calibration_samples == 0 {
            return Err(ConfigurationError::InvalidSetting(
                "calibration_samples must be at least 1".to_string(),
            ));
        }

        if self.presentation.poll_interval_ms == 0 {
            return Err(ConfigurationError::InvalidSetting(
                "poll_interval_ms must be positive".to_string(),
            ));
        }

        self.tunables.validate()
    }

    /// Render the effective configuration as TOML.
    pub fn to_toml_string(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }
}
