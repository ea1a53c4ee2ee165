//! Operator-adjustable acquisition parameters.
//!
//! A single [`DeviceTunables`] record lives in each [`RunSession`](crate::session::RunSession).
//! It can be replaced between runs (from the configuration file, from the
//! `device_configuration` block of a plan file, or from the shell) but never while a run is
//! active.

use crate::error::ConfigurationError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How the discharge target for the next cell is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DischargeMode {
    /// Discharge only down to the injection voltage where the previous cell's regulation
    /// settled, and restart injection from that cell's PWM level.
    #[default]
    CarryForward,
    /// Always discharge to `injection_volt_low` and restart from `injection_low_pwm`.
    Fixed,
}

/// Acquisition tunables.
///
/// Units follow the board firmware: currents in mA, sense voltages in mV, injection
/// voltages in V.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceTunables {
    /// Lower edge of the target injection current band (mA)
    pub current_band_low: f64,
    /// Upper edge of the target injection current band (mA)
    pub current_band_high: f64,
    /// PWM level injection starts from
    pub injection_low_pwm: u32,
    /// PWM step applied per regulation iteration
    pub pwm_increment: u32,
    /// Regulation stops once the injection voltage exceeds this (V)
    pub injection_volt_limit: f64,
    /// Discharge target between cells and at the end of a run (V)
    pub injection_volt_low: f64,
    /// Maximum regulation iterations per cell
    pub injection_max_try: u32,
    /// Sense voltage at or above which contact is considered bad (mV)
    pub voltage_limit: f64,
    /// Bad-contact retries per cell before it is recorded as undefined
    pub max_measurement_try: u32,
    /// Prefix for result file names
    pub filename_prefix: String,
    /// Discharge target policy
    pub discharge_mode: DischargeMode,
    /// Settle wait after discharging (ms)
    pub settle_interval_ms: u64,
}

impl Default for DeviceTunables {
    fn default() -> Self {
        Self {
            current_band_low: 0.025,
            current_band_high: 50.0,
            injection_low_pwm: 20,
            pwm_increment: 5,
            injection_volt_limit: 200.0,
            injection_volt_low: 15.0,
            injection_max_try: 50,
            voltage_limit: 4966.0,
            max_measurement_try: 10,
            filename_prefix: "data-".to_string(),
            discharge_mode: DischargeMode::CarryForward,
            settle_interval_ms: 500,
        }
    }
}

impl DeviceTunables {
    /// The target current band `(low, high)` in mA.
    pub fn current_band(&self) -> CurrentBand {
        CurrentBand {
            low: self.current_band_low,
            high: self.current_band_high,
        }
    }

    /// Settle wait as a `Duration`.
    pub fn settle_interval(&self) -> Duration {
        Duration::from_millis(self.settle_interval_ms)
    }

    /// Check the record is usable for a run.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        let ordered = self.current_band_low < self.current_band_high;
        if !ordered {
            return Err(ConfigurationError::InvalidSetting(format!(
                "current band low ({}) must be below high ({})",
                self.current_band_low, self.current_band_high
            )));
        }
        if self.current_band_low < 0.0 {
            return Err(ConfigurationError::InvalidSetting(
                "current band must be non-negative".to_string(),
            ));
        }
        if self.pwm_increment == 0 {
            return Err(ConfigurationError::InvalidSetting(
                "pwm_increment must be at least 1".to_string(),
            ));
        }
        let positive = self.voltage_limit > 0.0 && self.injection_volt_limit > 0.0;
        if !positive {
            return Err(ConfigurationError::InvalidSetting(
                "voltage limits must be positive".to_string(),
            ));
        }
        if self.injection_volt_low < 0.0 {
            return Err(ConfigurationError::InvalidSetting(
                "discharge voltage must be non-negative".to_string(),
            ));
        }
        Ok(())
    }

    /// Apply the overrides carried by a plan file.
    pub fn apply(&mut self, overrides: &TunableOverrides) {
        macro_rules! take {
            ($($field:ident),+) => {
                $(if let Some(value) = overrides.$field.clone() {
                    self.$field = value;
                })+
            };
        }
        take!(
            current_band_low,
            current_band_high,
            injection_low_pwm,
            pwm_increment,
            injection_volt_limit,
            injection_volt_low,
            injection_max_try,
            voltage_limit,
            max_measurement_try,
            filename_prefix,
            discharge_mode,
            settle_interval_ms
        );
    }
}

/// Partial tunables, as found in the `device_configuration` block of a plan file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TunableOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_band_low: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_band_high: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub injection_low_pwm: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pwm_increment: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub injection_volt_limit: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub injection_volt_low: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub injection_max_try: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voltage_limit: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_measurement_try: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename_prefix: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discharge_mode: Option<DischargeMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settle_interval_ms: Option<u64>,
}

/// Target injection current band in mA.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CurrentBand {
    pub low: f64,
    pub high: f64,
}

impl CurrentBand {
    /// Strictly inside the band. The edges count as out of band, like the firmware menu.
    pub fn contains(&self, current: f64) -> bool {
        current > self.low && current < self.high
    }
}
