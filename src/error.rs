//! Custom error types for the application.
//!
//! Using the `thiserror` crate, this module provides a consistent way to handle the few
//! things that can actually go wrong around a resistivity survey, from plan files that
//! describe impossible electrode pairs to a serial board that stops answering.
//!
//! ## Error Hierarchy
//!
//! - **`ConfigurationError`**: semantic problems with a plan or with settings. These are
//!   always detected before a single command is sent to the board.
//! - **`DeviceFault`**: a command round-trip that did not produce a usable reading
//!   (timeout, malformed reply, closed port). The acquisition sequencer never propagates
//!   these; it treats them as an invalid reading and routes the cell through the
//!   bad-contact retry path.
//! - **`GeoError`**: the top-level error for the library API and the binary, with `#[from]`
//!   conversions so the `?` operator works across layers.

use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, GeoError>;

/// Convenience alias for device round-trips.
pub type DeviceResult<T> = std::result::Result<T, DeviceFault>;

/// Semantic errors in plans, electrode configurations and settings.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigurationError {
    #[error("Injection electrodes must differ (pm = pp = {0})")]
    EqualInjectionElectrodes(u32),

    #[error("Electrode {index} out of range for a {nprobe}-probe array")]
    ElectrodeOutOfRange { index: u32, nprobe: u32 },

    #[error("Plan written for {plan} probes, device has {device}")]
    ProbeCountMismatch { plan: u32, device: u32 },

    #[error("Duplicate cell id {0} in plan")]
    DuplicateCell(String),

    #[error("Plan contains no cells")]
    EmptyPlan,

    #[error("Session is busy: a run is active")]
    SessionBusy,

    #[error("Invalid setting: {0}")]
    InvalidSetting(String),
}

/// A device round-trip that did not yield a usable answer.
#[derive(Error, Debug)]
pub enum DeviceFault {
    #[error("No response to '{command}' within {timeout_ms} ms")]
    Timeout { command: String, timeout_ms: u64 },

    #[error("Malformed response to '{command}': {response:?}")]
    Malformed { command: String, response: String },

    #[error("Device connection closed")]
    Closed,

    #[error("Serial I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Relay configuration rejected: {0}")]
    InvalidConfiguration(#[from] ConfigurationError),

    #[error("Serial support not enabled. Rebuild with --features serial")]
    SerialFeatureDisabled,
}

/// Top-level error type.
#[derive(Error, Debug)]
pub enum GeoError {
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    #[error("Configuration validation error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Device error: {0}")]
    Device(#[from] DeviceFault),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("A run is already active")]
    AlreadyRunning,

    #[error("No measurement plan loaded")]
    NoPlan,

    #[error("Device is held by the acquisition worker")]
    DeviceBusy,

    #[error("Acquisition worker failed: {0}")]
    WorkerFailed(String),
}

impl From<figment::Error> for GeoError {
    fn from(value: figment::Error) -> Self {
        GeoError::Config(Box::new(value))
    }
}

impl DeviceFault {
    /// Build a `Malformed` fault for a command and the raw text it produced.
    pub fn malformed(command: &str, response: &str) -> Self {
        DeviceFault::Malformed {
            command: command.to_string(),
            response: response.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configuration_error_converts_to_geo_error() {
        let err: GeoError = ConfigurationError::ProbeCountMismatch { plan: 8, device: 16 }.into();
        match err {
            GeoError::Configuration(ConfigurationError::ProbeCountMismatch { plan, device }) => {
                assert_eq!(plan, 8);
                assert_eq!(device, 16);
            }
            other => panic!("unexpected variant: {:?}", other),
        }
    }

    #[test]
    fn device_fault_messages_name_the_command() {
        let fault = DeviceFault::Timeout {
            command: "V".into(),
            timeout_ms: 1000,
        };
        assert!(fault.to_string().contains("'V'"));

        let fault = DeviceFault::malformed("A", "garbage");
        assert!(fault.to_string().contains("garbage"));
    }

    #[test]
    fn invalid_relay_configuration_is_a_device_fault() {
        let fault: DeviceFault = ConfigurationError::EqualInjectionElectrodes(3).into();
        assert!(matches!(fault, DeviceFault::InvalidConfiguration(_)));
    }
}
