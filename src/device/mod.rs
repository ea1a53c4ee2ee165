//! Device capability for the relay/ADC board.
//!
//! The acquisition code only ever talks to the board through [`Device`]. Two
//! implementations exist:
//!
//! - [`SerialDevice`](serial::SerialDevice) - the live IGF-02 board over a serial line
//!   (feature `serial`)
//! - [`SimulatedDevice`](simulated::SimulatedDevice) - a deterministic in-memory board
//!   model with a call log and fault injection
//!
//! Which one is used is decided explicitly at startup from configuration; see
//! [`open_device`].
//!
//! # Contract
//!
//! - All methods take `&self`; implementations use interior mutability
//! - Every round-trip is bounded by a timeout enforced by the implementation
//! - A timeout, a malformed reply or a closed link is reported as
//!   [`DeviceFault`](crate::error::DeviceFault),
//!   never as a panic
//! - Units follow the firmware: sense voltage and shunt in mV, current in mA,
//!   injection voltage in V

use crate::config::{DeviceBackend, DeviceSettings};
use crate::error::DeviceResult;
use crate::plan::ElectrodeConfiguration;
use async_trait::async_trait;

pub mod serial;
pub mod simulated;

pub use serial::SerialDevice;
pub use simulated::{DeviceCall, SimulatedDevice};

/// Capability surface of the resistivity meter.
#[async_trait]
pub trait Device: Send + Sync {
    /// Number of electrodes wired to the relay matrix.
    fn nprobe(&self) -> u32;

    /// Human-readable identity for logs.
    fn describe(&self) -> String;

    /// Connect the given electrodes; `0` entries stay disconnected.
    async fn set_relay_pattern(&self, configuration: &ElectrodeConfiguration) -> DeviceResult<()>;

    /// Set the injection PWM level.
    async fn set_injection_level(&self, pwm: u32) -> DeviceResult<()>;

    /// Raise the PWM level by `n` steps; returns the new level.
    async fn increment_injection(&self, n: u32) -> DeviceResult<u32>;

    /// Lower the PWM level by `n` steps; returns the new level.
    async fn decrement_injection(&self, n: u32) -> DeviceResult<u32>;

    /// Switch the current source on or off.
    async fn enable_injection(&self, on: bool) -> DeviceResult<()>;

    /// Sense voltage between `vm` and `vp` (mV).
    async fn measure_voltage(&self) -> DeviceResult<f64>;

    /// Injection current (mA).
    async fn measure_current(&self) -> DeviceResult<f64>;

    /// Injection source voltage (V).
    async fn measure_injection_voltage(&self) -> DeviceResult<f64>;

    /// Shunt voltage (mV).
    async fn measure_shunt(&self) -> DeviceResult<f64>;

    /// Open every relay.
    async fn probe_off(&self) -> DeviceResult<()>;

    /// Bleed the injection capacitor down to `target_volt`; returns the voltage reached.
    async fn discharge(&self, target_volt: f64) -> DeviceResult<f64>;

    /// Drop any pending device output; returns what was pending.
    async fn flush(&self) -> DeviceResult<String>;

    /// Move the active relay pattern one electrode along the array.
    async fn shift_relays(&self) -> DeviceResult<()>;

    /// Number of ADC samples averaged per reading.
    async fn set_averaging(&self, samples: u32) -> DeviceResult<()>;

    /// Store current and shunt zero offsets on the board.
    async fn set_calibration_offsets(&self, current: f64, shunt: f64) -> DeviceResult<()>;

    /// Send a command verbatim and return the raw reply.
    async fn send_raw(&self, command: &str) -> DeviceResult<String>;
}

/// Clamp an averaging request to what the board accepts.
pub fn clamp_averaging(samples: u32) -> u32 {
    samples.clamp(1, 50)
}

/// Open the device selected by `settings.backend`.
///
/// No fallback: a serial port that cannot be opened is an error.
pub async fn open_device(settings: &DeviceSettings) -> DeviceResult<Box<dyn Device>> {
    match settings.backend {
        DeviceBackend::Simulated => {
            tracing::info!(nprobe = settings.nprobe, "Using simulated device");
            Ok(Box::new(SimulatedDevice::new(settings.nprobe)))
        }
        DeviceBackend::Serial => open_serial(settings).await,
    }
}

#[cfg(feature = "serial")]
async fn open_serial(settings: &DeviceSettings) -> DeviceResult<Box<dyn Device>> {
    let device = SerialDevice::open(settings).await?;
    Ok(Box::new(device))
}

#[cfg(not(feature = "serial"))]
async fn open_serial(_settings: &DeviceSettings) -> DeviceResult<Box<dyn Device>> {
    Err(crate::error::DeviceFault::SerialFeatureDisabled)
}
