//! Software zero-offset calibration.

use crate::device::Device;
use crate::error::DeviceResult;
use serde::Serialize;

/// Injection voltage left on the board after calibrating (V).
pub const CALIBRATION_DISCHARGE_VOLT: f64 = 10.0;

/// Offsets stored on the board.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CalibrationOffsets {
    /// Mean current with the relays open (mA)
    pub current: f64,
    /// Mean shunt voltage with the relays open (mV)
    pub shunt: f64,
}

/// Average `samples` open-circuit current and shunt readings with the source on, store
/// them as the board's zero offsets and discharge.
pub async fn soft_calibrate(device: &dyn Device, samples: u32) -> DeviceResult<CalibrationOffsets> {
    let n = samples.max(1);
    device.enable_injection(true).await?;
    device.probe_off().await?;

    let mut current = 0.0;
    let mut shunt = 0.0;
    for i in 0..n {
        let c = device.measure_current().await?;
        let s = device.measure_shunt().await?;
        tracing::debug!(sample = i, current = c, shunt = s, "Calibration sample");
        current += c;
        shunt += s;
    }
    let offsets = CalibrationOffsets {
        current: current / f64::from(n),
        shunt: shunt / f64::from(n),
    };

    device
        .set_calibration_offsets(offsets.current, offsets.shunt)
        .await?;
    device.discharge(CALIBRATION_DISCHARGE_VOLT).await?;
    tracing::info!(current = offsets.current, shunt = offsets.shunt, samples = n, "Calibrated");
    Ok(offsets)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceCall, SimulatedDevice};

    #[tokio::test]
    async fn averages_and_stores_offsets() {
        let dev = SimulatedDevice::new(16);
        dev.script_current([0.2, 0.4, 0.6]);

        let offsets = soft_calibrate(&dev, 3).await.unwrap();
        assert!((offsets.current - 0.4).abs() < 1e-9);
        // relays open: no current through the shunt
        assert_eq!(offsets.shunt, 0.0);

        let calls = dev.calls();
        assert_eq!(calls[0], DeviceCall::EnableInjection(true));
        assert_eq!(calls[1], DeviceCall::ProbeOff);
        assert_eq!(dev.count(|c| *c == DeviceCall::MeasureShunt), 3);
        assert!(calls.contains(&DeviceCall::SetCalibration(offsets.current, 0.0)));
        assert_eq!(calls.last(), Some(&DeviceCall::Discharge(10.0)));
    }
}
