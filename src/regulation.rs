//! Closed-loop injection current regulation.
//!
//! Nudges the PWM level by `pwm_increment` until the injection current is strictly inside
//! the target band. The loop never fails: every way out is a [`RegulationStop`] and the
//! caller decides whether the readings are usable.

use crate::device::Device;
use crate::session::RunSession;
use crate::tunables::DeviceTunables;

/// Why regulation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegulationStop {
    /// Current strictly inside the band
    InBand,
    /// Injection voltage went above `injection_volt_limit`
    VoltageLimited,
    /// Adjustment count went past `injection_max_try` without reaching the band
    TryLimited,
    /// Abort flag observed; no further commands were sent
    Aborted,
    /// A device round-trip failed
    Fault,
}

/// Readings at the end of regulation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RegulationOutcome {
    /// Last injection current (mA)
    pub current: f64,
    /// Sense voltage read once after regulation (mV); `None` if aborted or faulted
    pub meter_voltage: Option<f64>,
    /// Last injection voltage (V); the discharge target carried to the next cell
    pub injection_voltage: f64,
    /// PWM level regulation stopped at
    pub pwm: u32,
    /// PWM adjustments made
    pub iterations: u32,
    pub stop: RegulationStop,
}

impl RegulationOutcome {
    /// Regulation produced readings the sequencer can validate.
    pub fn has_readings(&self) -> bool {
        !matches!(self.stop, RegulationStop::Aborted | RegulationStop::Fault)
    }
}

/// Drive the injection current into the tunables' band, starting from `start_pwm`.
///
/// The abort flag is checked before the first command and at the top of every iteration.
/// The loop gives up once the adjustment count exceeds `injection_max_try`, so at most
/// `injection_max_try + 1` adjustments are made.
pub async fn regulate(
    device: &dyn Device,
    tunables: &DeviceTunables,
    start_pwm: u32,
    session: &RunSession,
) -> RegulationOutcome {
    let band = tunables.current_band();
    let mut outcome = RegulationOutcome {
        current: f64::NAN,
        meter_voltage: None,
        injection_voltage: f64::NAN,
        pwm: start_pwm,
        iterations: 0,
        stop: RegulationStop::Fault,
    };

    if session.abort_requested() {
        outcome.stop = RegulationStop::Aborted;
        return outcome;
    }

    match read_pair(device).await {
        Some((current, volt)) => {
            outcome.current = current;
            outcome.injection_voltage = volt;
        }
        None => return outcome,
    }

    loop {
        if session.abort_requested() {
            outcome.stop = RegulationStop::Aborted;
            return outcome;
        }
        if band.contains(outcome.current) {
            outcome.stop = RegulationStop::InBand;
            break;
        }
        if outcome.iterations > tunables.injection_max_try {
            let line = format!(
                "max try number reached ({} adjustments, {:.4}mA)",
                outcome.iterations, outcome.current
            );
            tracing::warn!(iterations = outcome.iterations, current = outcome.current, "Regulation try-limited");
            session.append_log(line);
            outcome.stop = RegulationStop::TryLimited;
            break;
        }

        let step = if outcome.current < band.low {
            device.increment_injection(tunables.pwm_increment).await
        } else {
            device.decrement_injection(tunables.pwm_increment).await
        };
        match step {
            Ok(pwm) => outcome.pwm = pwm,
            Err(e) => {
                tracing::warn!(error = %e, "PWM adjustment failed");
                return outcome;
            }
        }

        match read_pair(device).await {
            Some((current, volt)) => {
                outcome.current = current;
                outcome.injection_voltage = volt;
            }
            None => return outcome,
        }
        outcome.iterations += 1;

        tracing::debug!(
            current_ma = outcome.current,
            injection_v = outcome.injection_voltage,
            pwm = outcome.pwm,
            band_low = band.low,
            band_high = band.high,
            "injection"
        );
        session.append_log(format!(
            "injection: {:.4}mA at {:.3}V (curr_limit: {:.3},{:.3})",
            outcome.current, outcome.injection_voltage, band.low, band.high
        ));

        if outcome.injection_voltage > tunables.injection_volt_limit {
            tracing::warn!(
                injection_v = outcome.injection_voltage,
                limit = tunables.injection_volt_limit,
                "Regulation voltage-limited"
            );
            session.append_log(format!(
                "injection voltage limit reached ({:.3}V > {:.3}V)",
                outcome.injection_voltage, tunables.injection_volt_limit
            ));
            outcome.stop = RegulationStop::VoltageLimited;
            break;
        }
    }

    match device.measure_voltage().await {
        Ok(v) => outcome.meter_voltage = Some(v),
        Err(e) => {
            tracing::warn!(error = %e, "Meter voltage read failed");
            outcome.stop = RegulationStop::Fault;
        }
    }
    outcome
}

async fn read_pair(device: &dyn Device) -> Option<(f64, f64)> {
    let current = match device.measure_current().await {
        Ok(i) => i,
        Err(e) => {
            tracing::warn!(error = %e, "Current read failed");
            return None;
        }
    };
    match device.measure_injection_voltage().await {
        Ok(v) => Some((current, v)),
        Err(e) => {
            tracing::warn!(error = %e, "Injection voltage read failed");
            None
        }
    }
}
