//! Contact resistance survey (`mres`).
//!
//! Injects between each pair of adjacent electrodes in turn and records
//! `R = (V + S) / I` from the injection voltage, shunt voltage and current. Useful before a
//! plan acquisition to spot electrodes with poor ground contact.

use crate::device::Device;
use crate::error::GeoError;
use crate::plan::ElectrodeConfiguration;
use crate::session::{ContactReading, RunSession, RunStatus, SessionSnapshot};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Injection voltage the survey starts from (V).
pub const SURVEY_DISCHARGE_VOLT: f64 = 10.0;

/// Source off time before the relays move to the next pair.
pub const PAIR_SETTLE: Duration = Duration::from_millis(200);

/// Outcome of one survey.
#[derive(Debug, Clone, PartialEq)]
pub struct SurveyReport {
    pub status: RunStatus,
    pub readings: Vec<ContactReading>,
    /// Session state at release
    pub final_state: SessionSnapshot,
}

/// Walks the electrode array pair by pair.
pub struct ContactSurvey {
    session: Arc<RunSession>,
}

impl ContactSurvey {
    /// Survey bound to `session`.
    pub fn new(session: Arc<RunSession>) -> Self {
        Self { session }
    }

    /// Claim the session and survey every adjacent pair.
    pub async fn survey(&self, device: &dyn Device) -> Result<SurveyReport, GeoError> {
        self.session.begin_survey()?;
        Ok(self.run(device).await)
    }

    /// Survey on a session already claimed with [`RunSession::begin_survey`]. Releases
    /// the session when done.
    pub async fn run(&self, device: &dyn Device) -> SurveyReport {
        let nprobe = device.nprobe();
        let low_pwm = self.session.tunables().injection_low_pwm;
        self.note(format!("contact survey: {} pairs", nprobe.saturating_sub(1)));

        let mut status = RunStatus::Success;
        if let Err(e) = self.prepare(device, low_pwm).await {
            warn!(error = %e, "Survey setup failed");
            self.note(format!("survey stopped: {}", e));
            status = RunStatus::Aborted;
        } else {
            for p1 in 1..nprobe {
                if self.session.abort_requested() {
                    status = RunStatus::Aborted;
                    break;
                }
                let reading = self.measure_pair(device, p1).await;
                self.session.record_contact(reading);
                self.note(format!(
                    "P{}-P{}: R={:.2}Ohm V={:.3} I={:.4}mA",
                    reading.p1, reading.p2, reading.resistance, reading.voltage, reading.current
                ));

                if p1 + 1 < nprobe {
                    self.advance(device).await;
                }
            }
        }

        if let Err(e) = device.enable_injection(false).await {
            warn!(error = %e, "Survey: injection off failed");
        }
        if let Err(e) = device.probe_off().await {
            warn!(error = %e, "Survey: probe off failed");
        }
        if status == RunStatus::Aborted {
            self.note("contact survey aborted");
        }
        let final_state = self.session.finish_run(status);
        SurveyReport {
            status,
            readings: final_state.contacts.clone(),
            final_state,
        }
    }

    async fn prepare(&self, device: &dyn Device, low_pwm: u32) -> crate::error::DeviceResult<()> {
        let first = ElectrodeConfiguration::new(1, 2, 0, 0)?;
        let volt = device.discharge(SURVEY_DISCHARGE_VOLT).await?;
        self.session.append_log(format!("discharged: {:.3}V", volt));
        device.set_injection_level(low_pwm).await?;
        device.set_relay_pattern(&first).await?;
        device.enable_injection(true).await
    }

    async fn measure_pair(&self, device: &dyn Device, p1: u32) -> ContactReading {
        let readings = async {
            let current = device.measure_current().await?;
            let volt = device.measure_injection_voltage().await?;
            let shunt = device.measure_shunt().await?;
            Ok::<_, crate::error::DeviceFault>((current, volt + shunt))
        }
        .await;

        match readings {
            Ok((current, voltage)) => ContactReading {
                p1,
                p2: p1 + 1,
                resistance: contact_resistance(voltage, current),
                voltage,
                current,
            },
            Err(e) => {
                warn!(p1, error = %e, "Contact reading failed");
                ContactReading {
                    p1,
                    p2: p1 + 1,
                    resistance: f64::NAN,
                    voltage: f64::NAN,
                    current: f64::NAN,
                }
            }
        }
    }

    async fn advance(&self, device: &dyn Device) {
        if let Err(e) = device.enable_injection(false).await {
            warn!(error = %e, "Survey: injection off failed");
        }
        tokio::time::sleep(PAIR_SETTLE).await;
        if let Err(e) = device.shift_relays().await {
            warn!(error = %e, "Relay shift failed");
        }
        if let Err(e) = device.enable_injection(true).await {
            warn!(error = %e, "Survey: injection on failed");
        }
    }

    fn note(&self, line: impl Into<String>) {
        let line = line.into();
        info!(target: "geoelec::survey", "{}", line);
        self.session.append_log(line);
    }
}

/// `voltage / current`, NaN when the quotient is not finite.
pub fn contact_resistance(voltage: f64, current: f64) -> f64 {
    let r = voltage / current;
    if r.is_finite() {
        r
    } else {
        f64::NAN
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceCall, SimulatedDevice};
    use crate::tunables::DeviceTunables;

    fn session(nprobe: u32) -> Arc<RunSession> {
        Arc::new(RunSession::new(nprobe, DeviceTunables::default()))
    }

    #[test]
    fn zero_current_gives_nan() {
        assert!(contact_resistance(12.0, 0.0).is_nan());
        assert_eq!(contact_resistance(20.0, 10.0), 2.0);
    }

    #[tokio::test(start_paused = true)]
    async fn surveys_every_adjacent_pair() {
        let s = session(5);
        let dev = SimulatedDevice::new(5);
        dev.set_contact_resistance(3, 4, 4000.0);

        let report = ContactSurvey::new(s.clone()).survey(&dev).await.unwrap();
        assert_eq!(report.status, RunStatus::Success);
        let readings = report.readings;
        let pairs: Vec<(u32, u32)> = readings.iter().map(|r| (r.p1, r.p2)).collect();
        assert_eq!(pairs, vec![(1, 2), (2, 3), (3, 4), (4, 5)]);
        // 20 V over 2000 ohm: 10 mA, shunt 10 mV
        assert!((readings[0].current - 10.0).abs() < 1e-9);
        assert!((readings[0].resistance - 3.0).abs() < 1e-9);
        assert!((readings[2].current - 5.0).abs() < 1e-9);

        assert_eq!(dev.count(|c| *c == DeviceCall::ShiftRelays), 3);
        assert_eq!(dev.calls().last(), Some(&DeviceCall::ProbeOff));
        assert_eq!(dev.calls()[0], DeviceCall::Discharge(SURVEY_DISCHARGE_VOLT));
        assert!(!s.is_running());
        assert_eq!(s.snapshot().status, RunStatus::Success);
    }

    #[tokio::test(start_paused = true)]
    async fn abort_stops_before_next_pair() {
        let s = session(8);
        let dev = SimulatedDevice::new(8);
        let flag = s.clone();
        dev.set_hook(move |call| {
            if *call == DeviceCall::ShiftRelays {
                flag.request_abort();
            }
        });

        let report = ContactSurvey::new(s.clone()).survey(&dev).await.unwrap();
        assert_eq!(report.readings.len(), 1);
        assert_eq!(report.status, RunStatus::Aborted);
        assert_eq!(s.snapshot().status, RunStatus::Aborted);
        assert_eq!(dev.calls().last(), Some(&DeviceCall::ProbeOff));
    }

    #[tokio::test]
    async fn rejected_while_running() {
        let s = session(8);
        s.begin_survey().unwrap();
        let dev = SimulatedDevice::new(8);
        let err = ContactSurvey::new(s).survey(&dev).await;
        assert!(matches!(err, Err(GeoError::AlreadyRunning)));
        assert!(dev.calls().is_empty());
    }
}
