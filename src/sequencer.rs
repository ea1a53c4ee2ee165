//! Acquisition sequencer: measures a plan cell by cell.
//!
//! # Per-cell state machine
//!
//! ```text
//!            ┌──────────── bad contact (retry budget left) ─────────────┐
//!            ▼                                                          │
//! ┌─────────────┐   ┌───────────────┐   ┌───────────┐   ┌────────────┐  │  ┌────────────┐
//! │ Discharging │──▶│ SelfPotential │──▶│ Injecting │──▶│ Regulating │──┴─▶│ Validating │──▶ Recorded
//! └─────────────┘   └───────────────┘   └───────────┘   └────────────┘     └────────────┘
//!        │ abort flag at the top of an attempt or of a regulation iteration
//!        └───────────────────────────────────────────────────────────────▶ Aborted
//! ```
//!
//! A sense voltage at or above `voltage_limit`, or a device fault, is a bad contact: the
//! cell is retried from `Discharging` until the retry counter exceeds
//! `max_measurement_try`, then recorded as undefined and the run moves on. The counter
//! starts from zero for every cell.
//!
//! After the last cell, or once an abort is observed, the cleanup sequence runs exactly
//! once: relays off, injection off, discharge to `injection_volt_low`, flush. Device
//! faults during cleanup are logged and never propagated.

use crate::device::Device;
use crate::error::GeoError;
use crate::plan::{MeasurementPlan, PlannedCell};
use crate::regulation::{regulate, RegulationStop};
use crate::results::{CellState, MeasurementResult, UndefinedReason};
use crate::session::{RunSession, RunStatus, SessionSnapshot};
use crate::tunables::{DeviceTunables, DischargeMode};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Phase of the cell being measured, for log context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellPhase {
    Discharging,
    SelfPotential,
    Injecting,
    Regulating,
    Validating,
}

impl fmt::Display for CellPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CellPhase::Discharging => "discharging",
            CellPhase::SelfPotential => "self-potential",
            CellPhase::Injecting => "injecting",
            CellPhase::Regulating => "regulating",
            CellPhase::Validating => "validating",
        };
        f.write_str(name)
    }
}

/// Summary of a finished run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    pub run_id: Option<Uuid>,
    pub status: RunStatus,
    /// Cells with a result, valid resistance or not
    pub measured: usize,
    /// Cells recorded as undefined
    pub undefined: usize,
    /// Cells never reached
    pub unmeasured: usize,
    /// Session state at release, with the tunables the run used
    pub final_state: SessionSnapshot,
}

/// Discharge target and PWM start level handed from one cell to the next.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Carry {
    discharge_target: f64,
    pwm: u32,
}

impl Carry {
    fn initial(tunables: &DeviceTunables) -> Self {
        Self {
            discharge_target: tunables.injection_volt_low,
            pwm: tunables.injection_low_pwm,
        }
    }
}

enum CellVerdict {
    Done,
    Aborted,
}

enum Attempt {
    Recorded(MeasurementResult),
    BadContact(String),
    Aborted,
}

/// Runs plans against a device, writing into a shared session.
pub struct Sequencer {
    session: Arc<RunSession>,
}

impl Sequencer {
    /// Sequencer bound to `session`.
    pub fn new(session: Arc<RunSession>) -> Self {
        Self { session }
    }

    /// Claim the session and measure the loaded plan.
    ///
    /// # Errors
    /// [`GeoError::NoPlan`] or [`GeoError::AlreadyRunning`]; nothing is sent to the
    /// device in either case.
    pub async fn acquire(&self, device: &dyn Device) -> Result<RunReport, GeoError> {
        let plan = self.session.begin_run()?;
        Ok(self.run(device, &plan).await)
    }

    /// Measure `plan` on a session already claimed with
    /// [`RunSession::begin_run`]. Always ends with cleanup and releases the session.
    pub async fn run(&self, device: &dyn Device, plan: &MeasurementPlan) -> RunReport {
        let tunables = self.session.tunables();
        let mut carry = Carry::initial(&tunables);
        self.note(format!(
            "acquisition: {} cells on {}",
            plan.len(),
            device.describe()
        ));

        let mut status = RunStatus::Success;
        for (index, cell) in plan.cells().iter().enumerate() {
            match self
                .measure_cell(device, &tunables, index, cell, &mut carry)
                .await
            {
                CellVerdict::Done => {}
                CellVerdict::Aborted => {
                    status = RunStatus::Aborted;
                    break;
                }
            }
        }

        self.cleanup(device).await;
        if status == RunStatus::Aborted {
            self.note("measurement aborted");
        }
        let final_state = self.session.finish_run(status);

        let mut report = RunReport {
            run_id: final_state.run_id,
            status,
            measured: 0,
            undefined: 0,
            unmeasured: 0,
            final_state: final_state.clone(),
        };
        for (_, state) in &final_state.results {
            match state {
                CellState::Measured(_) => report.measured += 1,
                CellState::Undefined(_) => report.undefined += 1,
                CellState::Unmeasured => report.unmeasured += 1,
            }
        }
        info!(
            status = ?report.status,
            measured = report.measured,
            undefined = report.undefined,
            unmeasured = report.unmeasured,
            "Acquisition complete"
        );
        report
    }

    async fn measure_cell(
        &self,
        device: &dyn Device,
        tunables: &DeviceTunables,
        index: usize,
        cell: &PlannedCell,
        carry: &mut Carry,
    ) -> CellVerdict {
        self.note(format!("probe conf: {}", cell.configuration));
        let mut retries = 0u32;
        let mut started = false;

        loop {
            if self.session.abort_requested() {
                if started {
                    self.session
                        .record(index, CellState::Undefined(UndefinedReason::Aborted));
                }
                return CellVerdict::Aborted;
            }
            started = true;

            match self.attempt(device, tunables, cell, carry).await {
                Attempt::Recorded(result) => {
                    self.session.record(index, CellState::Measured(result));
                    self.note(format!(
                        "R={:.2}Ohm V={:.3}mV C_inj={:.4}mA V_self={:.3}mV",
                        result.resistance,
                        result.measured_voltage,
                        result.measured_current,
                        result.self_potential
                    ));
                    return CellVerdict::Done;
                }
                Attempt::Aborted => {
                    self.session
                        .record(index, CellState::Undefined(UndefinedReason::Aborted));
                    return CellVerdict::Aborted;
                }
                Attempt::BadContact(reason) => {
                    retries += 1;
                    if retries > tunables.max_measurement_try {
                        self.note(format!(
                            "cell {} undefined after {} attempts ({})",
                            cell.id, retries, reason
                        ));
                        self.session
                            .record(index, CellState::Undefined(UndefinedReason::BadContact));
                        return CellVerdict::Done;
                    }
                    self.note(format!("bad probe contact ({}).. retrying..", reason));
                }
            }
        }
    }

    /// One pass through Discharging to Validating.
    async fn attempt(
        &self,
        device: &dyn Device,
        tunables: &DeviceTunables,
        cell: &PlannedCell,
        carry: &mut Carry,
    ) -> Attempt {
        let conf = &cell.configuration;

        // Discharging
        self.discharge(device, tunables, carry.discharge_target).await;

        // SelfPotential
        let sense = conf.sense_only();
        let sv = match self
            .step(CellPhase::SelfPotential, async {
                device.set_relay_pattern(&sense).await?;
                device.measure_voltage().await
            })
            .await
        {
            Some(sv) => sv,
            None => return Attempt::BadContact("V_self: device fault".to_string()),
        };
        if sv >= tunables.voltage_limit {
            return Attempt::BadContact(format!("V_self={:.3}mV", sv));
        }

        // Injecting
        let injected = self
            .step(CellPhase::Injecting, async {
                device.enable_injection(false).await?;
                device.set_relay_pattern(conf).await?;
                device.set_injection_level(carry.pwm).await?;
                device.enable_injection(true).await
            })
            .await;
        if injected.is_none() {
            return Attempt::BadContact("injection: device fault".to_string());
        }
        tokio::time::sleep(tunables.settle_interval()).await;

        // Regulating
        let outcome = regulate(device, tunables, carry.pwm, &self.session).await;
        debug!(stop = ?outcome.stop, pwm = outcome.pwm, "Regulation finished");

        // Validating
        let mv = match (outcome.stop, outcome.meter_voltage) {
            (RegulationStop::Aborted, _) => return Attempt::Aborted,
            (_, Some(mv)) if outcome.has_readings() => mv,
            _ => {
                self.probe_off_quietly(device).await;
                return Attempt::BadContact("regulation: device fault".to_string());
            }
        };
        if mv >= tunables.voltage_limit {
            self.probe_off_quietly(device).await;
            return Attempt::BadContact(format!("V={:.3}mV", mv));
        }

        if tunables.discharge_mode == DischargeMode::CarryForward
            && outcome.stop == RegulationStop::InBand
        {
            carry.discharge_target = outcome.injection_voltage;
            carry.pwm = outcome.pwm;
        }

        Attempt::Recorded(MeasurementResult::from_readings(mv, outcome.current, sv))
    }

    /// Injection off, relays off, discharge, settle.
    async fn discharge(&self, device: &dyn Device, tunables: &DeviceTunables, target: f64) {
        let reached = self
            .step(CellPhase::Discharging, async {
                device.enable_injection(false).await?;
                device.probe_off().await?;
                device.discharge(target).await
            })
            .await;
        if let Some(volt) = reached {
            self.session
                .append_log(format!("discharged: {:.3}V", volt));
        }
        tokio::time::sleep(tunables.settle_interval()).await;
    }

    /// Relays off, injection off, discharge to `injection_volt_low`, flush.
    ///
    /// Faults are logged and skipped; every step is attempted. Also run by the worker
    /// after a run that panicked partway.
    pub async fn cleanup(&self, device: &dyn Device) {
        let tunables = self.session.tunables();
        if let Err(e) = device.probe_off().await {
            warn!(error = %e, "Cleanup: probe off failed");
        }
        if let Err(e) = device.enable_injection(false).await {
            warn!(error = %e, "Cleanup: injection off failed");
        }
        match device.discharge(tunables.injection_volt_low).await {
            Ok(volt) => self.session.append_log(format!("discharged: {:.3}V", volt)),
            Err(e) => warn!(error = %e, "Cleanup: discharge failed"),
        }
        if let Err(e) = device.flush().await {
            warn!(error = %e, "Cleanup: flush failed");
        }
    }

    async fn probe_off_quietly(&self, device: &dyn Device) {
        if let Err(e) = device.probe_off().await {
            warn!(error = %e, "Probe off failed");
        }
    }

    /// Run one phase; a device fault is logged and reported as `None`.
    async fn step<T, F>(&self, phase: CellPhase, fut: F) -> Option<T>
    where
        F: std::future::Future<Output = crate::error::DeviceResult<T>>,
    {
        match fut.await {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(%phase, error = %e, "Device fault");
                self.session.append_log(format!("device fault while {}: {}", phase, e));
                None
            }
        }
    }

    fn note(&self, line: impl Into<String>) {
        let line = line.into();
        info!(target: "geoelec::acquisition", "{}", line);
        self.session.append_log(line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceCall, SimulatedDevice};
    use crate::plan::ElectrodeConfiguration;

    fn quick_tunables() -> DeviceTunables {
        DeviceTunables {
            settle_interval_ms: 0,
            max_measurement_try: 2,
            ..Default::default()
        }
    }

    fn setup(nprobe: u32, layers: u32) -> (Arc<RunSession>, SimulatedDevice) {
        let session = Arc::new(RunSession::new(nprobe, quick_tunables()));
        session
            .load_plan(MeasurementPlan::wenner(nprobe, layers).unwrap())
            .unwrap();
        (session, SimulatedDevice::new(nprobe))
    }

    #[tokio::test]
    async fn carry_forward_reuses_previous_pwm() {
        let (session, dev) = setup(8, 1);
        // Band needs ~24 mA: regulation climbs from 20 to 50 on the first cell
        let mut t = quick_tunables();
        t.current_band_low = 24.0;
        t.current_band_high = 30.0;
        session.set_tunables(t).unwrap();

        Sequencer::new(session.clone()).acquire(&dev).await.unwrap();

        let levels: Vec<u32> = dev
            .calls()
            .iter()
            .filter_map(|c| match c {
                DeviceCall::SetInjection(p) => Some(*p),
                _ => None,
            })
            .collect();
        assert_eq!(levels[0], 20);
        assert!(levels[1..].iter().all(|p| *p == 50));
        // Second cell needs no adjustment
        assert_eq!(dev.count(|c| matches!(c, DeviceCall::Increment(_))), 6);
    }

    #[tokio::test]
    async fn fixed_mode_restarts_from_low_pwm() {
        let (session, dev) = setup(8, 1);
        let mut t = quick_tunables();
        t.current_band_low = 24.0;
        t.current_band_high = 30.0;
        t.discharge_mode = DischargeMode::Fixed;
        session.set_tunables(t).unwrap();

        Sequencer::new(session.clone()).acquire(&dev).await.unwrap();

        assert!(dev.calls().iter().all(|c| match c {
            DeviceCall::SetInjection(p) => *p == 20,
            DeviceCall::Discharge(v) => *v == 15.0,
            _ => true,
        }));
    }

    #[tokio::test]
    async fn device_fault_on_self_potential_retries_then_undefined() {
        let (session, dev) = setup(8, 1);
        let bad = ElectrodeConfiguration::new(2, 5, 3, 4).unwrap();
        dev.fail_voltage(bad.sense_only(), u32::MAX);

        let report = Sequencer::new(session.clone()).acquire(&dev).await.unwrap();
        assert_eq!(report.status, RunStatus::Success);
        assert_eq!(report.undefined, 1);
        assert_eq!(report.measured, 4);
        // 1 + max_measurement_try attempts
        let sense_patterns = dev.count(|c| *c == DeviceCall::RelayPattern([0, 0, 3, 4]));
        assert_eq!(sense_patterns, 3);
    }

    #[tokio::test]
    async fn retry_budget_resets_per_cell() {
        let (session, dev) = setup(8, 1);
        // Two failures per cell: within a budget of 2 retries for each
        for cell in MeasurementPlan::wenner(8, 1).unwrap().cells() {
            dev.fail_voltage(cell.configuration.sense_only(), 2);
        }
        let report = Sequencer::new(session.clone()).acquire(&dev).await.unwrap();
        assert_eq!(report.measured, 5);
        assert_eq!(report.undefined, 0);
    }
}
