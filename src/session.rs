//! Run session state.
//!
//! A [`RunSession`] is shared (`Arc`) between the acquisition worker, which is its only
//! writer during a run, and the presentation side, which polls [`RunSession::snapshot`] and
//! may call [`RunSession::request_abort`] at any time.
//!
//! ## Lifecycle
//!
//! - **`load_plan`**: validates the plan against the device probe count, resets every cell
//!   to `Unmeasured` in plan order, resets the resistance range, clears the log and the abort
//!   flag. Rejected without any mutation on mismatch or while a run is active.
//! - **`begin_run` / `finish_run`**: bracket one acquisition. Only one run can be active.
//! - **`set_tunables`**: rejected while a run is active.

use crate::error::{ConfigurationError, GeoError};
use crate::plan::{CellId, MeasurementPlan};
use crate::results::{CellState, ResistanceRange};
use crate::tunables::DeviceTunables;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// Overall state of the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// No run since the plan was loaded
    #[default]
    Idle,
    /// Acquisition worker active
    Running,
    /// Last run went through every cell
    Success,
    /// Last run stopped on operator request
    Aborted,
}

impl RunStatus {
    /// Value of `measurement_status` in result files.
    pub fn as_file_status(&self) -> &'static str {
        match self {
            RunStatus::Aborted => "aborted",
            _ => "success",
        }
    }
}

/// Contact resistance between two adjacent electrodes.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ContactReading {
    pub p1: u32,
    pub p2: u32,
    /// `(V + S) / I`, NaN when undefined
    pub resistance: f64,
    pub voltage: f64,
    pub current: f64,
}

/// Point-in-time copy of the session for the presentation side.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub results: Vec<(CellId, CellState)>,
    pub running: bool,
    pub status: RunStatus,
    pub log: String,
    pub resistance_range: ResistanceRange,
    pub contacts: Vec<ContactReading>,
    pub run_id: Option<Uuid>,
    pub started_at: Option<DateTime<Utc>>,
    pub tunables: DeviceTunables,
}

impl SessionSnapshot {
    /// Cells that hold a result or an undefined verdict.
    pub fn completed(&self) -> usize {
        self.results
            .iter()
            .filter(|(_, s)| !matches!(s, CellState::Unmeasured))
            .count()
    }
}

#[derive(Default)]
struct SessionState {
    plan: Option<Arc<MeasurementPlan>>,
    results: Vec<(CellId, CellState)>,
    range: ResistanceRange,
    status: RunStatus,
    log: String,
    tunables: DeviceTunables,
    contacts: Vec<ContactReading>,
    run_id: Option<Uuid>,
    started_at: Option<DateTime<Utc>>,
}

/// Shared state of one operator session.
pub struct RunSession {
    device_nprobe: u32,
    running: AtomicBool,
    abort: AtomicBool,
    state: RwLock<SessionState>,
}

impl RunSession {
    /// Empty session for a device with `device_nprobe` electrodes.
    pub fn new(device_nprobe: u32, tunables: DeviceTunables) -> Self {
        Self {
            device_nprobe,
            running: AtomicBool::new(false),
            abort: AtomicBool::new(false),
            state: RwLock::new(SessionState {
                tunables,
                ..Default::default()
            }),
        }
    }

    /// Probe count of the attached device.
    pub fn device_nprobe(&self) -> u32 {
        self.device_nprobe
    }

    /// Install a plan and reset results.
    pub fn load_plan(&self, plan: MeasurementPlan) -> Result<(), ConfigurationError> {
        if self.is_running() {
            return Err(ConfigurationError::SessionBusy);
        }
        if plan.nprobe() != self.device_nprobe {
            return Err(ConfigurationError::ProbeCountMismatch {
                plan: plan.nprobe(),
                device: self.device_nprobe,
            });
        }

        let mut state = self.state.write();
        if self.is_running() {
            return Err(ConfigurationError::SessionBusy);
        }
        let mut tunables = state.tunables.clone();
        if let Some(overrides) = plan.overrides() {
            tunables.apply(overrides);
            tunables.validate()?;
        }

        state.results = plan
            .cells()
            .iter()
            .map(|c| (c.id.clone(), CellState::Unmeasured))
            .collect();
        state.range = ResistanceRange::default();
        state.status = RunStatus::Idle;
        state.log.clear();
        state.contacts.clear();
        state.run_id = None;
        state.started_at = None;
        state.tunables = tunables;
        state.plan = Some(Arc::new(plan));
        self.abort.store(false, Ordering::SeqCst);

        tracing::info!(cells = state.results.len(), nprobe = self.device_nprobe, "Plan loaded");
        Ok(())
    }

    /// The loaded plan.
    pub fn plan(&self) -> Option<Arc<MeasurementPlan>> {
        self.state.read().plan.clone()
    }

    /// Ask the worker to stop at its next check point. Idempotent.
    pub fn request_abort(&self) {
        if !self.abort.swap(true, Ordering::SeqCst) {
            tracing::info!("Abort requested");
        }
    }

    /// Whether an abort is pending.
    pub fn abort_requested(&self) -> bool {
        self.abort.load(Ordering::SeqCst)
    }

    /// Whether a run is active.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Append one line to the operator log.
    pub fn append_log(&self, line: impl AsRef<str>) {
        let mut state = self.state.write();
        state.log.push_str(line.as_ref());
        state.log.push('\n');
    }

    /// Log text starting at byte `offset`, plus the new end offset.
    pub fn log_since(&self, offset: usize) -> (String, usize) {
        let state = self.state.read();
        let text = state.log.get(offset..).unwrap_or_default().to_string();
        (text, state.log.len())
    }

    /// Current tunables.
    pub fn tunables(&self) -> DeviceTunables {
        self.state.read().tunables.clone()
    }

    /// Replace tunables between runs.
    pub fn set_tunables(&self, tunables: DeviceTunables) -> Result<(), ConfigurationError> {
        if self.is_running() {
            return Err(ConfigurationError::SessionBusy);
        }
        tunables.validate()?;
        let mut state = self.state.write();
        // A run may have started between the check and the lock
        if self.is_running() {
            return Err(ConfigurationError::SessionBusy);
        }
        state.tunables = tunables;
        Ok(())
    }

    /// Claim the session for a plan acquisition and reset results for it.
    pub fn begin_run(&self) -> Result<Arc<MeasurementPlan>, GeoError> {
        self.claim()?;

        // load_plan is refused from here on, so the plan read below is the one measured
        let mut state = self.state.write();
        let Some(plan) = state.plan.clone() else {
            drop(state);
            self.running.store(false, Ordering::SeqCst);
            return Err(GeoError::NoPlan);
        };
        let id = Uuid::new_v4();
        for (_, cell) in state.results.iter_mut() {
            *cell = CellState::Unmeasured;
        }
        state.range = ResistanceRange::default();
        state.status = RunStatus::Running;
        state.run_id = Some(id);
        state.started_at = Some(Utc::now());
        drop(state);

        tracing::info!(run_id = %id, cells = plan.len(), "Run started");
        Ok(plan)
    }

    /// Claim the session for a contact survey.
    pub fn begin_survey(&self) -> Result<(), GeoError> {
        self.claim()?;
        let mut state = self.state.write();
        state.contacts.clear();
        state.status = RunStatus::Running;
        state.run_id = Some(Uuid::new_v4());
        state.started_at = Some(Utc::now());
        Ok(())
    }

    fn claim(&self) -> Result<(), GeoError> {
        self.running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| GeoError::AlreadyRunning)?;
        self.abort.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Store the state of the cell at plan position `index`.
    pub fn record(&self, index: usize, cell: CellState) {
        let mut state = self.state.write();
        if let Some(resistance) = cell.resistance() {
            state.range.update(resistance);
        }
        if let Some(slot) = state.results.get_mut(index) {
            slot.1 = cell;
        }
    }

    /// Store one contact survey reading.
    pub fn record_contact(&self, reading: ContactReading) {
        self.state.write().contacts.push(reading);
    }

    /// Release the session after cleanup.
    ///
    /// Returns the final state, taken before the session accepts a new plan or new
    /// tunables, so it is what result files are written from.
    pub fn finish_run(&self, status: RunStatus) -> SessionSnapshot {
        let mut state = self.state.write();
        state.status = status;
        let final_state = Self::copy_state(&state, false);
        self.running.store(false, Ordering::SeqCst);
        drop(state);
        tracing::info!(?status, "Run finished");
        final_state
    }

    /// Copy of everything the presentation side renders.
    pub fn snapshot(&self) -> SessionSnapshot {
        let state = self.state.read();
        Self::copy_state(&state, self.is_running())
    }

    fn copy_state(state: &SessionState, running: bool) -> SessionSnapshot {
        SessionSnapshot {
            results: state.results.clone(),
            running,
            status: state.status,
            log: state.log.clone(),
            resistance_range: state.range,
            contacts: state.contacts.clone(),
            run_id: state.run_id,
            started_at: state.started_at,
            tunables: state.tunables.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::results::{MeasurementResult, UndefinedReason};

    fn session() -> RunSession {
        RunSession::new(16, DeviceTunables::default())
    }

    #[test]
    fn load_plan_resets_cells_in_plan_order() {
        let s = session();
        let plan = MeasurementPlan::wenner(16, 2).unwrap();
        let first = plan.cells()[0].id.clone();
        s.append_log("old");
        s.load_plan(plan).unwrap();

        let snap = s.snapshot();
        assert_eq!(snap.results.len(), 23);
        assert_eq!(snap.results[0].0, first);
        assert!(snap
            .results
            .iter()
            .all(|(_, c)| *c == CellState::Unmeasured));
        assert!(snap.log.is_empty());
        assert!(snap.resistance_range.is_empty());
    }

    #[test]
    fn mismatched_plan_leaves_session_untouched() {
        let s = session();
        s.load_plan(MeasurementPlan::wenner(16, 1).unwrap()).unwrap();
        s.append_log("kept");

        let err = s.load_plan(MeasurementPlan::wenner(8, 1).unwrap());
        assert_eq!(
            err,
            Err(ConfigurationError::ProbeCountMismatch { plan: 8, device: 16 })
        );
        let snap = s.snapshot();
        assert_eq!(snap.results.len(), 13);
        assert_eq!(snap.log, "kept\n");
    }

    #[test]
    fn plan_overrides_apply_on_load() {
        let s = session();
        let plan = MeasurementPlan::from_json(
            r#"{"nprobe": 16, "conf": [[0, [1, 4, 2, 3]]],
                "device_configuration": {"max_measurement_try": 3}}"#,
        )
        .unwrap();
        s.load_plan(plan).unwrap();
        assert_eq!(s.tunables().max_measurement_try, 3);
    }

    #[test]
    fn abort_is_idempotent() {
        let s = session();
        s.request_abort();
        s.request_abort();
        assert!(s.abort_requested());
        s.load_plan(MeasurementPlan::wenner(16, 1).unwrap()).unwrap();
        assert!(!s.abort_requested());
    }

    #[test]
    fn second_run_is_rejected_and_tunables_are_locked() {
        let s = session();
        assert!(matches!(s.begin_run(), Err(GeoError::NoPlan)));

        s.load_plan(MeasurementPlan::wenner(16, 1).unwrap()).unwrap();
        s.begin_run().unwrap();
        assert!(matches!(s.begin_run(), Err(GeoError::AlreadyRunning)));
        assert_eq!(
            s.set_tunables(DeviceTunables::default()),
            Err(ConfigurationError::SessionBusy)
        );
        assert_eq!(
            s.load_plan(MeasurementPlan::wenner(16, 1).unwrap()),
            Err(ConfigurationError::SessionBusy)
        );

        s.finish_run(RunStatus::Success);
        assert!(!s.is_running());
        assert!(s.set_tunables(DeviceTunables::default()).is_ok());
    }

    #[test]
    fn begin_run_without_plan_releases_the_claim() {
        let s = session();
        assert!(matches!(s.begin_run(), Err(GeoError::NoPlan)));
        assert!(!s.is_running());
        assert!(s.begin_survey().is_ok());
    }

    #[test]
    fn claimed_run_keeps_its_plan() {
        let s = session();
        s.load_plan(MeasurementPlan::wenner(16, 1).unwrap()).unwrap();
        let plan = s.begin_run().unwrap();
        assert_eq!(
            s.load_plan(MeasurementPlan::wenner(16, 2).unwrap()),
            Err(ConfigurationError::SessionBusy)
        );
        assert_eq!(plan.len(), 13);
        assert_eq!(s.snapshot().results.len(), 13);
        assert!(Arc::ptr_eq(&plan, &s.plan().unwrap()));
    }

    #[test]
    fn finished_state_is_unaffected_by_later_edits() {
        let s = session();
        s.load_plan(MeasurementPlan::wenner(16, 1).unwrap()).unwrap();
        s.begin_run().unwrap();
        s.record(0, CellState::Measured(MeasurementResult::from_readings(21.0, 2.0, 1.0)));

        let final_state = s.finish_run(RunStatus::Success);
        assert!(!final_state.running);
        assert_eq!(final_state.status, RunStatus::Success);

        s.set_tunables(DeviceTunables {
            filename_prefix: "line2-".to_string(),
            ..Default::default()
        })
        .unwrap();
        s.load_plan(MeasurementPlan::wenner(16, 2).unwrap()).unwrap();

        assert_eq!(final_state.tunables.filename_prefix, "data-");
        assert_eq!(final_state.results.len(), 13);
        assert!(matches!(final_state.results[0].1, CellState::Measured(_)));
        assert_eq!(s.snapshot().results.len(), 23);
    }

    #[test]
    fn range_tracks_valid_cells_only() {
        let s = session();
        s.load_plan(MeasurementPlan::wenner(16, 1).unwrap()).unwrap();
        s.begin_run().unwrap();
        s.record(0, CellState::Undefined(UndefinedReason::BadContact));
        s.record(1, CellState::Measured(MeasurementResult::from_readings(5.0, 0.0, 1.0)));
        assert!(s.snapshot().resistance_range.is_empty());

        s.record(2, CellState::Measured(MeasurementResult::from_readings(21.0, 2.0, 1.0)));
        assert_eq!(s.snapshot().resistance_range.bounds(), Some((10.0, 10.0)));
        assert_eq!(s.snapshot().completed(), 3);
    }

    #[test]
    fn log_since_returns_only_new_text() {
        let s = session();
        s.append_log("one");
        let (text, offset) = s.log_since(0);
        assert_eq!(text, "one\n");
        s.append_log("two");
        let (text, _) = s.log_since(offset);
        assert_eq!(text, "two\n");
    }
}
