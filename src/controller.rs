//! Owns the device and runs acquisitions on a worker task.
//!
//! The device lives in a slot that is either idle (available for direct operator commands)
//! or handed to the worker for the duration of a run. When the worker finishes it gives
//! the device back; [`Controller::wait`] or the next operation reclaims it. Results are
//! persisted by the worker after cleanup, before the device is handed back.
//!
//! A panic inside a run is caught on the worker: the cleanup sequence still runs, the
//! session is released as aborted and the device returns to the slot. Only a panic during
//! that cleanup loses the device.

use crate::device::Device;
use crate::error::{AppResult, GeoError};
use crate::plan::MeasurementPlan;
use crate::sequencer::{RunReport, Sequencer};
use crate::session::{ContactReading, RunSession, RunStatus};
use crate::storage::{ResultFile, ResultStore};
use crate::survey::ContactSurvey;
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{MappedMutexGuard, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// What a finished worker produced.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerReport {
    Acquisition {
        report: RunReport,
        saved: Option<PathBuf>,
    },
    Survey {
        readings: Vec<ContactReading>,
        saved: Option<PathBuf>,
    },
}

/// Result of [`Controller::toggle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Toggle {
    Started,
    AbortRequested,
}

enum Job {
    Acquire(Arc<MeasurementPlan>),
    Survey,
}

/// The device always comes back; the report is `Err` with the panic message when the
/// run panicked.
type WorkerHandle = JoinHandle<(Box<dyn Device>, Result<WorkerReport, String>)>;

enum DeviceSlot {
    Idle(Box<dyn Device>),
    Busy(WorkerHandle),
    /// The worker panicked again while cleaning up and took the device with it
    Lost,
}

/// Front door for the shell: start, cancel and await runs, or borrow the idle device.
pub struct Controller {
    session: Arc<RunSession>,
    slot: Mutex<DeviceSlot>,
    store: Option<ResultStore>,
}

impl Controller {
    /// Controller owning `device`. Results are written through `store` when given.
    pub fn new(device: Box<dyn Device>, session: Arc<RunSession>, store: Option<ResultStore>) -> Self {
        Self {
            session,
            slot: Mutex::new(DeviceSlot::Idle(device)),
            store,
        }
    }

    /// The shared session.
    pub fn session(&self) -> &Arc<RunSession> {
        &self.session
    }

    /// Start measuring the loaded plan.
    ///
    /// # Errors
    /// [`GeoError::NoPlan`], or [`GeoError::AlreadyRunning`] while a run is active.
    pub async fn start_acquisition(&self) -> AppResult<()> {
        let mut slot = self.slot.lock().await;
        self.reclaim(&mut slot, false).await?;
        Self::ensure_idle(&slot)?;
        let plan = self.session.begin_run()?;
        let device = Self::take_idle(&mut slot)?;
        *slot = DeviceSlot::Busy(self.spawn(device, Job::Acquire(plan)));
        Ok(())
    }

    /// Start a contact resistance survey.
    pub async fn start_survey(&self) -> AppResult<()> {
        let mut slot = self.slot.lock().await;
        self.reclaim(&mut slot, false).await?;
        Self::ensure_idle(&slot)?;
        self.session.begin_survey()?;
        let device = Self::take_idle(&mut slot)?;
        *slot = DeviceSlot::Busy(self.spawn(device, Job::Survey));
        Ok(())
    }

    /// Start an acquisition, or request an abort if one is running.
    pub async fn toggle(&self) -> AppResult<Toggle> {
        if self.session.is_running() {
            self.session.request_abort();
            return Ok(Toggle::AbortRequested);
        }
        self.start_acquisition().await?;
        Ok(Toggle::Started)
    }

    /// Ask the running worker to stop.
    pub fn request_abort(&self) {
        self.session.request_abort();
    }

    /// Wait for the running worker, if any, and take the device back.
    ///
    /// # Errors
    /// [`GeoError::WorkerFailed`] if the run panicked. The session is marked aborted; the
    /// device is back in the slot unless its cleanup panicked as well.
    pub async fn wait(&self) -> AppResult<Option<WorkerReport>> {
        let mut slot = self.slot.lock().await;
        self.reclaim(&mut slot, true).await
    }

    /// Borrow the idle device for a direct command.
    ///
    /// # Errors
    /// [`GeoError::DeviceBusy`] while a run holds it.
    pub async fn device(&self) -> AppResult<MappedMutexGuard<'_, dyn Device>> {
        let mut slot = self.slot.lock().await;
        self.reclaim(&mut slot, false).await?;
        Self::ensure_idle(&slot).map_err(|e| match e {
            GeoError::AlreadyRunning => GeoError::DeviceBusy,
            other => other,
        })?;
        MutexGuard::try_map(slot, |slot| match slot {
            DeviceSlot::Idle(device) => Some(device.as_mut()),
            _ => None,
        })
        .map_err(|_| GeoError::DeviceBusy)
    }

    fn ensure_idle(slot: &DeviceSlot) -> AppResult<()> {
        match slot {
            DeviceSlot::Idle(_) => Ok(()),
            DeviceSlot::Busy(_) => Err(GeoError::AlreadyRunning),
            DeviceSlot::Lost => Err(GeoError::WorkerFailed(
                "device was lost with a failed worker".to_string(),
            )),
        }
    }

    fn take_idle(slot: &mut DeviceSlot) -> AppResult<Box<dyn Device>> {
        match std::mem::replace(slot, DeviceSlot::Lost) {
            DeviceSlot::Idle(device) => Ok(device),
            other => {
                *slot = other;
                Err(GeoError::AlreadyRunning)
            }
        }
    }

    /// Join the worker if it is done, or unconditionally when `block` is set.
    async fn reclaim(&self, slot: &mut DeviceSlot, block: bool) -> AppResult<Option<WorkerReport>> {
        let ready = matches!(slot, DeviceSlot::Busy(handle) if block || handle.is_finished());
        if !ready {
            return Ok(None);
        }
        let DeviceSlot::Busy(handle) = std::mem::replace(slot, DeviceSlot::Lost) else {
            return Ok(None);
        };
        match handle.await {
            Ok((device, Ok(report))) => {
                *slot = DeviceSlot::Idle(device);
                Ok(Some(report))
            }
            Ok((device, Err(message))) => {
                *slot = DeviceSlot::Idle(device);
                Err(GeoError::WorkerFailed(message))
            }
            Err(e) => {
                error!(error = %e, "Acquisition worker failed during cleanup");
                if self.session.is_running() {
                    self.session.append_log(format!("worker failed: {}", e));
                    self.session.finish_run(RunStatus::Aborted);
                }
                Err(GeoError::WorkerFailed(e.to_string()))
            }
        }
    }

    fn spawn(&self, device: Box<dyn Device>, job: Job) -> WorkerHandle {
        let session = self.session.clone();
        let store = self.store.clone();
        tokio::spawn(async move {
            let outcome = AssertUnwindSafe(run_job(device.as_ref(), &session, store.as_ref(), job))
                .catch_unwind()
                .await;
            let report = match outcome {
                Ok(report) => Ok(report),
                Err(payload) => {
                    let message = panic_message(payload.as_ref());
                    error!(error = %message, "Worker panicked, cleaning up");
                    session.append_log(format!("worker failed: {}", message));
                    Sequencer::new(session.clone()).cleanup(device.as_ref()).await;
                    if session.is_running() {
                        session.finish_run(RunStatus::Aborted);
                    }
                    Err(message)
                }
            };
            (device, report)
        })
    }
}

async fn run_job(
    device: &dyn Device,
    session: &Arc<RunSession>,
    store: Option<&ResultStore>,
    job: Job,
) -> WorkerReport {
    match job {
        Job::Acquire(plan) => {
            let report = Sequencer::new(session.clone()).run(device, &plan).await;
            let saved = match store {
                Some(store) => {
                    let file = ResultFile::from_snapshot(&report.final_state, &plan);
                    let prefix = &report.final_state.tunables.filename_prefix;
                    persist(session, store.save_results(prefix, &file).await)
                }
                None => None,
            };
            WorkerReport::Acquisition { report, saved }
        }
        Job::Survey => {
            let survey = ContactSurvey::new(session.clone()).run(device).await;
            let saved = match store {
                Some(store) => {
                    let prefix = &survey.final_state.tunables.filename_prefix;
                    persist(session, store.save_contacts(prefix, &survey.readings).await)
                }
                None => None,
            };
            WorkerReport::Survey {
                readings: survey.readings,
                saved,
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "worker panicked".to_string()
    }
}

fn persist(session: &RunSession, saved: AppResult<PathBuf>) -> Option<PathBuf> {
    match saved {
        Ok(path) => {
            info!(path = %path.display(), "Saved");
            session.append_log(format!("saved: {}", path.display()));
            Some(path)
        }
        Err(e) => {
            warn!(error = %e, "Saving results failed");
            session.append_log(format!("saving failed: {}", e));
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceCall, SimulatedDevice};
    use crate::tunables::DeviceTunables;

    fn controller(dev: &SimulatedDevice, store: Option<ResultStore>) -> Controller {
        let tunables = DeviceTunables {
            settle_interval_ms: 0,
            ..Default::default()
        };
        let session = Arc::new(RunSession::new(8, tunables));
        session
            .load_plan(MeasurementPlan::wenner(8, 1).unwrap())
            .unwrap();
        Controller::new(Box::new(dev.clone()), session, store)
    }

    #[tokio::test]
    async fn acquisition_runs_and_hands_device_back() {
        let dir = tempfile::tempdir().unwrap();
        let dev = SimulatedDevice::new(8);
        let ctl = controller(&dev, Some(ResultStore::new(dir.path())));

        ctl.start_acquisition().await.unwrap();
        let report = ctl.wait().await.unwrap();
        let Some(WorkerReport::Acquisition { report, saved }) = report else {
            panic!("expected an acquisition report");
        };
        assert_eq!(report.status, RunStatus::Success);
        assert_eq!(report.measured, 5);
        assert_eq!(report.final_state.status, RunStatus::Success);
        assert!(!report.final_state.running);
        let saved = saved.unwrap();
        assert!(saved.starts_with(dir.path()));
        let name = saved.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with(&report.final_state.tunables.filename_prefix));
        assert!(ctl.session().snapshot().log.contains("saved: "));

        ctl.device().await.unwrap().flush().await.unwrap();
        assert_eq!(dev.calls().last(), Some(&DeviceCall::Flush));
    }

    #[tokio::test]
    async fn device_is_busy_and_toggle_aborts_during_a_run() {
        let dev = SimulatedDevice::new(8);
        let ctl = controller(&dev, None);

        assert_eq!(ctl.toggle().await.unwrap(), Toggle::Started);
        assert!(matches!(ctl.device().await, Err(GeoError::DeviceBusy)));
        assert!(matches!(
            ctl.start_acquisition().await,
            Err(GeoError::AlreadyRunning)
        ));
        assert_eq!(ctl.toggle().await.unwrap(), Toggle::AbortRequested);

        let Some(WorkerReport::Acquisition { report, saved }) = ctl.wait().await.unwrap() else {
            panic!("expected an acquisition report");
        };
        assert_eq!(report.status, RunStatus::Aborted);
        assert_eq!(report.unmeasured, 5);
        assert!(saved.is_none());
        assert!(ctl.device().await.is_ok());
    }

    #[tokio::test]
    async fn panicking_worker_marks_session_aborted() {
        let dev = SimulatedDevice::new(8);
        dev.set_hook(|call| {
            if matches!(call, DeviceCall::MeasureVoltage) {
                panic!("board exploded");
            }
        });
        let ctl = controller(&dev, None);

        ctl.start_acquisition().await.unwrap();
        let err = ctl.wait().await.unwrap_err();
        assert!(matches!(err, GeoError::WorkerFailed(ref m) if m.contains("board exploded")));
        let snap = ctl.session().snapshot();
        assert!(!snap.running);
        assert_eq!(snap.status, RunStatus::Aborted);
        assert!(snap.log.contains("worker failed: board exploded"));
        assert!(ctl.device().await.is_ok());
    }

    #[tokio::test]
    async fn panicking_worker_still_runs_cleanup() {
        let dev = SimulatedDevice::new(8);
        dev.set_hook(|call| {
            if matches!(call, DeviceCall::MeasureVoltage) {
                panic!("board exploded");
            }
        });
        let ctl = controller(&dev, None);

        ctl.start_acquisition().await.unwrap();
        assert!(ctl.wait().await.is_err());

        let calls = dev.calls();
        let failed_at = calls
            .iter()
            .position(|c| *c == DeviceCall::MeasureVoltage)
            .unwrap();
        assert_eq!(
            calls[failed_at + 1..],
            [
                DeviceCall::ProbeOff,
                DeviceCall::EnableInjection(false),
                DeviceCall::Discharge(15.0),
                DeviceCall::Flush,
            ]
        );
        assert_eq!(dev.count(|c| *c == DeviceCall::Flush), 1);
    }

    #[tokio::test]
    async fn panic_during_cleanup_loses_the_device() {
        let dev = SimulatedDevice::new(8);
        dev.set_hook(|call| {
            if matches!(call, DeviceCall::ProbeOff) {
                panic!("relay driver stuck");
            }
        });
        let ctl = controller(&dev, None);

        ctl.start_acquisition().await.unwrap();
        assert!(matches!(ctl.wait().await, Err(GeoError::WorkerFailed(_))));
        let snap = ctl.session().snapshot();
        assert!(!snap.running);
        assert_eq!(snap.status, RunStatus::Aborted);
        assert!(matches!(ctl.device().await, Err(GeoError::WorkerFailed(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn survey_runs_on_the_worker() {
        let dev = SimulatedDevice::new(8);
        let ctl = controller(&dev, None);
        ctl.start_survey().await.unwrap();
        let Some(WorkerReport::Survey { readings, .. }) = ctl.wait().await.unwrap() else {
            panic!("expected a survey report");
        };
        assert_eq!(readings.len(), 7);
    }
}
