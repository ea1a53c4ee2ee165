//! End-to-end acquisition runs against the simulated board.

use geoelec_daq::device::{DeviceCall, SimulatedDevice};
use geoelec_daq::error::{ConfigurationError, GeoError};
use geoelec_daq::plan::MeasurementPlan;
use geoelec_daq::results::{CellState, UndefinedReason};
use geoelec_daq::sequencer::Sequencer;
use geoelec_daq::session::{RunSession, RunStatus};
use geoelec_daq::storage::ResultFile;
use geoelec_daq::tunables::{DeviceTunables, DischargeMode};
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

fn tunables() -> DeviceTunables {
    DeviceTunables {
        settle_interval_ms: 0,
        max_measurement_try: 2,
        ..Default::default()
    }
}

fn plan(nprobe: u32, confs: &[[u32; 4]]) -> MeasurementPlan {
    let conf: Vec<_> = confs
        .iter()
        .enumerate()
        .map(|(i, c)| json!([i, c]))
        .collect();
    MeasurementPlan::from_json(&json!({ "nprobe": nprobe, "conf": conf }).to_string()).unwrap()
}

fn five_cells() -> MeasurementPlan {
    plan(
        16,
        &[
            [1, 4, 2, 3],
            [2, 5, 3, 4],
            [3, 6, 4, 5],
            [4, 7, 5, 6],
            [5, 8, 6, 7],
        ],
    )
}

fn session_with(plan: MeasurementPlan, tunables: DeviceTunables) -> Arc<RunSession> {
    let session = Arc::new(RunSession::new(plan.nprobe(), tunables));
    session.load_plan(plan).unwrap();
    session
}

/// Calls making up the end-of-run cleanup.
fn cleanup_tail(volt_low: f64) -> [DeviceCall; 4] {
    [
        DeviceCall::ProbeOff,
        DeviceCall::EnableInjection(false),
        DeviceCall::Discharge(volt_low),
        DeviceCall::Flush,
    ]
}

fn ends_with_cleanup(dev: &SimulatedDevice) -> bool {
    let calls = dev.calls();
    calls.len() >= 4 && calls[calls.len() - 4..] == cleanup_tail(15.0)
}

#[tokio::test]
async fn scenario_a_all_cells_succeed_first_try() {
    let session = session_with(plan(8, &[[1, 4, 2, 3], [2, 5, 3, 4], [3, 6, 4, 5]]), tunables());
    let dev = SimulatedDevice::new(8);

    let report = Sequencer::new(session.clone()).acquire(&dev).await.unwrap();
    assert_eq!(report.status, RunStatus::Success);
    assert_eq!(report.measured, 3);

    let snap = session.snapshot();
    assert_eq!(snap.results.len(), 3);
    for (_, cell) in &snap.results {
        // 10 mA through 50 ohm transfer resistance
        let r = cell.resistance().unwrap();
        assert!((r - 50.0).abs() < 1e-9);
    }
    assert_eq!(snap.resistance_range.bounds(), Some((50.0, 50.0)));
    // no retries: one self-potential read and one meter read per cell
    assert_eq!(dev.count(|c| *c == DeviceCall::MeasureVoltage), 6);
    assert_eq!(dev.count(|c| *c == DeviceCall::Flush), 1);
    assert!(ends_with_cleanup(&dev));
}

#[test]
fn scenario_b_probe_count_mismatch_is_rejected() {
    tokio_test::block_on(async {
        let dev = SimulatedDevice::new(16);
        let session = Arc::new(RunSession::new(16, tunables()));
        session.load_plan(five_cells()).unwrap();
        session.append_log("before");

        let err = session.load_plan(plan(8, &[[1, 4, 2, 3]]));
        assert_eq!(
            err,
            Err(ConfigurationError::ProbeCountMismatch { plan: 8, device: 16 })
        );

        let snap = session.snapshot();
        assert_eq!(snap.results.len(), 5);
        assert_eq!(snap.log, "before\n");
        assert_eq!(snap.status, RunStatus::Idle);
        assert!(dev.calls().is_empty());
    });
}

#[tokio::test]
async fn scenario_c_high_self_potential_exhausts_retries() {
    let session = session_with(plan(8, &[[1, 4, 2, 3], [2, 5, 3, 4], [3, 6, 4, 5]]), tunables());
    let dev = SimulatedDevice::new(8);
    dev.set_self_potential(3, 4, 5000.0);

    let report = Sequencer::new(session.clone()).acquire(&dev).await.unwrap();
    assert_eq!(report.status, RunStatus::Success);
    assert_eq!(report.measured, 2);
    assert_eq!(report.undefined, 1);

    let snap = session.snapshot();
    assert_eq!(
        snap.results[1].1,
        CellState::Undefined(UndefinedReason::BadContact)
    );
    assert!(matches!(snap.results[2].1, CellState::Measured(_)));
    // 1 + max_measurement_try attempts, never reaching injection
    assert_eq!(dev.count(|c| *c == DeviceCall::RelayPattern([0, 0, 3, 4])), 3);
    assert_eq!(dev.count(|c| *c == DeviceCall::RelayPattern([2, 5, 3, 4])), 0);
    assert!(snap.log.contains("bad probe contact"));
}

#[tokio::test]
async fn meter_voltage_over_limit_is_a_bad_contact() {
    let session = session_with(plan(8, &[[1, 4, 2, 3], [2, 5, 3, 4]]), tunables());
    let dev = SimulatedDevice::new(8);
    // 10 mA through 1 kohm reads 10 V, above the 4966 mV limit
    dev.set_transfer_resistance(
        geoelec_daq::plan::ElectrodeConfiguration::new(1, 4, 2, 3).unwrap(),
        1000.0,
    );

    let report = Sequencer::new(session.clone()).acquire(&dev).await.unwrap();
    assert_eq!(report.status, RunStatus::Success);
    assert_eq!(report.undefined, 1);
    assert_eq!(report.measured, 1);

    let snap = session.snapshot();
    assert_eq!(
        snap.results[0].1,
        CellState::Undefined(UndefinedReason::BadContact)
    );
    assert!(matches!(snap.results[1].1, CellState::Measured(_)));
    assert!(snap.log.contains("bad probe contact (V="));

    // every attempt injects, reads the meter once and opens the relays right after
    let calls = dev.calls();
    let attempts: Vec<usize> = calls
        .iter()
        .enumerate()
        .filter(|(_, c)| **c == DeviceCall::RelayPattern([1, 4, 2, 3]))
        .map(|(i, _)| i)
        .collect();
    assert_eq!(attempts.len(), 3);
    for i in attempts {
        assert_eq!(
            calls[i + 1..i + 7],
            [
                DeviceCall::SetInjection(20),
                DeviceCall::EnableInjection(true),
                DeviceCall::MeasureCurrent,
                DeviceCall::MeasureInjectionVoltage,
                DeviceCall::MeasureVoltage,
                DeviceCall::ProbeOff,
            ]
        );
    }
    // three attempts on the bad cell, one on the next
    assert_eq!(dev.count(|c| *c == DeviceCall::EnableInjection(true)), 4);
}

/// Aborts as soon as regulation raises the PWM while `target` is connected.
fn abort_on_regulation(dev: &SimulatedDevice, session: &Arc<RunSession>, target: [u32; 4], times: usize) {
    let on_target = AtomicBool::new(false);
    let session = session.clone();
    dev.set_hook(move |call| match call {
        DeviceCall::RelayPattern(p) => on_target.store(*p == target, Ordering::SeqCst),
        DeviceCall::Increment(_) if on_target.load(Ordering::SeqCst) => {
            for _ in 0..times {
                session.request_abort();
            }
        }
        _ => {}
    });
}

fn regulating_tunables() -> DeviceTunables {
    // 20 PWM gives 10 mA: every cell needs one step up
    DeviceTunables {
        current_band_low: 12.0,
        current_band_high: 30.0,
        discharge_mode: DischargeMode::Fixed,
        ..tunables()
    }
}

#[tokio::test]
async fn scenario_d_abort_mid_regulation() {
    let session = session_with(five_cells(), regulating_tunables());
    let dev = SimulatedDevice::new(16);
    abort_on_regulation(&dev, &session, [2, 5, 3, 4], 1);

    let report = Sequencer::new(session.clone()).acquire(&dev).await.unwrap();
    assert_eq!(report.status, RunStatus::Aborted);

    let snap = session.snapshot();
    assert!(matches!(snap.results[0].1, CellState::Measured(_)));
    assert_eq!(
        snap.results[1].1,
        CellState::Undefined(UndefinedReason::Aborted)
    );
    for (_, cell) in &snap.results[2..] {
        assert_eq!(*cell, CellState::Unmeasured);
    }
    assert!(!snap.running);
    assert_eq!(dev.count(|c| *c == DeviceCall::Flush), 1);
    assert!(ends_with_cleanup(&dev));
    // the abort was seen before another PWM step
    assert_eq!(dev.count(|c| matches!(c, DeviceCall::Increment(_))), 2);

    let file = serde_json::to_value(ResultFile::from_snapshot(&snap, &five_cells())).unwrap();
    assert_eq!(file["measurement_status"], "aborted");
    assert_eq!(file["data"][1][1], serde_json::Value::Null);
    assert_eq!(file["data"][4][1], serde_json::Value::Null);
}

#[tokio::test]
async fn repeated_abort_requests_act_like_one() {
    let once = session_with(five_cells(), regulating_tunables());
    let dev_once = SimulatedDevice::new(16);
    abort_on_regulation(&dev_once, &once, [3, 6, 4, 5], 1);
    Sequencer::new(once.clone()).acquire(&dev_once).await.unwrap();

    let thrice = session_with(five_cells(), regulating_tunables());
    let dev_thrice = SimulatedDevice::new(16);
    abort_on_regulation(&dev_thrice, &thrice, [3, 6, 4, 5], 3);
    Sequencer::new(thrice.clone()).acquire(&dev_thrice).await.unwrap();

    assert_eq!(dev_once.calls(), dev_thrice.calls());
    assert_eq!(once.snapshot().results, thrice.snapshot().results);
    assert_eq!(thrice.snapshot().status, RunStatus::Aborted);
}

#[tokio::test]
async fn abort_before_start_measures_nothing() {
    let session = session_with(five_cells(), tunables());
    let dev = SimulatedDevice::new(16);
    let plan = session.begin_run().unwrap();
    session.request_abort();

    let report = Sequencer::new(session.clone()).run(&dev, &plan).await;
    assert_eq!(report.status, RunStatus::Aborted);
    assert_eq!(report.unmeasured, 5);
    // nothing but the cleanup reached the board
    assert_eq!(dev.calls(), cleanup_tail(15.0).to_vec());
}

#[tokio::test]
async fn fault_on_last_cell_still_cleans_up_once() {
    let session = session_with(five_cells(), tunables());
    let dev = SimulatedDevice::new(16);
    dev.fail_voltage(
        geoelec_daq::plan::ElectrodeConfiguration::new(0, 0, 6, 7).unwrap(),
        u32::MAX,
    );

    let report = Sequencer::new(session.clone()).acquire(&dev).await.unwrap();
    assert_eq!(report.status, RunStatus::Success);
    assert_eq!(report.measured, 4);
    assert_eq!(
        session.snapshot().results[4].1,
        CellState::Undefined(UndefinedReason::BadContact)
    );
    assert_eq!(dev.count(|c| *c == DeviceCall::Flush), 1);
    assert!(ends_with_cleanup(&dev));
}

#[tokio::test]
async fn zero_current_records_undefined_resistance() {
    let t = DeviceTunables {
        injection_max_try: 3,
        ..tunables()
    };
    let session = session_with(plan(8, &[[1, 4, 2, 3]]), t);
    let dev = SimulatedDevice::new(8);
    // initial read plus injection_max_try + 1 adjustments
    dev.script_current(vec![0.0; 5]);

    let report = Sequencer::new(session.clone()).acquire(&dev).await.unwrap();
    assert_eq!(report.measured, 1);

    let snap = session.snapshot();
    let result = *snap.results[0].1.result().unwrap();
    assert_eq!(result.measured_current, 0.0);
    assert!(result.resistance.is_nan());
    // no valid cell: range keeps its sentinels
    assert_eq!(snap.resistance_range.min, f64::INFINITY);
    assert_eq!(snap.resistance_range.max, f64::NEG_INFINITY);
    assert!(snap.log.contains("max try number reached"));
}

#[tokio::test]
async fn resistance_is_never_negative() {
    let session = session_with(plan(8, &[[1, 4, 2, 3], [2, 5, 3, 4]]), tunables());
    let dev = SimulatedDevice::new(8);
    // sense voltage drops below the self-potential under injection
    dev.set_self_potential(2, 3, 400.0);
    dev.set_transfer_resistance(
        geoelec_daq::plan::ElectrodeConfiguration::new(1, 4, 2, 3).unwrap(),
        -30.0,
    );

    Sequencer::new(session.clone()).acquire(&dev).await.unwrap();
    let snap = session.snapshot();
    let first = snap.results[0].1.resistance().unwrap();
    assert!((first - 30.0).abs() < 1e-9);
    assert!(snap
        .results
        .iter()
        .filter_map(|(_, c)| c.resistance())
        .all(|r| r >= 0.0));
}

#[test]
fn equal_injection_electrodes_never_reach_the_device() {
    let dev = SimulatedDevice::new(8);
    let err = MeasurementPlan::from_json(r#"{"nprobe": 8, "conf": [[0, [3, 3, 1, 2]]]}"#);
    assert!(err.is_err());
    assert!(matches!(
        geoelec_daq::plan::ElectrodeConfiguration::new(3, 3, 1, 2),
        Err(ConfigurationError::EqualInjectionElectrodes(3))
    ));
    assert!(dev.calls().is_empty());
}

#[tokio::test]
async fn second_start_is_rejected_while_running() {
    let session = session_with(five_cells(), tunables());
    let dev = SimulatedDevice::new(16);
    session.begin_run().unwrap();
    let err = Sequencer::new(session.clone()).acquire(&dev).await;
    assert!(matches!(err, Err(GeoError::AlreadyRunning)));
    assert!(dev.calls().is_empty());
}
