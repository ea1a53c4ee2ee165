//! Deterministic in-memory model of the IGF-02 board.
//!
//! The model is deliberately simple:
//!
//! - injection voltage follows the PWM level (`volts_per_pwm`) while the source is on and
//!   holds its value when it is switched off, until [`discharge`](Device::discharge)
//! - injection current is `injection voltage / contact resistance` of the `(pm, pp)` pair
//! - sense voltage is the self-potential of the `(vm, vp)` pair plus
//!   `current * transfer resistance` of the full configuration
//!
//! Every command is appended to a call log. Tests can script readings, make the sense
//! voltage fail for a configuration, and install a hook that runs after each call (used to
//! request an abort at a precise point of a run).
//!
//! Clones share state, so a test can keep a handle while the acquisition worker owns
//! another.

use super::Device;
use crate::error::{DeviceFault, DeviceResult};
use crate::plan::ElectrodeConfiguration;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

/// One command received by the simulator.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceCall {
    RelayPattern([u32; 4]),
    SetInjection(u32),
    Increment(u32),
    Decrement(u32),
    EnableInjection(bool),
    MeasureVoltage,
    MeasureCurrent,
    MeasureInjectionVoltage,
    MeasureShunt,
    ProbeOff,
    Discharge(f64),
    Flush,
    ShiftRelays,
    SetAveraging(u32),
    SetCalibration(f64, f64),
    Raw(String),
}

/// A scripted reading: a value, or a timeout.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScriptedReading {
    Value(f64),
    Fault,
}

impl From<f64> for ScriptedReading {
    fn from(value: f64) -> Self {
        ScriptedReading::Value(value)
    }
}

/// Physical constants of the simulated ground and board.
#[derive(Debug, Clone, PartialEq)]
pub struct SimulatedModel {
    /// Injection voltage per PWM step (V)
    pub volts_per_pwm: f64,
    /// Highest PWM level the source accepts
    pub max_pwm: u32,
    /// PWM level the board drops to while discharging
    pub discharge_pwm: u32,
    /// Default electrode contact resistance between injection electrodes (ohm)
    pub contact_resistance: f64,
    /// Default transfer resistance of a configuration (ohm)
    pub transfer_resistance: f64,
    /// Default self-potential of a sense pair (mV)
    pub self_potential: f64,
    /// Shunt resistance (ohm); shunt reading is `current * shunt_resistance` in mV
    pub shunt_resistance: f64,
}

impl Default for SimulatedModel {
    fn default() -> Self {
        Self {
            volts_per_pwm: 1.0,
            max_pwm: 255,
            discharge_pwm: 5,
            contact_resistance: 2000.0,
            transfer_resistance: 50.0,
            self_potential: 2.0,
            shunt_resistance: 1.0,
        }
    }
}

type CallHook = Arc<dyn Fn(&DeviceCall) + Send + Sync>;

#[derive(Default)]
struct SimState {
    relay: [u32; 4],
    pwm: u32,
    injecting: bool,
    injection_volt: f64,
    calls: Vec<DeviceCall>,
    transfer: HashMap<[u32; 4], f64>,
    self_potential: HashMap<(u32, u32), f64>,
    contact: HashMap<(u32, u32), f64>,
    voltage_faults: HashMap<[u32; 4], u32>,
    current_script: VecDeque<ScriptedReading>,
    voltage_script: VecDeque<ScriptedReading>,
}

/// Simulated resistivity meter.
#[derive(Clone)]
pub struct SimulatedDevice {
    nprobe: u32,
    model: Arc<SimulatedModel>,
    state: Arc<Mutex<SimState>>,
    hook: Arc<Mutex<Option<CallHook>>>,
}

impl SimulatedDevice {
    /// Simulator with the default model.
    pub fn new(nprobe: u32) -> Self {
        Self::with_model(nprobe, SimulatedModel::default())
    }

    /// Simulator with a custom model.
    pub fn with_model(nprobe: u32, model: SimulatedModel) -> Self {
        Self {
            nprobe,
            model: Arc::new(model),
            state: Arc::new(Mutex::new(SimState::default())),
            hook: Arc::new(Mutex::new(None)),
        }
    }

    /// Transfer resistance for one configuration (ohm).
    pub fn set_transfer_resistance(&self, configuration: ElectrodeConfiguration, ohm: f64) {
        self.state.lock().transfer.insert(configuration.into(), ohm);
    }

    /// Self-potential for one sense pair (mV).
    pub fn set_self_potential(&self, vm: u32, vp: u32, millivolt: f64) {
        self.state.lock().self_potential.insert((vm, vp), millivolt);
    }

    /// Contact resistance for one injection pair (ohm).
    pub fn set_contact_resistance(&self, pm: u32, pp: u32, ohm: f64) {
        self.state.lock().contact.insert((pm, pp), ohm);
    }

    /// Make the next `times` voltage reads time out while `configuration` is connected.
    pub fn fail_voltage(&self, configuration: ElectrodeConfiguration, times: u32) {
        self.state
            .lock()
            .voltage_faults
            .insert(configuration.into(), times);
    }

    /// Queue current readings, consumed before the model is consulted.
    pub fn script_current<I, R>(&self, readings: I)
    where
        I: IntoIterator<Item = R>,
        R: Into<ScriptedReading>,
    {
        self.state
            .lock()
            .current_script
            .extend(readings.into_iter().map(Into::into));
    }

    /// Queue sense voltage readings, consumed before the model is consulted.
    pub fn script_voltage<I, R>(&self, readings: I)
    where
        I: IntoIterator<Item = R>,
        R: Into<ScriptedReading>,
    {
        self.state
            .lock()
            .voltage_script
            .extend(readings.into_iter().map(Into::into));
    }

    /// Run `hook` after every command.
    pub fn set_hook<F>(&self, hook: F)
    where
        F: Fn(&DeviceCall) + Send + Sync + 'static,
    {
        *self.hook.lock() = Some(Arc::new(hook));
    }

    /// Commands received so far.
    pub fn calls(&self) -> Vec<DeviceCall> {
        self.state.lock().calls.clone()
    }

    /// Forget the call log.
    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    /// Number of logged calls matching `predicate`.
    pub fn count<P>(&self, predicate: P) -> usize
    where
        P: Fn(&DeviceCall) -> bool,
    {
        self.state.lock().calls.iter().filter(|c| predicate(c)).count()
    }

    /// Current PWM level.
    pub fn pwm(&self) -> u32 {
        self.state.lock().pwm
    }

    /// Whether the current source is on.
    pub fn is_injecting(&self) -> bool {
        self.state.lock().injecting
    }

    fn record(&self, call: DeviceCall) {
        self.state.lock().calls.push(call.clone());
        let hook = self.hook.lock().clone();
        if let Some(hook) = hook {
            hook(&call);
        }
    }

    fn model_current(&self, state: &SimState) -> f64 {
        let [pm, pp, _, _] = state.relay;
        if !state.injecting || pm == 0 || pp == 0 {
            return 0.0;
        }
        let contact = state
            .contact
            .get(&(pm, pp))
            .copied()
            .unwrap_or(self.model.contact_resistance);
        if contact <= 0.0 {
            return 0.0;
        }
        state.injection_volt * 1000.0 / contact
    }

    fn apply_pwm(&self, state: &mut SimState, pwm: u32) {
        state.pwm = pwm.min(self.model.max_pwm);
        if state.injecting {
            state.injection_volt = f64::from(state.pwm) * self.model.volts_per_pwm;
        }
    }
}

#[async_trait]
impl Device for SimulatedDevice {
    fn nprobe(&self) -> u32 {
        self.nprobe
    }

    fn describe(&self) -> String {
        format!("simulated IGF-02 ({} probes)", self.nprobe)
    }

    async fn set_relay_pattern(&self, configuration: &ElectrodeConfiguration) -> DeviceResult<()> {
        configuration.check_range(self.nprobe)?;
        self.state.lock().relay = (*configuration).into();
        self.record(DeviceCall::RelayPattern((*configuration).into()));
        Ok(())
    }

    async fn set_injection_level(&self, pwm: u32) -> DeviceResult<()> {
        {
            let mut state = self.state.lock();
            self.apply_pwm(&mut state, pwm);
        }
        self.record(DeviceCall::SetInjection(pwm));
        Ok(())
    }

    async fn increment_injection(&self, n: u32) -> DeviceResult<u32> {
        let pwm = {
            let mut state = self.state.lock();
            let target = state.pwm.saturating_add(n);
            self.apply_pwm(&mut state, target);
            state.pwm
        };
        self.record(DeviceCall::Increment(n));
        Ok(pwm)
    }

    async fn decrement_injection(&self, n: u32) -> DeviceResult<u32> {
        let pwm = {
            let mut state = self.state.lock();
            let target = state.pwm.saturating_sub(n);
            self.apply_pwm(&mut state, target);
            state.pwm
        };
        self.record(DeviceCall::Decrement(n));
        Ok(pwm)
    }

    async fn enable_injection(&self, on: bool) -> DeviceResult<()> {
        {
            let mut state = self.state.lock();
            state.injecting = on;
            if on {
                state.injection_volt = f64::from(state.pwm) * self.model.volts_per_pwm;
            }
        }
        self.record(DeviceCall::EnableInjection(on));
        Ok(())
    }

    async fn measure_voltage(&self) -> DeviceResult<f64> {
        let reading = {
            let mut state = self.state.lock();
            let relay = state.relay;
            let faulted = match state.voltage_faults.get_mut(&relay) {
                Some(remaining) if *remaining > 0 => {
                    *remaining -= 1;
                    true
                }
                _ => false,
            };
            if faulted {
                ScriptedReading::Fault
            } else if let Some(scripted) = state.voltage_script.pop_front() {
                scripted
            } else {
                let [_, _, vm, vp] = relay;
                let sp = if vm == 0 && vp == 0 {
                    0.0
                } else {
                    state
                        .self_potential
                        .get(&(vm, vp))
                        .copied()
                        .unwrap_or(self.model.self_potential)
                };
                let transfer = state
                    .transfer
                    .get(&relay)
                    .copied()
                    .unwrap_or(self.model.transfer_resistance);
                ScriptedReading::Value(sp + self.model_current(&state) * transfer)
            }
        };
        self.record(DeviceCall::MeasureVoltage);
        match reading {
            ScriptedReading::Value(v) => Ok(v),
            ScriptedReading::Fault => Err(DeviceFault::Timeout {
                command: "V".to_string(),
                timeout_ms: 0,
            }),
        }
    }

    async fn measure_current(&self) -> DeviceResult<f64> {
        let reading = {
            let mut state = self.state.lock();
            match state.current_script.pop_front() {
                Some(scripted) => scripted,
                None => ScriptedReading::Value(self.model_current(&state)),
            }
        };
        self.record(DeviceCall::MeasureCurrent);
        match reading {
            ScriptedReading::Value(i) => Ok(i),
            ScriptedReading::Fault => Err(DeviceFault::Timeout {
                command: "A".to_string(),
                timeout_ms: 0,
            }),
        }
    }

    async fn measure_injection_voltage(&self) -> DeviceResult<f64> {
        let volt = self.state.lock().injection_volt;
        self.record(DeviceCall::MeasureInjectionVoltage);
        Ok(volt)
    }

    async fn measure_shunt(&self) -> DeviceResult<f64> {
        let shunt = {
            let state = self.state.lock();
            self.model_current(&state) * self.model.shunt_resistance
        };
        self.record(DeviceCall::MeasureShunt);
        Ok(shunt)
    }

    async fn probe_off(&self) -> DeviceResult<()> {
        self.state.lock().relay = [0; 4];
        self.record(DeviceCall::ProbeOff);
        Ok(())
    }

    async fn discharge(&self, target_volt: f64) -> DeviceResult<f64> {
        let reached = {
            let mut state = self.state.lock();
            state.injecting = false;
            state.pwm = self.model.discharge_pwm;
            state.injection_volt = state.injection_volt.min(target_volt.max(0.0));
            state.injection_volt
        };
        self.record(DeviceCall::Discharge(target_volt));
        Ok(reached)
    }

    async fn flush(&self) -> DeviceResult<String> {
        self.record(DeviceCall::Flush);
        Ok(String::new())
    }

    async fn shift_relays(&self) -> DeviceResult<()> {
        {
            let mut state = self.state.lock();
            let nprobe = self.nprobe;
            for index in state.relay.iter_mut() {
                if *index != 0 && *index < nprobe {
                    *index += 1;
                }
            }
        }
        self.record(DeviceCall::ShiftRelays);
        Ok(())
    }

    async fn set_averaging(&self, samples: u32) -> DeviceResult<()> {
        self.record(DeviceCall::SetAveraging(super::clamp_averaging(samples)));
        Ok(())
    }

    async fn set_calibration_offsets(&self, current: f64, shunt: f64) -> DeviceResult<()> {
        self.record(DeviceCall::SetCalibration(current, shunt));
        Ok(())
    }

    async fn send_raw(&self, command: &str) -> DeviceResult<String> {
        self.record(DeviceCall::Raw(command.to_string()));
        Ok(format!("{} ok", command.trim()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conf(pm: u32, pp: u32, vm: u32, vp: u32) -> ElectrodeConfiguration {
        ElectrodeConfiguration::new(pm, pp, vm, vp).unwrap()
    }

    #[tokio::test]
    async fn current_follows_pwm_and_contact_resistance() {
        let dev = SimulatedDevice::new(16);
        dev.set_relay_pattern(&conf(1, 4, 2, 3)).await.unwrap();
        dev.set_injection_level(20).await.unwrap();
        assert_eq!(dev.measure_current().await.unwrap(), 0.0);

        dev.enable_injection(true).await.unwrap();
        // 20 V over 2000 ohm
        assert!((dev.measure_current().await.unwrap() - 10.0).abs() < 1e-9);

        assert_eq!(dev.increment_injection(5).await.unwrap(), 25);
        assert_eq!(dev.measure_injection_voltage().await.unwrap(), 25.0);
    }

    #[tokio::test]
    async fn sense_voltage_adds_self_potential_and_transfer() {
        let dev = SimulatedDevice::new(16);
        let c = conf(1, 4, 2, 3);
        dev.set_self_potential(2, 3, -7.0);
        dev.set_transfer_resistance(c, 100.0);

        dev.set_relay_pattern(&c.sense_only()).await.unwrap();
        assert_eq!(dev.measure_voltage().await.unwrap(), -7.0);

        dev.set_relay_pattern(&c).await.unwrap();
        dev.set_injection_level(20).await.unwrap();
        dev.enable_injection(true).await.unwrap();
        // -7 mV + 10 mA * 100 ohm
        assert!((dev.measure_voltage().await.unwrap() - 993.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn discharge_holds_voltage_below_target() {
        let dev = SimulatedDevice::new(16);
        dev.set_injection_level(40).await.unwrap();
        dev.enable_injection(true).await.unwrap();
        dev.enable_injection(false).await.unwrap();
        assert_eq!(dev.measure_injection_voltage().await.unwrap(), 40.0);
        assert_eq!(dev.discharge(15.0).await.unwrap(), 15.0);
        assert_eq!(dev.discharge(30.0).await.unwrap(), 15.0);
        assert!(!dev.is_injecting());
    }

    #[tokio::test]
    async fn voltage_faults_are_bounded_per_configuration() {
        let dev = SimulatedDevice::new(16);
        let c = conf(1, 4, 2, 3);
        dev.fail_voltage(c, 2);
        dev.set_relay_pattern(&c).await.unwrap();
        assert!(dev.measure_voltage().await.is_err());
        assert!(dev.measure_voltage().await.is_err());
        assert!(dev.measure_voltage().await.is_ok());
    }

    #[tokio::test]
    async fn scripted_readings_come_first() {
        let dev = SimulatedDevice::new(16);
        dev.script_current([ScriptedReading::Value(1.5), ScriptedReading::Fault]);
        assert_eq!(dev.measure_current().await.unwrap(), 1.5);
        assert!(dev.measure_current().await.is_err());
        assert_eq!(dev.measure_current().await.unwrap(), 0.0);
    }

    #[tokio::test]
    async fn out_of_range_relay_pattern_is_rejected() {
        let dev = SimulatedDevice::new(8);
        let err = dev.set_relay_pattern(&conf(1, 9, 2, 3)).await.unwrap_err();
        assert!(matches!(err, DeviceFault::InvalidConfiguration(_)));
        assert!(dev.calls().is_empty());
    }

    #[tokio::test]
    async fn hook_sees_every_call() {
        let dev = SimulatedDevice::new(8);
        let seen = Arc::new(Mutex::new(0usize));
        let counter = seen.clone();
        dev.set_hook(move |_| *counter.lock() += 1);
        dev.probe_off().await.unwrap();
        dev.flush().await.unwrap();
        assert_eq!(*seen.lock(), 2);
        assert_eq!(dev.calls(), vec![DeviceCall::ProbeOff, DeviceCall::Flush]);
    }

    #[tokio::test]
    async fn shift_moves_pattern_along_the_array() {
        let dev = SimulatedDevice::new(4);
        dev.set_relay_pattern(&conf(1, 2, 0, 0)).await.unwrap();
        dev.shift_relays().await.unwrap();
        assert_eq!(dev.state.lock().relay, [2, 3, 0, 0]);
    }
}
