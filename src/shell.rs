//! Operator shell (`GE-CTR >`).
//!
//! Line-oriented front end over a [`Controller`]. Known commands are parsed into
//! [`ShellCommand`]; anything else is sent to the device verbatim and the reply printed.
//! While an acquisition or survey runs the shell polls the session, prints new log lines
//! and turns Ctrl-C into an abort request.

use crate::config::PresentationConfig;
use crate::controller::{Controller, WorkerReport};
use crate::error::{AppResult, ConfigurationError, GeoError};
use crate::plan::{ElectrodeConfiguration, MeasurementPlan};
use crate::session::RunStatus;
use crate::tunables::DeviceTunables;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

/// Prompt printed before each command.
pub const PROMPT: &str = "GE-CTR > ";

/// One parsed shell line.
#[derive(Debug, Clone, PartialEq)]
pub enum ShellCommand {
    Empty,
    Probe(ElectrodeConfiguration),
    ProbeOff,
    LoadPlan(PathBuf),
    Wenner(Option<u32>),
    Acquire,
    Survey,
    Discharge(Option<f64>),
    Inject(bool),
    Flush,
    Status,
    Set { key: String, value: String },
    Settings,
    Quit,
    Raw(String),
}

impl FromStr for ShellCommand {
    type Err = ConfigurationError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let line = line.trim();
        if let Some(path) = line.strip_prefix("conf=") {
            return Ok(ShellCommand::LoadPlan(PathBuf::from(path.trim())));
        }

        let mut words = line.split_whitespace();
        let Some(head) = words.next() else {
            return Ok(ShellCommand::Empty);
        };
        let args: Vec<&str> = words.collect();

        let command = match (head, args.as_slice()) {
            ("q" | "quit" | "exit", []) => ShellCommand::Quit,
            ("probe", ["off"]) => ShellCommand::ProbeOff,
            ("probe", [pm, pp, vm, vp]) => ShellCommand::Probe(ElectrodeConfiguration::new(
                number(pm)?,
                number(pp)?,
                number(vm)?,
                number(vp)?,
            )?),
            ("probe", _) => {
                return Err(ConfigurationError::InvalidSetting(
                    "usage: probe <pm> <pp> <vm> <vp> | probe off".to_string(),
                ))
            }
            ("wenner", []) => ShellCommand::Wenner(None),
            ("wenner", [layers]) => ShellCommand::Wenner(Some(number(layers)?)),
            ("acq", []) => ShellCommand::Acquire,
            ("mres", []) => ShellCommand::Survey,
            ("discharge", []) => ShellCommand::Discharge(None),
            ("discharge", [volt]) => ShellCommand::Discharge(Some(number(volt)?)),
            ("inject", []) => ShellCommand::Inject(true),
            ("inject", ["off"]) => ShellCommand::Inject(false),
            ("flush", []) => ShellCommand::Flush,
            ("status", []) => ShellCommand::Status,
            ("settings", []) => ShellCommand::Settings,
            ("set", [key, value @ ..]) if !value.is_empty() => ShellCommand::Set {
                key: key.to_string(),
                value: value.join(" "),
            },
            ("set", _) => {
                return Err(ConfigurationError::InvalidSetting(
                    "usage: set <tunable> <value>".to_string(),
                ))
            }
            _ => ShellCommand::Raw(line.to_string()),
        };
        Ok(command)
    }
}

fn number<T: FromStr>(word: &str) -> Result<T, ConfigurationError> {
    word.parse()
        .map_err(|_| ConfigurationError::InvalidSetting(format!("not a number: {}", word)))
}

/// Replace one field of `tunables`, parsing `value` as a TOML value (bare words are taken
/// as strings).
pub fn apply_setting(
    tunables: &DeviceTunables,
    key: &str,
    value: &str,
) -> Result<DeviceTunables, ConfigurationError> {
    fn invalid(e: impl std::fmt::Display) -> ConfigurationError {
        ConfigurationError::InvalidSetting(e.to_string())
    }

    let mut current = toml::Value::try_from(tunables).map_err(invalid)?;
    let table = current
        .as_table_mut()
        .ok_or_else(|| invalid("tunables are not a table"))?;
    if !table.contains_key(key) {
        return Err(invalid(format!("unknown tunable '{}'", key)));
    }

    let parsed = toml::from_str::<toml::Table>(&format!("v = {}", value))
        .ok()
        .and_then(|mut t| t.remove("v"))
        .unwrap_or_else(|| toml::Value::String(value.to_string()));
    table.insert(key.to_string(), parsed);

    let updated: DeviceTunables = current.try_into().map_err(invalid)?;
    updated.validate()?;
    Ok(updated)
}

enum Flow {
    Continue,
    Quit,
}

/// Interactive shell bound to one controller and one output stream.
pub struct Shell<W> {
    controller: Arc<Controller>,
    presentation: PresentationConfig,
    out: W,
    log_offset: usize,
}

impl<W: AsyncWrite + Unpin> Shell<W> {
    /// Shell writing to `out`.
    pub fn new(controller: Arc<Controller>, presentation: PresentationConfig, out: W) -> Self {
        Self {
            controller,
            presentation,
            out,
            log_offset: 0,
        }
    }

    /// Give back the output stream.
    pub fn into_output(self) -> W {
        self.out
    }

    /// Read commands from `input` until `q` or end of input.
    pub async fn run<R: AsyncBufRead + Unpin>(&mut self, input: R) -> AppResult<()> {
        let mut lines = input.lines();
        loop {
            self.say(PROMPT).await?;
            let Some(line) = lines.next_line().await? else {
                break;
            };
            let command = match line.parse::<ShellCommand>() {
                Ok(command) => command,
                Err(e) => {
                    self.say_line(&format!("error: {}", e)).await?;
                    continue;
                }
            };
            tracing::debug!(?command, "Shell command");
            match self.execute(command).await {
                Ok(Flow::Continue) => {}
                Ok(Flow::Quit) => break,
                Err(e) => self.say_line(&format!("error: {}", e)).await?,
            }
        }
        self.shutdown().await
    }

    async fn execute(&mut self, command: ShellCommand) -> AppResult<Flow> {
        let session = self.controller.session().clone();
        match command {
            ShellCommand::Empty => {}
            ShellCommand::Quit => return Ok(Flow::Quit),
            ShellCommand::Probe(conf) => {
                self.controller.device().await?.set_relay_pattern(&conf).await?;
                self.say_line(&format!("probe {}", conf)).await?;
            }
            ShellCommand::ProbeOff => {
                self.controller.device().await?.probe_off().await?;
                self.say_line("probe off").await?;
            }
            ShellCommand::LoadPlan(path) => {
                let plan = MeasurementPlan::load(&path)?;
                self.install_plan(plan).await?;
            }
            ShellCommand::Wenner(layers) => {
                let layers = layers.unwrap_or(self.presentation.wenner_layers);
                let plan = MeasurementPlan::wenner(session.device_nprobe(), layers)?;
                self.install_plan(plan).await?;
            }
            ShellCommand::Acquire => {
                self.controller.start_acquisition().await?;
                self.follow().await?;
            }
            ShellCommand::Survey => {
                self.controller.start_survey().await?;
                self.follow().await?;
            }
            ShellCommand::Discharge(volt) => {
                let target = volt.unwrap_or(session.tunables().injection_volt_low);
                let reached = self.controller.device().await?.discharge(target).await?;
                self.say_line(&format!("discharged: {:.3}V", reached)).await?;
            }
            ShellCommand::Inject(on) => {
                self.controller.device().await?.enable_injection(on).await?;
                self.say_line(if on { "injection on" } else { "injection off" })
                    .await?;
            }
            ShellCommand::Flush => {
                let pending = self.controller.device().await?.flush().await?;
                if !pending.is_empty() {
                    self.say_line(pending.trim_end()).await?;
                }
            }
            ShellCommand::Status => self.print_status().await?,
            ShellCommand::Set { key, value } => {
                let updated = apply_setting(&session.tunables(), &key, &value)?;
                session.set_tunables(updated)?;
                self.say_line(&format!("{} = {}", key, value)).await?;
            }
            ShellCommand::Settings => {
                let text = toml::to_string_pretty(&session.tunables())
                    .map_err(|e| ConfigurationError::InvalidSetting(e.to_string()))?;
                self.say(&text).await?;
            }
            ShellCommand::Raw(line) => {
                tracing::info!(command = %line, "Sending command directly to device");
                let reply = self.controller.device().await?.send_raw(&line).await?;
                self.say_line(reply.trim_end()).await?;
            }
        }
        Ok(Flow::Continue)
    }

    async fn install_plan(&mut self, plan: MeasurementPlan) -> AppResult<()> {
        let cells = plan.len();
        self.controller.session().load_plan(plan)?;
        self.log_offset = 0;
        self.say_line(&format!("plan loaded: {} cells", cells)).await
    }

    /// Poll the running worker until it finishes.
    async fn follow(&mut self) -> AppResult<()> {
        let poll = Duration::from_millis(self.presentation.poll_interval_ms.max(1));
        let session = self.controller.session().clone();
        let ctrl_c = tokio::signal::ctrl_c();
        tokio::pin!(ctrl_c);
        let mut interrupted = false;

        loop {
            tokio::select! {
                _ = tokio::time::sleep(poll) => {}
                signal = &mut ctrl_c, if !interrupted => {
                    interrupted = true;
                    if signal.is_ok() {
                        self.controller.request_abort();
                        self.say_line("abort requested").await?;
                    }
                }
            }
            self.print_new_log().await?;
            if !session.is_running() {
                break;
            }
        }

        let report = self.controller.wait().await?;
        self.print_new_log().await?;
        match report {
            Some(WorkerReport::Acquisition { report, saved }) => {
                self.say_line(&format!(
                    "{}: {} measured, {} undefined, {} not reached",
                    report.status.as_file_status(),
                    report.measured,
                    report.undefined,
                    report.unmeasured
                ))
                .await?;
                if let Some(path) = saved {
                    self.say_line(&format!("results: {}", path.display())).await?;
                }
            }
            Some(WorkerReport::Survey { readings, saved }) => {
                self.say_line(&format!("contact survey: {} pairs", readings.len()))
                    .await?;
                if let Some(path) = saved {
                    self.say_line(&format!("results: {}", path.display())).await?;
                }
            }
            None => {}
        }
        Ok(())
    }

    async fn print_status(&mut self) -> AppResult<()> {
        let snap = self.controller.session().snapshot();
        let status = match snap.status {
            RunStatus::Idle => "idle",
            RunStatus::Running => "running",
            RunStatus::Success => "success",
            RunStatus::Aborted => "aborted",
        };
        let mut text = format!(
            "status: {} ({}/{} cells)",
            status,
            snap.completed(),
            snap.results.len()
        );
        if let Some((low, high)) = snap.resistance_range.bounds() {
            text.push_str(&format!(", R {:.2}..{:.2} Ohm", low, high));
        }
        if let Some(id) = snap.run_id {
            text.push_str(&format!(", run {}", id));
        }
        self.say_line(&text).await
    }

    async fn print_new_log(&mut self) -> AppResult<()> {
        let (text, offset) = self.controller.session().log_since(self.log_offset);
        self.log_offset = offset;
        if !text.is_empty() {
            self.say(&text).await?;
        }
        Ok(())
    }

    /// Abort and drain a run still in flight, then leave the board safe.
    async fn shutdown(&mut self) -> AppResult<()> {
        if self.controller.session().is_running() {
            self.controller.request_abort();
        }
        match self.controller.wait().await {
            Ok(_) => {}
            Err(GeoError::WorkerFailed(e)) => {
                tracing::warn!(error = %e, "Worker failed before shutdown");
                return Ok(());
            }
            Err(e) => return Err(e),
        }
        let device = self.controller.device().await?;
        if let Err(e) = device.enable_injection(false).await {
            tracing::warn!(error = %e, "Shutdown: injection off failed");
        }
        if let Err(e) = device.probe_off().await {
            tracing::warn!(error = %e, "Shutdown: probe off failed");
        }
        Ok(())
    }

    async fn say(&mut self, text: &str) -> AppResult<()> {
        self.out.write_all(text.as_bytes()).await?;
        self.out.flush().await?;
        Ok(())
    }

    async fn say_line(&mut self, text: &str) -> AppResult<()> {
        self.say(text).await?;
        self.say("\n").await
    }
}
