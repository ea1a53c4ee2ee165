//! IGF-02 resistivity board over a serial line.
//!
//! Protocol Overview:
//! - Format: single-letter ASCII commands, space terminated
//! - Baud: 9600 by default, 8N1, no flow control
//! - Replies: zero or more CR/LF terminated lines; readings are the first token
//!
//! | Command            | Meaning                                   | Reply          |
//! |--------------------|-------------------------------------------|----------------|
//! | `q`                | open all relays                           | -              |
//! | `p<vp><vm><pp><pm>`| relay pattern, N chars each, `X` = closed | -              |
//! | `v<n>`             | set injection PWM                         | -              |
//! | `i…` / `d…`        | PWM up / down one step per letter         | `<tag> <pwm>`  |
//! | `Z` / `D`          | injection on / off                        | -              |
//! | `V` `A` `J` `S`    | sense volt, current, injection volt, shunt| `<value> …`    |
//! | `m`                | combined `V I J` reading                  | `<V> <I> <J>`  |
//! | `n<k>`             | ADC averaging (1-50)                      | -              |
//! | `C`                | hardware offset calibration               | `<cu> <sh>`    |
//! | `c <cu> <sh> 0`    | store offsets                             | -              |
//! | `s 0 1`            | shift relay pattern by one electrode      | -              |
//!
//! Each transaction drains stale input, writes the command, then collects reply lines
//! until the line goes quiet for `idle_gap`. A query that gets no line at all within
//! `response_timeout` is a [`DeviceFault::Timeout`].
//!
//! The transport is generic over any `AsyncRead + AsyncWrite`, so tests drive it with
//! `tokio::io::duplex`.

use super::{clamp_averaging, Device};
use crate::config::DeviceSettings;
use crate::error::{ConfigurationError, DeviceFault, DeviceResult};
use crate::plan::ElectrodeConfiguration;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;

/// Trait for types that can be used as async serial ports.
pub trait SerialPortIO: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> SerialPortIO for T {}

/// Dynamic serial port type.
pub type DynSerial = Box<dyn SerialPortIO>;

/// Serial port shared behind an async mutex.
pub type SharedPort = Arc<Mutex<BufReader<DynSerial>>>;

const COMMAND_TERMINATOR: &str = " ";

/// The board resets when the port opens.
const BOARD_BOOT_WAIT: Duration = Duration::from_secs(2);

/// Timing knobs of the serial transport.
#[derive(Debug, Clone, PartialEq)]
pub struct SerialTiming {
    /// Maximum wait for the first reply line of a query
    pub response_timeout: Duration,
    /// Quiet period that ends a reply
    pub idle_gap: Duration,
    /// Wait between opening all relays and applying a new pattern
    pub relay_settle: Duration,
    /// Wait between injection-voltage polls while discharging
    pub discharge_poll: Duration,
    /// Polls before a discharge gives up
    pub discharge_max_polls: u32,
    /// PWM level the source is set to while discharging
    pub discharge_pwm: u32,
}

impl Default for SerialTiming {
    fn default() -> Self {
        Self {
            response_timeout: Duration::from_millis(1000),
            idle_gap: Duration::from_millis(100),
            relay_settle: Duration::from_millis(500),
            discharge_poll: Duration::from_millis(1000),
            discharge_max_polls: 30,
            discharge_pwm: 5,
        }
    }
}

impl From<&DeviceSettings> for SerialTiming {
    fn from(settings: &DeviceSettings) -> Self {
        Self {
            response_timeout: Duration::from_millis(settings.response_timeout_ms),
            idle_gap: Duration::from_millis(settings.idle_gap_ms),
            relay_settle: Duration::from_millis(settings.relay_settle_ms),
            discharge_poll: Duration::from_millis(settings.discharge_poll_ms),
            discharge_max_polls: settings.discharge_max_polls,
            ..Default::default()
        }
    }
}

/// Live IGF-02 board.
pub struct SerialDevice {
    port: SharedPort,
    label: String,
    nprobe: u32,
    timing: SerialTiming,
}

impl SerialDevice {
    /// Open the configured serial port and wait for the board to boot.
    ///
    /// # Errors
    /// Returns [`DeviceFault::Io`] if the port cannot be opened.
    #[cfg(feature = "serial")]
    pub async fn open(settings: &DeviceSettings) -> DeviceResult<Self> {
        let path = settings.port.clone();
        let baud = settings.baud_rate;
        let stream =
            tokio::task::spawn_blocking(move || open_serial_port(&path, baud))
                .await
                .map_err(|e| DeviceFault::Io(std::io::Error::other(e)))??;

        tracing::info!(port = %settings.port, baud, "Opened serial port");
        tokio::time::sleep(BOARD_BOOT_WAIT).await;

        let device = Self::from_stream(
            stream,
            settings.port.clone(),
            settings.nprobe,
            SerialTiming::from(settings),
        );
        let banner = device.flush().await?;
        if !banner.is_empty() {
            tracing::debug!(banner = %banner, "Board greeting");
        }
        Ok(device)
    }

    /// Wrap an already open byte stream.
    pub fn from_stream<S>(stream: S, label: impl Into<String>, nprobe: u32, timing: SerialTiming) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let boxed: DynSerial = Box::new(stream);
        Self {
            port: Arc::new(Mutex::new(BufReader::new(boxed))),
            label: label.into(),
            nprobe,
            timing,
        }
    }

    /// Relay pattern command for a configuration on an `nprobe` array.
    pub fn relay_command(nprobe: u32, configuration: &ElectrodeConfiguration) -> String {
        let field = |index: u32| -> String {
            (1..=nprobe)
                .rev()
                .map(|slot| if slot == index { 'X' } else { '-' })
                .collect()
        };
        format!(
            "p{}{}{}{}",
            field(configuration.vp()),
            field(configuration.vm()),
            field(configuration.pp()),
            field(configuration.pm())
        )
    }

    /// Combined `(V, I, J, S)` reading.
    pub async fn measure_all(&self) -> DeviceResult<(f64, f64, f64, f64)> {
        let reply = self.query("m").await?;
        let mut tokens = reply.split_whitespace();
        let mut next = || -> DeviceResult<f64> {
            tokens
                .next()
                .and_then(|t| t.parse::<f64>().ok())
                .ok_or_else(|| DeviceFault::malformed("m", &reply))
        };
        let (v, i, j) = (next()?, next()?, next()?);
        let s = self.read_first("S").await?;
        Ok((v, i, j, s))
    }

    /// Let the board measure its own current and shunt offsets.
    pub async fn hardware_calibration(&self) -> DeviceResult<(f64, f64)> {
        let reply = self.query("C").await?;
        let values: Vec<f64> = reply
            .split_whitespace()
            .filter_map(|t| t.parse().ok())
            .collect();
        match values.as_slice() {
            [current, shunt, ..] => Ok((*current, *shunt)),
            _ => Err(DeviceFault::malformed("C", &reply)),
        }
    }

    /// Send a command that may or may not answer.
    async fn command(&self, cmd: &str) -> DeviceResult<String> {
        self.transact(cmd, false).await
    }

    /// Send a command that must answer.
    async fn query(&self, cmd: &str) -> DeviceResult<String> {
        self.transact(cmd, true).await
    }

    async fn read_first(&self, cmd: &str) -> DeviceResult<f64> {
        let reply = self.query(cmd).await?;
        parse_first(cmd, &reply)
    }

    async fn step_injection(&self, letter: char, n: u32) -> DeviceResult<u32> {
        if n == 0 {
            return Err(ConfigurationError::InvalidSetting(
                "injection step must be at least 1".to_string(),
            )
            .into());
        }
        let cmd: String = std::iter::repeat(letter).take(n as usize).collect();
        let reply = self.query(&cmd).await?;
        reply
            .lines()
            .rev()
            .find_map(|line| line.split_whitespace().nth(1))
            .and_then(|t| t.parse::<u32>().ok())
            .ok_or_else(|| DeviceFault::malformed(&cmd, &reply))
    }

    async fn transact(&self, cmd: &str, expect_reply: bool) -> DeviceResult<String> {
        let mut port = self.port.lock().await;

        let stale = drain(&mut port).await?;
        if !stale.is_empty() {
            tracing::trace!(stale = %stale.trim(), "Dropped stale input");
        }

        let line = format!("{}{}", cmd, COMMAND_TERMINATOR);
        port.get_mut().write_all(line.as_bytes()).await?;
        port.get_mut().flush().await?;
        tracing::trace!(command = cmd, "Sent");

        let first_wait = if expect_reply {
            self.timing.response_timeout
        } else {
            self.timing.idle_gap
        };
        let lines = collect_lines(&mut port, first_wait, self.timing.idle_gap).await?;
        if expect_reply && lines.is_empty() {
            return Err(DeviceFault::Timeout {
                command: cmd.to_string(),
                timeout_ms: self.timing.response_timeout.as_millis() as u64,
            });
        }
        let reply = lines.join("\n");
        tracing::trace!(command = cmd, reply = %reply, "Received");
        Ok(reply)
    }
}

#[cfg(feature = "serial")]
fn open_serial_port(path: &str, baud: u32) -> DeviceResult<tokio_serial::SerialStream> {
    use tokio_serial::SerialPortBuilderExt;

    let port = tokio_serial::new(path, baud)
        .data_bits(tokio_serial::DataBits::Eight)
        .parity(tokio_serial::Parity::None)
        .stop_bits(tokio_serial::StopBits::One)
        .flow_control(tokio_serial::FlowControl::None)
        .open_native_async()
        .map_err(|e| DeviceFault::Io(std::io::Error::other(format!("{}: {}", path, e))))?;
    Ok(port)
}

/// Read whatever is already buffered without waiting.
async fn drain(port: &mut BufReader<DynSerial>) -> DeviceResult<String> {
    let mut dropped = Vec::new();
    let mut buf = [0u8; 256];
    loop {
        match tokio::time::timeout(Duration::ZERO, port.read(&mut buf)).await {
            Ok(Ok(0)) => return Err(DeviceFault::Closed),
            Ok(Ok(n)) => dropped.extend_from_slice(&buf[..n]),
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => break,
        }
    }
    Ok(String::from_utf8_lossy(&dropped).into_owned())
}

/// Collect reply lines: the first within `first_wait`, the rest within `idle_gap` each.
///
/// A tail without a line terminator still counts as a line once the wait runs out.
async fn collect_lines(
    port: &mut BufReader<DynSerial>,
    first_wait: Duration,
    idle_gap: Duration,
) -> DeviceResult<Vec<String>> {
    let mut lines = Vec::new();
    // read_until appends as bytes arrive, so a timeout leaves the partial line here
    let mut pending = Vec::new();
    let mut wait = first_wait;
    loop {
        match tokio::time::timeout(wait, port.read_until(b'\n', &mut pending)).await {
            Ok(Ok(0)) => {
                push_line(&mut lines, &pending);
                if lines.is_empty() {
                    return Err(DeviceFault::Closed);
                }
                break;
            }
            Ok(Ok(_)) => {
                push_line(&mut lines, &pending);
                pending.clear();
                wait = idle_gap;
            }
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => {
                push_line(&mut lines, &pending);
                break;
            }
        }
    }
    Ok(lines)
}

fn push_line(lines: &mut Vec<String>, raw: &[u8]) {
    let clean = String::from_utf8_lossy(raw).replace('\r', "").trim().to_string();
    if !clean.is_empty() {
        lines.push(clean);
    }
}

fn parse_first(cmd: &str, reply: &str) -> DeviceResult<f64> {
    reply
        .split_whitespace()
        .next()
        .and_then(|t| t.parse::<f64>().ok())
        .ok_or_else(|| DeviceFault::malformed(cmd, reply))
}

#[async_trait]
impl Device for SerialDevice {
    fn nprobe(&self) -> u32 {
        self.nprobe
    }

    fn describe(&self) -> String {
        format!("IGF-02 on {} ({} probes)", self.label, self.nprobe)
    }

    async fn set_relay_pattern(&self, configuration: &ElectrodeConfiguration) -> DeviceResult<()> {
        configuration.check_range(self.nprobe)?;
        self.command("q").await?;
        tokio::time::sleep(self.timing.relay_settle).await;
        self.command(&Self::relay_command(self.nprobe, configuration))
            .await?;
        Ok(())
    }

    async fn set_injection_level(&self, pwm: u32) -> DeviceResult<()> {
        self.command(&format!("v{}", pwm)).await?;
        Ok(())
    }

    async fn increment_injection(&self, n: u32) -> DeviceResult<u32> {
        self.step_injection('i', n).await
    }

    async fn decrement_injection(&self, n: u32) -> DeviceResult<u32> {
        self.step_injection('d', n).await
    }

    async fn enable_injection(&self, on: bool) -> DeviceResult<()> {
        self.command(if on { "Z" } else { "D" }).await?;
        Ok(())
    }

    async fn measure_voltage(&self) -> DeviceResult<f64> {
        self.read_first("V").await
    }

    async fn measure_current(&self) -> DeviceResult<f64> {
        self.read_first("A").await
    }

    async fn measure_injection_voltage(&self) -> DeviceResult<f64> {
        self.read_first("J").await
    }

    async fn measure_shunt(&self) -> DeviceResult<f64> {
        self.read_first("S").await
    }

    async fn probe_off(&self) -> DeviceResult<()> {
        self.command("q").await?;
        Ok(())
    }

    async fn discharge(&self, target_volt: f64) -> DeviceResult<f64> {
        self.set_injection_level(self.timing.discharge_pwm).await?;
        self.enable_injection(false).await?;
        let mut volt = self.measure_injection_voltage().await?;
        let mut polls = 0;
        while volt > target_volt {
            if polls >= self.timing.discharge_max_polls {
                tracing::warn!(
                    volt,
                    target_volt,
                    polls,
                    "Discharge did not reach target voltage"
                );
                break;
            }
            tokio::time::sleep(self.timing.discharge_poll).await;
            volt = self.measure_injection_voltage().await?;
            polls += 1;
            tracing::debug!(volt, "discharging");
        }
        Ok(volt)
    }

    async fn flush(&self) -> DeviceResult<String> {
        let mut port = self.port.lock().await;
        let mut pending = drain(&mut port).await?;
        let lines = collect_lines(&mut port, self.timing.idle_gap, self.timing.idle_gap).await?;
        if !lines.is_empty() {
            if !pending.is_empty() && !pending.ends_with('\n') {
                pending.push('\n');
            }
            pending.push_str(&lines.join("\n"));
        }
        Ok(pending.replace('\r', ""))
    }

    async fn shift_relays(&self) -> DeviceResult<()> {
        self.command("s 0 1").await?;
        Ok(())
    }

    async fn set_averaging(&self, samples: u32) -> DeviceResult<()> {
        self.command(&format!("n{}", clamp_averaging(samples)))
            .await?;
        Ok(())
    }

    async fn set_calibration_offsets(&self, current: f64, shunt: f64) -> DeviceResult<()> {
        self.command(&format!("c {:.4} {:.4} 0", current, shunt))
            .await?;
        Ok(())
    }

    async fn send_raw(&self, command: &str) -> DeviceResult<String> {
        self.command(command.trim()).await
    }
}
