//! CLI entry point for the geoelectric meter.
//!
//! Opens the configured device, calibrates it and starts the operator shell.
//!
//! ```bash
//! geoelec --port /dev/ttyUSB0
//! geoelec --simulate --plan line1.json
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use geoelec_daq::calibration::soft_calibrate;
use geoelec_daq::config::{AppConfig, DeviceBackend, DEFAULT_CONFIG_PATH};
use geoelec_daq::controller::Controller;
use geoelec_daq::device::open_device;
use geoelec_daq::logging;
use geoelec_daq::plan::MeasurementPlan;
use geoelec_daq::session::RunSession;
use geoelec_daq::shell::Shell;
use geoelec_daq::storage::ResultStore;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "geoelec")]
#[command(about = "Geoelectric resistivity meter control shell", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Serial port of the board
    #[arg(long)]
    port: Option<String>,

    /// Serial baud rate
    #[arg(long)]
    baud: Option<u32>,

    /// Use the simulated board instead of the serial one
    #[arg(long)]
    simulate: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    /// Plan file to load at startup
    #[arg(long)]
    plan: Option<PathBuf>,

    /// Skip soft calibration at startup
    #[arg(long)]
    no_calibrate: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = AppConfig::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    if let Some(port) = cli.port {
        config.device.port = port;
    }
    if let Some(baud) = cli.baud {
        config.device.baud_rate = baud;
    }
    if cli.simulate {
        config.device.backend = DeviceBackend::Simulated;
    }
    if let Some(level) = cli.log_level {
        config.application.log_level = level;
    }
    if cli.no_calibrate {
        config.device.calibrate_on_start = false;
    }
    config.validate()?;
    logging::init_from_config(&config)?;

    let device = open_device(&config.device)
        .await
        .with_context(|| format!("opening device on {}", config.device.port))?;
    tracing::info!(device = %device.describe(), "Device ready");

    if config.device.calibrate_on_start {
        println!("calibrating...");
        match soft_calibrate(device.as_ref(), config.device.calibration_samples).await {
            Ok(offsets) => println!(
                "calibration parameters: {:.4} {:.4}",
                offsets.current, offsets.shunt
            ),
            Err(e) => tracing::warn!(error = %e, "Soft calibration failed"),
        }
    }
    device
        .set_averaging(config.device.averaging)
        .await
        .context("setting averaging")?;

    let session = Arc::new(RunSession::new(device.nprobe(), config.tunables.clone()));
    if let Some(path) = &cli.plan {
        let plan = MeasurementPlan::load(path)
            .with_context(|| format!("loading plan {}", path.display()))?;
        session.load_plan(plan)?;
    }

    let store = config
        .storage
        .save_results
        .then(|| ResultStore::new(config.storage.output_dir.clone()));
    let controller = Arc::new(Controller::new(device, session, store));

    let mut shell = Shell::new(controller, config.presentation.clone(), tokio::io::stdout());
    shell
        .run(tokio::io::BufReader::new(tokio::io::stdin()))
        .await?;
    Ok(())
}
