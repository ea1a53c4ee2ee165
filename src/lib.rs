//! # Geoelectric acquisition engine
//!
//! Drives a multi-electrode resistivity meter (IGF-02 relay/ADC board) through a
//! measurement plan: for every electrode configuration it discharges the injection source,
//! reads the self-potential, regulates the injection current into a target band, reads the
//! sense voltage and records the apparent resistance.
//!
//! ## Crate Structure
//!
//! - **`device`**: the [`device::Device`] capability with a serial and a simulated implementation
//! - **`plan`**: electrode configurations, measurement plans and the Wenner generator
//! - **`tunables`**: operator-adjustable acquisition parameters
//! - **`regulation`**: the closed-loop injection current regulator
//! - **`sequencer`**: the per-cell state machine with retry, abort and cleanup
//! - **`session`**: shared run state polled by the presentation side
//! - **`results`**: per-cell results and the resistance range
//! - **`survey`**, **`calibration`**: contact resistance survey and soft calibration
//! - **`controller`**: owns the device and runs acquisitions on a worker task
//! - **`storage`**: JSON result files
//! - **`shell`**: the `GE-CTR >` operator shell
//! - **`colormap`**: resistance to palette colour
//! - **`config`**, **`logging`**, **`error`**: ambient configuration, tracing and error types

pub mod calibration;
pub mod colormap;
pub mod config;
pub mod controller;
pub mod device;
pub mod error;
pub mod logging;
pub mod plan;
pub mod regulation;
pub mod results;
pub mod sequencer;
pub mod session;
pub mod shell;
pub mod storage;
pub mod survey;
pub mod tunables;

pub use error::{AppResult, GeoError};
