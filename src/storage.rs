//! Result files.
//!
//! Plan acquisitions are written as
//!
//! ```json
//! { "comment": "...",
//!   "measurement_status": "success",
//!   "measurement_fields": "volt curr res vself",
//!   "data": [[[0, 0], [mv, mi, mr, sv]], [[1, 0], null]],
//!   "conf": { "nprobe": 16, "conf": [...] } }
//! ```
//!
//! to `<output_dir>/<filename_prefix><unix-seconds>.json`. Undefined values (NaN) are
//! written as `null`. Contact surveys go to `<filename_prefix>res-<unix-seconds>.json`.

use crate::error::AppResult;
use crate::plan::{CellId, MeasurementPlan, PlanFile};
use crate::session::{ContactReading, RunStatus, SessionSnapshot};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use uuid::Uuid;

const RESULT_COMMENT: &str = "geoelectric measurement data";
const RESULT_FIELDS: &str = "volt curr res vself";
const CONTACT_COMMENT: &str = "resistance measurement data";
const CONTACT_FIELDS: &str = "P1 P2 R V I";

/// One data row: `[mv, mi, mr, sv]`, `None` for an undefined value.
pub type DataRow = [Option<f64>; 4];

/// Plan acquisition result file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultFile {
    pub comment: String,
    pub measurement_status: String,
    pub measurement_fields: String,
    pub data: Vec<(CellId, Option<DataRow>)>,
    pub conf: PlanFile,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
}

impl ResultFile {
    /// Build the file content from a session snapshot and the plan it measured.
    pub fn from_snapshot(snapshot: &SessionSnapshot, plan: &MeasurementPlan) -> Self {
        let data = snapshot
            .results
            .iter()
            .map(|(id, state)| {
                let row = state
                    .result()
                    .map(|r| r.as_row().map(|v| v.is_finite().then_some(v)));
                (id.clone(), row)
            })
            .collect();
        let status = match snapshot.status {
            RunStatus::Aborted => RunStatus::Aborted,
            _ => RunStatus::Success,
        };
        Self {
            comment: RESULT_COMMENT.to_string(),
            measurement_status: status.as_file_status().to_string(),
            measurement_fields: RESULT_FIELDS.to_string(),
            data,
            conf: plan.to_file(),
            run_id: snapshot.run_id,
            started_at: snapshot.started_at,
        }
    }

    /// Whether the run was aborted.
    pub fn is_aborted(&self) -> bool {
        self.measurement_status == "aborted"
    }
}

/// Contact survey file.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContactFile {
    pub comment: String,
    pub measurement_fields: String,
    pub data: Vec<ContactReading>,
}

/// Writes result files into one directory.
#[derive(Debug, Clone)]
pub struct ResultStore {
    output_dir: PathBuf,
}

impl ResultStore {
    /// Store writing into `output_dir`, created on first save.
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }

    /// Target directory.
    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Write a plan result; returns the file path.
    pub async fn save_results(&self, prefix: &str, file: &ResultFile) -> AppResult<PathBuf> {
        let text = serde_json::to_string_pretty(file)?;
        let path = self.write_unique(prefix, &text).await?;
        tracing::info!(path = %path.display(), status = %file.measurement_status, "Results saved");
        Ok(path)
    }

    /// Write a contact survey; returns the file path.
    pub async fn save_contacts(&self, prefix: &str, readings: &[ContactReading]) -> AppResult<PathBuf> {
        let file = ContactFile {
            comment: CONTACT_COMMENT.to_string(),
            measurement_fields: CONTACT_FIELDS.to_string(),
            data: readings.to_vec(),
        };
        let text = serde_json::to_string_pretty(&file)?;
        let path = self.write_unique(&format!("{}res-", prefix), &text).await?;
        tracing::info!(path = %path.display(), pairs = readings.len(), "Contact survey saved");
        Ok(path)
    }

    async fn write_unique(&self, prefix: &str, text: &str) -> AppResult<PathBuf> {
        fs::create_dir_all(&self.output_dir).await?;
        let stamp = Utc::now().timestamp();
        let mut path = self.output_dir.join(format!("{}{}.json", prefix, stamp));
        let mut n = 1;
        while fs::try_exists(&path).await? {
            path = self
                .output_dir
                .join(format!("{}{}-{}.json", prefix, stamp, n));
            n += 1;
        }
        fs::write(&path, text).await?;
        Ok(path)
    }
}

/// Read a result file back.
pub async fn load_results(path: impl AsRef<Path>) -> AppResult<ResultFile> {
    let text = fs::read_to_string(path).await?;
    Ok(serde_json::from_str(&text)?)
}
