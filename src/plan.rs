//! Measurement plans: which electrodes to switch for every cell of a pseudo-section.
//!
//! A plan is loaded from a JSON file shaped like
//!
//! ```json
//! { "nprobe": 16,
//!   "conf": [[[0, 0], [1, 4, 2, 3]], [[1, 0], [2, 5, 3, 4]]],
//!   "device_configuration": { "voltage_limit": 4000.0 } }
//! ```
//!
//! or generated with [`MeasurementPlan::wenner`]. Electrode configurations are validated
//! on construction, so a configuration that would short the current source onto a
//! single electrode cannot reach the device.

use crate::error::ConfigurationError;
use crate::tunables::TunableOverrides;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::Path;

/// Electrode selection `(pm, pp, vm, vp)`; `0` means "not connected".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "[u32; 4]", into = "[u32; 4]")]
pub struct ElectrodeConfiguration {
    pm: u32,
    pp: u32,
    vm: u32,
    vp: u32,
}

impl ElectrodeConfiguration {
    /// Build a configuration, rejecting equal nonzero injection electrodes.
    pub fn new(pm: u32, pp: u32, vm: u32, vp: u32) -> Result<Self, ConfigurationError> {
        if (pm != 0 || pp != 0) && pm == pp {
            return Err(ConfigurationError::EqualInjectionElectrodes(pm));
        }
        Ok(Self { pm, pp, vm, vp })
    }

    /// Sense electrodes only; used for the self-potential reading.
    pub fn sense_only(&self) -> Self {
        Self {
            pm: 0,
            pp: 0,
            vm: self.vm,
            vp: self.vp,
        }
    }

    /// Minus injection electrode
    pub fn pm(&self) -> u32 {
        self.pm
    }

    /// Plus injection electrode
    pub fn pp(&self) -> u32 {
        self.pp
    }

    /// Minus sense electrode
    pub fn vm(&self) -> u32 {
        self.vm
    }

    /// Plus sense electrode
    pub fn vp(&self) -> u32 {
        self.vp
    }

    /// Highest electrode index used.
    pub fn max_index(&self) -> u32 {
        self.pm.max(self.pp).max(self.vm).max(self.vp)
    }

    /// Check every electrode exists on an `nprobe` array.
    pub fn check_range(&self, nprobe: u32) -> Result<(), ConfigurationError> {
        let index = self.max_index();
        if index > nprobe {
            return Err(ConfigurationError::ElectrodeOutOfRange { index, nprobe });
        }
        Ok(())
    }
}

impl TryFrom<[u32; 4]> for ElectrodeConfiguration {
    type Error = ConfigurationError;

    fn try_from([pm, pp, vm, vp]: [u32; 4]) -> Result<Self, Self::Error> {
        Self::new(pm, pp, vm, vp)
    }
}

impl From<ElectrodeConfiguration> for [u32; 4] {
    fn from(c: ElectrodeConfiguration) -> Self {
        [c.pm, c.pp, c.vm, c.vp]
    }
}

impl fmt::Display for ElectrodeConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "pm={} pp={} vm={} vp={}",
            self.pm, self.pp, self.vm, self.vp
        )
    }
}

/// Identifier of one pseudo-section cell: a plain index or a grid coordinate.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CellId {
    Index(i64),
    Grid(Vec<i64>),
}

impl fmt::Display for CellId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CellId::Index(i) => write!(f, "{}", i),
            CellId::Grid(coords) => {
                let parts: Vec<String> = coords.iter().map(|c| c.to_string()).collect();
                write!(f, "({})", parts.join(","))
            }
        }
    }
}

/// One planned cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannedCell {
    pub id: CellId,
    pub configuration: ElectrodeConfiguration,
}

/// On-disk plan layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanFile {
    pub nprobe: u32,
    pub conf: Vec<(CellId, ElectrodeConfiguration)>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_configuration: Option<TunableOverrides>,
}

/// Validated, immutable measurement plan.
#[derive(Debug, Clone, PartialEq)]
pub struct MeasurementPlan {
    nprobe: u32,
    cells: Vec<PlannedCell>,
    overrides: Option<TunableOverrides>,
}

impl MeasurementPlan {
    /// Build a plan, checking electrode ranges and cell id uniqueness.
    pub fn new(
        nprobe: u32,
        cells: Vec<PlannedCell>,
        overrides: Option<TunableOverrides>,
    ) -> Result<Self, ConfigurationError> {
        if cells.is_empty() {
            return Err(ConfigurationError::EmptyPlan);
        }
        let mut seen = HashSet::with_capacity(cells.len());
        for cell in &cells {
            cell.configuration.check_range(nprobe)?;
            if !seen.insert(&cell.id) {
                return Err(ConfigurationError::DuplicateCell(cell.id.to_string()));
            }
        }
        Ok(Self {
            nprobe,
            cells,
            overrides,
        })
    }

    /// Parse and validate a plan from JSON text.
    pub fn from_json(text: &str) -> crate::error::AppResult<Self> {
        let file: PlanFile = serde_json::from_str(text)?;
        Ok(Self::try_from(file)?)
    }

    /// Read and validate a plan file.
    pub fn load<P: AsRef<Path>>(path: P) -> crate::error::AppResult<Self> {
        let text = fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    /// Layered Wenner-style plan for an `nprobe` array.
    ///
    /// Layer `d` uses electrode spacing `d + 1`: `pm = 1`, `vm = pm + d + 1`,
    /// `vp = vm + d + 1`, `pp = 3(d + 1) + 1`, and the quadruple is shifted one electrode
    /// at a time until `pp` reaches the last electrode. Cell ids are `[shift, layer]`.
    pub fn wenner(nprobe: u32, max_layers: u32) -> Result<Self, ConfigurationError> {
        let mut cells = Vec::new();
        let mut layer = 0u32;
        while (layer + 1) * 3 < nprobe && layer < max_layers {
            let a = layer + 1;
            let ncells = nprobe - 3 * a;
            for shift in 0..ncells {
                let pm = 1 + shift;
                let configuration = ElectrodeConfiguration::new(pm, pm + 3 * a, pm + a, pm + 2 * a)?;
                cells.push(PlannedCell {
                    id: CellId::Grid(vec![i64::from(shift), i64::from(layer)]),
                    configuration,
                });
            }
            layer += 1;
        }
        Self::new(nprobe, cells, None)
    }

    /// Probe count the plan was written for.
    pub fn nprobe(&self) -> u32 {
        self.nprobe
    }

    /// Planned cells in measurement order.
    pub fn cells(&self) -> &[PlannedCell] {
        &self.cells
    }

    /// Number of cells.
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    /// Always false for a validated plan.
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Tunable overrides carried by the plan file, if any.
    pub fn overrides(&self) -> Option<&TunableOverrides> {
        self.overrides.as_ref()
    }

    /// The plan in its file layout, for embedding in result files.
    pub fn to_file(&self) -> PlanFile {
        PlanFile {
            nprobe: self.nprobe,
            conf: self
                .cells
                .iter()
                .map(|c| (c.id.clone(), c.configuration))
                .collect(),
            device_configuration: self.overrides.clone(),
        }
    }
}

impl TryFrom<PlanFile> for MeasurementPlan {
    type Error = ConfigurationError;

    fn try_from(file: PlanFile) -> Result<Self, Self::Error> {
        let cells = file
            .conf
            .into_iter()
            .map(|(id, configuration)| PlannedCell { id, configuration })
            .collect();
        Self::new(file.nprobe, cells, file.device_configuration)
    }
}
