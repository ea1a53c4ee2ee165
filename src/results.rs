//! Per-cell measurement results.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Readings of one recorded cell.
///
/// Voltages in mV, current in mA, resistance in ohm. `resistance` is NaN when it could not
/// be computed; it serializes as `null`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MeasurementResult {
    pub measured_voltage: f64,
    pub measured_current: f64,
    pub resistance: f64,
    pub self_potential: f64,
}

impl MeasurementResult {
    /// Build a result, deriving the resistance from the readings.
    pub fn from_readings(measured_voltage: f64, measured_current: f64, self_potential: f64) -> Self {
        let resistance = match MeasurementOutcome::compute(measured_voltage, self_potential, measured_current) {
            MeasurementOutcome::Valid(r) => r,
            MeasurementOutcome::Undefined => f64::NAN,
        };
        Self {
            measured_voltage,
            measured_current,
            resistance,
            self_potential,
        }
    }

    /// Resistance as an outcome.
    pub fn outcome(&self) -> MeasurementOutcome {
        if self.resistance.is_finite() {
            MeasurementOutcome::Valid(self.resistance)
        } else {
            MeasurementOutcome::Undefined
        }
    }

    /// `[mv, mi, mr, sv]`, the order used in result files.
    pub fn as_row(&self) -> [f64; 4] {
        [
            self.measured_voltage,
            self.measured_current,
            self.resistance,
            self.self_potential,
        ]
    }
}

/// Outcome of the resistance computation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MeasurementOutcome {
    Valid(f64),
    Undefined,
}

impl MeasurementOutcome {
    /// `|mv - sv| / mi`; undefined for zero current or a non-finite quotient.
    pub fn compute(measured_voltage: f64, self_potential: f64, measured_current: f64) -> Self {
        if measured_current == 0.0 {
            return MeasurementOutcome::Undefined;
        }
        let r = ((measured_voltage - self_potential) / measured_current).abs();
        if r.is_finite() {
            MeasurementOutcome::Valid(r)
        } else {
            MeasurementOutcome::Undefined
        }
    }

    /// The resistance, if valid.
    pub fn value(&self) -> Option<f64> {
        match self {
            MeasurementOutcome::Valid(r) => Some(*r),
            MeasurementOutcome::Undefined => None,
        }
    }
}

/// Why a cell has no result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UndefinedReason {
    /// Retry budget exhausted on bad contact or device faults
    BadContact,
    /// Run aborted while this cell was in progress
    Aborted,
}

impl fmt::Display for UndefinedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UndefinedReason::BadContact => write!(f, "bad contact"),
            UndefinedReason::Aborted => write!(f, "aborted"),
        }
    }
}

/// State of one planned cell.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum CellState {
    #[default]
    Unmeasured,
    Undefined(UndefinedReason),
    Measured(MeasurementResult),
}

impl CellState {
    /// The result, if measured.
    pub fn result(&self) -> Option<&MeasurementResult> {
        match self {
            CellState::Measured(r) => Some(r),
            _ => None,
        }
    }

    /// Valid resistance, if any.
    pub fn resistance(&self) -> Option<f64> {
        self.result().and_then(|r| r.outcome().value())
    }
}

/// Running min/max over valid resistances.
///
/// Starts at the sentinel `(+inf, -inf)`; a range that saw no valid value stays there.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResistanceRange {
    pub min: f64,
    pub max: f64,
}

impl Default for ResistanceRange {
    fn default() -> Self {
        Self {
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
        }
    }
}

impl ResistanceRange {
    /// Fold in one resistance; non-finite values are ignored.
    pub fn update(&mut self, resistance: f64) {
        if !resistance.is_finite() {
            return;
        }
        self.min = self.min.min(resistance);
        self.max = self.max.max(resistance);
    }

    /// No valid value seen yet.
    pub fn is_empty(&self) -> bool {
        self.min > self.max
    }

    /// `(min, max)` if at least one valid value was seen.
    pub fn bounds(&self) -> Option<(f64, f64)> {
        if self.is_empty() {
            None
        } else {
            Some((self.min, self.max))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_current_is_undefined() {
        assert_eq!(
            MeasurementOutcome::compute(100.0, 2.0, 0.0),
            MeasurementOutcome::Undefined
        );
        let r = MeasurementResult::from_readings(100.0, 0.0, 2.0);
        assert!(r.resistance.is_nan());
        assert_eq!(r.outcome(), MeasurementOutcome::Undefined);
    }

    #[test]
    fn resistance_is_absolute() {
        // sv above mv and negative current both still give a positive value
        assert_eq!(
            MeasurementOutcome::compute(10.0, 30.0, 2.0),
            MeasurementOutcome::Valid(10.0)
        );
        assert_eq!(
            MeasurementOutcome::compute(30.0, 10.0, -4.0),
            MeasurementOutcome::Valid(5.0)
        );
    }

    #[test]
    fn non_finite_quotient_is_undefined() {
        assert_eq!(
            MeasurementOutcome::compute(f64::NAN, 0.0, 1.0),
            MeasurementOutcome::Undefined
        );
        assert_eq!(
            MeasurementOutcome::compute(1.0, 0.0, 1e-320),
            MeasurementOutcome::Undefined
        );
    }

    #[test]
    fn range_ignores_undefined_values() {
        let mut range = ResistanceRange::default();
        assert!(range.is_empty());
        range.update(f64::NAN);
        assert!(range.is_empty());
        assert_eq!(range, ResistanceRange::default());

        range.update(12.0);
        range.update(3.0);
        range.update(f64::NAN);
        assert_eq!(range.bounds(), Some((3.0, 12.0)));
    }

    #[test]
    fn nan_resistance_serializes_as_null() {
        let r = MeasurementResult::from_readings(5.0, 0.0, 1.0);
        let json = serde_json::to_value(r.as_row()).unwrap();
        assert_eq!(json, serde_json::json!([5.0, 0.0, null, 1.0]));
    }
}
