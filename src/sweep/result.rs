//! Accumulated sweep data.

use super::spec::CharacterizationMode;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Value recorded in place of a measurement that could not be read.
pub const SENTINEL: f64 = 0.0;

/// How a point's value was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PointStatus {
    /// Parsed from the instrument's reply.
    Measured,
    /// The read failed; the value is [`SENTINEL`].
    Sentinel,
}

/// One setpoint and its measured dependent value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SweepPoint {
    /// Commanded independent value.
    pub setpoint: f64,
    /// Dependent value, or [`SENTINEL`].
    pub value: f64,
    /// Whether `value` is real.
    pub status: PointStatus,
}

/// The inner sequence measured for one outer value.
///
/// Single-axis sweeps have exactly one curve with `outer: None`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Curve {
    /// Outer setpoint, for nested sweeps.
    pub outer: Option<f64>,
    /// Points in setpoint order.
    pub points: Vec<SweepPoint>,
}

/// What was swept.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SweepKind {
    /// One instrument, I-V curve.
    Single {
        /// Instrument identifier.
        instrument: String,
    },
    /// Gate/drain pair.
    Nested {
        /// Curve family.
        mode: CharacterizationMode,
        /// Gate instrument identifier.
        gate: String,
        /// Drain instrument identifier.
        drain: String,
    },
}

impl SweepKind {
    /// Export column labels, outer axis first for nested sweeps.
    pub fn labels(&self) -> Vec<&'static str> {
        match self {
            SweepKind::Single { .. } => vec!["Voltage (V)", "Current (A)"],
            SweepKind::Nested { mode, .. } => mode.labels().to_vec(),
        }
    }
}

/// How the run ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "lowercase")]
pub enum SweepOutcome {
    /// Every setpoint was visited.
    Completed,
    /// The transport failed; `at` points were recorded before it did.
    Aborted {
        /// Number of points recorded.
        at: usize,
        /// Failure description.
        reason: String,
    },
    /// Stopped on request after `at` points.
    Cancelled {
        /// Number of points recorded.
        at: usize,
    },
}

/// Ordered data of one sweep run. Possibly partial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepResult {
    /// What was swept.
    pub kind: SweepKind,
    /// Curves in outer-setpoint order.
    pub curves: Vec<Curve>,
    /// How the run ended.
    pub outcome: SweepOutcome,
    /// When configuration began.
    pub started_at: DateTime<Utc>,
    /// When teardown finished.
    pub finished_at: DateTime<Utc>,
}

impl SweepResult {
    pub(crate) fn new(kind: SweepKind) -> Self {
        let now = Utc::now();
        Self {
            kind,
            curves: Vec::new(),
            outcome: SweepOutcome::Completed,
            started_at: now,
            finished_at: now,
        }
    }

    pub(crate) fn begin_curve(&mut self, outer: Option<f64>) {
        self.curves.push(Curve {
            outer,
            points: Vec::new(),
        });
    }

    pub(crate) fn push(&mut self, point: SweepPoint) {
        if self.curves.is_empty() {
            self.begin_curve(None);
        }
        if let Some(curve) = self.curves.last_mut() {
            curve.points.push(point);
        }
    }

    /// Total number of recorded points across all curves.
    pub fn len(&self) -> usize {
        self.curves.iter().map(|c| c.points.len()).sum()
    }

    /// Whether no point was recorded.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether every setpoint was visited.
    pub fn is_complete(&self) -> bool {
        self.outcome == SweepOutcome::Completed
    }

    /// Number of points holding the sentinel.
    pub fn sentinel_count(&self) -> usize {
        self.points()
            .filter(|(_, p)| p.status == PointStatus::Sentinel)
            .count()
    }

    /// Every point with its curve's outer value, in order.
    pub fn points(&self) -> impl Iterator<Item = (Option<f64>, &SweepPoint)> + '_ {
        self.curves
            .iter()
            .flat_map(|c| c.points.iter().map(move |p| (c.outer, p)))
    }

    /// Export rows: `[outer, setpoint, value]` for nested sweeps,
    /// `[setpoint, value]` otherwise.
    pub fn rows(&self) -> Vec<Vec<f64>> {
        self.points()
            .map(|(outer, p)| match outer {
                Some(o) => vec![o, p.setpoint, p.value],
                None => vec![p.setpoint, p.value],
            })
            .collect()
    }

    /// Ordered `(x, y)` series per curve, labelled by outer value.
    pub fn series(&self) -> Vec<(Option<f64>, Vec<(f64, f64)>)> {
        self.curves
            .iter()
            .map(|c| {
                (
                    c.outer,
                    c.points.iter().map(|p| (p.setpoint, p.value)).collect(),
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point(setpoint: f64, value: f64) -> SweepPoint {
        SweepPoint {
            setpoint,
            value,
            status: PointStatus::Measured,
        }
    }

    #[test]
    fn test_single_rows() {
        let mut result = SweepResult::new(SweepKind::Single {
            instrument: "dut".into(),
        });
        result.push(point(0.0, 0.0));
        result.push(point(1.0, 1e-3));
        assert_eq!(result.len(), 2);
        assert_eq!(result.rows(), vec![vec![0.0, 0.0], vec![1.0, 1e-3]]);
        assert_eq!(result.curves.len(), 1);
    }

    #[test]
    fn test_nested_rows_and_series() {
        let mut result = SweepResult::new(SweepKind::Nested {
            mode: CharacterizationMode::Output,
            gate: "gate".into(),
            drain: "drain".into(),
        });
        for vgs in [1.0, 2.0] {
            result.begin_curve(Some(vgs));
            result.push(point(0.0, 0.0));
            result.push(SweepPoint {
                setpoint: 1.0,
                value: SENTINEL,
                status: PointStatus::Sentinel,
            });
        }
        assert_eq!(result.len(), 4);
        assert_eq!(result.sentinel_count(), 2);
        assert_eq!(result.rows()[2], vec![2.0, 0.0, 0.0]);
        let series = result.series();
        assert_eq!(series.len(), 2);
        assert_eq!(series[1].0, Some(2.0));
        assert_eq!(result.kind.labels(), vec!["Vgs (V)", "Vds (V)", "Id (A)"]);
    }
}
