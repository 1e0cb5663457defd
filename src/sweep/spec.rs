//! Sweep definitions and setpoint generation.

use crate::error::ValidationError;
use crate::instrument::{InstrumentProfile, SourceFunction};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Relative tolerance (in units of `step`) used at the end of the grid.
const GRID_TOLERANCE: f64 = 1e-9;

/// Upper bound on generated points per axis.
pub const MAX_POINTS: usize = 100_000;

/// A closed-interval sweep `start..=end` in increments of `step`.
///
/// Setpoints are `start + i * step`, computed by multiplication so rounding
/// does not accumulate. A grid point within tolerance of `end` is snapped to
/// `end`; otherwise `end` is appended as the final point. The sequence is
/// therefore strictly increasing, starts at `start` and ends exactly at `end`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SweepSpec {
    /// First setpoint.
    pub start: f64,
    /// Last setpoint.
    pub end: f64,
    /// Increment between setpoints.
    pub step: f64,
}

impl SweepSpec {
    /// Build and validate a sweep.
    pub fn new(start: f64, end: f64, step: f64) -> Result<Self, ValidationError> {
        let spec = Self { start, end, step };
        spec.validate()?;
        Ok(spec)
    }

    /// Check the sweep's own invariants: finite values, `step > 0`,
    /// `start < end`, and a bounded number of points.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if !(self.start.is_finite() && self.end.is_finite() && self.step.is_finite()) {
            return Err(ValidationError::InvalidSweep(format!(
                "non-finite bounds in {}",
                self
            )));
        }
        if self.step <= 0.0 {
            return Err(ValidationError::InvalidSweep(format!(
                "step must be positive, got {}",
                self.step
            )));
        }
        if self.start >= self.end {
            return Err(ValidationError::InvalidSweep(format!(
                "start ({}) must be less than end ({})",
                self.start, self.end
            )));
        }
        if self.grid_steps() >= MAX_POINTS {
            return Err(ValidationError::InvalidSweep(format!(
                "{} generates more than {} points",
                self, MAX_POINTS
            )));
        }
        Ok(())
    }

    /// Check every setpoint against the instrument's range for `function`.
    ///
    /// The sequence is monotonic within `[start, end]`, so the bounds suffice.
    pub fn validate_for(
        &self,
        profile: &InstrumentProfile,
        function: SourceFunction,
    ) -> Result<(), ValidationError> {
        self.validate()?;
        profile.validate_setpoint(function, self.start)?;
        profile.validate_setpoint(function, self.end)
    }

    fn grid_steps(&self) -> usize {
        let steps = ((self.end - self.start) / self.step + GRID_TOLERANCE).floor();
        if steps.is_finite() && steps >= 0.0 {
            steps.min(MAX_POINTS as f64) as usize
        } else {
            MAX_POINTS
        }
    }

    /// The ordered setpoint sequence. Empty if the sweep is invalid.
    pub fn points(&self) -> Vec<f64> {
        if self.validate().is_err() {
            return Vec::new();
        }
        let steps = self.grid_steps();
        let mut points: Vec<f64> = (0..=steps)
            .map(|i| self.start + i as f64 * self.step)
            .collect();

        let tolerance = self.step * GRID_TOLERANCE;
        if let Some(last) = points.last_mut() {
            if (self.end - *last).abs() <= tolerance || *last > self.end {
                *last = self.end;
            } else {
                points.push(self.end);
            }
        }
        points
    }

    /// Number of setpoints [`points`](Self::points) yields.
    pub fn len(&self) -> usize {
        self.points().len()
    }

    /// Whether the sweep yields no points (only when invalid).
    pub fn is_empty(&self) -> bool {
        self.validate().is_err()
    }
}

impl fmt::Display for SweepSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..={} step {}", self.start, self.end, self.step)
    }
}

/// Which two-terminal curve a nested gate/drain sweep produces.
///
/// The dependent value is always the drain current.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CharacterizationMode {
    /// Id-Vds family: outer axis is the gate voltage, inner is the drain voltage.
    Output,
    /// Id-Vgs family: outer axis is the drain voltage, inner is the gate voltage.
    Transfer,
}

impl CharacterizationMode {
    /// Column labels `(outer, inner, dependent)`.
    pub fn labels(&self) -> [&'static str; 3] {
        match self {
            CharacterizationMode::Output => ["Vgs (V)", "Vds (V)", "Id (A)"],
            CharacterizationMode::Transfer => ["Vds (V)", "Vgs (V)", "Id (A)"],
        }
    }
}

impl fmt::Display for CharacterizationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CharacterizationMode::Output => write!(f, "output"),
            CharacterizationMode::Transfer => write!(f, "transfer"),
        }
    }
}

impl std::str::FromStr for CharacterizationMode {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "output" | "id-vds" => Ok(CharacterizationMode::Output),
            "transfer" | "id-vgs" => Ok(CharacterizationMode::Transfer),
            other => Err(ValidationError::Unsupported(format!(
                "unknown characterization mode '{}'",
                other
            ))),
        }
    }
}

/// Outer/inner sweep over a gate and a drain instrument.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NestedSweepSpec {
    /// Which curve family to take.
    pub mode: CharacterizationMode,
    /// Stepped once per curve.
    pub outer: SweepSpec,
    /// Swept in full for every outer value.
    pub inner: SweepSpec,
}

impl NestedSweepSpec {
    /// Validate both axes.
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.outer.validate()?;
        self.inner.validate()
    }

    /// Total number of measured points.
    pub fn len(&self) -> usize {
        self.outer.len() * self.inner.len()
    }

    /// Whether either axis is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Compliance settings for a single-instrument sweep.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SweepLimits {
    /// Current limit in amperes.
    pub current_limit: f64,
}

impl Default for SweepLimits {
    fn default() -> Self {
        Self {
            current_limit: 0.01,
        }
    }
}

/// Compliance settings for a gate/drain sweep.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NestedLimits {
    /// Gate current limit in amperes.
    pub gate_current_limit: f64,
    /// Drain current limit in amperes.
    pub drain_current_limit: f64,
}

impl Default for NestedLimits {
    fn default() -> Self {
        Self {
            gate_current_limit: 0.01,
            drain_current_limit: 0.01,
        }
    }
}
