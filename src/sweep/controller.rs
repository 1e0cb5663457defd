//! Drives instruments through sweeps.
//!
//! A run has three phases: validate (no hardware access), acquire and
//! configure, then step through the setpoints. Teardown disables the output
//! of every instrument the run touched, on every exit path, exactly once.
//!
//! Per-point policy:
//! - a reply that cannot be parsed is recorded as [`SENTINEL`] and the sweep
//!   continues;
//! - a transport failure aborts the run. The points recorded so far are
//!   returned with [`SweepOutcome::Aborted`] and the instruments are closed.

use super::result::{PointStatus, SweepKind, SweepOutcome, SweepPoint, SweepResult, SENTINEL};
use super::spec::{CharacterizationMode, NestedLimits, NestedSweepSpec, SweepLimits, SweepSpec};
use crate::error::{DaqResult, DeviceError, ValidationError};
use crate::instrument::{Instrument, InstrumentHandle, SourceFunction};
use chrono::Utc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// How the stepping phase ended without error.
enum Finish {
    Completed,
    Cancelled,
}

/// Runs single and nested sweeps.
#[derive(Debug, Clone, Default)]
pub struct SweepController {
    settle_delay: Duration,
    cancel: Option<watch::Receiver<bool>>,
}

impl SweepController {
    /// Controller with no settle delay and no cancellation.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait this long after each setpoint before reading.
    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    /// Stop before the next setpoint once `cancel` reads `true`.
    pub fn with_cancellation(mut self, cancel: watch::Receiver<bool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().map(|rx| *rx.borrow()).unwrap_or(false)
    }

    async fn settle(&self) {
        if !self.settle_delay.is_zero() {
            tokio::time::sleep(self.settle_delay).await;
        }
    }

    /// Sweep the voltage of one instrument and measure its current.
    ///
    /// Validation and `Busy` failures are returned as errors before any
    /// command is sent. A transport failure mid-run is not an error: the
    /// partial result is returned with an `Aborted` outcome.
    pub async fn run(
        &self,
        handle: &InstrumentHandle,
        spec: &SweepSpec,
        limits: &SweepLimits,
    ) -> DaqResult<SweepResult> {
        spec.validate_for(handle.profile(), SourceFunction::Voltage)?;
        handle.profile().validate_current_limit(limits.current_limit)?;
        let mut lease = handle.acquire("sweep")?;

        let setpoints = spec.points();
        info!(instrument = handle.id(), %spec, points = setpoints.len(), "starting sweep");

        let mut result = SweepResult::new(SweepKind::Single {
            instrument: handle.id().to_string(),
        });
        result.begin_curve(None);

        let run = self
            .drive_single(&mut lease, &setpoints, limits, &mut result)
            .await;
        self.conclude(&mut result, run, &mut [&mut *lease]).await;
        Ok(result)
    }

    async fn drive_single(
        &self,
        instrument: &mut Instrument,
        setpoints: &[f64],
        limits: &SweepLimits,
        result: &mut SweepResult,
    ) -> DaqResult<Finish> {
        configure(instrument, limits.current_limit).await?;
        instrument.set_output_enabled(true).await?;

        for &setpoint in setpoints {
            if self.is_cancelled() {
                return Ok(Finish::Cancelled);
            }
            instrument.set_setpoint(setpoint).await?;
            self.settle().await;
            result.push(measure(instrument, setpoint).await?);
        }
        Ok(Finish::Completed)
    }

    /// Nested gate/drain sweep. The drain current is measured at every point.
    pub async fn run_nested(
        &self,
        gate: &InstrumentHandle,
        drain: &InstrumentHandle,
        spec: &NestedSweepSpec,
        limits: &NestedLimits,
    ) -> DaqResult<SweepResult> {
        if gate.id() == drain.id() {
            return Err(ValidationError::InvalidSweep(format!(
                "gate and drain must be different instruments, both are '{}'",
                gate.id()
            ))
            .into());
        }
        let (outer_profile, inner_profile) = match spec.mode {
            CharacterizationMode::Output => (gate.profile(), drain.profile()),
            CharacterizationMode::Transfer => (drain.profile(), gate.profile()),
        };
        spec.outer.validate_for(outer_profile, SourceFunction::Voltage)?;
        spec.inner.validate_for(inner_profile, SourceFunction::Voltage)?;
        gate.profile()
            .validate_current_limit(limits.gate_current_limit)?;
        drain
            .profile()
            .validate_current_limit(limits.drain_current_limit)?;

        let mut gate_lease = gate.acquire("nested sweep (gate)")?;
        let mut drain_lease = drain.acquire("nested sweep (drain)")?;

        info!(
            gate = gate.id(),
            drain = drain.id(),
            mode = %spec.mode,
            outer = %spec.outer,
            inner = %spec.inner,
            points = spec.len(),
            "starting nested sweep"
        );

        let mut result = SweepResult::new(SweepKind::Nested {
            mode: spec.mode,
            gate: gate.id().to_string(),
            drain: drain.id().to_string(),
        });

        let run = self
            .drive_nested(&mut gate_lease, &mut drain_lease, spec, limits, &mut result)
            .await;
        self.conclude(&mut result, run, &mut [&mut *drain_lease, &mut *gate_lease])
            .await;
        Ok(result)
    }

    async fn drive_nested(
        &self,
        gate: &mut Instrument,
        drain: &mut Instrument,
        spec: &NestedSweepSpec,
        limits: &NestedLimits,
        result: &mut SweepResult,
    ) -> DaqResult<Finish> {
        configure(gate, limits.gate_current_limit).await?;
        configure(drain, limits.drain_current_limit).await?;

        let outer_points = spec.outer.points();
        let inner_points = spec.inner.points();
        let (outer_inst, inner_inst) = match spec.mode {
            CharacterizationMode::Output => (gate, drain),
            CharacterizationMode::Transfer => (drain, gate),
        };

        for &outer in &outer_points {
            if self.is_cancelled() {
                return Ok(Finish::Cancelled);
            }
            outer_inst.set_setpoint(outer).await?;
            outer_inst.set_output_enabled(true).await?;
            result.begin_curve(Some(outer));
            debug!(outer, "outer setpoint applied");

            for &inner in &inner_points {
                if self.is_cancelled() {
                    return Ok(Finish::Cancelled);
                }
                inner_inst.set_setpoint(inner).await?;
                inner_inst.set_output_enabled(true).await?;
                self.settle().await;

                let drain_inst = match spec.mode {
                    CharacterizationMode::Output => &mut *inner_inst,
                    CharacterizationMode::Transfer => &mut *outer_inst,
                };
                result.push(measure(drain_inst, inner).await?);
            }
        }
        Ok(Finish::Completed)
    }

    /// Record the outcome and tear down. Output disable is attempted on every
    /// instrument; after a transport failure the instruments are closed too.
    async fn conclude(
        &self,
        result: &mut SweepResult,
        run: DaqResult<Finish>,
        instruments: &mut [&mut Instrument],
    ) {
        let fatal = run.is_err();
        result.outcome = match run {
            Ok(Finish::Completed) => SweepOutcome::Completed,
            Ok(Finish::Cancelled) => {
                info!(points = result.len(), "sweep cancelled");
                SweepOutcome::Cancelled { at: result.len() }
            }
            Err(e) => {
                error!(points = result.len(), error = %e, "sweep aborted");
                SweepOutcome::Aborted {
                    at: result.len(),
                    reason: e.to_string(),
                }
            }
        };

        for instrument in instruments.iter_mut() {
            if let Err(e) = instrument.set_output_enabled(false).await {
                warn!(instrument = instrument.id(), error = %e, "failed to disable output");
            }
            if fatal {
                if let Err(e) = instrument.close().await {
                    warn!(instrument = instrument.id(), error = %e, "failed to close instrument");
                }
            }
        }

        result.finished_at = Utc::now();
        info!(
            points = result.len(),
            sentinels = result.sentinel_count(),
            outcome = ?result.outcome,
            "sweep finished"
        );
    }
}

async fn configure(instrument: &mut Instrument, current_limit: f64) -> DaqResult<()> {
    instrument.reset().await?;
    instrument
        .configure_as_source(SourceFunction::Voltage)
        .await?;
    instrument.set_current_limit(current_limit).await
}

/// Read one point, substituting the sentinel for a malformed reply.
async fn measure(instrument: &mut Instrument, setpoint: f64) -> Result<SweepPoint, DeviceError> {
    match instrument.read_measurement().await {
        Ok(value) => Ok(SweepPoint {
            setpoint,
            value,
            status: PointStatus::Measured,
        }),
        Err(e) if !e.is_fatal() => {
            warn!(
                instrument = instrument.id(),
                setpoint,
                error = %e,
                "measurement failed, recording sentinel"
            );
            Ok(SweepPoint {
                setpoint,
                value: SENTINEL,
                status: PointStatus::Sentinel,
            })
        }
        Err(e) => Err(e),
    }
}
