//! Stepped source/measure sweeps.
//!
//! A sweep takes exclusive ownership of its instrument(s), visits every
//! setpoint of a [`SweepSpec`] in order and records one [`SweepPoint`] per
//! setpoint. Single-instrument sweeps produce an I-V curve; gate/drain pairs
//! produce a family of curves via [`NestedSweepSpec`].
//!
//! ```no_run
//! # async fn demo(handle: smu_daq::instrument::InstrumentHandle) -> smu_daq::error::DaqResult<()> {
//! use smu_daq::sweep::{SweepController, SweepLimits, SweepSpec};
//!
//! let spec = SweepSpec::new(0.0, 5.0, 0.5)?;
//! let result = SweepController::new()
//!     .run(&handle, &spec, &SweepLimits::default())
//!     .await?;
//! println!("{} points, outcome {:?}", result.len(), result.outcome);
//! # Ok(())
//! # }
//! ```

pub mod controller;
pub mod result;
pub mod spec;

pub use controller::SweepController;
pub use result::{Curve, PointStatus, SweepKind, SweepOutcome, SweepPoint, SweepResult, SENTINEL};
pub use spec::{
    CharacterizationMode, NestedLimits, NestedSweepSpec, SweepLimits, SweepSpec, MAX_POINTS,
};
