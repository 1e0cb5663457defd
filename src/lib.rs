//! Sweep and real-time acquisition engine for source/measure units.
//!
//! The crate drives Keithley-style SMUs over a command/response transport
//! and offers two ways to use them:
//!
//! - [`sweep`]: stepped I-V sweeps on one instrument, or nested gate/drain
//!   sweeps for MOSFET output and transfer curves.
//! - [`telemetry`]: a periodic acquisition loop feeding a rolling window,
//!   subscribers and an optional CSV recording.
//!
//! An instrument is used by at most one activity at a time; see
//! [`instrument::InstrumentHandle`].

pub mod config;
pub mod connection;
pub mod error;
pub mod export;
pub mod instrument;
pub mod logging;
pub mod recording;
pub mod sweep;
pub mod telemetry;

pub use error::{DaqError, DaqResult};
pub use instrument::{Instrument, InstrumentHandle, InstrumentModel};
