//! Error types for the acquisition engine.
//!
//! The taxonomy separates failures by what the caller has to do about them,
//! not by where they happened:
//!
//! - **`ValidationError`**: a caller-supplied value is outside what the
//!   instrument profile or sweep rules allow. Raised before any command is
//!   sent, so it never has side effects.
//! - **`DeviceError::MalformedReply`**: the instrument answered but the reply
//!   could not be parsed. A sweep records a sentinel for that point and moves
//!   on; the telemetry loop skips the tick.
//! - **`TransportError`** (also seen as `DeviceError::Unreachable`): the
//!   connection itself failed or timed out. Sweeps abort and the telemetry
//!   loop halts, both after a best-effort output disable.
//! - **`DaqError::Busy`**: another flow already owns the instrument.
//! - **`RecordingError`**: the recording sink failed. Reported, but
//!   acquisition continues.
//!
//! `DaqError` wraps all of them with `#[from]` so `?` works across layers.

use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the engine error type.
pub type DaqResult<T> = std::result::Result<T, DaqError>;

/// Connection-level failure. Always fatal for the operation in progress.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    /// No terminator arrived before the query timeout elapsed.
    #[error("timed out after {timeout:?} waiting for reply to '{command}'")]
    Timeout {
        /// The query that was sent.
        command: String,
        /// The timeout that elapsed.
        timeout: Duration,
    },

    /// The transport could not be written to or read from.
    #[error("instrument unreachable: {0}")]
    Unreachable(String),

    /// The connection was already closed.
    #[error("connection closed")]
    Closed,
}

/// Failure reported by an instrument operation.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DeviceError {
    /// The reply to a measurement query could not be parsed.
    #[error("malformed reply to '{command}': {reply:?}")]
    MalformedReply {
        /// The query that produced the reply.
        command: String,
        /// The raw reply text.
        reply: String,
    },

    /// The underlying connection failed.
    #[error(transparent)]
    Unreachable(#[from] TransportError),
}

impl DeviceError {
    /// Whether the failure means the instrument can no longer be driven.
    ///
    /// Malformed replies are per-point faults; transport failures are not.
    pub fn is_fatal(&self) -> bool {
        matches!(self, DeviceError::Unreachable(_))
    }
}

/// A parameter was rejected before touching hardware.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    /// A numeric value fell outside the allowed range.
    #[error("{quantity} {value} outside allowed range [{min}, {max}]")]
    OutOfRange {
        /// What was being set ("voltage setpoint", "current limit", ...).
        quantity: &'static str,
        /// The rejected value.
        value: f64,
        /// Lower bound.
        min: f64,
        /// Upper bound.
        max: f64,
    },

    /// Sweep bounds or step are unusable.
    #[error("invalid sweep: {0}")]
    InvalidSweep(String),

    /// The operation does not apply in the instrument's current mode.
    #[error("unsupported: {0}")]
    Unsupported(String),
}

/// The recording sink could not accept a point.
#[derive(Error, Debug)]
pub enum RecordingError {
    /// A recording session is already open on this loop.
    #[error("a recording session is already active")]
    AlreadyActive,

    /// File-level failure.
    #[error("recording I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// CSV encoding failure.
    #[error("recording CSV error: {0}")]
    Csv(#[from] csv::Error),
}

/// Configuration could not be loaded or failed validation.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Figment could not extract the settings.
    #[error("configuration load error: {0}")]
    Load(#[from] figment::Error),

    /// The settings parsed but are not usable.
    #[error("configuration validation error: {0}")]
    Validation(String),
}

/// Top-level error for every engine operation.
#[derive(Error, Debug)]
pub enum DaqError {
    /// See [`ValidationError`].
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    /// See [`DeviceError`].
    #[error("device error: {0}")]
    Device(#[from] DeviceError),

    /// The instrument is already owned by another sweep or telemetry loop.
    #[error("instrument '{instrument}' is busy ({owner})")]
    Busy {
        /// Instrument identifier.
        instrument: String,
        /// Description of the current owner.
        owner: String,
    },

    /// See [`RecordingError`].
    #[error("recording error: {0}")]
    Recording(#[from] RecordingError),

    /// See [`ConfigError`].
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Plain I/O failure outside the recording path (exports, file loading).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// CSV failure outside the recording path.
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// The telemetry loop task is no longer running.
    #[error("telemetry loop is not running")]
    NotRunning,

    /// Teardown finished, but some steps failed.
    #[error("shutdown failed with {} error(s)", .0.len())]
    ShutdownFailed(Vec<DaqError>),
}

impl From<TransportError> for DaqError {
    fn from(err: TransportError) -> Self {
        DaqError::Device(DeviceError::Unreachable(err))
    }
}

impl DaqError {
    /// Whether this error came from a lost or timed-out connection.
    pub fn is_transport(&self) -> bool {
        matches!(self, DaqError::Device(DeviceError::Unreachable(_)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DaqError::Busy {
            instrument: "dut".into(),
            owner: "telemetry loop".into(),
        };
        assert_eq!(err.to_string(), "instrument 'dut' is busy (telemetry loop)");
    }

    #[test]
    fn test_malformed_reply_is_not_fatal() {
        let err = DeviceError::MalformedReply {
            command: ":MEAS:CURR?".into(),
            reply: "garbage".into(),
        };
        assert!(!err.is_fatal());
        assert!(DeviceError::from(TransportError::Closed).is_fatal());
    }

    #[test]
    fn test_transport_converts_to_device_error() {
        let err: DaqError = TransportError::Unreachable("usb unplugged".into()).into();
        assert!(err.is_transport());
        assert!(err.to_string().contains("usb unplugged"));
    }

    #[test]
    fn test_shutdown_failed_error() {
        let err = DaqError::ShutdownFailed(vec![
            DaqError::from(TransportError::Closed),
            DaqError::NotRunning,
        ]);
        assert!(err.to_string().contains("2 error(s)"));
    }
}
