//! Per-model capabilities and command dialects.
//!
//! Every model-dependent decision (ranges, how a measurement completes, how
//! the reply is shaped, which command sets the compliance limit) lives here,
//! so the rest of the engine never compares model names.

use crate::error::{DeviceError, ValidationError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Supported source/measure unit models.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InstrumentModel {
    /// Keithley 2461 high-current SourceMeter.
    #[serde(rename = "2461", alias = "keithley2461")]
    Keithley2461,
    /// Keithley 2410 high-voltage SourceMeter.
    #[serde(rename = "2410", alias = "keithley2410")]
    Keithley2410,
    /// Keithley 2400 SourceMeter.
    #[serde(rename = "2400", alias = "keithley2400")]
    Keithley2400,
}

impl InstrumentModel {
    /// Short model number, as used in configuration files.
    pub fn id(&self) -> &'static str {
        match self {
            InstrumentModel::Keithley2461 => "2461",
            InstrumentModel::Keithley2410 => "2410",
            InstrumentModel::Keithley2400 => "2400",
        }
    }

    /// The fixed capability profile for this model.
    pub fn profile(&self) -> InstrumentProfile {
        match self {
            InstrumentModel::Keithley2461 => InstrumentProfile {
                model: *self,
                voltage_range: (-100.0, 100.0),
                max_current: 7.0,
                completion: CompletionStyle::OperationComplete,
                read_style: ReadStyle::Single,
            },
            InstrumentModel::Keithley2410 => InstrumentProfile {
                model: *self,
                voltage_range: (-1100.0, 1100.0),
                max_current: 1.0,
                completion: CompletionStyle::CombinedRead,
                read_style: ReadStyle::FirstField,
            },
            InstrumentModel::Keithley2400 => InstrumentProfile {
                model: *self,
                voltage_range: (-200.0, 200.0),
                max_current: 1.0,
                completion: CompletionStyle::CombinedRead,
                read_style: ReadStyle::FirstField,
            },
        }
    }
}

impl fmt::Display for InstrumentModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Keithley {}", self.id())
    }
}

impl FromStr for InstrumentModel {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase();
        let digits = normalized.trim_start_matches("keithley").trim();
        match digits {
            "2461" => Ok(InstrumentModel::Keithley2461),
            "2410" => Ok(InstrumentModel::Keithley2410),
            "2400" => Ok(InstrumentModel::Keithley2400),
            _ => Err(ValidationError::Unsupported(format!(
                "unknown instrument model '{}'",
                s
            ))),
        }
    }
}

/// Which quantity the instrument sources. The other one is measured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceFunction {
    /// Source voltage, measure current.
    #[default]
    Voltage,
    /// Source current, measure voltage.
    Current,
}

/// How the engine learns a measurement is ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionStyle {
    /// Wait on `*OPC?`, then issue a `:MEAS` query.
    OperationComplete,
    /// A single `:READ?` triggers, waits and returns the reading.
    CombinedRead,
}

/// Shape of a measurement reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStyle {
    /// One number.
    Single,
    /// Comma-separated tuple; the reading is the first field.
    FirstField,
}

/// Immutable description of what one model can do.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InstrumentProfile {
    /// Model this profile belongs to.
    pub model: InstrumentModel,
    /// Allowed voltage setpoints, inclusive.
    pub voltage_range: (f64, f64),
    /// Upper bound for the current limit, and for current setpoints.
    pub max_current: f64,
    /// Measurement completion mechanism.
    pub completion: CompletionStyle,
    /// Reply format of a measurement.
    pub read_style: ReadStyle,
}

impl InstrumentProfile {
    /// Range of setpoints accepted while sourcing `function`.
    pub fn setpoint_range(&self, function: SourceFunction) -> (f64, f64) {
        match function {
            SourceFunction::Voltage => self.voltage_range,
            SourceFunction::Current => (-self.max_current, self.max_current),
        }
    }

    /// Reject setpoints outside the model's range.
    pub fn validate_setpoint(
        &self,
        function: SourceFunction,
        value: f64,
    ) -> Result<(), ValidationError> {
        let (min, max) = self.setpoint_range(function);
        let quantity = match function {
            SourceFunction::Voltage => "voltage setpoint",
            SourceFunction::Current => "current setpoint",
        };
        if !value.is_finite() || value < min || value > max {
            return Err(ValidationError::OutOfRange {
                quantity,
                value,
                min,
                max,
            });
        }
        Ok(())
    }

    /// Current limits must be in `(0, max_current]`.
    pub fn validate_current_limit(&self, value: f64) -> Result<(), ValidationError> {
        if !value.is_finite() || value <= 0.0 || value > self.max_current {
            return Err(ValidationError::OutOfRange {
                quantity: "current limit",
                value,
                min: 0.0,
                max: self.max_current,
            });
        }
        Ok(())
    }

    /// Commands selecting the source/sense pairing for `function`.
    pub fn source_commands(&self, function: SourceFunction) -> Vec<String> {
        let (source, sense, element) = match function {
            SourceFunction::Voltage => ("VOLT", "CURR", "CURR"),
            SourceFunction::Current => ("CURR", "VOLT", "VOLT"),
        };
        let mut commands = vec![
            format!(":SOUR:FUNC {}", source),
            format!(":SENS:FUNC '{}'", sense),
        ];
        if self.read_style == ReadStyle::FirstField {
            commands.push(format!(":FORM:ELEM {}", element));
        }
        commands
    }

    /// Command that sets a compliance current of `amps`.
    pub fn current_limit_command(&self, amps: f64) -> String {
        match self.completion {
            CompletionStyle::OperationComplete => format!(":SOUR:VOLT:ILIM {}", amps),
            CompletionStyle::CombinedRead => format!(":SENS:CURR:PROT {}", amps),
        }
    }

    /// Command that sets the source level.
    pub fn setpoint_command(&self, function: SourceFunction, value: f64) -> String {
        match function {
            SourceFunction::Voltage => format!(":SOUR:VOLT {}", value),
            SourceFunction::Current => format!(":SOUR:CURR {}", value),
        }
    }

    /// The query returning the measured quantity for `function`.
    pub fn measurement_query(&self, function: SourceFunction) -> &'static str {
        match (self.completion, function) {
            (CompletionStyle::CombinedRead, _) => ":READ?",
            (CompletionStyle::OperationComplete, SourceFunction::Voltage) => ":MEAS:CURR?",
            (CompletionStyle::OperationComplete, SourceFunction::Current) => ":MEAS:VOLT?",
        }
    }

    /// Parse a measurement reply according to the read style.
    pub fn parse_measurement(&self, command: &str, reply: &str) -> Result<f64, DeviceError> {
        let field = match self.read_style {
            ReadStyle::Single => reply.trim(),
            ReadStyle::FirstField => reply.split(',').next().unwrap_or_default().trim(),
        };
        field
            .parse::<f64>()
            .ok()
            .filter(|v| v.is_finite())
            .ok_or_else(|| DeviceError::MalformedReply {
                command: command.to_string(),
                reply: reply.to_string(),
            })
    }
}
