//! Simulated source/measure unit.
//!
//! `MockConnection` understands the subset of SCPI the engine emits and
//! answers measurement queries from a simple load model, so sweeps and the
//! telemetry loop can run end to end without hardware. It provides:
//! - A call log of every command and query, for test verification
//! - Controllable fault injection (malformed replies, timeouts, disconnects)
//! - Optional simulated latency
//!
//! Handles are cheap clones sharing one state, so a test can keep a handle
//! after giving another one to an [`Instrument`](crate::instrument::Instrument).

use super::Connection;
use crate::error::TransportError;
use crate::instrument::InstrumentModel;
use async_trait::async_trait;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::debug;

/// Electrical load attached to the simulated output.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Load {
    /// Ohmic load.
    Resistor {
        /// Resistance in ohms.
        ohms: f64,
    },
    /// Shockley diode.
    Diode {
        /// Saturation current in amperes.
        saturation_current: f64,
        /// Ideality factor times thermal voltage, in volts.
        n_vt: f64,
    },
}

impl Default for Load {
    fn default() -> Self {
        Load::Diode {
            saturation_current: 1e-12,
            n_vt: 0.026,
        }
    }
}

impl Load {
    fn current_at(&self, volts: f64) -> f64 {
        match *self {
            Load::Resistor { ohms } => volts / ohms,
            Load::Diode {
                saturation_current,
                n_vt,
            } => saturation_current * ((volts / n_vt).min(700.0).exp() - 1.0),
        }
    }

    fn voltage_at(&self, amps: f64) -> f64 {
        match *self {
            Load::Resistor { ohms } => amps * ohms,
            Load::Diode {
                saturation_current,
                n_vt,
            } => n_vt * (amps / saturation_current + 1.0).max(f64::MIN_POSITIVE).ln(),
        }
    }
}

#[derive(Debug)]
struct MockState {
    resource: String,
    model: InstrumentModel,
    open: bool,
    call_log: Vec<String>,
    load: Load,
    latency: Duration,

    sourcing_current: bool,
    level: f64,
    output_on: bool,
    compliance: f64,

    measurement_count: usize,
    malformed_remaining: usize,
    malformed_always: bool,
    timeout_at: Option<usize>,
    disconnect_at: Option<usize>,
    disconnected: bool,
    fail_sends: bool,
}

/// In-process simulated instrument.
///
/// # Example
///
/// ```
/// use smu_daq::connection::{Load, MockConnection};
/// use smu_daq::instrument::InstrumentModel;
///
/// let mock = MockConnection::new("SIM::1", InstrumentModel::Keithley2461)
///     .with_load(Load::Resistor { ohms: 1000.0 });
/// mock.inject_timeout_at(3);
/// assert!(mock.call_log().is_empty());
/// ```
#[derive(Clone, Debug)]
pub struct MockConnection {
    resource: String,
    state: Arc<Mutex<MockState>>,
}

impl MockConnection {
    /// Create an open simulated instrument with a diode load.
    pub fn new(resource: &str, model: InstrumentModel) -> Self {
        Self {
            resource: resource.to_string(),
            state: Arc::new(Mutex::new(MockState {
                resource: resource.to_string(),
                model,
                open: true,
                call_log: Vec::new(),
                load: Load::default(),
                latency: Duration::ZERO,
                sourcing_current: false,
                level: 0.0,
                output_on: false,
                compliance: model.profile().max_current,
                measurement_count: 0,
                malformed_remaining: 0,
                malformed_always: false,
                timeout_at: None,
                disconnect_at: None,
                disconnected: false,
                fail_sends: false,
            })),
        }
    }

    /// Replace the attached load.
    pub fn with_load(self, load: Load) -> Self {
        self.state().load = load;
        self
    }

    /// Delay every operation by `latency`.
    pub fn with_latency(self, latency: Duration) -> Self {
        self.state().latency = latency;
        self
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Every command and query received so far, in order.
    pub fn call_log(&self) -> Vec<String> {
        self.state().call_log.clone()
    }

    /// Forget the call log.
    pub fn clear_log(&self) {
        self.state().call_log.clear();
    }

    /// How many times `command` appears in the call log.
    pub fn count(&self, command: &str) -> usize {
        self.state()
            .call_log
            .iter()
            .filter(|c| c.as_str() == command)
            .count()
    }

    /// Whether the simulated output is currently on.
    pub fn output_on(&self) -> bool {
        self.state().output_on
    }

    /// Whether the connection is still open.
    pub fn is_connected(&self) -> bool {
        let state = self.state();
        state.open && !state.disconnected
    }

    /// Number of measurement queries answered or failed so far.
    pub fn measurement_count(&self) -> usize {
        self.state().measurement_count
    }

    /// Reply with garbage to the next `n` measurement queries.
    pub fn inject_malformed(&self, n: usize) {
        self.state().malformed_remaining = n;
    }

    /// Reply with garbage to every measurement query.
    pub fn malformed_always(&self, enabled: bool) {
        self.state().malformed_always = enabled;
    }

    /// Time out the measurement query with zero-based index `index`, once.
    pub fn inject_timeout_at(&self, index: usize) {
        self.state().timeout_at = Some(index);
    }

    /// Drop the link permanently when measurement query `index` is issued.
    pub fn disconnect_at(&self, index: usize) {
        self.state().disconnect_at = Some(index);
    }

    /// Make every plain command fail as if the link were down.
    pub fn fail_sends(&self, enabled: bool) {
        self.state().fail_sends = enabled;
    }

    async fn simulate_latency(&self) {
        let latency = self.state().latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }
}

impl MockState {
    fn check_link(&self) -> Result<(), TransportError> {
        if !self.open {
            return Err(TransportError::Closed);
        }
        if self.disconnected {
            return Err(TransportError::Unreachable(format!(
                "{}: link lost",
                self.resource
            )));
        }
        Ok(())
    }

    fn apply(&mut self, command: &str) {
        let upper = command.trim().to_ascii_uppercase();
        let (head, arg) = match upper.split_once(' ') {
            Some((head, arg)) => (head.to_string(), arg.trim().to_string()),
            None => (upper.clone(), String::new()),
        };
        let value = arg.parse::<f64>().ok();

        match head.as_str() {
            "*RST" => {
                self.level = 0.0;
                self.output_on = false;
                self.sourcing_current = false;
                self.compliance = self.model.profile().max_current;
            }
            ":OUTP" | ":OUTPUT" => self.output_on = arg == "ON" || arg == "1",
            ":SOUR:FUNC" => self.sourcing_current = arg.starts_with("CURR"),
            ":SOUR:VOLT" | ":SOUR:CURR" => {
                if let Some(v) = value {
                    self.level = v;
                }
            }
            ":SOUR:VOLT:ILIM" | ":SENS:CURR:PROT" => {
                if let Some(v) = value {
                    self.compliance = v;
                }
            }
            _ => {}
        }
    }

    fn measured_current(&self) -> f64 {
        if !self.output_on {
            return 0.0;
        }
        if self.sourcing_current {
            return self.level;
        }
        let current = self.load.current_at(self.level);
        current.clamp(-self.compliance, self.compliance)
    }

    fn measured_voltage(&self) -> f64 {
        if !self.output_on {
            return 0.0;
        }
        if self.sourcing_current {
            let range = self.model.profile().voltage_range;
            return self.load.voltage_at(self.level).clamp(range.0, range.1);
        }
        self.level
    }

    fn reply(&mut self, query: &str, timeout: Duration) -> Result<String, TransportError> {
        let upper = query.trim().to_ascii_uppercase();
        let is_measurement = upper.starts_with(":MEAS") || upper == ":READ?";

        if is_measurement {
            let index = self.measurement_count;
            self.measurement_count += 1;

            if self.disconnect_at == Some(index) {
                self.disconnected = true;
                return Err(TransportError::Unreachable(format!(
                    "{}: link lost",
                    self.resource
                )));
            }
            if self.timeout_at == Some(index) {
                self.timeout_at = None;
                return Err(TransportError::Timeout {
                    command: query.to_string(),
                    timeout,
                });
            }
            if self.malformed_always || self.malformed_remaining > 0 {
                self.malformed_remaining = self.malformed_remaining.saturating_sub(1);
                return Ok("\"Undefined header\",-113".to_string());
            }
        }

        let reply = match upper.as_str() {
            "*IDN?" => format!(
                "KEITHLEY INSTRUMENTS,MODEL {},SIMULATED,1.0.0",
                self.model.id()
            ),
            "*OPC?" => "1".to_string(),
            ":MEAS:CURR?" => format!("{:E}", self.measured_current()),
            ":MEAS:VOLT?" => format!("{:E}", self.measured_voltage()),
            ":READ?" => {
                if self.sourcing_current {
                    format!("{:E}", self.measured_voltage())
                } else {
                    format!("{:E}", self.measured_current())
                }
            }
            _ => "0".to_string(),
        };
        Ok(reply)
    }
}

#[async_trait]
impl Connection for MockConnection {
    fn resource(&self) -> &str {
        &self.resource
    }

    fn is_open(&self) -> bool {
        self.state().open
    }

    async fn send(&mut self, command: &str) -> Result<(), TransportError> {
        self.simulate_latency().await;
        let mut state = self.state();
        state.check_link()?;
        if state.fail_sends {
            return Err(TransportError::Unreachable(format!(
                "{}: write failed",
                state.resource
            )));
        }
        state.call_log.push(command.to_string());
        state.apply(command);
        debug!(resource = %state.resource, command, "mock command");
        Ok(())
    }

    async fn query(&mut self, command: &str, timeout: Duration) -> Result<String, TransportError> {
        self.simulate_latency().await;
        let mut state = self.state();
        state.check_link()?;
        state.call_log.push(command.to_string());
        let reply = state.reply(command, timeout)?;
        debug!(resource = %state.resource, command, reply = %reply, "mock query");
        Ok(reply)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        let mut state = self.state();
        if state.open {
            state.open = false;
            debug!(resource = %state.resource, "mock connection closed");
        }
        Ok(())
    }
}
