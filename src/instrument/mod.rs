//! Source/measure instrument driver.
//!
//! An [`Instrument`] owns one [`Connection`] and the model's
//! [`InstrumentProfile`], and tracks the operating state it has commanded.
//! Parameters are validated against the profile before anything is sent.
//!
//! ## Configuration
//!
//! ```toml
//! [instruments.dut]
//! model = "2461"
//! transport = "tcp"
//! resource = "192.168.0.20"
//! timeout = "10s"
//! ```
//!
//! Shared access goes through [`InstrumentHandle`], which enforces a single
//! owner at a time.

pub mod handle;
pub mod profile;

pub use handle::{InstrumentHandle, InstrumentLease};
pub use profile::{CompletionStyle, InstrumentModel, InstrumentProfile, ReadStyle, SourceFunction};

use crate::config::InstrumentSettings;
use crate::connection::{self, Connection};
use crate::error::{DaqResult, DeviceError};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Default query timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// What the driver last commanded.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OperatingState {
    /// Source output relay state.
    pub output_enabled: bool,
    /// Last accepted setpoint.
    pub setpoint: f64,
    /// Last accepted current limit.
    pub current_limit: f64,
    /// Active source function.
    pub function: SourceFunction,
}

/// A connected source/measure unit.
pub struct Instrument {
    id: String,
    profile: InstrumentProfile,
    connection: Box<dyn Connection>,
    timeout: Duration,
    state: OperatingState,
    disable_pending: bool,
}

impl Instrument {
    /// Wrap an already open connection.
    pub fn new(id: &str, model: InstrumentModel, connection: Box<dyn Connection>) -> Self {
        let profile = model.profile();
        Self {
            id: id.to_string(),
            profile,
            connection,
            timeout: DEFAULT_TIMEOUT,
            state: OperatingState {
                output_enabled: false,
                setpoint: 0.0,
                current_limit: profile.max_current,
                function: SourceFunction::Voltage,
            },
            disable_pending: false,
        }
    }

    /// Open the configured transport and wrap it.
    pub async fn connect(
        id: &str,
        settings: &InstrumentSettings,
        simulate: bool,
    ) -> anyhow::Result<Self> {
        let connection = connection::open(id, settings, simulate).await?;
        Ok(Self::new(id, settings.model, connection).with_timeout(settings.timeout))
    }

    /// Set the query timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Instrument identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The model's capability profile.
    pub fn profile(&self) -> &InstrumentProfile {
        &self.profile
    }

    /// Operating state as last commanded.
    pub fn state(&self) -> OperatingState {
        self.state
    }

    /// Whether the transport is still open.
    pub fn is_open(&self) -> bool {
        self.connection.is_open()
    }

    async fn send(&mut self, command: &str) -> Result<(), DeviceError> {
        self.connection.send(command).await.map_err(DeviceError::from)
    }

    async fn query(&mut self, command: &str) -> Result<String, DeviceError> {
        self.connection
            .query(command, self.timeout)
            .await
            .map_err(DeviceError::from)
    }

    /// Query `*IDN?` and return the identification string.
    pub async fn identify(&mut self) -> Result<String, DeviceError> {
        let idn = self.query("*IDN?").await?;
        info!(instrument = %self.id, idn = %idn, "instrument identified");
        Ok(idn)
    }

    /// Device reset and clear-status.
    pub async fn reset(&mut self) -> Result<(), DeviceError> {
        self.send("*RST").await?;
        self.send("*CLS").await?;
        self.state = OperatingState {
            output_enabled: false,
            setpoint: 0.0,
            current_limit: self.profile.max_current,
            function: SourceFunction::Voltage,
        };
        debug!(instrument = %self.id, "reset");
        Ok(())
    }

    /// Select the source/sense pairing. Safe to repeat.
    pub async fn configure_as_source(&mut self, function: SourceFunction) -> Result<(), DeviceError> {
        for command in self.profile.source_commands(function) {
            self.send(&command).await?;
        }
        self.state.function = function;
        debug!(instrument = %self.id, ?function, "source configured");
        Ok(())
    }

    /// Set the compliance current. Only meaningful while sourcing voltage.
    pub async fn set_current_limit(&mut self, amps: f64) -> DaqResult<()> {
        if self.state.function == SourceFunction::Current {
            return Err(crate::error::ValidationError::Unsupported(
                "current limit while sourcing current".to_string(),
            )
            .into());
        }
        self.profile.validate_current_limit(amps)?;
        let command = self.profile.current_limit_command(amps);
        self.send(&command).await?;
        self.state.current_limit = amps;
        Ok(())
    }

    /// Set the source level for the active function.
    pub async fn set_setpoint(&mut self, value: f64) -> DaqResult<()> {
        self.profile.validate_setpoint(self.state.function, value)?;
        let command = self.profile.setpoint_command(self.state.function, value);
        self.send(&command).await?;
        self.state.setpoint = value;
        Ok(())
    }

    /// Toggle the output relay.
    ///
    /// Enabling an enabled output sends nothing. Disabling is always sent.
    pub async fn set_output_enabled(&mut self, enabled: bool) -> Result<(), DeviceError> {
        if enabled && self.state.output_enabled {
            return Ok(());
        }
        if enabled {
            // Set before sending: a lost reply may still have switched the relay.
            self.disable_pending = true;
        }
        self.send(if enabled { ":OUTP ON" } else { ":OUTP OFF" })
            .await?;
        self.state.output_enabled = enabled;
        if !enabled {
            self.disable_pending = false;
        }
        debug!(instrument = %self.id, enabled, "output");
        Ok(())
    }

    /// Trigger and read one measurement of the sensed quantity.
    pub async fn read_measurement(&mut self) -> Result<f64, DeviceError> {
        if self.profile.completion == CompletionStyle::OperationComplete {
            self.query("*OPC?").await?;
        }
        let command = self.profile.measurement_query(self.state.function);
        let reply = self.query(command).await?;
        self.profile.parse_measurement(command, &reply)
    }

    /// Disable the output unless it is known to be off, then release the
    /// transport.
    ///
    /// Both steps are attempted; the first failure is returned.
    pub async fn close(&mut self) -> Result<(), DeviceError> {
        if !self.connection.is_open() {
            return Ok(());
        }
        let mut result = Ok(());
        if self.disable_pending {
            if let Err(e) = self.set_output_enabled(false).await {
                warn!(instrument = %self.id, error = %e, "failed to disable output before close");
                result = Err(e);
            }
        }
        if let Err(e) = self.connection.close().await {
            warn!(instrument = %self.id, error = %e, "failed to close connection");
            if result.is_ok() {
                result = Err(e.into());
            }
        }
        info!(instrument = %self.id, "instrument closed");
        result
    }
}

impl std::fmt::Debug for Instrument {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instrument")
            .field("id", &self.id)
            .field("model", &self.profile.model)
            .field("resource", &self.connection.resource())
            .field("state", &self.state)
            .finish()
    }
}
