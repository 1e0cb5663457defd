//! Configuration loaded with Figment.
//!
//! Settings come from `config/smu_daq.toml`, overridden by environment
//! variables prefixed with `SMUDAQ_`. Nested keys are separated by a double
//! underscore:
//!
//! ```text
//! SMUDAQ_APPLICATION__LOG_LEVEL=debug
//! SMUDAQ_TELEMETRY__PERIOD=250ms
//! SMUDAQ_INSTRUMENTS__DUT__RESOURCE=192.168.1.50
//! ```
//!
//! ```no_run
//! use smu_daq::config::Settings;
//!
//! let settings = Settings::load()?;
//! println!("{} instruments configured", settings.instruments.len());
//! # Ok::<(), smu_daq::error::ConfigError>(())
//! ```

use crate::error::ConfigError;
use crate::instrument::{InstrumentModel, DEFAULT_TIMEOUT};
use crate::sweep::SweepLimits;
use crate::telemetry::{DEFAULT_PERIOD, DEFAULT_WINDOW_LEN};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config/smu_daq.toml";

const MIN_PERIOD: Duration = Duration::from_millis(10);
const MAX_PERIOD: Duration = Duration::from_secs(10);

/// Top-level settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    /// Process-wide settings.
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Instruments keyed by identifier.
    #[serde(default)]
    pub instruments: HashMap<String, InstrumentSettings>,
    /// Sweep defaults.
    #[serde(default)]
    pub sweep: SweepConfig,
    /// Telemetry loop defaults.
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    /// Output locations.
    #[serde(default)]
    pub storage: StorageConfig,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// trace, debug, info, warn or error.
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Emit logs as JSON lines.
    #[serde(default)]
    pub json_logs: bool,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            json_logs: false,
        }
    }
}

/// How an instrument is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Simulated instrument.
    Mock,
    /// Raw SCPI socket; `resource` is `host` or `host:port`.
    #[default]
    Tcp,
    /// RS-232; `resource` is the port name.
    Serial,
    /// VISA resource string.
    Visa,
}

/// One configured instrument.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstrumentSettings {
    /// Device model, selecting its capability profile.
    pub model: InstrumentModel,
    /// Transport used to reach it.
    #[serde(default)]
    pub transport: TransportKind,
    /// Address, port name or VISA resource.
    pub resource: String,
    /// Per-query timeout.
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Duration,
    /// Serial baud rate.
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
}

impl InstrumentSettings {
    /// Simulated instrument of `model`.
    pub fn mock(model: InstrumentModel) -> Self {
        Self {
            model,
            transport: TransportKind::Mock,
            resource: format!("MOCK::{}", model.id()),
            timeout: default_timeout(),
            baud_rate: default_baud_rate(),
        }
    }
}

/// Sweep defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepConfig {
    /// Wait between setting a point and measuring it.
    #[serde(default, with = "humantime_serde")]
    pub settle_delay: Duration,
    /// Current limit when none is given, in amperes.
    #[serde(default = "default_current_limit")]
    pub current_limit: f64,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            settle_delay: Duration::ZERO,
            current_limit: default_current_limit(),
        }
    }
}

/// Telemetry loop defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Sampling period.
    #[serde(default = "default_period", with = "humantime_serde")]
    pub period: Duration,
    /// Rolling window length.
    #[serde(default = "default_window_len")]
    pub window_len: usize,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            period: default_period(),
            window_len: default_window_len(),
        }
    }
}

/// Output locations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory for sweep files and recordings.
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_timeout() -> Duration {
    DEFAULT_TIMEOUT
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_current_limit() -> f64 {
    SweepLimits::default().current_limit
}

fn default_period() -> Duration {
    DEFAULT_PERIOD
}

fn default_window_len() -> usize {
    DEFAULT_WINDOW_LEN
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("data")
}

impl Settings {
    /// Load from [`DEFAULT_CONFIG_PATH`] and the environment.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load from `path` and the environment, then validate.
    ///
    /// A missing file is not an error; defaults and environment overrides
    /// still apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let settings: Self = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("SMUDAQ_").split("__"))
            .extract()?;

        settings.validate()?;
        Ok(settings)
    }

    /// Check values serde cannot.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(ConfigError::Validation(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        for (id, instrument) in &self.instruments {
            if instrument.resource.trim().is_empty() {
                return Err(ConfigError::Validation(format!(
                    "Instrument '{}': 'resource' cannot be empty",
                    id
                )));
            }
            if instrument.timeout.is_zero() {
                return Err(ConfigError::Validation(format!(
                    "Instrument '{}': 'timeout' must be positive",
                    id
                )));
            }
        }

        if !(self.sweep.current_limit.is_finite() && self.sweep.current_limit > 0.0) {
            return Err(ConfigError::Validation(format!(
                "Invalid sweep current_limit {}. Must be positive",
                self.sweep.current_limit
            )));
        }

        if self.telemetry.window_len == 0 {
            return Err(ConfigError::Validation(
                "telemetry window_len must be at least 1".to_string(),
            ));
        }
        if !(MIN_PERIOD..=MAX_PERIOD).contains(&self.telemetry.period) {
            return Err(ConfigError::Validation(format!(
                "Invalid telemetry period {:?}. Must be between {:?} and {:?}",
                self.telemetry.period, MIN_PERIOD, MAX_PERIOD
            )));
        }

        Ok(())
    }

    /// Settings of instrument `id`.
    pub fn instrument(&self, id: &str) -> Result<&InstrumentSettings, ConfigError> {
        self.instruments.get(id).ok_or_else(|| {
            let mut known: Vec<&str> = self.instruments.keys().map(String::as_str).collect();
            known.sort_unstable();
            ConfigError::Validation(format!(
                "Unknown instrument '{}'. Configured: {}",
                id,
                if known.is_empty() {
                    "none".to_string()
                } else {
                    known.join(", ")
                }
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_full_file() {
        let file = write_config(
            r#"
            [application]
            log_level = "debug"

            [instruments.dut]
            model = "2461"
            resource = "192.168.1.50"
            timeout = "2s"

            [instruments.gate]
            model = "2400"
            transport = "serial"
            resource = "/dev/ttyUSB0"
            baud_rate = 19200

            [sweep]
            settle_delay = "50ms"

            [telemetry]
            period = "250ms"
            window_len = 50
            "#,
        );
        let settings = Settings::load_from(file.path()).unwrap();

        let dut = settings.instrument("dut").unwrap();
        assert_eq!(dut.model, InstrumentModel::Keithley2461);
        assert_eq!(dut.transport, TransportKind::Tcp);
        assert_eq!(dut.timeout, Duration::from_secs(2));

        let gate = settings.instrument("gate").unwrap();
        assert_eq!(gate.transport, TransportKind::Serial);
        assert_eq!(gate.baud_rate, 19200);
        assert_eq!(gate.timeout, DEFAULT_TIMEOUT);

        assert_eq!(settings.sweep.settle_delay, Duration::from_millis(50));
        assert_eq!(settings.sweep.current_limit, 0.01);
        assert_eq!(settings.telemetry.window_len, 50);
        assert_eq!(settings.storage.output_dir, PathBuf::from("data"));
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let settings = Settings::load_from("does/not/exist.toml").unwrap();
        assert_eq!(settings.application.log_level, "info");
        assert_eq!(settings.telemetry.period, DEFAULT_PERIOD);
        assert!(settings.instruments.is_empty());
    }

    #[test]
    fn test_invalid_log_level() {
        let mut settings = Settings::default();
        settings.application.log_level = "loud".to_string();
        assert!(matches!(
            settings.validate(),
            Err(ConfigError::Validation(msg)) if msg.contains("log_level")
        ));
    }

    #[test]
    fn test_empty_resource_rejected() {
        let mut settings = Settings::default();
        let mut dut = InstrumentSettings::mock(InstrumentModel::Keithley2410);
        dut.resource = "  ".to_string();
        settings.instruments.insert("dut".to_string(), dut);
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_telemetry_bounds() {
        let mut settings = Settings::default();
        settings.telemetry.window_len = 0;
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.telemetry.period = Duration::from_millis(1);
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.telemetry.period = Duration::from_secs(10);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_unknown_instrument_lists_configured() {
        let mut settings = Settings::default();
        settings.instruments.insert(
            "dut".to_string(),
            InstrumentSettings::mock(InstrumentModel::Keithley2461),
        );
        let err = settings.instrument("gate").unwrap_err();
        assert!(err.to_string().contains("dut"));
    }

    #[test]
    fn test_unknown_model_is_load_error() {
        let file = write_config(
            r#"
            [instruments.dut]
            model = "6221"
            resource = "x"
            "#,
        );
        assert!(matches!(
            Settings::load_from(file.path()),
            Err(ConfigError::Load(_))
        ));
    }
}
