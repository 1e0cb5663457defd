//! Timer-free core of the telemetry loop.
//!
//! `TelemetryEngine` owns the instrument lease(s), the rolling window and the
//! recording session. It has no timer of its own: every call to
//! [`tick`](TelemetryEngine::tick) performs exactly one read and, on success,
//! one window push and one recording append. [`TelemetryLoop`](super::TelemetryLoop)
//! calls it on a schedule; tests call it directly.

use super::window::RollingWindow;
use super::{Channel, ChannelConfig, SamplePoint};
use crate::error::{DaqError, DaqResult, DeviceError, RecordingError, ValidationError};
use crate::instrument::{Instrument, InstrumentHandle, InstrumentLease, SourceFunction};
use crate::recording::{RecordSink, RecordingSession, RecordingSummary};
use chrono::Utc;
use futures::future;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const OWNER: &str = "telemetry loop";

/// Result of one tick.
#[derive(Debug)]
pub enum TickOutcome {
    /// A point was produced and stored.
    Sampled {
        /// The new point.
        point: SamplePoint,
        /// Set when the recording append failed; acquisition continues.
        recording_error: Option<RecordingError>,
    },
    /// The read failed for this tick only.
    Skipped(DeviceError),
    /// The transport is gone. The engine must be shut down.
    Fatal(DeviceError),
}

/// Telemetry state for one instrument or a gate/drain pair.
pub struct TelemetryEngine {
    primary: InstrumentLease,
    secondary: Option<InstrumentLease>,
    window: RollingWindow,
    recording: RecordingSession,
    sequence: u64,
    halted: bool,
}

impl TelemetryEngine {
    /// Claim one instrument. Fails with `Busy` if it is already owned.
    pub fn single(handle: &InstrumentHandle, window_len: usize) -> DaqResult<Self> {
        Ok(Self {
            primary: handle.acquire(OWNER)?,
            secondary: None,
            window: RollingWindow::new(window_len),
            recording: RecordingSession::new(),
            sequence: 0,
            halted: false,
        })
    }

    /// Claim a gate and a drain instrument, read together on every tick.
    pub fn pair(
        gate: &InstrumentHandle,
        drain: &InstrumentHandle,
        window_len: usize,
    ) -> DaqResult<Self> {
        if gate.id() == drain.id() {
            return Err(ValidationError::Unsupported(format!(
                "gate and drain must be different instruments, both are '{}'",
                gate.id()
            ))
            .into());
        }
        let primary = gate.acquire(OWNER)?;
        let secondary = drain.acquire(OWNER)?;
        Ok(Self {
            primary,
            secondary: Some(secondary),
            window: RollingWindow::new(window_len),
            recording: RecordingSession::new(),
            sequence: 0,
            halted: false,
        })
    }

    /// Column labels: setpoints, then currents, then current limits.
    pub fn labels(&self) -> Vec<&'static str> {
        if self.secondary.is_some() {
            vec![
                "Gate Voltage (V)",
                "Drain Voltage (V)",
                "Gate Current (A)",
                "Drain Current (A)",
                "Gate Current Limit (A)",
                "Drain Current Limit (A)",
            ]
        } else {
            vec!["Voltage (V)", "Current (A)", "Current Limit (A)"]
        }
    }

    fn channel_mut(&mut self, channel: Channel) -> DaqResult<&mut Instrument> {
        match channel {
            Channel::Primary => Ok(&mut *self.primary),
            Channel::Secondary => match self.secondary.as_mut() {
                Some(lease) => Ok(&mut **lease),
                None => Err(ValidationError::Unsupported(
                    "no secondary channel in single-instrument telemetry".to_string(),
                )
                .into()),
            },
        }
    }

    /// Validate, then reset and configure every channel and enable output.
    ///
    /// Nothing is sent unless every config is valid. If any channel fails to
    /// configure, every claimed instrument is disabled and closed before the
    /// error is returned.
    pub async fn configure(
        &mut self,
        primary: ChannelConfig,
        secondary: Option<ChannelConfig>,
    ) -> DaqResult<()> {
        if secondary.is_some() != self.secondary.is_some() {
            return Err(ValidationError::Unsupported(
                "channel configs do not match the claimed instruments".to_string(),
            )
            .into());
        }
        primary.validate(self.primary.profile())?;
        if let (Some(config), Some(lease)) = (&secondary, &self.secondary) {
            config.validate(lease.profile())?;
        }

        let mut configured = setup(&mut self.primary, &primary).await;
        if configured.is_ok() {
            if let (Some(config), Some(lease)) = (&secondary, self.secondary.as_mut()) {
                configured = setup(lease, config).await;
            }
        }
        if let Err(e) = configured {
            error!(instrument = self.primary.id(), error = %e, "telemetry configuration failed, disabling outputs");
            let mut errors = Vec::new();
            if let Some(lease) = self.secondary.as_mut() {
                teardown(lease, &mut errors).await;
            }
            teardown(&mut self.primary, &mut errors).await;
            self.halted = true;
            return Err(e);
        }
        info!(instrument = self.primary.id(), pair = self.secondary.is_some(), "telemetry configured");
        Ok(())
    }

    /// Read the instrument(s) once. Does not touch the window or recording.
    pub async fn sample(&mut self) -> Result<SamplePoint, DeviceError> {
        let primary = &mut self.primary;
        let (independent, dependent, current_limit) = match self.secondary.as_mut() {
            None => {
                let current = primary.read_measurement().await?;
                let state = primary.state();
                (vec![state.setpoint], vec![current], vec![state.current_limit])
            }
            Some(secondary) => {
                let (gate, drain) =
                    future::join(primary.read_measurement(), secondary.read_measurement()).await;
                // A transport failure on either side outranks a malformed reply.
                let (gate, drain) = match (gate, drain) {
                    (Ok(g), Ok(d)) => (g, d),
                    (Err(e), _) | (_, Err(e)) if e.is_fatal() => return Err(e),
                    (Err(e), _) | (_, Err(e)) => return Err(e),
                };
                let (gate_state, drain_state) = (primary.state(), secondary.state());
                (
                    vec![gate_state.setpoint, drain_state.setpoint],
                    vec![gate, drain],
                    vec![gate_state.current_limit, drain_state.current_limit],
                )
            }
        };

        let point = SamplePoint {
            timestamp: Utc::now(),
            sequence: self.sequence,
            independent,
            dependent,
            current_limit,
        };
        self.sequence += 1;
        Ok(point)
    }

    /// Store a point: push it into the window and append it to an active
    /// recording. A recording failure is returned but the point stays in the
    /// window.
    pub fn accept(&mut self, point: &SamplePoint) -> Result<(), RecordingError> {
        self.window.push(point.clone());
        self.recording.append(point)
    }

    /// One full tick: sample, then accept.
    pub async fn tick(&mut self) -> TickOutcome {
        if self.halted {
            return TickOutcome::Fatal(DeviceError::Unreachable(
                crate::error::TransportError::Closed,
            ));
        }
        match self.sample().await {
            Ok(point) => {
                let recording_error = self.accept(&point).err();
                TickOutcome::Sampled {
                    point,
                    recording_error,
                }
            }
            Err(e) if e.is_fatal() => {
                self.halted = true;
                TickOutcome::Fatal(e)
            }
            Err(e) => {
                warn!(sequence = self.sequence, error = %e, "telemetry read failed, skipping tick");
                TickOutcome::Skipped(e)
            }
        }
    }

    /// The rolling display window.
    pub fn window(&self) -> &RollingWindow {
        &self.window
    }

    /// Whether a recording is open.
    pub fn is_recording(&self) -> bool {
        self.recording.is_active()
    }

    /// Open a recording session into `sink`.
    pub fn start_recording(&mut self, sink: Box<dyn RecordSink>) -> Result<Uuid, RecordingError> {
        self.recording.start(sink)
    }

    /// Close the recording session, if any.
    pub fn stop_recording(&mut self) -> Result<Option<RecordingSummary>, RecordingError> {
        self.recording.stop()
    }

    /// Change a channel's setpoint. Validated before sending.
    pub async fn set_setpoint(&mut self, channel: Channel, value: f64) -> DaqResult<()> {
        let instrument = self.channel_mut(channel)?;
        instrument.set_setpoint(value).await?;
        debug!(instrument = instrument.id(), value, "setpoint changed");
        Ok(())
    }

    /// Change a channel's current limit. Validated before sending.
    pub async fn set_current_limit(&mut self, channel: Channel, amps: f64) -> DaqResult<()> {
        let instrument = self.channel_mut(channel)?;
        instrument.set_current_limit(amps).await?;
        debug!(instrument = instrument.id(), amps, "current limit changed");
        Ok(())
    }

    /// Stop recording, disable every output and close the instruments.
    ///
    /// Every step is attempted. Returns the recording summary, or
    /// `ShutdownFailed` listing each step that failed.
    pub async fn shutdown(mut self) -> DaqResult<Option<RecordingSummary>> {
        let mut errors: Vec<DaqError> = Vec::new();

        let summary = match self.recording.stop() {
            Ok(summary) => summary,
            Err(e) => {
                warn!(error = %e, "failed to finalize recording");
                errors.push(e.into());
                None
            }
        };

        if let Some(lease) = self.secondary.as_mut() {
            teardown(lease, &mut errors).await;
        }
        teardown(&mut self.primary, &mut errors).await;

        info!(samples = self.sequence, "telemetry stopped");
        if errors.is_empty() {
            Ok(summary)
        } else {
            Err(DaqError::ShutdownFailed(errors))
        }
    }
}

impl std::fmt::Debug for TelemetryEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelemetryEngine")
            .field("primary", &self.primary.id())
            .field("secondary", &self.secondary.as_ref().map(|l| l.id().to_string()))
            .field("sequence", &self.sequence)
            .field("recording", &self.recording)
            .finish()
    }
}

async fn setup(instrument: &mut Instrument, config: &ChannelConfig) -> DaqResult<()> {
    instrument.reset().await?;
    instrument.configure_as_source(SourceFunction::Voltage).await?;
    instrument.set_current_limit(config.current_limit).await?;
    instrument.set_setpoint(config.setpoint).await?;
    instrument.set_output_enabled(true).await?;
    Ok(())
}

async fn teardown(instrument: &mut Instrument, errors: &mut Vec<DaqError>) {
    if !instrument.is_open() {
        return;
    }
    if let Err(e) = instrument.set_output_enabled(false).await {
        warn!(instrument = instrument.id(), error = %e, "failed to disable output");
        errors.push(e.into());
    }
    if let Err(e) = instrument.close().await {
        warn!(instrument = instrument.id(), error = %e, "failed to close instrument");
        errors.push(e.into());
    }
}
