//! Periodic sampling with live display and optional recording.
//!
//! [`TelemetryLoop`] runs a [`TelemetryEngine`] on a tokio task:
//!
//! ```text
//!            ┌──────── commands (mpsc + oneshot reply) ────────┐
//!  caller ───┤                                                 ▼
//!            └── stop (watch) ──►  select! { stop | command | tick }
//!                                              │
//!                          sample ─► cancelled? ─► accept ─► window / recording
//!                                              │
//!                           broadcast ◄────────┴────────► watch (snapshot)
//! ```
//!
//! The task is the only writer of the window and the recording session.
//! Readers get copies: each new point is broadcast, and the latest window
//! snapshot is published through a watch channel.
//!
//! A point whose read completes after `stop()` is discarded, never stored or
//! broadcast. On exit, for any reason, the engine disables every output and
//! closes the instruments.

pub mod engine;
pub mod window;

pub use engine::{TelemetryEngine, TickOutcome};
pub use window::{RollingWindow, DEFAULT_WINDOW_LEN};

use crate::error::{DaqError, DaqResult, RecordingError, ValidationError};
use crate::instrument::{InstrumentProfile, SourceFunction};
use crate::recording::{RecordSink, RecordingSummary};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Default tick period.
pub const DEFAULT_PERIOD: Duration = Duration::from_millis(100);

const COMMAND_CAPACITY: usize = 16;
const BROADCAST_CAPACITY: usize = 256;

/// One telemetry observation. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplePoint {
    /// When the read completed.
    pub timestamp: DateTime<Utc>,
    /// Per-loop counter, starting at zero.
    pub sequence: u64,
    /// Commanded setpoints, one per channel.
    pub independent: Vec<f64>,
    /// Measured currents, one per channel.
    pub dependent: Vec<f64>,
    /// Current limit in force when the read was taken, one per channel.
    pub current_limit: Vec<f64>,
}

/// Which instrument of the loop a live command targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    /// The only instrument, or the gate of a pair.
    Primary,
    /// The drain of a pair.
    Secondary,
}

/// Initial source settings for one channel.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Voltage setpoint.
    pub setpoint: f64,
    /// Current limit in amperes.
    pub current_limit: f64,
}

impl ChannelConfig {
    /// Check both values against `profile`.
    pub fn validate(&self, profile: &InstrumentProfile) -> Result<(), ValidationError> {
        profile.validate_setpoint(SourceFunction::Voltage, self.setpoint)?;
        profile.validate_current_limit(self.current_limit)
    }
}

/// Requests handled by the loop task between ticks.
pub enum LoopCommand {
    /// Open a recording session.
    StartRecording {
        /// Destination.
        sink: Box<dyn RecordSink>,
        /// Session id, or `AlreadyActive`.
        response: oneshot::Sender<Result<Uuid, RecordingError>>,
    },
    /// Close the recording session.
    StopRecording {
        /// Summary of the closed session, if one was open.
        response: oneshot::Sender<Result<Option<RecordingSummary>, RecordingError>>,
    },
    /// Change a channel's setpoint.
    SetSetpoint {
        /// Target channel.
        channel: Channel,
        /// New setpoint.
        value: f64,
        /// Validation or device failure.
        response: oneshot::Sender<DaqResult<()>>,
    },
    /// Change a channel's current limit.
    SetCurrentLimit {
        /// Target channel.
        channel: Channel,
        /// New limit in amperes.
        value: f64,
        /// Validation or device failure.
        response: oneshot::Sender<DaqResult<()>>,
    },
}

impl LoopCommand {
    /// Recording request plus the receiver that gets the session id.
    pub fn start_recording(
        sink: Box<dyn RecordSink>,
    ) -> (Self, oneshot::Receiver<Result<Uuid, RecordingError>>) {
        let (tx, rx) = oneshot::channel();
        (Self::StartRecording { sink, response: tx }, rx)
    }

    /// Stop request; the reply carries the closed session's summary.
    pub fn stop_recording() -> (
        Self,
        oneshot::Receiver<Result<Option<RecordingSummary>, RecordingError>>,
    ) {
        let (tx, rx) = oneshot::channel();
        (Self::StopRecording { response: tx }, rx)
    }

    /// Setpoint change for `channel`, answered once it is applied or rejected.
    pub fn set_setpoint(channel: Channel, value: f64) -> (Self, oneshot::Receiver<DaqResult<()>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self::SetSetpoint {
                channel,
                value,
                response: tx,
            },
            rx,
        )
    }

    /// Current-limit change for `channel`, answered once it is applied or rejected.
    pub fn set_current_limit(
        channel: Channel,
        value: f64,
    ) -> (Self, oneshot::Receiver<DaqResult<()>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self::SetCurrentLimit {
                channel,
                value,
                response: tx,
            },
            rx,
        )
    }
}

impl std::fmt::Debug for LoopCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoopCommand::StartRecording { .. } => write!(f, "StartRecording"),
            LoopCommand::StopRecording { .. } => write!(f, "StopRecording"),
            LoopCommand::SetSetpoint { channel, value, .. } => {
                write!(f, "SetSetpoint({:?}, {})", channel, value)
            }
            LoopCommand::SetCurrentLimit { channel, value, .. } => {
                write!(f, "SetCurrentLimit({:?}, {})", channel, value)
            }
        }
    }
}

/// Handle to a running telemetry task.
pub struct TelemetryLoop {
    commands: mpsc::Sender<LoopCommand>,
    stop: watch::Sender<bool>,
    points: broadcast::Sender<SamplePoint>,
    window: watch::Receiver<Arc<Vec<SamplePoint>>>,
    labels: Vec<&'static str>,
    finished: watch::Receiver<bool>,
    task: Option<JoinHandle<DaqResult<Option<RecordingSummary>>>>,
}

impl TelemetryLoop {
    /// Spawn the sampling task. The engine should already be configured.
    ///
    /// The first tick fires immediately, then every `period`.
    pub fn start(engine: TelemetryEngine, period: Duration) -> Self {
        let (commands, command_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (stop, stop_rx) = watch::channel(false);
        let (points, _) = broadcast::channel(BROADCAST_CAPACITY);
        let (window_tx, window) = watch::channel(Arc::new(Vec::new()));
        let (finished_tx, finished) = watch::channel(false);
        let labels = engine.labels();

        info!(?period, "starting telemetry loop");
        let broadcaster = points.clone();
        let task = tokio::spawn(async move {
            let result = run(engine, period, command_rx, stop_rx, broadcaster, window_tx).await;
            let _ = finished_tx.send(true);
            result
        });

        Self {
            commands,
            stop,
            points,
            window,
            labels,
            finished,
            task: Some(task),
        }
    }

    /// Column labels of the points this loop produces.
    pub fn labels(&self) -> &[&'static str] {
        &self.labels
    }

    /// Receive every point produced from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<SamplePoint> {
        self.points.subscribe()
    }

    /// Copy of the rolling window as of the last accepted point.
    pub fn snapshot(&self) -> Arc<Vec<SamplePoint>> {
        self.window.borrow().clone()
    }

    /// Watch channel that changes after every accepted point.
    pub fn watch_window(&self) -> watch::Receiver<Arc<Vec<SamplePoint>>> {
        self.window.clone()
    }

    /// Whether the task is still sampling.
    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Resolves once the task has exited, for any reason, and the
    /// instruments are torn down. Collect the outcome with [`stop`](Self::stop).
    pub async fn closed(&self) {
        let mut finished = self.finished.clone();
        // A dropped sender means the task is gone as well.
        let _ = finished.wait_for(|done| *done).await;
    }

    async fn request<T>(&self, command: LoopCommand, response: oneshot::Receiver<T>) -> DaqResult<T> {
        self.commands
            .send(command)
            .await
            .map_err(|_| DaqError::NotRunning)?;
        response.await.map_err(|_| DaqError::NotRunning)
    }

    /// Start recording every subsequent point into `sink`.
    pub async fn start_recording(&self, sink: Box<dyn RecordSink>) -> DaqResult<Uuid> {
        let (command, response) = LoopCommand::start_recording(sink);
        Ok(self.request(command, response).await??)
    }

    /// Stop recording. Returns `None` if no session was open.
    pub async fn stop_recording(&self) -> DaqResult<Option<RecordingSummary>> {
        let (command, response) = LoopCommand::stop_recording();
        Ok(self.request(command, response).await??)
    }

    /// Change a channel's setpoint between ticks.
    pub async fn set_setpoint(&self, channel: Channel, value: f64) -> DaqResult<()> {
        let (command, response) = LoopCommand::set_setpoint(channel, value);
        self.request(command, response).await?
    }

    /// Change a channel's current limit between ticks.
    pub async fn set_current_limit(&self, channel: Channel, value: f64) -> DaqResult<()> {
        let (command, response) = LoopCommand::set_current_limit(channel, value);
        self.request(command, response).await?
    }

    /// Stop sampling and wait for teardown.
    ///
    /// Idempotent: later calls return `Ok(None)`. Returns the summary of a
    /// recording that was still open, or the error that halted the loop.
    pub async fn stop(&mut self) -> DaqResult<Option<RecordingSummary>> {
        let _ = self.stop.send(true);
        let Some(task) = self.task.take() else {
            return Ok(None);
        };
        match task.await {
            Ok(result) => result,
            Err(e) => {
                error!(error = %e, "telemetry task failed");
                Err(DaqError::NotRunning)
            }
        }
    }
}

impl Drop for TelemetryLoop {
    fn drop(&mut self) {
        // The task still tears down on its own once signalled.
        let _ = self.stop.send(true);
    }
}

impl std::fmt::Debug for TelemetryLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelemetryLoop")
            .field("labels", &self.labels)
            .field("running", &self.is_running())
            .finish()
    }
}

async fn handle_command(engine: &mut TelemetryEngine, command: LoopCommand) {
    debug!(?command, "telemetry command");
    match command {
        LoopCommand::StartRecording { sink, response } => {
            let _ = response.send(engine.start_recording(sink));
        }
        LoopCommand::StopRecording { response } => {
            let _ = response.send(engine.stop_recording());
        }
        LoopCommand::SetSetpoint {
            channel,
            value,
            response,
        } => {
            let _ = response.send(engine.set_setpoint(channel, value).await);
        }
        LoopCommand::SetCurrentLimit {
            channel,
            value,
            response,
        } => {
            let _ = response.send(engine.set_current_limit(channel, value).await);
        }
    }
}

async fn run(
    mut engine: TelemetryEngine,
    period: Duration,
    mut commands: mpsc::Receiver<LoopCommand>,
    mut stop: watch::Receiver<bool>,
    points: broadcast::Sender<SamplePoint>,
    window: watch::Sender<Arc<Vec<SamplePoint>>>,
) -> DaqResult<Option<RecordingSummary>> {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut halted_by = None;

    loop {
        tokio::select! {
            biased;

            _ = stop.changed() => break,

            Some(command) = commands.recv() => handle_command(&mut engine, command).await,

            _ = interval.tick() => {
                let sampled = engine.sample().await;
                if *stop.borrow() {
                    debug!("discarding sample read after stop");
                    break;
                }
                match sampled {
                    Ok(point) => {
                        if let Err(e) = engine.accept(&point) {
                            warn!(sequence = point.sequence, error = %e, "recording degraded, acquisition continues");
                        }
                        let _ = window.send(Arc::new(engine.window().snapshot()));
                        let _ = points.send(point);
                    }
                    Err(e) if e.is_fatal() => {
                        error!(error = %e, "instrument unreachable, halting telemetry");
                        halted_by = Some(e);
                        break;
                    }
                    Err(e) => {
                        warn!(error = %e, "telemetry read failed, skipping tick");
                    }
                }
            }
        }
    }

    let teardown = engine.shutdown().await;
    match halted_by {
        Some(e) => {
            if let Err(teardown_err) = teardown {
                warn!(error = %teardown_err, "teardown after transport loss was incomplete");
            }
            Err(e.into())
        }
        None => teardown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{Load, MockConnection};
    use crate::instrument::{Instrument, InstrumentHandle, InstrumentModel};
    use crate::recording::CsvRecorder;

    async fn running_loop(period: Duration) -> (TelemetryLoop, InstrumentHandle, MockConnection) {
        let mock = MockConnection::new("SIM::1", InstrumentModel::Keithley2461)
            .with_load(Load::Resistor { ohms: 1000.0 });
        let handle = InstrumentHandle::new(Instrument::new(
            "dut",
            InstrumentModel::Keithley2461,
            Box::new(mock.clone()),
        ));
        let mut engine = TelemetryEngine::single(&handle, DEFAULT_WINDOW_LEN).unwrap();
        engine
            .configure(
                ChannelConfig {
                    setpoint: 1.0,
                    current_limit: 0.1,
                },
                None,
            )
            .await
            .unwrap();
        (TelemetryLoop::start(engine, period), handle, mock)
    }

    #[tokio::test]
    async fn test_points_are_broadcast() {
        let (mut telemetry, _handle, _mock) = running_loop(Duration::from_millis(10)).await;
        let mut rx = telemetry.subscribe();
        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert!(second.sequence > first.sequence);
        assert!(second.timestamp >= first.timestamp);
        assert!(!telemetry.snapshot().is_empty());
        telemetry.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_and_disables_output() {
        let (mut telemetry, handle, mock) = running_loop(Duration::from_millis(10)).await;
        let mut rx = telemetry.subscribe();
        rx.recv().await.unwrap();

        assert!(telemetry.stop().await.unwrap().is_none());
        assert!(telemetry.stop().await.unwrap().is_none());
        assert!(!telemetry.is_running());
        assert!(!mock.output_on());
        assert_eq!(mock.count(":OUTP OFF"), 1);
        assert!(!handle.is_busy());
        assert!(matches!(
            telemetry.set_setpoint(Channel::Primary, 1.0).await,
            Err(DaqError::NotRunning)
        ));
    }

    #[tokio::test]
    async fn test_no_point_after_stop() {
        let (mut telemetry, _handle, _mock) = running_loop(Duration::from_millis(5)).await;
        let mut rx = telemetry.subscribe();
        rx.recv().await.unwrap();
        telemetry.stop().await.unwrap();

        let last = telemetry.snapshot().last().map(|p| p.sequence);
        while rx.try_recv().is_ok() {}
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert!(matches!(
            rx.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
        assert_eq!(telemetry.snapshot().last().map(|p| p.sequence), last);
    }

    #[tokio::test]
    async fn test_live_setpoint_change() {
        let (mut telemetry, _handle, _mock) = running_loop(Duration::from_millis(10)).await;
        assert!(matches!(
            telemetry.set_setpoint(Channel::Primary, 250.0).await,
            Err(DaqError::Validation(_))
        ));
        telemetry.set_setpoint(Channel::Primary, 2.0).await.unwrap();

        let mut rx = telemetry.subscribe();
        let point = rx.recv().await.unwrap();
        assert_eq!(point.independent, vec![2.0]);
        assert!((point.dependent[0] - 2e-3).abs() < 1e-12);
        telemetry.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_recording_through_loop() {
        let dir = tempfile::tempdir().unwrap();
        let (mut telemetry, _handle, _mock) = running_loop(Duration::from_millis(10)).await;
        let sink = CsvRecorder::create(dir.path(), telemetry.labels()).unwrap();

        telemetry.start_recording(Box::new(sink)).await.unwrap();
        let again = CsvRecorder::new(Vec::new(), telemetry.labels()).unwrap();
        assert!(matches!(
            telemetry.start_recording(Box::new(again)).await,
            Err(DaqError::Recording(RecordingError::AlreadyActive))
        ));

        let mut rx = telemetry.subscribe();
        rx.recv().await.unwrap();
        let summary = telemetry.stop_recording().await.unwrap().unwrap();
        assert!(summary.rows >= 1);
        assert!(telemetry.stop_recording().await.unwrap().is_none());
        telemetry.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_closed_resolves_after_transport_loss() {
        let (mut telemetry, _handle, mock) = running_loop(Duration::from_millis(5)).await;
        let mut rx = telemetry.subscribe();
        mock.inject_timeout_at(2);

        tokio::time::timeout(Duration::from_secs(2), telemetry.closed())
            .await
            .unwrap();
        assert!(!mock.output_on());
        // The broadcast stays open while the handle lives.
        while rx.try_recv().is_ok() {}
        assert!(matches!(
            rx.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
        assert!(telemetry.stop().await.unwrap_err().is_transport());
        telemetry.closed().await;
    }

    #[tokio::test]
    async fn test_recording_started_before_loop_keeps_first_point() {
        let dir = tempfile::tempdir().unwrap();
        let mock = MockConnection::new("SIM::1", InstrumentModel::Keithley2461)
            .with_load(Load::Resistor { ohms: 1000.0 });
        let handle = InstrumentHandle::new(Instrument::new(
            "dut",
            InstrumentModel::Keithley2461,
            Box::new(mock.clone()),
        ));
        let mut engine = TelemetryEngine::single(&handle, 1000).unwrap();
        engine
            .configure(
                ChannelConfig {
                    setpoint: 1.0,
                    current_limit: 0.1,
                },
                None,
            )
            .await
            .unwrap();
        let sink = CsvRecorder::create(dir.path(), &engine.labels()).unwrap();
        engine.start_recording(Box::new(sink)).unwrap();

        let mut telemetry = TelemetryLoop::start(engine, Duration::from_millis(10));
        let mut rx = telemetry.subscribe();
        rx.recv().await.unwrap();
        let summary = telemetry.stop().await.unwrap().unwrap();

        let snapshot = telemetry.snapshot();
        assert_eq!(snapshot[0].sequence, 0);
        assert_eq!(summary.rows as usize, snapshot.len());
        assert!(!mock.output_on());
    }

    #[tokio::test]
    async fn test_transport_loss_halts_loop() {
        let (mut telemetry, handle, mock) = running_loop(Duration::from_millis(5)).await;
        mock.inject_timeout_at(2);

        tokio::time::timeout(Duration::from_secs(2), async {
            while telemetry.is_running() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        assert!(telemetry.stop().await.unwrap_err().is_transport());
        assert!(!mock.output_on());
        assert!(!mock.is_connected());
        assert!(!handle.is_busy());
    }
}
