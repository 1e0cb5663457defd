//! Durable recording of telemetry points.
//!
//! A [`RecordingSession`] is owned by the telemetry engine and is either idle
//! or holds one open [`RecordSink`]. A point is appended if and only if the
//! session was active when the point was produced; there is no buffering
//! and no backfill. The CSV sink flushes after every row, so a crash loses at
//! most the row being written.
//!
//! File format:
//!
//! ```text
//! timestamp,Voltage (V),Current (A)
//! 2024-05-01T12:00:00.100+00:00,1,0.001
//! ```

use crate::error::RecordingError;
use crate::telemetry::SamplePoint;
use chrono::{DateTime, Utc};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use uuid::Uuid;

/// Append-only destination for recorded points.
pub trait RecordSink: Send {
    /// Durably append one point.
    fn append(&mut self, point: &SamplePoint) -> Result<(), RecordingError>;

    /// Flush anything buffered.
    fn flush(&mut self) -> Result<(), RecordingError>;

    /// Where the data goes, if it is a file.
    fn location(&self) -> Option<&Path> {
        None
    }
}

/// CSV recording sink.
pub struct CsvRecorder<W: Write> {
    writer: csv::Writer<W>,
    path: Option<PathBuf>,
}

impl CsvRecorder<File> {
    /// Create `telemetry_<YYYYmmdd_HHMMSS>.csv` under `dir` and write the header.
    pub fn create(dir: &Path, labels: &[&str]) -> Result<Self, RecordingError> {
        if !dir.exists() {
            fs::create_dir_all(dir)?;
        }
        let file_name = format!("telemetry_{}.csv", Utc::now().format("%Y%m%d_%H%M%S"));
        let path = dir.join(file_name);
        let file = File::create(&path)?;
        let mut recorder = Self::new(file, labels)?;
        recorder.path = Some(path);
        Ok(recorder)
    }
}

impl<W: Write> CsvRecorder<W> {
    /// Wrap `inner` and write the header row.
    pub fn new(inner: W, labels: &[&str]) -> Result<Self, RecordingError> {
        let mut writer = csv::Writer::from_writer(inner);
        let mut header = Vec::with_capacity(labels.len() + 1);
        header.push("timestamp");
        header.extend_from_slice(labels);
        writer.write_record(&header)?;
        writer.flush()?;
        Ok(Self { writer, path: None })
    }
}

impl<W: Write + Send> RecordSink for CsvRecorder<W> {
    fn append(&mut self, point: &SamplePoint) -> Result<(), RecordingError> {
        let mut record = Vec::with_capacity(
            1 + point.independent.len() + point.dependent.len() + point.current_limit.len(),
        );
        record.push(point.timestamp.to_rfc3339());
        record.extend(
            point
                .independent
                .iter()
                .chain(&point.dependent)
                .chain(&point.current_limit)
                .map(f64::to_string),
        );
        self.writer.write_record(&record)?;
        self.writer.flush()?;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), RecordingError> {
        self.writer.flush()?;
        Ok(())
    }

    fn location(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

/// What a finished session wrote.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordingSummary {
    /// Session identifier.
    pub id: Uuid,
    /// Rows successfully appended.
    pub rows: u64,
    /// Rows whose append failed.
    pub failed: u64,
    /// File written, if any.
    pub location: Option<PathBuf>,
    /// When the session started.
    pub started_at: DateTime<Utc>,
}

struct ActiveRecording {
    id: Uuid,
    sink: Box<dyn RecordSink>,
    rows: u64,
    failed: u64,
    started_at: DateTime<Utc>,
}

/// At most one open recording.
#[derive(Default)]
pub struct RecordingSession {
    active: Option<ActiveRecording>,
}

impl RecordingSession {
    /// An idle session.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a sink is open.
    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    /// Id of the open session.
    pub fn id(&self) -> Option<Uuid> {
        self.active.as_ref().map(|a| a.id)
    }

    /// Start recording into `sink`.
    pub fn start(&mut self, sink: Box<dyn RecordSink>) -> Result<Uuid, RecordingError> {
        if self.active.is_some() {
            return Err(RecordingError::AlreadyActive);
        }
        let id = Uuid::new_v4();
        info!(session = %id, location = ?sink.location(), "recording started");
        self.active = Some(ActiveRecording {
            id,
            sink,
            rows: 0,
            failed: 0,
            started_at: Utc::now(),
        });
        Ok(id)
    }

    /// Append `point` if a session is open. A failure leaves the session
    /// open and earlier rows untouched.
    pub fn append(&mut self, point: &SamplePoint) -> Result<(), RecordingError> {
        let Some(active) = self.active.as_mut() else {
            return Ok(());
        };
        match active.sink.append(point) {
            Ok(()) => {
                active.rows += 1;
                Ok(())
            }
            Err(e) => {
                active.failed += 1;
                warn!(session = %active.id, sequence = point.sequence, error = %e, "recording append failed");
                Err(e)
            }
        }
    }

    /// Flush and close the sink. Returns `None` if nothing was open.
    ///
    /// The session is closed even when the final flush fails.
    pub fn stop(&mut self) -> Result<Option<RecordingSummary>, RecordingError> {
        let Some(mut active) = self.active.take() else {
            return Ok(None);
        };
        let flushed = active.sink.flush();
        let summary = RecordingSummary {
            id: active.id,
            rows: active.rows,
            failed: active.failed,
            location: active.sink.location().map(Path::to_path_buf),
            started_at: active.started_at,
        };
        info!(session = %summary.id, rows = summary.rows, failed = summary.failed, "recording stopped");
        flushed.map(|_| Some(summary))
    }
}

impl std::fmt::Debug for RecordingSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordingSession")
            .field("id", &self.id())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    fn point(sequence: u64) -> SamplePoint {
        SamplePoint {
            timestamp: Utc::now(),
            sequence,
            independent: vec![sequence as f64],
            dependent: vec![sequence as f64 * 1e-3],
            current_limit: vec![0.1],
        }
    }

    struct BrokenWriter;

    impl Write for BrokenWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Err(io::Error::new(io::ErrorKind::Other, "disk full"))
        }
    }

    #[test]
    fn test_csv_rows_written_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = CsvRecorder::create(
            dir.path(),
            &["Voltage (V)", "Current (A)", "Current Limit (A)"],
        )
        .unwrap();
        let path = recorder.location().unwrap().to_path_buf();

        let mut session = RecordingSession::new();
        session.start(Box::new(recorder)).unwrap();
        for i in 0..3 {
            session.append(&point(i)).unwrap();
        }
        let summary = session.stop().unwrap().unwrap();
        assert_eq!(summary.rows, 3);

        let content = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines[0], "timestamp,Voltage (V),Current (A),Current Limit (A)");
        assert_eq!(lines.len(), 4);
        assert!(lines[3].ends_with(",2,0.002,0.1"));
        assert!(path
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("telemetry_"));
    }

    #[test]
    fn test_create_under_a_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not_a_dir");
        fs::write(&blocker, b"").unwrap();
        assert!(matches!(
            CsvRecorder::create(&blocker, &["V"]),
            Err(RecordingError::Io(_))
        ));
    }

    #[test]
    fn test_start_twice_is_already_active() {
        let mut session = RecordingSession::new();
        let sink = CsvRecorder::new(Vec::new(), &["V"]).unwrap();
        session.start(Box::new(sink)).unwrap();
        let again = CsvRecorder::new(Vec::new(), &["V"]).unwrap();
        assert!(matches!(
            session.start(Box::new(again)),
            Err(RecordingError::AlreadyActive)
        ));
    }

    #[test]
    fn test_stop_is_idempotent() {
        let mut session = RecordingSession::new();
        assert!(session.stop().unwrap().is_none());
        session
            .start(Box::new(CsvRecorder::new(Vec::new(), &["V"]).unwrap()))
            .unwrap();
        assert!(session.stop().unwrap().is_some());
        assert!(session.stop().unwrap().is_none());
        assert!(!session.is_active());
    }

    #[test]
    fn test_inactive_append_is_dropped() {
        let mut session = RecordingSession::new();
        assert!(session.append(&point(0)).is_ok());
        assert!(session.id().is_none());
    }

    #[test]
    fn test_write_failure_is_reported_and_session_stays_open() {
        let mut session = RecordingSession::new();
        // `new` would already fail on the header flush.
        let recorder = CsvRecorder {
            writer: csv::Writer::from_writer(BrokenWriter),
            path: None,
        };
        session.start(Box::new(recorder)).unwrap();
        let err = session.append(&point(1)).unwrap_err();
        assert!(matches!(err, RecordingError::Io(_) | RecordingError::Csv(_)));
        assert!(session.is_active());
    }
}
