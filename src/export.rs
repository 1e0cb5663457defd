//! Sweep result files and curve comparison.
//!
//! Sweep CSVs start with the run's metadata as `# `-prefixed JSON lines,
//! followed by a header and one row per point:
//!
//! ```text
//! # {
//! #   "kind": { "kind": "single", "instrument": "dut" },
//! #   ...
//! # }
//! Voltage (V),Current (A)
//! 0,0
//! 1,0.001
//! ```
//!
//! Comment lines are skipped when reading files back for comparison.

use crate::error::{DaqError, DaqResult, ValidationError};
use crate::sweep::{SweepKind, SweepOutcome, SweepResult};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::info;

/// Most files [`load_comparison`] accepts.
pub const MAX_COMPARISON_FILES: usize = 6;

#[derive(Serialize)]
struct SweepMetadata<'a> {
    kind: &'a SweepKind,
    outcome: &'a SweepOutcome,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
    points: usize,
    sentinels: usize,
}

/// Write `result` as commented CSV.
pub fn write_sweep_csv<W: Write>(result: &SweepResult, mut writer: W) -> DaqResult<()> {
    let metadata = SweepMetadata {
        kind: &result.kind,
        outcome: &result.outcome,
        started_at: result.started_at,
        finished_at: result.finished_at,
        points: result.len(),
        sentinels: result.sentinel_count(),
    };
    let json = serde_json::to_string_pretty(&metadata)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    for line in json.lines() {
        writeln!(writer, "# {}", line)?;
    }

    let mut csv = csv::Writer::from_writer(writer);
    csv.write_record(result.kind.labels())?;
    for row in result.rows() {
        csv.write_record(row.iter().map(f64::to_string))?;
    }
    csv.flush()?;
    Ok(())
}

/// Save `result` as `sweep_<YYYYmmdd_HHMMSS>.csv` under `dir`.
pub fn save_sweep(result: &SweepResult, dir: &Path) -> DaqResult<PathBuf> {
    if !dir.exists() {
        fs::create_dir_all(dir)?;
    }
    let path = dir.join(format!(
        "sweep_{}.csv",
        result.finished_at.format("%Y%m%d_%H%M%S")
    ));
    write_sweep_csv(result, File::create(&path)?)?;
    info!(path = %path.display(), points = result.len(), "sweep saved");
    Ok(path)
}

/// A two-column I-V curve loaded from disk.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadedCurve {
    /// File stem, used as the plot label.
    pub name: String,
    /// `(voltage, current)` pairs in file order.
    pub points: Vec<(f64, f64)>,
}

impl LoadedCurve {
    /// Smallest and largest voltage, if any.
    pub fn voltage_span(&self) -> Option<(f64, f64)> {
        span(self.points.iter().map(|p| p.0))
    }

    /// Smallest and largest current, if any.
    pub fn current_span(&self) -> Option<(f64, f64)> {
        span(self.points.iter().map(|p| p.1))
    }
}

fn span(values: impl Iterator<Item = f64>) -> Option<(f64, f64)> {
    values.fold(None, |acc, v| match acc {
        None => Some((v, v)),
        Some((lo, hi)) => Some((lo.min(v), hi.max(v))),
    })
}

/// Read the first two columns of an I-V CSV, skipping `#` comments and the
/// header row.
pub fn read_curve_csv(path: &Path) -> DaqResult<LoadedCurve> {
    let mut reader = csv::ReaderBuilder::new()
        .comment(Some(b'#'))
        .has_headers(true)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_path(path)?;

    let mut points = Vec::new();
    for (index, record) in reader.records().enumerate() {
        let record = record?;
        let field = |i: usize| -> DaqResult<f64> {
            record
                .get(i)
                .and_then(|s| s.parse::<f64>().ok())
                .ok_or_else(|| {
                    DaqError::Io(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!(
                            "{}: row {} column {} is not a number",
                            path.display(),
                            index + 1,
                            i + 1
                        ),
                    ))
                })
        };
        points.push((field(0)?, field(1)?));
    }

    let name = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());
    Ok(LoadedCurve { name, points })
}

/// Load up to [`MAX_COMPARISON_FILES`] curves for overlay.
pub fn load_comparison<P: AsRef<Path>>(paths: &[P]) -> DaqResult<Vec<LoadedCurve>> {
    if paths.is_empty() {
        return Err(ValidationError::Unsupported("no files to compare".to_string()).into());
    }
    if paths.len() > MAX_COMPARISON_FILES {
        return Err(ValidationError::Unsupported(format!(
            "at most {} files can be compared, got {}",
            MAX_COMPARISON_FILES,
            paths.len()
        ))
        .into());
    }
    paths.iter().map(|p| read_curve_csv(p.as_ref())).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sweep::{CharacterizationMode, PointStatus, SweepPoint};

    fn single_result() -> SweepResult {
        let mut result = SweepResult::new(SweepKind::Single {
            instrument: "dut".into(),
        });
        for (v, i) in [(0.0, 0.0), (0.5, 5e-4), (1.0, 1e-3)] {
            result.push(SweepPoint {
                setpoint: v,
                value: i,
                status: PointStatus::Measured,
            });
        }
        result
    }

    #[test]
    fn test_single_sweep_csv_layout() {
        let mut buf = Vec::new();
        write_sweep_csv(&single_result(), &mut buf).unwrap();
        let text = String::from_utf8(buf).unwrap();

        let data: Vec<&str> = text.lines().filter(|l| !l.starts_with('#')).collect();
        assert_eq!(data[0], "Voltage (V),Current (A)");
        assert_eq!(data[2], "0.5,0.0005");
        assert_eq!(data.len(), 4);
        assert!(text.starts_with("# {"));
        assert!(text.contains("\"sentinels\": 0"));
    }

    #[test]
    fn test_nested_header() {
        let mut result = SweepResult::new(SweepKind::Nested {
            mode: CharacterizationMode::Transfer,
            gate: "g".into(),
            drain: "d".into(),
        });
        result.begin_curve(Some(5.0));
        result.push(SweepPoint {
            setpoint: 1.0,
            value: 2e-3,
            status: PointStatus::Measured,
        });
        let mut buf = Vec::new();
        write_sweep_csv(&result, &mut buf).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert!(text.contains("Vds (V),Vgs (V),Id (A)\n5,1,0.002"));
    }

    #[test]
    fn test_saved_sweep_reads_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = save_sweep(&single_result(), dir.path()).unwrap();
        assert!(path.file_name().unwrap().to_string_lossy().starts_with("sweep_"));

        let curve = read_curve_csv(&path).unwrap();
        assert_eq!(curve.points.len(), 3);
        assert_eq!(curve.points[2], (1.0, 1e-3));
        assert_eq!(curve.voltage_span(), Some((0.0, 1.0)));
    }

    #[test]
    fn test_reads_plain_two_column_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("diode_a.csv");
        fs::write(&path, "Voltage (V), Current (A)\n0.0, 0.0\n0.6, 1.2e-3\n").unwrap();
        let curve = read_curve_csv(&path).unwrap();
        assert_eq!(curve.name, "diode_a");
        assert_eq!(curve.points[1], (0.6, 1.2e-3));
    }

    #[test]
    fn test_rejects_non_numeric_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.csv");
        fs::write(&path, "V,I\n0.1,abc\n").unwrap();
        assert!(read_curve_csv(&path).is_err());
    }

    #[test]
    fn test_comparison_limit() {
        let paths: Vec<PathBuf> = (0..7).map(|i| PathBuf::from(format!("{}.csv", i))).collect();
        assert!(matches!(
            load_comparison(&paths),
            Err(DaqError::Validation(ValidationError::Unsupported(_)))
        ));
        let none: Vec<PathBuf> = Vec::new();
        assert!(load_comparison(&none).is_err());
    }
}
