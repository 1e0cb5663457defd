//! CLI entry point for smu-daq.
//!
//! ```bash
//! smu_daq sweep --instrument dut --start 0 --end 5 --step 0.1
//! smu_daq mosfet --mode output --gate g --drain d \
//!     --outer-start 0 --outer-end 3 --outer-step 1 \
//!     --inner-start 0 --inner-end 5 --inner-step 0.5
//! smu_daq monitor --instrument dut --setpoint 1.0 --duration 30s --record
//! smu_daq compare data/sweep_a.csv data/sweep_b.csv
//! ```
//!
//! `--simulate` replaces every transport with the built-in mock.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use smu_daq::config::{InstrumentSettings, Settings, DEFAULT_CONFIG_PATH};
use smu_daq::export;
use smu_daq::instrument::{Instrument, InstrumentHandle, InstrumentModel};
use smu_daq::recording::{CsvRecorder, RecordSink};
use smu_daq::sweep::{
    CharacterizationMode, NestedLimits, NestedSweepSpec, SweepController, SweepLimits, SweepResult,
    SweepSpec,
};
use smu_daq::telemetry::{ChannelConfig, TelemetryEngine, TelemetryLoop};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "smu_daq")]
#[command(about = "Sweeps and live monitoring for source/measure units", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Use simulated instruments instead of the configured transports
    #[arg(long, global = true)]
    simulate: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Single-instrument I-V sweep
    Sweep {
        /// Configured instrument id
        #[arg(long)]
        instrument: String,
        #[arg(long, allow_hyphen_values = true)]
        start: f64,
        #[arg(long, allow_hyphen_values = true)]
        end: f64,
        #[arg(long, allow_hyphen_values = true)]
        step: f64,
        /// Current limit in amperes (defaults to the configured value)
        #[arg(long)]
        current_limit: Option<f64>,
        /// Output directory (defaults to storage.output_dir)
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Gate/drain sweep producing output or transfer curves
    Mosfet {
        /// output (Id-Vds) or transfer (Id-Vgs)
        #[arg(long, default_value = "output")]
        mode: CharacterizationMode,
        #[arg(long)]
        gate: String,
        #[arg(long)]
        drain: String,
        #[arg(long, allow_hyphen_values = true)]
        outer_start: f64,
        #[arg(long, allow_hyphen_values = true)]
        outer_end: f64,
        #[arg(long, allow_hyphen_values = true)]
        outer_step: f64,
        #[arg(long, allow_hyphen_values = true)]
        inner_start: f64,
        #[arg(long, allow_hyphen_values = true)]
        inner_end: f64,
        #[arg(long, allow_hyphen_values = true)]
        inner_step: f64,
        #[arg(long)]
        gate_limit: Option<f64>,
        #[arg(long)]
        drain_limit: Option<f64>,
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Live telemetry at a fixed setpoint
    Monitor {
        /// Instrument id; the gate when --drain is given
        #[arg(long)]
        instrument: String,
        /// Second instrument, sampled together with the first
        #[arg(long)]
        drain: Option<String>,
        #[arg(long, default_value_t = 0.0, allow_hyphen_values = true)]
        setpoint: f64,
        #[arg(long, default_value_t = 0.0, allow_hyphen_values = true)]
        drain_setpoint: f64,
        #[arg(long)]
        current_limit: Option<f64>,
        /// Stop after this long (e.g. "30s"); runs until Ctrl-C otherwise
        #[arg(long, value_parser = humantime_serde::re::humantime::parse_duration)]
        duration: Option<Duration>,
        /// Record every point to CSV
        #[arg(long)]
        record: bool,
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Summarise up to six saved I-V curves
    Compare {
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings = Settings::load_from(&cli.config)
        .with_context(|| format!("Failed to load configuration from {}", cli.config.display()))?;
    smu_daq::logging::init(&settings.application.log_level, settings.application.json_logs)?;

    match cli.command {
        Commands::Sweep {
            instrument,
            start,
            end,
            step,
            current_limit,
            output,
        } => {
            let spec = SweepSpec::new(start, end, step)?;
            let limits = SweepLimits {
                current_limit: current_limit.unwrap_or(settings.sweep.current_limit),
            };
            let handle = open_instrument(&settings, &instrument, cli.simulate).await?;

            let (controller, cancel) = cancellable(&settings);
            let result = controller.run(&handle, &spec, &limits).await;
            cancel.abort();
            finish_sweep(result?, output.unwrap_or(settings.storage.output_dir))
        }

        Commands::Mosfet {
            mode,
            gate,
            drain,
            outer_start,
            outer_end,
            outer_step,
            inner_start,
            inner_end,
            inner_step,
            gate_limit,
            drain_limit,
            output,
        } => {
            let spec = NestedSweepSpec {
                mode,
                outer: SweepSpec::new(outer_start, outer_end, outer_step)?,
                inner: SweepSpec::new(inner_start, inner_end, inner_step)?,
            };
            let limits = NestedLimits {
                gate_current_limit: gate_limit.unwrap_or(settings.sweep.current_limit),
                drain_current_limit: drain_limit.unwrap_or(settings.sweep.current_limit),
            };
            let gate = open_instrument(&settings, &gate, cli.simulate).await?;
            let drain = open_instrument(&settings, &drain, cli.simulate).await?;

            let (controller, cancel) = cancellable(&settings);
            let result = controller.run_nested(&gate, &drain, &spec, &limits).await;
            cancel.abort();
            finish_sweep(result?, output.unwrap_or(settings.storage.output_dir))
        }

        Commands::Monitor {
            instrument,
            drain,
            setpoint,
            drain_setpoint,
            current_limit,
            duration,
            record,
            output,
        } => {
            let limit = current_limit.unwrap_or(settings.sweep.current_limit);
            let primary = open_instrument(&settings, &instrument, cli.simulate).await?;
            let secondary = match &drain {
                Some(id) => Some(open_instrument(&settings, id, cli.simulate).await?),
                None => None,
            };

            let window_len = settings.telemetry.window_len;
            let mut engine = match &secondary {
                Some(drain) => TelemetryEngine::pair(&primary, drain, window_len)?,
                None => TelemetryEngine::single(&primary, window_len)?,
            };
            let primary_config = ChannelConfig {
                setpoint,
                current_limit: limit,
            };
            let secondary_config = secondary.as_ref().map(|_| ChannelConfig {
                setpoint: drain_setpoint,
                current_limit: limit,
            });
            engine.configure(primary_config, secondary_config).await?;

            if record {
                let dir = output.unwrap_or(settings.storage.output_dir);
                let started = CsvRecorder::create(&dir, &engine.labels()).and_then(|sink| {
                    if let Some(path) = RecordSink::location(&sink) {
                        println!("Recording to {}", path.display());
                    }
                    engine.start_recording(Box::new(sink))
                });
                if let Err(e) = started {
                    if let Err(teardown) = engine.shutdown().await {
                        warn!(error = %teardown, "teardown after recording failure was incomplete");
                    }
                    return Err(e).context(format!("cannot record to {}", dir.display()));
                }
            }

            let mut telemetry = TelemetryLoop::start(engine, settings.telemetry.period);
            let mut points = telemetry.subscribe();
            println!("{}", telemetry.labels().join(", "));

            let deadline = async {
                match duration {
                    Some(d) => tokio::time::sleep(d).await,
                    None => std::future::pending().await,
                }
            };
            tokio::pin!(deadline);

            loop {
                tokio::select! {
                    _ = &mut deadline => break,
                    _ = tokio::signal::ctrl_c() => {
                        info!("interrupted");
                        break;
                    }
                    _ = telemetry.closed() => break,
                    received = points.recv() => match received {
                        Ok(point) => {
                            let values: Vec<String> = point
                                .independent
                                .iter()
                                .chain(&point.dependent)
                                .chain(&point.current_limit)
                                .map(|v| format!("{:.6e}", v))
                                .collect();
                            println!("{}", values.join(", "));
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!(skipped = n, "display fell behind");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }

            if let Some(summary) = telemetry.stop().await? {
                println!(
                    "Recorded {} rows ({} failed){}",
                    summary.rows,
                    summary.failed,
                    summary
                        .location
                        .map(|p| format!(" to {}", p.display()))
                        .unwrap_or_default()
                );
            }
            Ok(())
        }

        Commands::Compare { files } => {
            for curve in export::load_comparison(&files)? {
                let (v_min, v_max) = curve.voltage_span().unwrap_or_default();
                let (i_min, i_max) = curve.current_span().unwrap_or_default();
                println!(
                    "{}: {} points, V [{}, {}], I [{:e}, {:e}]",
                    curve.name,
                    curve.points.len(),
                    v_min,
                    v_max,
                    i_min,
                    i_max
                );
            }
            Ok(())
        }
    }
}

async fn open_instrument(settings: &Settings, id: &str, simulate: bool) -> Result<InstrumentHandle> {
    let instrument_settings = match settings.instrument(id) {
        Ok(s) => s.clone(),
        Err(_) if simulate => {
            warn!(instrument = id, "not configured, simulating a 2461");
            InstrumentSettings::mock(InstrumentModel::Keithley2461)
        }
        Err(e) => return Err(e.into()),
    };

    let mut instrument = Instrument::connect(id, &instrument_settings, simulate).await?;
    let idn = instrument
        .identify()
        .await
        .with_context(|| format!("Instrument '{}' did not identify", id))?;
    println!("{}: {}", id, idn);
    Ok(InstrumentHandle::new(instrument))
}

/// Controller that stops at the next setpoint on Ctrl-C.
fn cancellable(settings: &Settings) -> (SweepController, tokio::task::JoinHandle<()>) {
    let (tx, rx) = watch::channel(false);
    let listener = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupted, stopping sweep");
            let _ = tx.send(true);
        }
    });
    let controller = SweepController::new()
        .with_settle_delay(settings.sweep.settle_delay)
        .with_cancellation(rx);
    (controller, listener)
}

fn finish_sweep(result: SweepResult, dir: PathBuf) -> Result<()> {
    println!("{}", result.kind.labels().join(", "));
    for row in result.rows() {
        let values: Vec<String> = row.iter().map(|v| format!("{:e}", v)).collect();
        println!("{}", values.join(", "));
    }
    if result.sentinel_count() > 0 {
        warn!(
            sentinels = result.sentinel_count(),
            "some points could not be measured"
        );
    }
    println!("Outcome: {:?}", result.outcome);

    if result.is_empty() {
        return Ok(());
    }
    let path = export::save_sweep(&result, &dir)?;
    println!("Saved {}", path.display());
    Ok(())
}
