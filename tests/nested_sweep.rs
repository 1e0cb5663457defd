//! Gate/drain sweeps for MOSFET output and transfer curves.

use smu_daq::connection::{Load, MockConnection};
use smu_daq::error::DaqError;
use smu_daq::export;
use smu_daq::instrument::{Instrument, InstrumentHandle, InstrumentModel};
use smu_daq::sweep::{
    CharacterizationMode, NestedLimits, NestedSweepSpec, SweepController, SweepKind, SweepOutcome,
    SweepSpec,
};

struct Bench {
    gate: InstrumentHandle,
    gate_mock: MockConnection,
    drain: InstrumentHandle,
    drain_mock: MockConnection,
}

fn bench() -> Bench {
    let gate_mock = MockConnection::new("SIM::GATE", InstrumentModel::Keithley2400)
        .with_load(Load::Resistor { ohms: 1e9 });
    let drain_mock = MockConnection::new("SIM::DRAIN", InstrumentModel::Keithley2410)
        .with_load(Load::Resistor { ohms: 200.0 });
    Bench {
        gate: InstrumentHandle::new(Instrument::new(
            "gate",
            InstrumentModel::Keithley2400,
            Box::new(gate_mock.clone()),
        )),
        gate_mock,
        drain: InstrumentHandle::new(Instrument::new(
            "drain",
            InstrumentModel::Keithley2410,
            Box::new(drain_mock.clone()),
        )),
        drain_mock,
    }
}

fn spec(mode: CharacterizationMode) -> NestedSweepSpec {
    NestedSweepSpec {
        mode,
        outer: SweepSpec::new(0.0, 2.0, 1.0).unwrap(),
        inner: SweepSpec::new(0.0, 1.0, 0.25).unwrap(),
    }
}

#[tokio::test]
async fn test_output_curves_measure_drain() {
    let bench = bench();
    let result = SweepController::new()
        .run_nested(
            &bench.gate,
            &bench.drain,
            &spec(CharacterizationMode::Output),
            &NestedLimits::default(),
        )
        .await
        .unwrap();

    assert_eq!(result.outcome, SweepOutcome::Completed);
    assert_eq!(result.curves.len(), 3);
    assert!(result.curves.iter().all(|c| c.points.len() == 5));
    assert_eq!(
        result.curves.iter().map(|c| c.outer).collect::<Vec<_>>(),
        vec![Some(0.0), Some(1.0), Some(2.0)]
    );

    // Only the drain is read.
    assert_eq!(bench.drain_mock.measurement_count(), 15);
    assert_eq!(bench.gate_mock.measurement_count(), 0);

    let last = result.curves[2].points[4];
    assert_eq!(last.setpoint, 1.0);
    assert!((last.value - 0.005).abs() < 1e-12);

    assert!(!bench.gate_mock.output_on());
    assert!(!bench.drain_mock.output_on());
    assert_eq!(bench.gate_mock.count(":OUTP OFF"), 1);
    assert_eq!(bench.drain_mock.count(":OUTP OFF"), 1);
}

#[tokio::test]
async fn test_transfer_steps_drain_outer() {
    let bench = bench();
    let result = SweepController::new()
        .run_nested(
            &bench.gate,
            &bench.drain,
            &spec(CharacterizationMode::Transfer),
            &NestedLimits::default(),
        )
        .await
        .unwrap();

    assert!(matches!(
        result.kind,
        SweepKind::Nested {
            mode: CharacterizationMode::Transfer,
            ..
        }
    ));
    // Drain held at the outer value while the gate sweeps.
    let second_curve = &result.curves[1];
    assert_eq!(second_curve.outer, Some(1.0));
    assert!(second_curve
        .points
        .iter()
        .all(|p| (p.value - 0.005).abs() < 1e-12));
    assert_eq!(
        second_curve.points.iter().map(|p| p.setpoint).collect::<Vec<_>>(),
        vec![0.0, 0.25, 0.5, 0.75, 1.0]
    );
}

#[tokio::test]
async fn test_drain_loss_aborts_and_disables_both() {
    let bench = bench();
    bench.drain_mock.inject_timeout_at(7);

    let result = SweepController::new()
        .run_nested(
            &bench.gate,
            &bench.drain,
            &spec(CharacterizationMode::Output),
            &NestedLimits::default(),
        )
        .await
        .unwrap();

    assert!(matches!(result.outcome, SweepOutcome::Aborted { at: 7, .. }));
    assert_eq!(result.curves.len(), 2);
    assert!(!bench.gate_mock.output_on());
    assert!(!bench.drain_mock.output_on());
    assert!(!bench.gate.is_busy() && !bench.drain.is_busy());
}

#[tokio::test]
async fn test_busy_drain_blocks_whole_sweep() {
    let bench = bench();
    let _held = bench.drain.acquire("someone else").unwrap();

    let err = SweepController::new()
        .run_nested(
            &bench.gate,
            &bench.drain,
            &spec(CharacterizationMode::Output),
            &NestedLimits::default(),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, DaqError::Busy { ref owner, .. } if owner == "someone else"));
    assert!(bench.gate_mock.call_log().is_empty());
    assert!(!bench.gate.is_busy());
}

#[tokio::test]
async fn test_nested_export_has_three_columns() {
    let bench = bench();
    let result = SweepController::new()
        .run_nested(
            &bench.gate,
            &bench.drain,
            &spec(CharacterizationMode::Output),
            &NestedLimits::default(),
        )
        .await
        .unwrap();

    let mut buf = Vec::new();
    export::write_sweep_csv(&result, &mut buf).unwrap();
    let text = String::from_utf8(buf).unwrap();
    let data: Vec<&str> = text.lines().filter(|l| !l.starts_with('#')).collect();
    assert_eq!(data[0], "Vgs (V),Vds (V),Id (A)");
    assert_eq!(data.len(), 1 + 15);
    assert_eq!(data[15], "2,1,0.005");
}
