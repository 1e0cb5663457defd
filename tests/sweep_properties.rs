//! End-to-end sweep behaviour against the simulated instrument.

use smu_daq::connection::{Load, MockConnection};
use smu_daq::error::{DaqError, ValidationError};
use smu_daq::export;
use smu_daq::instrument::{Instrument, InstrumentHandle, InstrumentModel};
use smu_daq::sweep::{PointStatus, SweepController, SweepLimits, SweepOutcome, SweepSpec, SENTINEL};

fn mock_instrument(model: InstrumentModel) -> (InstrumentHandle, MockConnection) {
    let mock = MockConnection::new("SIM::DUT", model).with_load(Load::Resistor { ohms: 500.0 });
    let instrument = Instrument::new("dut", model, Box::new(mock.clone()));
    (InstrumentHandle::new(instrument), mock)
}

#[tokio::test]
async fn test_closed_interval_visits_every_setpoint() {
    let (handle, mock) = mock_instrument(InstrumentModel::Keithley2461);
    let spec = SweepSpec::new(0.0, 5.0, 1.0).unwrap();

    let result = SweepController::new()
        .run(&handle, &spec, &SweepLimits::default())
        .await
        .unwrap();

    assert_eq!(result.outcome, SweepOutcome::Completed);
    let setpoints: Vec<f64> = result.points().map(|(_, p)| p.setpoint).collect();
    assert_eq!(setpoints, vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0]);
    assert_eq!(mock.measurement_count(), 6);
    assert!(!mock.output_on());
    assert!(!handle.is_busy());
}

#[tokio::test]
async fn test_every_point_malformed_still_completes() {
    let (handle, mock) = mock_instrument(InstrumentModel::Keithley2410);
    mock.malformed_always(true);
    let spec = SweepSpec::new(-1.0, 1.0, 0.5).unwrap();

    let result = SweepController::new()
        .run(&handle, &spec, &SweepLimits::default())
        .await
        .unwrap();

    assert!(result.is_complete());
    assert_eq!(result.len(), 5);
    assert_eq!(result.sentinel_count(), 5);
    assert!(result
        .points()
        .all(|(_, p)| p.value == SENTINEL && p.status == PointStatus::Sentinel));
}

#[tokio::test]
async fn test_timeout_aborts_with_partial_result_and_one_disable() {
    let (handle, mock) = mock_instrument(InstrumentModel::Keithley2461);
    mock.inject_timeout_at(3);
    let spec = SweepSpec::new(0.0, 9.0, 1.0).unwrap();

    let result = SweepController::new()
        .run(&handle, &spec, &SweepLimits::default())
        .await
        .unwrap();

    match &result.outcome {
        SweepOutcome::Aborted { at, reason } => {
            assert_eq!(*at, 3);
            assert!(reason.contains("timed out") || reason.contains("timeout"), "{}", reason);
        }
        other => panic!("expected Aborted, got {:?}", other),
    }
    assert_eq!(result.len(), 3);
    assert_eq!(mock.count(":OUTP OFF"), 1);
    assert!(!mock.output_on());
    assert!(!handle.is_busy());
}

#[tokio::test]
async fn test_disconnect_aborts_and_releases_instrument() {
    let (handle, mock) = mock_instrument(InstrumentModel::Keithley2400);
    mock.disconnect_at(2);
    let spec = SweepSpec::new(0.0, 4.0, 1.0).unwrap();

    let result = SweepController::new()
        .run(&handle, &spec, &SweepLimits::default())
        .await
        .unwrap();

    assert!(matches!(result.outcome, SweepOutcome::Aborted { at: 2, .. }));
    assert!(!handle.is_busy());
}

#[tokio::test]
async fn test_invalid_step_sends_nothing() {
    let (handle, mock) = mock_instrument(InstrumentModel::Keithley2461);
    let spec = SweepSpec {
        start: 0.0,
        end: 1.0,
        step: 0.0,
    };

    let err = SweepController::new()
        .run(&handle, &spec, &SweepLimits::default())
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        DaqError::Validation(ValidationError::InvalidSweep(_))
    ));
    assert!(mock.call_log().is_empty());
}

#[tokio::test]
async fn test_out_of_range_end_sends_nothing() {
    let (handle, mock) = mock_instrument(InstrumentModel::Keithley2461);
    let spec = SweepSpec::new(0.0, 150.0, 10.0).unwrap();

    let err = SweepController::new()
        .run(&handle, &spec, &SweepLimits::default())
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        DaqError::Validation(ValidationError::OutOfRange { .. })
    ));
    assert!(mock.call_log().is_empty());
}

#[tokio::test]
async fn test_saved_sweep_loads_for_comparison() {
    let (handle, _mock) = mock_instrument(InstrumentModel::Keithley2461);
    let spec = SweepSpec::new(0.0, 2.0, 0.5).unwrap();
    let result = SweepController::new()
        .run(&handle, &spec, &SweepLimits::default())
        .await
        .unwrap();

    let dir = tempfile::tempdir().unwrap();
    let path = export::save_sweep(&result, dir.path()).unwrap();
    let curves = export::load_comparison(&[path]).unwrap();

    assert_eq!(curves.len(), 1);
    assert_eq!(curves[0].points.len(), 5);
    let (v, i) = curves[0].points[4];
    assert_eq!(v, 2.0);
    assert!((i - 2.0 / 500.0).abs() < 1e-12);
}
