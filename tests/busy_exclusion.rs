//! One activity per instrument at a time.

use smu_daq::connection::MockConnection;
use smu_daq::error::DaqError;
use smu_daq::instrument::{Instrument, InstrumentHandle, InstrumentModel};
use smu_daq::sweep::{SweepController, SweepLimits, SweepSpec};
use smu_daq::telemetry::{ChannelConfig, TelemetryEngine, TelemetryLoop};
use std::time::Duration;

fn mock_instrument() -> (InstrumentHandle, MockConnection) {
    let mock = MockConnection::new("SIM::1", InstrumentModel::Keithley2461);
    let instrument = Instrument::new("dut", InstrumentModel::Keithley2461, Box::new(mock.clone()));
    (InstrumentHandle::new(instrument), mock)
}

#[tokio::test]
async fn test_sweep_while_monitoring_is_busy_and_silent() {
    let (handle, mock) = mock_instrument();
    let mut engine = TelemetryEngine::single(&handle, 20).unwrap();
    engine
        .configure(
            ChannelConfig {
                setpoint: 0.5,
                current_limit: 0.01,
            },
            None,
        )
        .await
        .unwrap();
    let mut telemetry = TelemetryLoop::start(engine, Duration::from_millis(20));
    let before = mock.count(":SOUR:VOLT 0");

    let spec = SweepSpec::new(0.0, 1.0, 0.5).unwrap();
    let err = SweepController::new()
        .run(&handle, &spec, &SweepLimits::default())
        .await
        .unwrap_err();

    match err {
        DaqError::Busy { instrument, owner } => {
            assert_eq!(instrument, "dut");
            assert_eq!(owner, "telemetry loop");
        }
        other => panic!("expected Busy, got {:?}", other),
    }
    assert_eq!(mock.count(":SOUR:VOLT 0"), before);
    assert_eq!(mock.count("*RST"), 1);

    telemetry.stop().await.unwrap();
    assert!(!handle.is_busy());
}

#[tokio::test]
async fn test_second_engine_is_busy() {
    let (handle, _mock) = mock_instrument();
    let _first = TelemetryEngine::single(&handle, 20).unwrap();
    assert!(matches!(
        TelemetryEngine::single(&handle, 20),
        Err(DaqError::Busy { .. })
    ));
}

#[tokio::test]
async fn test_concurrent_sweeps_one_wins() {
    let mock =
        MockConnection::new("SIM::1", InstrumentModel::Keithley2461).with_latency(Duration::from_millis(1));
    let handle = InstrumentHandle::new(Instrument::new(
        "dut",
        InstrumentModel::Keithley2461,
        Box::new(mock.clone()),
    ));
    let spec = SweepSpec::new(0.0, 2.0, 1.0).unwrap();
    let limits = SweepLimits::default();

    let controller_a = SweepController::new();
    let controller_b = SweepController::new();
    let first = controller_a.run(&handle, &spec, &limits);
    let second = controller_b.run(&handle, &spec, &limits);
    let (a, b) = tokio::join!(first, second);

    let outcomes = [a.is_ok(), b.is_ok()];
    assert_eq!(outcomes.iter().filter(|ok| **ok).count(), 1);
    assert!(matches!(
        if a.is_err() { a } else { b },
        Err(DaqError::Busy { .. })
    ));
    assert_eq!(mock.count("*RST"), 1);
}
