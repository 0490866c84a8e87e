//! Integration tests for the simulated instruments
//!
//! These tests verify that the mocks and protocol simulators all see one
//! optical bench, so that stage and laser actions change what the lock-in
//! measures.

use daq_core::capabilities::{LockIn, Movable, PollRequest, WavelengthTunable};
use daq_driver_mock::*;
use std::sync::Arc;

fn quiet_model() -> TimeZeroModel {
    TimeZeroModel {
        noise: 1e-7,
        ..TimeZeroModel::default()
    }
}

async fn magnitude(lockin: &dyn LockIn) -> f64 {
    lockin
        .poll(PollRequest::default())
        .await
        .unwrap()
        .mean_magnitude()
        .unwrap()
}

/// Test that the capability mocks work together through trait objects
#[tokio::test]
async fn test_capability_mocks_share_the_bench() {
    let bench = OpticalBench::new(quiet_model());
    let stage: Arc<dyn Movable> = Arc::new(MockStage::new(bench.clone()));
    let laser: Arc<dyn WavelengthTunable> = Arc::new(MockLaser::new(bench.clone()));
    let lockin: Arc<dyn LockIn> = Arc::new(MockLockIn::new(bench.clone()).with_seed(3));

    assert_eq!(laser.set_wavelength(900).await.unwrap(), 900);
    let t0 = bench.model().time_zero(900);

    stage.move_abs(t0).await.unwrap();
    let on_peak = magnitude(lockin.as_ref()).await;
    stage.move_abs(t0 + 0.1).await.unwrap();
    let off_peak = magnitude(lockin.as_ref()).await;

    assert!(on_peak > 0.9e-3, "{on_peak}");
    assert!(off_peak < 1e-5, "{off_peak}");
    assert_eq!(
        laser.coupled_axis_position().await.unwrap(),
        Some(OpticalBench::dsm_position_for(900))
    );
}

/// Test that a coarse manual sweep finds the model's time zero
#[tokio::test]
async fn test_manual_sweep_finds_time_zero() {
    let bench = OpticalBench::new(quiet_model());
    let stage = MockStage::new(bench.clone());
    let lockin = MockLockIn::new(bench.clone()).with_seed(11);
    let t0 = bench.model().time_zero(bench.wavelength());

    let positions: Vec<f64> = (0..=40).map(|i| t0 - 0.1 + 0.005 * f64::from(i)).collect();
    let mut best = (f64::NEG_INFINITY, 0.0);
    for &position in &positions {
        stage.move_abs(position).await.unwrap();
        let r = magnitude(&lockin).await;
        if r > best.0 {
            best = (r, position);
        }
    }

    assert!((best.1 - t0).abs() < 0.005 + 1e-9, "{} vs {t0}", best.1);
    assert_eq!(stage.move_count(), positions.len());
    assert_eq!(lockin.poll_count(), positions.len());
}

/// Test that protocol-level commands move the same bench the lock-in reads
#[tokio::test(start_paused = true)]
async fn test_protocol_simulators_drive_the_bench() {
    let bench = OpticalBench::new(quiet_model());
    let stage = SimulatedStage::new(bench.clone());
    let laser = SimulatedLaser::new(bench.clone());
    let lockin = MockLockIn::new(bench.clone()).with_seed(5);

    laser.handle("WAVelength 900");
    assert_eq!(bench.wavelength(), 900);
    assert_eq!(laser.handle("WAVelength?").as_deref(), Some("900"));

    stage.handle("1PA-25.0");
    assert_eq!(stage.state_code(), "28");
    tokio::time::advance(std::time::Duration::from_secs(6)).await;
    assert_eq!(stage.state_code(), "33");
    assert_eq!(bench.stage_position(), -25.0);

    assert!(magnitude(&lockin).await > 0.9e-3);
    assert_eq!(stage.commands(), vec!["1PA-25.0".to_string()]);
}

/// Test fault injection on the mocks
#[tokio::test]
async fn test_fault_injection() {
    let bench = OpticalBench::default();
    let stage = MockStage::new(bench.clone());
    let laser = MockLaser::new(bench.clone());
    let lockin = MockLockIn::new(bench.clone());

    stage.refuse_move_to(1.0);
    let err = stage.move_abs(1.0).await.unwrap_err();
    assert!(err.to_string().contains("Following error"));
    assert_eq!(bench.stage_position(), 0.0);

    laser.make_unreachable(950);
    assert!(laser.set_wavelength(950).await.is_err());
    assert_eq!(bench.wavelength(), 800);

    lockin.go_silent_at(800);
    assert!(lockin.poll(PollRequest::default()).await.is_err());
}
