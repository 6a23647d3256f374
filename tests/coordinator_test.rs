//! Water phantom coordinator integration tests
//!
//! Runs `WaterPhantom` against the simulated TMCM module and the simulated
//! cylinder firmware. Time is paused so cylinder travel and poll delays
//! auto-advance; the stepper simulator counts bus transactions instead of
//! time.

use phantom_core::capabilities::{AxisId, ReachState};
use phantom_core::error::PhantomError;
use phantom_driver_cylinder::sim::{SimulatedCylinder, SimulatedCylinderOptions};
use phantom_driver_cylinder::{CylinderConfig, CylinderDriver};
use phantom_driver_trinamic::sim::{SimulatedTmcm, SimulatedTmcmHandle, SimulatedTmcmOptions};
use phantom_driver_trinamic::tmcl::TmclCommand;
use phantom_driver_trinamic::{StepperConfig, StepperDriver};
use std::time::Duration;
use water_phantom::config::MotionConfig;
use water_phantom::{MotionState, WaterPhantom};

fn motion() -> MotionConfig {
    MotionConfig {
        poll_interval_ms: 5,
        max_poll_interval_ms: 50,
        backoff_factor: 1.5,
        move_timeout_ms: 2_000,
        startup_timeout_ms: 2_000,
    }
}

fn stepper_config() -> StepperConfig {
    StepperConfig {
        homing_poll_interval_ms: 1,
        home_settle_ms: 1,
        homing_timeout_ms: 1_000,
        ..StepperConfig::default()
    }
}

struct Rig {
    phantom: WaterPhantom,
    tmcm: SimulatedTmcmHandle,
    cylinder: Option<SimulatedCylinder>,
}

async fn stepper(options: SimulatedTmcmOptions) -> (StepperDriver, SimulatedTmcmHandle) {
    let (bus, handle) = SimulatedTmcm::new(options);
    let driver = StepperDriver::with_bus(Box::new(bus), stepper_config())
        .await
        .unwrap();
    (driver, handle)
}

async fn rig() -> Rig {
    let (stepper, tmcm) = stepper(SimulatedTmcmOptions::default()).await;
    let (port, sim) = SimulatedCylinder::spawn(SimulatedCylinderOptions {
        initial_percent: 40.0,
        ..Default::default()
    });
    let cylinder = CylinderDriver::with_port(port, CylinderConfig::default());

    let phantom = WaterPhantom::from_drivers(stepper, Some(cylinder), motion())
        .await
        .unwrap();
    Rig {
        phantom,
        tmcm,
        cylinder: Some(sim),
    }
}

async fn rig_without_cylinder() -> Rig {
    let (stepper, tmcm) = stepper(SimulatedTmcmOptions::default()).await;
    let phantom = WaterPhantom::from_drivers(stepper, None, motion()).await.unwrap();
    Rig {
        phantom,
        tmcm,
        cylinder: None,
    }
}

fn assert_close(actual: f64, expected: f64, tolerance: f64) {
    assert!(
        (actual - expected).abs() <= tolerance,
        "expected {expected} ± {tolerance}, got {actual}"
    );
}

#[tokio::test(start_paused = true)]
async fn startup_homes_steppers_and_zeroes_cylinder() {
    let rig = rig().await;
    let sim = rig.cylinder.as_ref().unwrap();

    assert_eq!(rig.phantom.state(), MotionState::Ready);
    assert_eq!(rig.phantom.axis_ids(), vec![AxisId::X, AxisId::Y, AxisId::Z]);
    assert_eq!(sim.commands()[0], "Z=0.0");
    assert_eq!(sim.position_percent(), 0.0);

    let positions = rig.phantom.positions().await.unwrap();
    assert_eq!(positions[0], (AxisId::X, 0.0));
    assert_eq!(positions[1], (AxisId::Y, 0.0));
    assert_eq!(positions[2].0, AxisId::Z);
    assert_close(positions[2].1, 2.3, 1e-9);

    let rfs = TmclCommand::Rfs.number();
    assert_eq!(
        rig.tmcm.requests().iter().filter(|r| r.command == rfs && r.kind == 0).count(),
        2
    );
}

#[tokio::test(start_paused = true)]
async fn blocking_move_reaches_all_three_axes() {
    let mut rig = rig().await;

    rig.phantom.move_to_coords(1.0, 1.0, 3.0, true).await.unwrap();
    assert_eq!(rig.phantom.state(), MotionState::Ready);
    assert!(rig.phantom.position_reached().await.unwrap());

    assert_eq!(rig.tmcm.actual_position(0), 64_000);
    assert_eq!(rig.tmcm.actual_position(1), 64_000);

    let sim = rig.cylinder.as_ref().unwrap();
    assert!(sim.commands().contains(&"Z=2.3".to_string()));
    let positions = rig.phantom.positions().await.unwrap();
    assert_close(positions[2].1, 3.0, 0.05);
}

#[tokio::test(start_paused = true)]
async fn negative_z_uses_magnitude() {
    let mut rig = rig().await;

    rig.phantom.move_to_coords(0.0, 0.0, -17.2, true).await.unwrap();
    let sim = rig.cylinder.as_ref().unwrap();
    assert!(sim.commands().contains(&"Z=50.0".to_string()));
}

#[tokio::test(start_paused = true)]
async fn non_blocking_move_then_wait() {
    let mut rig = rig().await;
    rig.tmcm.set_move_ticks(10);

    rig.phantom.move_to_coords(5.0, 6.0, 10.0, false).await.unwrap();
    assert_eq!(rig.phantom.state(), MotionState::Moving);
    assert!(!rig.phantom.position_reached().await.unwrap());

    rig.phantom.wait_until_reached().await.unwrap();
    assert_eq!(rig.phantom.state(), MotionState::Ready);

    let positions = rig.phantom.positions().await.unwrap();
    assert_eq!(positions[0], (AxisId::X, 5.0));
    assert_eq!(positions[1], (AxisId::Y, 6.0));
    assert_close(positions[2].1, 10.0, 0.05);
}

#[tokio::test(start_paused = true)]
async fn out_of_range_target_sends_nothing() {
    let mut rig = rig().await;
    rig.tmcm.clear_requests();
    let sim = rig.cylinder.as_ref().unwrap();
    let sent = sim.commands().len();

    let err = rig
        .phantom
        .move_to_coords(20.01, 1.0, 3.0, true)
        .await
        .unwrap_err();
    assert!(matches!(err, PhantomError::Range { axis: AxisId::X, .. }), "{err}");

    let err = rig
        .phantom
        .move_to_coords(1.0, 1.0, 40.0, true)
        .await
        .unwrap_err();
    assert!(matches!(err, PhantomError::Range { axis: AxisId::Z, .. }), "{err}");

    assert!(rig.tmcm.requests().is_empty());
    assert_eq!(sim.commands().len(), sent);
    assert_eq!(rig.phantom.state(), MotionState::Ready);
}

#[tokio::test(start_paused = true)]
async fn silent_cylinder_reports_partial_move() {
    let mut rig = rig().await;
    rig.cylinder.as_ref().unwrap().set_mute_reached(true);

    let err = rig
        .phantom
        .move_to_coords(2.0, 2.0, 5.0, true)
        .await
        .unwrap_err();
    match err {
        PhantomError::PartialMove {
            reached,
            pending,
            timeout,
        } => {
            assert_eq!(reached, vec![AxisId::X, AxisId::Y]);
            assert_eq!(pending, vec![AxisId::Z]);
            assert_eq!(timeout, Duration::from_millis(2_000));
        }
        other => panic!("expected partial move, got {other:?}"),
    }
    assert_eq!(rig.phantom.state(), MotionState::Moving);
}

#[tokio::test(start_paused = true)]
async fn stalled_steppers_report_partial_move() {
    let mut rig = rig().await;
    rig.tmcm.set_stall(true);

    let err = rig
        .phantom
        .move_to_coords(3.0, 4.0, 3.0, true)
        .await
        .unwrap_err();
    match err {
        PhantomError::PartialMove { reached, pending, .. } => {
            assert_eq!(reached, vec![AxisId::Z]);
            assert_eq!(pending, vec![AxisId::X, AxisId::Y]);
        }
        other => panic!("expected partial move, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn reached_requires_every_axis() {
    let mut rig = rig().await;
    rig.cylinder.as_ref().unwrap().set_move_time(Duration::from_secs(10));

    rig.phantom.move_to_coords(1.0, 2.0, 20.0, false).await.unwrap();

    // Every stepper poll advances the simulated module by one tick.
    for _ in 0..5 {
        rig.phantom.axis_states().await.unwrap();
    }
    let states = rig.phantom.axis_states().await.unwrap();
    assert!(states[0].1.is_reached());
    assert!(states[1].1.is_reached());
    assert_eq!(states[2].1, ReachState::Moving);
    assert!(!rig.phantom.position_reached().await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn disabled_cylinder_ignores_z() {
    let mut rig = rig_without_cylinder().await;
    assert!(!rig.phantom.has_cylinder());
    assert_eq!(rig.phantom.axis_ids(), vec![AxisId::X, AxisId::Y]);

    rig.phantom.move_to_coords(4.0, 8.0, 99.0, true).await.unwrap();
    let positions = rig.phantom.positions().await.unwrap();
    assert_eq!(positions, vec![(AxisId::X, 4.0), (AxisId::Y, 8.0)]);
}

#[tokio::test(start_paused = true)]
async fn stop_halts_steppers_and_skips_cylinder() {
    let mut rig = rig().await;
    rig.tmcm.set_stall(true);

    rig.phantom.move_to_coords(10.0, 10.0, 20.0, false).await.unwrap();
    assert!(rig.tmcm.is_busy(0));

    rig.phantom.stop().await.unwrap();
    assert!(!rig.tmcm.is_busy(0));
    assert!(!rig.tmcm.is_busy(1));
    assert_eq!(rig.phantom.state(), MotionState::Ready);
}

#[tokio::test(start_paused = true)]
async fn failed_homing_aborts_startup() {
    let (stepper, tmcm) = stepper(SimulatedTmcmOptions {
        fail_homing: true,
        ..Default::default()
    })
    .await;

    let err = WaterPhantom::from_drivers(stepper, None, motion())
        .await
        .err()
        .unwrap();
    assert!(matches!(err, PhantomError::Timeout { .. }), "{err}");
    assert!(!tmcm.is_busy(0));
    assert!(!tmcm.is_busy(1));
}

#[tokio::test(start_paused = true)]
async fn shutdown_stops_motors() {
    let rig = rig().await;
    rig.tmcm.set_stall(true);
    rig.tmcm.clear_requests();

    rig.phantom.shutdown().await.unwrap();

    let mst = TmclCommand::Mst.number();
    let stops: Vec<u8> = rig
        .tmcm
        .requests()
        .iter()
        .filter(|r| r.command == mst)
        .map(|r| r.motor)
        .collect();
    assert_eq!(stops, vec![0, 1]);
}

#[tokio::test(start_paused = true)]
async fn released_session_leaves_moves_running() {
    let mut rig = rig().await;
    rig.tmcm.set_move_ticks(10);
    rig.cylinder.as_ref().unwrap().set_move_time(Duration::from_secs(5));

    rig.phantom.move_to_coords(5.0, 6.0, 10.0, false).await.unwrap();
    rig.tmcm.clear_requests();

    rig.phantom.finish(Ok(())).await.unwrap();

    let mst = TmclCommand::Mst.number();
    assert!(rig.tmcm.requests().iter().all(|r| r.command != mst));
    assert_eq!(rig.tmcm.target_position(0), 320_000);
    assert_eq!(rig.tmcm.target_position(1), 384_000);
    assert!(rig.tmcm.is_busy(0));
    assert!(rig.tmcm.is_busy(1));

    // let the firmware task pick up the last command
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(rig.cylinder.as_ref().unwrap().is_moving());
}

#[tokio::test(start_paused = true)]
async fn finishing_a_settled_session_stops_motors() {
    let mut rig = rig().await;

    rig.phantom.move_to_coords(1.0, 1.0, 3.0, true).await.unwrap();
    rig.tmcm.clear_requests();

    rig.phantom.finish(Ok(())).await.unwrap();

    let mst = TmclCommand::Mst.number();
    assert_eq!(rig.tmcm.requests().iter().filter(|r| r.command == mst).count(), 2);
}

#[tokio::test(start_paused = true)]
async fn failed_move_outranks_failed_shutdown() {
    let mut rig = rig().await;
    rig.tmcm.set_stall(true);

    let outcome = rig.phantom.move_to_coords(3.0, 4.0, 3.0, true).await;
    assert!(matches!(outcome, Err(PhantomError::PartialMove { .. })));
    rig.tmcm.set_reject_stop(true);

    let err = rig.phantom.finish(outcome).await.unwrap_err();
    assert!(matches!(err, PhantomError::PartialMove { .. }), "{err}");
    assert!(rig.tmcm.is_busy(0));
}

#[tokio::test(start_paused = true)]
async fn failed_move_still_stops_motors() {
    let mut rig = rig().await;
    rig.tmcm.set_stall(true);

    let outcome = rig.phantom.move_to_coords(3.0, 4.0, 3.0, true).await;
    let err = rig.phantom.finish(outcome).await.unwrap_err();

    assert!(matches!(err, PhantomError::PartialMove { .. }), "{err}");
    assert!(!rig.tmcm.is_busy(0));
    assert!(!rig.tmcm.is_busy(1));
}

#[tokio::test(start_paused = true)]
async fn rejected_stop_fails_shutdown() {
    let rig = rig().await;
    rig.tmcm.set_reject_stop(true);

    let err = rig.phantom.finish(Ok(())).await.unwrap_err();
    assert!(matches!(err, PhantomError::Rejected { .. }), "{err}");
}
