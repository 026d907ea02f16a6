/// Integration tests for alarms raised by the feeder thread
use anyhow::Result;
use legato_core::{PlannerError, alarm::Alarm, axis::Axis, path::Path};
use parking_lot::Mutex;
use std::{sync::Arc, thread, time::Duration};

mod common;
use common::{axes, config, rig, wait_for};

fn record_alarms(rig: &common::Rig) -> Arc<Mutex<Vec<Alarm>>> {
    let alarms = Arc::new(Mutex::new(Vec::new()));
    let sink = alarms.clone();
    rig.planner.on_alarm(move |alarm| sink.lock().push(alarm.clone()));
    alarms
}

#[test]
fn test_endstop_during_cancellable_move_truncates_queue() -> Result<()> {
    let rig = rig(config(4096, 8), 1.0);
    let alarms = record_alarms(&rig);

    for _ in 0..3 {
        rig.planner.add_path(
            Path::relative(axes(&[(Axis::X, 0.02)]), 0.05, 0.5).cancellable(true),
        )?;
    }
    assert!(wait_for(Duration::from_secs(5), || rig.sim.records_executed() > 20));
    rig.sim.press_endstop(Axis::X);

    assert!(wait_for(Duration::from_secs(5), || !alarms.lock().is_empty()));
    match &alarms.lock()[0] {
        Alarm::EndstopHit { axes, .. } => assert_eq!(axes, &[Axis::X]),
        other => panic!("unexpected alarm {other:?}"),
    }
    assert_eq!(rig.planner.queued_len(), 0);
    assert!(!rig.planner.steppers_enabled());
    assert!(rig.planner.fault().is_none());

    let executed = rig.sim.executed_steps()[0];
    assert!(executed < 3000, "executed {executed}");
    rig.planner.wait_until_done()?;

    let actual = rig.planner.get_current_pos(false, false)?;
    let ideal = rig.planner.get_current_pos(false, true)?;
    assert!((actual[&Axis::X] - ideal[&Axis::X]).abs() < 1e-9);
    assert!((actual[&Axis::X] - rig.sim.executed_steps()[0] as f64 / 50_000.0).abs() < 1e-9);
    Ok(())
}

#[test]
fn test_endstop_during_non_cancellable_move_is_not_an_alarm() -> Result<()> {
    let rig = rig(config(64, 8), 1.0);
    let alarms = record_alarms(&rig);

    rig.planner
        .add_path(Path::relative(axes(&[(Axis::X, -0.02)]), 0.05, 0.5))?;
    assert!(wait_for(Duration::from_secs(5), || rig.sim.records_executed() > 10));
    rig.sim.press_endstop(Axis::X);
    rig.planner.wait_until_done()?;

    assert!(alarms.lock().is_empty());
    assert!(rig.planner.steppers_enabled());
    let executed = rig.sim.executed_steps()[0];
    assert!(executed > -1000, "executed {executed}");

    // Suppressed steps are not counted, so the reported position is
    // where the carriage actually stopped.
    let actual = rig.planner.get_current_pos(false, false)?;
    assert!((actual[&Axis::X] - executed as f64 / 50_000.0).abs() < 1e-9);

    rig.sim.release_endstop(Axis::X);
    rig.planner
        .add_path(Path::absolute(axes(&[(Axis::X, 0.0)]), 0.05, 0.5))?;
    rig.planner.wait_until_done()?;
    assert_eq!(rig.sim.executed_steps()[0], 0);
    Ok(())
}

#[test]
fn test_unreachable_position_reset_stops_motion() -> Result<()> {
    let mut config = config(4096, 8);
    config.kinematics = legato_core::kinematics::KinematicMode::Delta;
    let rig = rig(config, 1.0);
    let alarms = record_alarms(&rig);

    rig.planner.suspend();
    let reset = rig.planner.add_path(Path::set_position(axes(&[(Axis::X, -0.5)])))?;
    rig.planner
        .add_path(Path::absolute(axes(&[(Axis::X, 0.01)]), 0.05, 0.5))?;
    rig.planner.resume()?;

    assert!(wait_for(Duration::from_secs(5), || !alarms.lock().is_empty()));
    match &alarms.lock()[0] {
        Alarm::PathUnreachable { path, .. } => assert_eq!(*path, reset),
        other => panic!("unexpected alarm {other:?}"),
    }
    assert!(!alarms.lock()[0].is_fatal());
    assert_eq!(rig.planner.queued_len(), 0);
    assert!(!rig.planner.steppers_enabled());
    assert!(rig.planner.fault().is_none());
    assert_eq!(rig.sim.records_executed(), 0);

    // The chain restarts from where the machine is.
    let ideal = rig.planner.get_current_pos(false, true)?;
    assert!(ideal[&Axis::X].abs() < 1e-9);
    rig.planner
        .add_path(Path::absolute(axes(&[(Axis::X, 0.01)]), 0.05, 0.5))?;
    rig.planner.wait_until_done()?;
    let actual = rig.planner.get_current_pos(false, false)?;
    assert!((actual[&Axis::X] - 0.01).abs() < 1e-4, "{actual:?}");
    Ok(())
}

#[test]
fn test_ring_underrun_is_fatal_until_restart() -> Result<()> {
    let rig = rig(config(16, 8), 0.0);
    let alarms = record_alarms(&rig);

    rig.planner
        .add_path(Path::absolute(axes(&[(Axis::X, 0.01)]), 0.05, 0.5))?;
    let err = rig.planner.wait_until_done().unwrap_err();
    assert!(matches!(
        err,
        PlannerError::Faulted(Alarm::RingBufferUnderrun { path: 0 })
    ));
    assert!(alarms.lock()[0].is_fatal());
    assert!(!rig.planner.steppers_enabled());
    assert!(matches!(
        rig.planner
            .add_path(Path::absolute(axes(&[(Axis::X, 0.0)]), 0.05, 0.5)),
        Err(PlannerError::Faulted(_))
    ));
    assert!(rig.planner.resume().is_err());

    rig.planner.restart()?;
    assert!(rig.planner.fault().is_none());
    let before = rig.sim.executed_steps()[0];
    rig.planner
        .add_path(Path::relative(axes(&[(Axis::X, 0.0001)]), 0.05, 0.5))?;
    rig.planner.wait_until_done()?;
    thread::sleep(Duration::from_millis(10));
    assert_eq!(rig.sim.executed_steps()[0], before + 5);
    Ok(())
}
