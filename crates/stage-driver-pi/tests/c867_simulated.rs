//! C-867 driver tests against the in-process simulated controller.
//!
//! These exercise the full stack: connect sequence, homing interlock, busy
//! position reports, macro execution and error propagation.

use stage_core::capabilities::{Homeable, MacroRunner, Movable};
use stage_core::driver::Capability;
use stage_driver_pi::codec::params;
use stage_driver_pi::sim::codes;
use stage_driver_pi::{
    C867Config, C867Driver, GcsError, HomingState, ParamValue, PositionReading, SimHandle,
    SimulatedController, TravelLimits,
};
use std::time::Duration;

fn test_config() -> C867Config {
    let mut config = C867Config::new("sim");
    config.timeout_ms = 200;
    config.home_timeout_secs = 1;
    config.resync_window_ms = 20;
    config.poll_interval_ms = 20;
    config
}

async fn connect(sim: SimulatedController, config: &C867Config) -> (C867Driver, SimHandle) {
    let (transport, handle) = sim.spawn();
    let driver = C867Driver::connect_with_transport(transport, config)
        .await
        .unwrap();
    (driver, handle)
}

#[tokio::test]
async fn test_home_move_busy_then_settled() {
    let (driver, sim) = connect(SimulatedController::new().with_busy_polls(1), &test_config()).await;

    driver.home("1").await.unwrap();
    assert_eq!(driver.homing_state("1").await, HomingState::Homed);

    driver.move_mm("1", 10.0).await.unwrap();
    assert_eq!(driver.cached_positions().await.get("1"), Some(&10.0));

    // Mid-move the controller reports the limit it is travelling toward
    let busy = driver.get_position_mm("1").await.unwrap();
    assert_eq!(busy, 25.0);
    assert_eq!(driver.cached_positions().await.get("1"), Some(&10.0));
    assert!(driver.is_in_motion("1").await);
    assert_eq!(driver.homing_state("1").await, HomingState::Homed);

    let settled = driver.get_position_mm("1").await.unwrap();
    assert_eq!(settled, 10.0);
    assert!(!driver.is_in_motion("1").await);
    assert_eq!(sim.position("1"), Some(10.0));
}

#[tokio::test]
async fn test_move_before_homing_is_rejected_locally() {
    let (driver, sim) = connect(SimulatedController::new(), &test_config()).await;

    for target in [0.0, 12.5, 25.0] {
        let err = driver.move_mm("2", target).await.unwrap_err();
        assert!(matches!(err, GcsError::NotHomed { ref axis } if axis == "2"));
    }

    assert!(driver.cached_positions().await.is_empty());
    assert!(!sim
        .commands_received()
        .iter()
        .any(|c| c.starts_with("MOV")));
}

#[tokio::test]
async fn test_connect_sequence() {
    let mut config = test_config();
    config.enable_joystick = false;
    let (driver, sim) = connect(SimulatedController::new(), &config).await;

    assert!(driver.identity().contains("C-867"));
    assert_eq!(driver.get_limits_mm("1").await.unwrap(), (0.0, 25.0));
    assert_eq!(driver.get_limits_mm("2").await.unwrap(), (0.0, 25.0));
    assert!(sim.servo("1") && sim.servo("2"));
    assert!(!sim.joystick("1"));

    let commands = sim.commands_received();
    assert_eq!(commands.first().map(String::as_str), Some("*IDN?"));
    assert!(commands.contains(&"SPA? 1 0x7000601".to_string()));
    assert!(commands.contains(&"HIN 2 0".to_string()));

    // Nothing is homed implicitly
    assert_eq!(driver.homing_state("1").await, HomingState::Unknown);
}

#[tokio::test]
async fn test_assume_homed_skips_reference_move() {
    let mut config = test_config();
    config.assume_homed = true;
    let (driver, sim) = connect(SimulatedController::new().referenced(true), &config).await;

    driver.move_mm("2", 3.0).await.unwrap();
    assert!(!sim.commands_received().iter().any(|c| c.starts_with("FRF")));
}

#[tokio::test]
async fn test_unit_mismatch_fails_connect() {
    let (transport, _sim) = SimulatedController::new().with_unit("DEG").spawn();
    let err = C867Driver::connect_with_transport(transport, &test_config())
        .await
        .err()
        .unwrap();
    assert!(format!("{err:#}").contains("DEG"));

    let mut config = test_config();
    config.require_mm_units = false;
    let (transport, _sim) = SimulatedController::new().with_unit("DEG").spawn();
    assert!(C867Driver::connect_with_transport(transport, &config)
        .await
        .is_ok());
}

#[tokio::test]
async fn test_config_limits_override_controller() {
    let mut config = test_config();
    config
        .limits
        .insert("1".to_string(), TravelLimits::new(5.0, 15.0));
    let (driver, sim) = connect(SimulatedController::new(), &config).await;

    assert_eq!(driver.get_limits_mm("1").await.unwrap(), (5.0, 15.0));
    assert!(!sim.commands_received().contains(&"TMN? 1".to_string()));

    driver.mark_homed("1").await.unwrap();
    let err = driver.move_mm("1", 20.0).await.unwrap_err();
    assert!(matches!(err, GcsError::OutOfRange { min, max, .. } if min == 5.0 && max == 15.0));
}

#[tokio::test]
async fn test_home_rejected_returns_to_unknown() {
    let (driver, sim) = connect(SimulatedController::new(), &test_config()).await;

    sim.fail_next_command(codes::INVALID_AXIS);
    let err = driver.home("1").await.unwrap_err();
    assert_eq!(err.controller_code(), Some(codes::INVALID_AXIS));
    assert_eq!(driver.homing_state("1").await, HomingState::Unknown);

    // Retrying is the caller's call and works
    driver.home("1").await.unwrap();
    assert!(sim.is_referenced("1"));
}

#[tokio::test]
async fn test_silent_controller_times_out_then_recovers() {
    let (driver, sim) = connect(SimulatedController::new(), &test_config()).await;

    sim.set_silent(true);
    let err = driver.get_position_mm("1").await.unwrap_err();
    assert!(matches!(err, GcsError::Timeout { .. }));

    sim.set_silent(false);
    assert_eq!(driver.get_position_mm("1").await.unwrap(), 0.0);
}

#[tokio::test]
async fn test_controller_error_is_surfaced() {
    let (driver, sim) = connect(
        SimulatedController::new().referenced(true),
        &test_config(),
    )
    .await;
    driver.mark_homed("1").await.unwrap();

    sim.fail_next_command(codes::OUT_OF_LIMITS);
    let err = driver.move_mm("1", 4.0).await.unwrap_err();
    assert!(matches!(err, GcsError::Controller { code: 7, ref command } if command.starts_with("MOV 1")));
    assert_eq!(driver.cached_positions().await.get("1"), None);
}

#[tokio::test]
async fn test_joystick_motion_is_invisible_to_cache() {
    let (driver, sim) = connect(
        SimulatedController::new().with_busy_polls(0),
        &test_config(),
    )
    .await;
    driver.home("1").await.unwrap();
    driver.move_mm("1", 10.0).await.unwrap();
    assert_eq!(driver.get_position_mm("1").await.unwrap(), 10.0);

    sim.jog("1", 2.0);
    assert_eq!(driver.cached_positions().await.get("1"), Some(&10.0));
    assert_eq!(driver.get_position_mm("1").await.unwrap(), 12.0);
    assert_eq!(driver.cached_positions().await.get("1"), Some(&12.0));
}

#[tokio::test]
async fn test_relative_move() {
    let (driver, sim) = connect(
        SimulatedController::new().with_busy_polls(0),
        &test_config(),
    )
    .await;
    driver.home("2").await.unwrap();
    driver.move_mm("2", 5.0).await.unwrap();

    driver.move_relative_mm("2", 2.5).await.unwrap();
    assert_eq!(driver.cached_positions().await.get("2"), Some(&7.5));
    assert_eq!(sim.position("2"), Some(7.5));

    let err = driver.move_relative_mm("2", 20.0).await.unwrap_err();
    assert!(matches!(err, GcsError::OutOfRange { .. }));
}

#[tokio::test]
async fn test_config_macro_collects_query_replies() {
    let mut config = test_config();
    config.macros.insert(
        "park".to_string(),
        vec!["MOV 1 0.5".to_string(), "POS? 1".to_string()],
    );
    let (driver, _sim) = connect(
        SimulatedController::new().with_busy_polls(0),
        &config,
    )
    .await;
    driver.home("1").await.unwrap();
    driver.get_position_mm("1").await.unwrap();

    let replies = driver.run_named_macro("park").await.unwrap();
    assert_eq!(replies, vec!["1=0.500000000".to_string()]);

    // Raw motion bypasses the cache
    assert_eq!(driver.cached_positions().await.get("1"), None);
    assert!(driver.is_in_motion("1").await);
}

#[tokio::test]
async fn test_macro_move_mid_travel_reports_busy() {
    let (driver, sim) = connect(SimulatedController::new().with_busy_polls(1), &test_config()).await;
    driver.home("1").await.unwrap();

    driver
        .execute_macro("jump", &["MOV 1 5".to_string()])
        .await
        .unwrap();
    assert!(driver.is_in_motion("1").await);

    // The travel limit is a busy report, never a cached position
    assert_eq!(
        driver.query_position("1").await.unwrap(),
        PositionReading::Busy(25.0)
    );
    assert_eq!(driver.cached_positions().await.get("1"), None);
    assert!(driver.is_in_motion("1").await);

    assert_eq!(driver.get_position_mm("1").await.unwrap(), 5.0);
    assert_eq!(driver.cached_positions().await.get("1"), Some(&5.0));
    assert_eq!(sim.position("1"), Some(5.0));
}

#[tokio::test]
async fn test_multi_axis_macro_move() {
    let (driver, sim) = connect(SimulatedController::new().with_busy_polls(1), &test_config()).await;
    driver.home("1").await.unwrap();
    driver.home("2").await.unwrap();
    driver.move_mm("1", 10.0).await.unwrap();

    driver
        .execute_macro("pair", &["MOV 1 5 2 6".to_string()])
        .await
        .unwrap();
    assert!(driver.cached_positions().await.is_empty());
    assert!(driver.is_in_motion("1").await && driver.is_in_motion("2").await);

    assert_eq!(
        driver.query_position("2").await.unwrap(),
        PositionReading::Busy(25.0)
    );
    assert_eq!(driver.get_position_mm("2").await.unwrap(), 6.0);

    // One reply line per axis; axis 1 is still travelling
    let replies = driver
        .execute_macro("where", &["POS? 1 2".to_string()])
        .await
        .unwrap();
    assert_eq!(replies, vec!["1=25.000000000", "2=6.000000000"]);
    assert_eq!(sim.position("1"), Some(5.0));
}

#[tokio::test]
async fn test_macro_with_newline_is_not_sent() {
    let (driver, sim) = connect(SimulatedController::new(), &test_config()).await;
    let before = sim.commands_received().len();

    let err = driver
        .execute_macro("split", &["POS? 1\nPOS? 2".to_string()])
        .await
        .unwrap_err();
    assert!(matches!(err, GcsError::MacroAborted { index: 0, .. }));
    assert_eq!(sim.commands_received().len(), before);

    // Session is untouched
    assert_eq!(driver.get_position_mm("1").await.unwrap(), 0.0);
}

#[tokio::test]
async fn test_macro_aborts_at_failing_command() {
    let (driver, sim) = connect(SimulatedController::new(), &test_config()).await;

    let commands = vec![
        "SVO 1 0".to_string(),
        "BOGUS".to_string(),
        "SVO 2 0".to_string(),
    ];
    let err = driver.execute_macro("bad", &commands).await.unwrap_err();

    match &err {
        GcsError::MacroAborted { name, index, .. } => {
            assert_eq!(name, "bad");
            assert_eq!(*index, 1);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(err.controller_code(), Some(codes::UNKNOWN_COMMAND));
    assert!(!sim.servo("1"));
    assert!(sim.servo("2"));
}

#[tokio::test]
async fn test_builtin_macros_through_capability() {
    let (driver, sim) = connect(SimulatedController::new(), &test_config()).await;
    let runner: &dyn MacroRunner = &driver;

    assert!(runner.macro_names().contains(&"servo_off".to_string()));
    runner.run_macro("servo_off").await.unwrap();
    assert!(!sim.servo("1") && !sim.servo("2"));

    assert!(runner.run_macro("missing").await.is_err());
}

#[tokio::test]
async fn test_components_expose_axes() {
    let (driver, sim) = connect(
        SimulatedController::new().with_busy_polls(0),
        &test_config(),
    )
    .await;
    let components = driver.components();

    assert_eq!(components.axes.len(), 2);
    assert!(components.capabilities().contains(&Capability::MacroRunner));

    let axis = components.axis("2").unwrap();
    assert_eq!(axis.movable.limits(), (0.0, 25.0));
    assert!(axis.movable.move_abs(1.0).await.is_err());

    let homeable = axis.homeable.as_ref().unwrap();
    homeable.home().await.unwrap();
    assert!(homeable.is_homed().await);

    axis.movable.move_abs(1.0).await.unwrap();
    assert_eq!(axis.movable.position().await.unwrap(), 1.0);
    assert_eq!(sim.position("2"), Some(1.0));
}

#[tokio::test]
async fn test_concurrent_callers_serialize() {
    let (driver, _sim) = connect(
        SimulatedController::new().with_busy_polls(0),
        &test_config(),
    )
    .await;
    driver.home("1").await.unwrap();
    driver.home("2").await.unwrap();

    let mut tasks = Vec::new();
    for i in 0..8 {
        let driver = driver.clone();
        tasks.push(tokio::spawn(async move {
            let axis = if i % 2 == 0 { "1" } else { "2" };
            driver.move_mm(axis, i as f64).await.unwrap();
            driver.get_position_mm(axis).await.unwrap()
        }));
    }
    for task in tasks {
        let position = task.await.unwrap();
        assert!((0.0..8.0).contains(&position));
    }
}

#[tokio::test]
async fn test_motion_status_is_one_shot() {
    let (driver, _sim) = connect(
        SimulatedController::new().with_busy_polls(1),
        &test_config(),
    )
    .await;
    driver.home("1").await.unwrap();
    driver.move_mm("1", 2.0).await.unwrap();

    let status = driver.motion_status().await.unwrap();
    assert_eq!(status.get("1"), Some(&true));
    assert_eq!(status.get("2"), Some(&false));

    assert_eq!(
        driver.query_position("1").await.unwrap(),
        PositionReading::Busy(25.0)
    );
    let status = driver.motion_status().await.unwrap();
    assert_eq!(status.get("1"), Some(&false));
    assert!(!driver.is_in_motion("1").await);
}

#[tokio::test]
async fn test_tuning_commands() {
    let (driver, sim) = connect(SimulatedController::new(), &test_config()).await;

    driver.set_velocity("1", 2.5).await.unwrap();
    assert_eq!(sim.velocity("1"), Some(2.5));
    assert_eq!(driver.query_velocity("1").await.unwrap(), 2.5);
    driver.set_acceleration("1", 100.0).await.unwrap();
    driver.set_deceleration("1", 100.0).await.unwrap();
    assert_eq!(driver.query_acceleration("1").await.unwrap(), 100.0);
    assert_eq!(driver.query_deceleration("1").await.unwrap(), 100.0);
    assert!(matches!(
        driver.set_velocity("1", f64::INFINITY).await,
        Err(GcsError::InvalidValue { .. })
    ));

    // Maxima read at connect are enforced before sending
    let sent = sim.commands_received().len();
    assert!(matches!(
        driver.set_velocity("1", 250.0).await,
        Err(GcsError::ExceedsMaximum { max, .. }) if max == 200.0
    ));
    assert!(matches!(
        driver.set_acceleration("1", 6000.0).await,
        Err(GcsError::ExceedsMaximum { .. })
    ));
    assert_eq!(sim.commands_received().len(), sent);

    assert_eq!(driver.query_counts_per_mm("1").await.unwrap(), 10_000.0);
    assert_eq!(driver.query_limits("2").await.unwrap(), (0.0, 25.0));
}

#[tokio::test]
async fn test_settling_time_and_tolerance() {
    let (driver, sim) = connect(SimulatedController::new(), &test_config()).await;

    driver.set_settling_time_ms("1", 20.0).await.unwrap();
    assert_eq!(sim.parameter("1", params::SETTLING_TIME), Some(0.02));
    assert!((driver.query_settling_time_ms("1").await.unwrap() - 20.0).abs() < 1e-9);
    assert!(driver.set_settling_time_ms("1", 1500.0).await.is_err());

    let applied = driver.set_positional_tolerance_um("2", 1.0).await.unwrap();
    assert!((applied - 1.0).abs() < 1e-9);
    assert_eq!(sim.parameter("2", params::WINDOW_EXIT), Some(10.0));
    assert_eq!(sim.parameter("2", params::WINDOW_ENTER), Some(9.0));
    assert!((driver.query_positional_tolerance_um("2").await.unwrap() - 1.0).abs() < 1e-9);

    // 0x416 is 100 counts, 10 um
    assert!(matches!(
        driver.set_positional_tolerance_um("2", 10.0).await,
        Err(GcsError::ExceedsMaximum { .. })
    ));
}

#[tokio::test]
async fn test_generic_parameters() {
    let (driver, sim) = connect(SimulatedController::new(), &test_config()).await;

    driver
        .set_parameter("1", params::SETTLING_TIME, ParamValue::Float(0.5))
        .await
        .unwrap();
    assert_eq!(
        driver.get_parameter("1", params::SETTLING_TIME).await.unwrap(),
        "0.5"
    );
    assert_eq!(sim.parameter("1", params::SETTLING_TIME), Some(0.5));

    let err = driver
        .set_parameter("1", params::UNIT, ParamValue::Text("UM".into()))
        .await
        .unwrap_err();
    assert_eq!(err.controller_code(), Some(codes::ILLEGAL_PARAMETER));
}

#[tokio::test]
async fn test_reboot_drops_references_and_restores_servo() {
    let (driver, sim) = connect(
        SimulatedController::new().with_startup_macro(2, true),
        &test_config(),
    )
    .await;
    driver.home("1").await.unwrap();
    driver.set_servo("2", false).await.unwrap();

    driver.reboot(true).await.unwrap();

    assert_eq!(driver.homing_state("1").await, HomingState::Unknown);
    assert!(driver.cached_positions().await.is_empty());
    assert!(sim.servo("1") && sim.servo("2"));
    assert!(sim.joystick("1"));
    // The startup macro referenced the stage; the driver waits to be told
    assert!(sim.is_referenced("1"));
    assert!(driver.move_mm("1", 1.0).await.is_err());
    let polls = sim
        .commands_received()
        .iter()
        .filter(|c| c.as_str() == "RMC?")
        .count();
    assert_eq!(polls, 3);
}

#[tokio::test]
async fn test_limits_seen_by_axis_follow_query_limits() {
    let (driver, sim) = connect(SimulatedController::new(), &test_config()).await;
    let components = driver.components();
    let axis = components.axis("2").unwrap();
    assert_eq!(axis.movable.limits(), (0.0, 25.0));

    sim.set_limits("2", TravelLimits::new(1.0, 20.0));
    assert_eq!(driver.query_limits("2").await.unwrap(), (1.0, 20.0));
    assert_eq!(axis.movable.limits(), (1.0, 20.0));
    assert_eq!(driver.get_limits_mm("2").await.unwrap(), (1.0, 20.0));
}

#[tokio::test]
async fn test_disconnect_closes_shared_link() {
    let (driver, _sim) = connect(SimulatedController::new(), &test_config()).await;
    let other = driver.clone();

    driver.disconnect().await.unwrap();
    assert!(matches!(
        other.get_position_mm("1").await,
        Err(GcsError::Disconnected)
    ));
}

#[tokio::test]
async fn test_slow_reference_within_home_timeout() {
    let (driver, _sim) = connect(
        SimulatedController::new().with_reference_delay(Duration::from_millis(300)),
        &test_config(),
    )
    .await;

    // 300 ms exceeds the ordinary reply timeout but not the homing one
    driver.home("1").await.unwrap();
    assert_eq!(driver.homing_state("1").await, HomingState::Homed);
    assert!(!driver.is_in_motion("1").await);
}

#[tokio::test]
async fn test_reference_move_outlasting_home_timeout() {
    let (driver, sim) = connect(
        SimulatedController::new().with_reference_delay(Duration::from_secs(2)),
        &test_config(),
    )
    .await;

    let err = driver.home("1").await.unwrap_err();
    assert!(matches!(err, GcsError::Timeout { ref command, .. } if command == "FRF 1"));
    assert_eq!(driver.homing_state("1").await, HomingState::Unknown);
    assert!(driver.is_in_motion("1").await);
    assert!(!sim.is_referenced("1"));

    // FRF? was polled while the stage travelled
    assert!(sim.commands_received().iter().filter(|c| c.as_str() == "FRF? 1").count() > 1);
}
