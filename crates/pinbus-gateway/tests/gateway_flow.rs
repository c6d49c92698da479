//! End-to-end: pin initializer + Arduino gateway on one in-process bus,
//! driving a simulated board.

use std::sync::Arc;
use std::time::Duration;

use pinbus_gateway::{
    ArduinoConfig, ArduinoGateway, GatewayShell, GatewayState, PinInitConfig, PinInitializer, ShellConfig,
};
use pinbus_hal::SimBoard;
use pinbus_middleware::EventBus;
use pinbus_types::{FROM_ARDUINO_GATEWAY, PIN_INIT, PinMode, TO_ARDUINO_GATEWAY};
use serde_json::json;
use tokio_util::sync::CancellationToken;

async fn wait_for(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn full_local_flow() -> Result<(), Box<dyn std::error::Error>> {
    let bus = EventBus::default();
    let board = SimBoard::default();
    let cancel = CancellationToken::new();
    let mut priming = bus.subscribe_topic(PIN_INIT);
    let mut reports = bus.subscribe_topic(FROM_ARDUINO_GATEWAY);

    // The initializer must be listening before the gateway primes it.
    let mut init_shell = GatewayShell::new(
        "pin-init",
        PinInitializer::new(PinInitConfig::default())?,
        Arc::new(bus.clone()),
        ShellConfig::default(),
    )
    .with_cancel(cancel.clone());
    let init_task = tokio::spawn(async move {
        let summary = init_shell.run().await;
        (init_shell, summary)
    });
    let init_ready = bus.clone();
    wait_for("pin initializer subscription", || init_ready.receiver_count() >= 3).await;

    let mut gateway_shell = GatewayShell::new(
        "arduino-gateway",
        ArduinoGateway::new(Box::new(board.clone()), ArduinoConfig::default()),
        Arc::new(bus.clone()),
        ShellConfig::default(),
    )
    .with_cancel(cancel.clone());
    let gateway_task = tokio::spawn(async move {
        let summary = gateway_shell.run().await;
        (gateway_shell, summary)
    });

    // Running: the gateway primes the initializer, which configures the pins.
    let primed = priming.recv().await.ok_or("bus closed")?;
    assert_eq!(primed.payload, json!({"init_pins": 0}));
    wait_for("pin table applied", || board.mode(5) == PinMode::Servo).await;
    assert!(board.is_open());
    assert_eq!(board.mode(9), PinMode::DigitalOutput);
    assert_eq!(board.mode(6), PinMode::Pwm);
    assert_eq!(board.mode(2), PinMode::AnalogInput);

    // bus → dispatch → device
    bus.publish_to(TO_ARDUINO_GATEWAY, json!({"command": "servo_position", "pin": 5, "position": 90}))?;
    bus.publish_to(TO_ARDUINO_GATEWAY, json!({"command": "digital_write", "pin": 9, "value": 1}))?;
    bus.publish_to(TO_ARDUINO_GATEWAY, json!({"command": "no_such_command"}))?;
    wait_for("writes applied", || board.pin_value(9) == Some(1)).await;
    assert_eq!(board.pin_value(5), Some(90));

    // device → translate → bus
    assert!(board.inject_analog(2, 700));
    let report = tokio::time::timeout(Duration::from_secs(5), reports.recv())
        .await?
        .ok_or("bus closed")?;
    assert_eq!(report.payload["report"], "analog_input");
    assert_eq!(report.payload["pin"], 2);
    assert_eq!(report.payload["value"], 700);

    // Shutdown: both shells drain and stop, the board is released.
    cancel.cancel();
    let (gateway_shell, gateway_summary) = gateway_task.await?;
    let (init_shell, init_summary) = init_task.await?;
    let gateway_summary = gateway_summary?;
    let init_summary = init_summary?;

    assert_eq!(gateway_shell.state(), GatewayState::Stopped);
    assert_eq!(init_shell.state(), GatewayState::Stopped);
    assert_eq!(gateway_summary.exit_code, 0);
    assert_eq!(init_summary.exit_code, 0);
    assert!(gateway_summary.dropped >= 1);
    assert_eq!(gateway_shell.pipeline().router_stats().unknown, 1);
    assert_eq!(init_shell.pipeline().rounds(), 1);
    assert!(!board.is_open());
    Ok(())
}

#[tokio::test]
async fn unreachable_board_is_fatal() {
    let board = SimBoard::new(pinbus_hal::SimBoardConfig {
        reachable: false,
        ..Default::default()
    });
    let mut shell = GatewayShell::new(
        "arduino-gateway",
        ArduinoGateway::new(Box::new(board), ArduinoConfig::default()),
        Arc::new(EventBus::default()),
        ShellConfig::default(),
    );

    let err = shell.run().await.unwrap_err();
    assert!(err.is_fatal());
    assert_eq!(shell.state(), GatewayState::Stopped);
}
