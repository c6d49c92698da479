//! Pin initializer: replays a table of mode-setting commands on request.
//!
//! Any message on the subscription topic (the Arduino gateway sends
//! `{"init_pins": 0}` once it is running) makes the initializer publish one
//! `set_mode_*` command per [`PinSpec`], in table order.

use async_trait::async_trait;
use pinbus_types::{GatewayError, PIN_INIT, PinMode, TO_ARDUINO_GATEWAY};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::{debug, info};

use crate::shell::{Inbound, Outbound, Pipeline, SourceSet};

/// One row of the initialization table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PinSpec {
    pub mode: PinMode,
    pub pin: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
}

impl PinSpec {
    pub fn new(mode: PinMode, pin: u8, tag: impl Into<String>) -> Self {
        Self {
            mode,
            pin,
            tag: Some(tag.into()),
        }
    }

    /// Only single-pin modes can be expressed as one row.
    pub fn validate(&self) -> Result<(), GatewayError> {
        match self.mode {
            PinMode::DigitalOutput
            | PinMode::DigitalInput
            | PinMode::DigitalInputPullup
            | PinMode::AnalogInput
            | PinMode::Pwm
            | PinMode::Servo
            | PinMode::Tone => Ok(()),
            other => Err(GatewayError::InvalidField {
                command: "pin_init".into(),
                field: "mode".into(),
                expected: format!("a single-pin mode, not {other}"),
            }),
        }
    }

    /// The `set_mode_*` command this row turns into.
    pub fn command(&self) -> Value {
        let mut body = Map::new();
        body.insert("command".into(), json!(format!("set_mode_{}", self.mode.as_str())));
        body.insert("pin".into(), json!(self.pin));
        if let Some(tag) = &self.tag {
            body.insert("tag".into(), json!(tag));
        }
        Value::Object(body)
    }
}

/// The table the demo board is wired for.
pub fn default_pins() -> Vec<PinSpec> {
    vec![
        PinSpec::new(PinMode::DigitalOutput, 9, "blue"),
        PinSpec::new(PinMode::DigitalOutput, 10, "green"),
        PinSpec::new(PinMode::DigitalOutput, 11, "red"),
        PinSpec::new(PinMode::Pwm, 6, "white"),
        PinSpec::new(PinMode::AnalogInput, 2, "potentiometer"),
        PinSpec::new(PinMode::Servo, 5, "servo"),
    ]
}

#[derive(Debug, Clone)]
pub struct PinInitConfig {
    pub subscription: String,
    pub publish_topic: String,
    pub pins: Vec<PinSpec>,
}

impl Default for PinInitConfig {
    fn default() -> Self {
        Self {
            subscription: PIN_INIT.to_string(),
            publish_topic: TO_ARDUINO_GATEWAY.to_string(),
            pins: default_pins(),
        }
    }
}

pub struct PinInitializer {
    config: PinInitConfig,
    commands: Vec<Value>,
    rounds: u64,
}

impl PinInitializer {
    /// Build the initializer, rejecting rows that are not single-pin modes.
    pub fn new(config: PinInitConfig) -> Result<Self, GatewayError> {
        let commands = config
            .pins
            .iter()
            .map(|spec| spec.validate().map(|()| spec.command()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            config,
            commands,
            rounds: 0,
        })
    }

    pub fn commands(&self) -> &[Value] {
        &self.commands
    }

    /// How many times the table has been published.
    pub fn rounds(&self) -> u64 {
        self.rounds
    }
}

#[async_trait]
impl Pipeline for PinInitializer {
    async fn connect(&mut self, sources: &mut SourceSet) -> Result<(), GatewayError> {
        sources.subscribe(&self.config.subscription).await?;
        info!(
            topic = %self.config.subscription,
            pins = self.commands.len(),
            "pin initializer waiting for requests"
        );
        Ok(())
    }

    async fn process(&mut self, item: Inbound, out: &Outbound) -> Result<(), GatewayError> {
        let Inbound::Bus(request) = item else {
            return Ok(());
        };
        debug!(topic = %request.topic, payload = %request.payload, "pin init requested");

        for command in &self.commands {
            out.publish(&self.config.publish_topic, command.clone()).await?;
        }
        self.rounds += 1;
        info!(
            topic = %self.config.publish_topic,
            commands = self.commands.len(),
            "pin modes published"
        );
        Ok(())
    }

    async fn close(&mut self) -> Result<(), GatewayError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shell::{GatewayShell, ShellConfig};
    use pinbus_middleware::EventBus;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn default_table_matches_the_demo_wiring() {
        let init = PinInitializer::new(PinInitConfig::default()).unwrap();
        let commands = init.commands();
        assert_eq!(commands.len(), 6);
        assert_eq!(commands[0], json!({"command": "set_mode_digital_output", "pin": 9, "tag": "blue"}));
        assert_eq!(commands[3], json!({"command": "set_mode_pwm", "pin": 6, "tag": "white"}));
        assert_eq!(
            commands[4],
            json!({"command": "set_mode_analog_input", "pin": 2, "tag": "potentiometer"})
        );
        assert_eq!(commands[5], json!({"command": "set_mode_servo", "pin": 5, "tag": "servo"}));
    }

    #[test]
    fn multi_pin_modes_are_rejected() {
        let config = PinInitConfig {
            pins: vec![PinSpec::new(PinMode::Sonar, 12, "range")],
            ..PinInitConfig::default()
        };
        let err = PinInitializer::new(config).err().unwrap();
        assert!(matches!(err, GatewayError::InvalidField { ref field, .. } if field == "mode"));
    }

    #[test]
    fn spec_rows_deserialize_without_tag() {
        let spec: PinSpec = serde_json::from_value(json!({"mode": "digital_input_pullup", "pin": 4})).unwrap();
        assert_eq!(spec.tag, None);
        assert_eq!(spec.command(), json!({"command": "set_mode_digital_input_pullup", "pin": 4}));
    }

    #[tokio::test]
    async fn publishes_the_table_in_order() {
        let bus = EventBus::default();
        let mut commands = bus.subscribe_topic(TO_ARDUINO_GATEWAY);
        let init = PinInitializer::new(PinInitConfig::default()).unwrap();
        let mut shell = GatewayShell::new("pin-init", init, Arc::new(bus.clone()), ShellConfig::default());
        let cancel = shell.cancel_token();
        let handle = tokio::spawn(async move { shell.run().await });

        // The subscription is registered asynchronously; poke until it answers.
        let first = loop {
            bus.publish_to(PIN_INIT, json!({"init_pins": 0})).unwrap();
            if let Ok(Some(message)) = tokio::time::timeout(Duration::from_millis(50), commands.recv()).await {
                break message;
            }
        };
        assert_eq!(first.payload["pin"], 9);

        let mut rest = Vec::new();
        for _ in 0..5 {
            rest.push(commands.recv().await.unwrap().payload["pin"].clone());
        }
        assert_eq!(rest, vec![json!(10), json!(11), json!(6), json!(2), json!(5)]);

        cancel.cancel();
        let summary = handle.await.unwrap().unwrap();
        assert!(summary.processed >= 1);
        assert_eq!(summary.exit_code, 0);
    }
}
