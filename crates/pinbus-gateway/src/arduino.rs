//! The Arduino gateway pipeline.
//!
//! Bus commands on the subscribed topics go through the [`InboundRouter`] to
//! the device; device callbacks go through the [`ReportTranslator`] and are
//! published on the report topic. On entering `Running` the gateway can
//! prime the pin-initialization component with `{"init_pins": 0}`.

use pinbus_hal::{DeviceAdapter, DeviceInfo, EventReceiver, ResourceRegistry, report_channel};
use pinbus_types::{FROM_ARDUINO_GATEWAY, GatewayError, PIN_INIT, TO_ARDUINO_GATEWAY};
use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, info};

use crate::dispatch::{DispatchContext, DispatchTable};
use crate::report::{ReportTranslator, TranslatorStats};
use crate::router::{InboundRouter, RouterStats};
use crate::shell::{Inbound, Outbound, Pipeline, SourceSet};

#[derive(Debug, Clone)]
pub struct ArduinoConfig {
    /// Topics commands arrive on.
    pub subscriptions: Vec<String>,
    /// Topic reports are published to.
    pub report_topic: String,
    /// Send `{"init_pins": 0}` to `pin_init_topic` once running.
    pub prime_pin_init: bool,
    pub pin_init_topic: String,
}

impl Default for ArduinoConfig {
    fn default() -> Self {
        Self {
            subscriptions: vec![TO_ARDUINO_GATEWAY.to_string()],
            report_topic: FROM_ARDUINO_GATEWAY.to_string(),
            prime_pin_init: true,
            pin_init_topic: PIN_INIT.to_string(),
        }
    }
}

pub struct ArduinoGateway {
    config: ArduinoConfig,
    ctx: DispatchContext,
    router: InboundRouter,
    translator: ReportTranslator,
    events: Option<EventReceiver>,
    device_info: Option<DeviceInfo>,
}

impl ArduinoGateway {
    pub fn new(device: Box<dyn DeviceAdapter>, config: ArduinoConfig) -> Self {
        let (reports, events) = report_channel();
        Self {
            config,
            ctx: DispatchContext::new(device, reports),
            router: InboundRouter::new(DispatchTable::arduino()),
            translator: ReportTranslator::new(),
            events: Some(events),
            device_info: None,
        }
    }

    pub fn registry(&self) -> &ResourceRegistry {
        self.ctx.registry()
    }

    pub fn device_info(&self) -> Option<&DeviceInfo> {
        self.device_info.as_ref()
    }

    pub fn router_stats(&self) -> RouterStats {
        self.router.stats()
    }

    pub fn translator_stats(&self) -> TranslatorStats {
        self.translator.stats()
    }
}

#[async_trait]
impl Pipeline for ArduinoGateway {
    async fn connect(&mut self, sources: &mut SourceSet) -> Result<(), GatewayError> {
        let info = self.ctx.device_mut().open().await?;
        info!(
            device = %info.name,
            com_port = info.com_port.as_deref().unwrap_or("auto"),
            instance_id = ?info.instance_id,
            "device connected"
        );
        self.device_info = Some(info);

        for topic in &self.config.subscriptions {
            sources.subscribe(topic).await?;
        }
        if let Some(events) = self.events.take() {
            sources.device_events(events);
        }
        Ok(())
    }

    async fn started(&mut self, out: &Outbound) -> Result<(), GatewayError> {
        if self.config.prime_pin_init {
            out.publish(&self.config.pin_init_topic, json!({"init_pins": 0})).await?;
            info!(topic = %self.config.pin_init_topic, "pin initializer primed");
        }
        Ok(())
    }

    async fn process(&mut self, item: Inbound, out: &Outbound) -> Result<(), GatewayError> {
        match item {
            Inbound::Bus(message) => self
                .router
                .route(&mut self.ctx, &message.topic, message.payload)
                .await
                .map(|_| ()),
            Inbound::Device(event) => {
                let report = self.translator.on_device_event(self.ctx.registry(), &event)?;
                out.publish(&self.config.report_topic, report.into_value()).await
            }
            Inbound::Transport(event) => {
                debug!(event = ?event, "ignoring transport event");
                Ok(())
            }
        }
    }

    async fn close(&mut self) -> Result<(), GatewayError> {
        self.ctx.device_mut().close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pinbus_hal::SimBoard;
    use pinbus_middleware::EventBus;
    use pinbus_types::{BusMessage, PinMode, ResourceId};
    use std::sync::Arc;

    struct Harness {
        gateway: ArduinoGateway,
        board: SimBoard,
        events: EventReceiver,
        bus: EventBus,
        out: Outbound,
    }

    /// Drives the pipeline directly, without a shell, so every step is
    /// deterministic.
    async fn harness() -> Harness {
        let mut board = SimBoard::default();
        board.open().await.unwrap();
        let mut gateway = ArduinoGateway::new(Box::new(board.clone()), ArduinoConfig::default());
        let events = gateway.events.take().unwrap();
        let bus = EventBus::default();
        let out = Outbound::new(Arc::new(bus.clone()));
        Harness {
            gateway,
            board,
            events,
            bus,
            out,
        }
    }

    async fn command(h: &mut Harness, payload: serde_json::Value) -> Result<(), GatewayError> {
        let message = BusMessage::new(TO_ARDUINO_GATEWAY, payload);
        h.gateway.process(Inbound::Bus(message), &h.out).await
    }

    #[tokio::test]
    async fn reports_reach_the_report_topic() {
        let mut h = harness().await;
        let mut reports = h.bus.subscribe_topic(FROM_ARDUINO_GATEWAY);

        command(&mut h, json!({"command": "set_mode_analog_input", "pin": 2, "tag": "potentiometer"}))
            .await
            .unwrap();
        assert_eq!(h.gateway.registry().tag(ResourceId::Pin(2)), Some("potentiometer"));

        assert!(h.board.inject_analog(2, 512));
        let event = h.events.recv().await.unwrap();
        h.gateway.process(Inbound::Device(event), &h.out).await.unwrap();

        let report = reports.recv().await.unwrap().payload;
        assert_eq!(report["report"], "analog_input");
        assert_eq!(report["pin"], 2);
        assert_eq!(report["value"], 512);
    }

    #[tokio::test]
    async fn events_from_a_replaced_mode_are_dropped() {
        let mut h = harness().await;
        let mut reports = h.bus.subscribe_topic(FROM_ARDUINO_GATEWAY);

        command(&mut h, json!({"command": "set_mode_digital_input", "pin": 7})).await.unwrap();
        assert!(h.board.inject_digital(7, 1));
        let old = h.events.recv().await.unwrap();

        command(&mut h, json!({"command": "set_mode_digital_input_pullup", "pin": 7}))
            .await
            .unwrap();
        assert_eq!(h.gateway.registry().get_mode(ResourceId::Pin(7)), PinMode::DigitalInputPullup);

        let err = h.gateway.process(Inbound::Device(old), &h.out).await.unwrap_err();
        assert!(matches!(err, GatewayError::StaleEvent { .. }));

        assert!(h.board.inject_digital(7, 0));
        let fresh = h.events.recv().await.unwrap();
        h.gateway.process(Inbound::Device(fresh), &h.out).await.unwrap();

        let report = reports.recv().await.unwrap().payload;
        assert_eq!(report["value"], 0);
        let stats = h.gateway.translator_stats();
        assert_eq!((stats.translated, stats.stale), (1, 1));
    }

    #[tokio::test]
    async fn i2c_read_is_answered_as_i2c_data() {
        let mut h = harness().await;
        let mut reports = h.bus.subscribe_topic(FROM_ARDUINO_GATEWAY);
        h.board.set_i2c_register(0x53, 0x2d, 8);

        command(&mut h, json!({"command": "set_mode_i2c"})).await.unwrap();
        command(
            &mut h,
            json!({"command": "i2c_read", "addr": 0x53, "register": 0x2d, "number_of_bytes": 1}),
        )
        .await
        .unwrap();

        let event = h.events.recv().await.unwrap();
        h.gateway.process(Inbound::Device(event), &h.out).await.unwrap();

        let report = reports.recv().await.unwrap().payload;
        assert_eq!(report["report"], "i2c_data");
        let value = report["value"].as_str().unwrap();
        assert!(value.starts_with("10, 0, 1, 83, 45, 8, "), "got {value}");
    }

    #[tokio::test]
    async fn bad_commands_do_not_touch_the_device() {
        let mut h = harness().await;
        let before = h.board.calls().len();

        assert!(command(&mut h, json!({"command": "warp_drive"})).await.is_err());
        assert!(command(&mut h, json!({"command": "pwm_write", "pin": 6})).await.is_err());

        assert_eq!(h.board.calls().len(), before);
        assert_eq!(h.gateway.router_stats().dropped(), 2);
    }
}
