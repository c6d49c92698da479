//! The device collaborator contract.
//!
//! The dispatch table never speaks a wire protocol. It calls
//! [`DeviceAdapter::configure`] once per mode-setting command and
//! [`DeviceAdapter::write`] once per value-setting command. Modes that report
//! asynchronously are given a [`ReportSink`]: a callback reference bound to
//! one resource, one report kind and one [`CallbackHandle`]. The adapter keeps
//! exactly one sink per resource and replaces it on reconfiguration.
//!
//! Events travel back to the gateway as [`DeviceEvent`]s over a bounded
//! channel created with [`report_channel`]. A device never waits on the
//! gateway: when the channel is full the event is dropped and logged.

use async_trait::async_trait;
use pinbus_types::{GatewayError, PinMode, ReportKind, ResourceId};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::warn;

use crate::registry::CallbackHandle;

/// Device events buffered before new ones are dropped.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

// ────────────────────────────────────────────────────────────────────────────
// Operations
// ────────────────────────────────────────────────────────────────────────────

/// A configuration request: one variant per mode-setting primitive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PinConfig {
    DigitalOutput { pin: u8 },
    DigitalInput { pin: u8 },
    DigitalInputPullup { pin: u8 },
    AnalogInput { pin: u8 },
    Pwm { pin: u8 },
    Servo { pin: u8 },
    Tone { pin: u8 },
    I2c,
    Sonar { trigger_pin: u8, echo_pin: u8 },
    Stepper { steps_per_revolution: u32, pins: Vec<u8> },
}

impl PinConfig {
    pub fn mode(&self) -> PinMode {
        match self {
            PinConfig::DigitalOutput { .. } => PinMode::DigitalOutput,
            PinConfig::DigitalInput { .. } => PinMode::DigitalInput,
            PinConfig::DigitalInputPullup { .. } => PinMode::DigitalInputPullup,
            PinConfig::AnalogInput { .. } => PinMode::AnalogInput,
            PinConfig::Pwm { .. } => PinMode::Pwm,
            PinConfig::Servo { .. } => PinMode::Servo,
            PinConfig::Tone { .. } => PinMode::Tone,
            PinConfig::I2c => PinMode::I2c,
            PinConfig::Sonar { .. } => PinMode::Sonar,
            PinConfig::Stepper { .. } => PinMode::Stepper,
        }
    }

    /// The resource whose callback slot this configuration owns.
    ///
    /// For multi-pin modes this is the first pin (sonar: the trigger pin).
    /// `None` only for a stepper with an empty pin list.
    pub fn primary(&self) -> Option<ResourceId> {
        match self {
            PinConfig::DigitalOutput { pin }
            | PinConfig::DigitalInput { pin }
            | PinConfig::DigitalInputPullup { pin }
            | PinConfig::AnalogInput { pin }
            | PinConfig::Pwm { pin }
            | PinConfig::Servo { pin }
            | PinConfig::Tone { pin } => Some(ResourceId::Pin(*pin)),
            PinConfig::I2c => Some(ResourceId::I2c),
            PinConfig::Sonar { trigger_pin, .. } => Some(ResourceId::Pin(*trigger_pin)),
            PinConfig::Stepper { pins, .. } => pins.first().map(|pin| ResourceId::Pin(*pin)),
        }
    }

    /// Every resource this configuration claims.
    pub fn resources(&self) -> Vec<ResourceId> {
        match self {
            PinConfig::I2c => vec![ResourceId::I2c],
            PinConfig::Sonar { trigger_pin, echo_pin } => {
                vec![ResourceId::Pin(*trigger_pin), ResourceId::Pin(*echo_pin)]
            }
            PinConfig::Stepper { pins, .. } => pins.iter().map(|p| ResourceId::Pin(*p)).collect(),
            _ => self.primary().into_iter().collect(),
        }
    }

    /// Report shape this mode produces, if it reports at all.
    pub fn report_kind(&self) -> Option<ReportKind> {
        match self {
            // I2C data arrives per read request, not per configuration.
            PinConfig::I2c => None,
            other => other.mode().report_kind(),
        }
    }
}

/// A value-setting request. Pass-through: no registry involvement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceOp {
    DigitalWrite { pin: u8, value: u8 },
    PwmWrite { pin: u8, value: u16 },
    ServoPosition { pin: u8, position: u8 },
    PlayTone { pin: u8, frequency: u16, duration: u16 },
    StepperWrite { motor_speed: u32, number_of_steps: i32 },
    I2cWrite { address: u8, data: Vec<u8> },
    SetDigitalReporting { pin: u8, enabled: bool },
    SetAnalogReporting { pin: u8, enabled: bool },
}

impl DeviceOp {
    /// Resource named in error messages.
    pub fn resource(&self) -> String {
        match self {
            DeviceOp::DigitalWrite { pin, .. }
            | DeviceOp::PwmWrite { pin, .. }
            | DeviceOp::ServoPosition { pin, .. }
            | DeviceOp::PlayTone { pin, .. }
            | DeviceOp::SetDigitalReporting { pin, .. }
            | DeviceOp::SetAnalogReporting { pin, .. } => ResourceId::Pin(*pin).to_string(),
            DeviceOp::StepperWrite { .. } => "stepper".to_string(),
            DeviceOp::I2cWrite { address, .. } => format!("i2c device {address:#04x}"),
        }
    }
}

/// A request whose answer arrives later through a [`ReportSink`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceQuery {
    I2cRead {
        address: u8,
        register: Option<u8>,
        number_of_bytes: u8,
    },
}

/// Identity reported by [`DeviceAdapter::open`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub name: String,
    pub com_port: Option<String>,
    pub instance_id: Option<u32>,
}

// ────────────────────────────────────────────────────────────────────────────
// Callback plumbing
// ────────────────────────────────────────────────────────────────────────────

/// One asynchronous device callback invocation.
///
/// `data` is the raw list the device delivered; its layout depends on
/// `kind`:
///
/// | kind | data |
/// |---|---|
/// | digital_input / analog_input | `[mode, pin, value, timestamp]` |
/// | sonar_data | `[mode, trigger_pin, distance, timestamp]` |
/// | i2c_data | device-defined, joined as text |
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceEvent {
    pub resource: ResourceId,
    pub kind: ReportKind,
    pub handle: CallbackHandle,
    pub data: Vec<Value>,
}

/// Receiving half of the device event channel.
pub type EventReceiver = mpsc::Receiver<DeviceEvent>;

/// Cloneable sending half; binds [`ReportSink`]s.
#[derive(Debug, Clone)]
pub struct ReportSender {
    tx: mpsc::Sender<DeviceEvent>,
}

impl ReportSender {
    pub fn bind(&self, resource: ResourceId, kind: ReportKind, handle: CallbackHandle) -> ReportSink {
        ReportSink {
            resource,
            kind,
            handle,
            tx: self.tx.clone(),
        }
    }
}

/// Create the channel device callbacks are delivered on, holding
/// [`DEFAULT_EVENT_CAPACITY`] events.
pub fn report_channel() -> (ReportSender, EventReceiver) {
    report_channel_with_capacity(DEFAULT_EVENT_CAPACITY)
}

pub fn report_channel_with_capacity(capacity: usize) -> (ReportSender, EventReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (ReportSender { tx }, rx)
}

/// A callback reference bound to one resource registration.
#[derive(Debug, Clone)]
pub struct ReportSink {
    resource: ResourceId,
    kind: ReportKind,
    handle: CallbackHandle,
    tx: mpsc::Sender<DeviceEvent>,
}

impl ReportSink {
    pub fn resource(&self) -> ResourceId {
        self.resource
    }

    pub fn kind(&self) -> ReportKind {
        self.kind
    }

    pub fn handle(&self) -> CallbackHandle {
        self.handle
    }

    /// Deliver one callback without blocking the caller. Returns `false`
    /// when the event was dropped: the gateway has stopped listening, or it
    /// is [`DEFAULT_EVENT_CAPACITY`] events behind.
    pub fn emit(&self, data: Vec<Value>) -> bool {
        let event = DeviceEvent {
            resource: self.resource,
            kind: self.kind,
            handle: self.handle,
            data,
        };
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(event)) => {
                let err = GatewayError::QueueFull {
                    queue: "device event".into(),
                    capacity: self.tx.max_capacity(),
                };
                warn!(resource = %event.resource, kind = %event.kind, error = %err, "device event dropped");
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Adapter trait
// ────────────────────────────────────────────────────────────────────────────

/// The narrow device interface the dispatch table is written against.
///
/// # Contract
///
/// * `open` – establish the connection. Failure is fatal
///   ([`GatewayError::Connection`]).
/// * `configure` – apply a mode. Fails with [`GatewayError::Configuration`]
///   when the resource or mode is invalid for the hardware. When `sink` is
///   given it replaces any previous sink for
///   [`PinConfig::primary`]; when it is `None` the slot is cleared.
/// * `write` – apply a value. Fails with [`GatewayError::Write`].
/// * `request` – start an operation answered through `sink`.
/// * `close` – release the connection. Further calls may fail.
#[async_trait]
pub trait DeviceAdapter: Send {
    async fn open(&mut self) -> Result<DeviceInfo, GatewayError>;

    async fn configure(&mut self, config: PinConfig, sink: Option<ReportSink>) -> Result<(), GatewayError>;

    async fn write(&mut self, op: DeviceOp) -> Result<(), GatewayError>;

    async fn request(&mut self, query: DeviceQuery, sink: ReportSink) -> Result<(), GatewayError>;

    async fn close(&mut self) -> Result<(), GatewayError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ResourceRegistry;
    use serde_json::json;

    #[test]
    fn config_resources() {
        let sonar = PinConfig::Sonar { trigger_pin: 12, echo_pin: 13 };
        assert_eq!(sonar.primary(), Some(ResourceId::Pin(12)));
        assert_eq!(sonar.resources(), vec![ResourceId::Pin(12), ResourceId::Pin(13)]);
        assert_eq!(sonar.report_kind(), Some(ReportKind::SonarData));

        let stepper = PinConfig::Stepper { steps_per_revolution: 512, pins: vec![8, 9, 10, 11] };
        assert_eq!(stepper.resources().len(), 4);
        assert_eq!(stepper.report_kind(), None);

        assert_eq!(PinConfig::I2c.primary(), Some(ResourceId::I2c));
        assert_eq!(PinConfig::Stepper { steps_per_revolution: 200, pins: vec![] }.primary(), None);
        assert_eq!(PinConfig::I2c.report_kind(), None);
        assert_eq!(PinConfig::Pwm { pin: 6 }.mode(), PinMode::Pwm);
        assert_eq!(PinConfig::DigitalInputPullup { pin: 7 }.report_kind(), Some(ReportKind::DigitalInput));
    }

    #[tokio::test]
    async fn sink_delivers_bound_event() {
        let mut registry = ResourceRegistry::new();
        let handle = registry.issue_handle();
        let (sender, mut rx) = report_channel();

        let sink = sender.bind(ResourceId::Pin(7), ReportKind::DigitalInput, handle);
        assert!(sink.emit(vec![json!(32), json!(7), json!(1), json!(1_690_000_000)]));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.resource, ResourceId::Pin(7));
        assert_eq!(event.kind, ReportKind::DigitalInput);
        assert_eq!(event.handle, handle);
        assert_eq!(event.data[2], 1);
    }

    #[test]
    fn sink_reports_closed_channel() {
        let mut registry = ResourceRegistry::new();
        let (sender, rx) = report_channel();
        let sink = sender.bind(ResourceId::Pin(2), ReportKind::AnalogInput, registry.issue_handle());
        drop(rx);
        assert!(!sink.emit(vec![]));
    }

    #[tokio::test]
    async fn full_channel_drops_new_events_without_blocking() {
        let mut registry = ResourceRegistry::new();
        let (sender, mut rx) = report_channel_with_capacity(2);
        let sink = sender.bind(ResourceId::Pin(2), ReportKind::AnalogInput, registry.issue_handle());

        assert!(sink.emit(vec![json!(2), json!(2), json!(10), json!(0)]));
        assert!(sink.emit(vec![json!(2), json!(2), json!(20), json!(0)]));
        assert!(!sink.emit(vec![json!(2), json!(2), json!(30), json!(0)]));

        assert_eq!(rx.recv().await.unwrap().data[2], 10);
        assert_eq!(rx.recv().await.unwrap().data[2], 20);
        assert!(rx.try_recv().is_err());

        // Space frees up once the gateway catches up.
        assert!(sink.emit(vec![json!(2), json!(2), json!(40), json!(0)]));
        assert_eq!(rx.recv().await.unwrap().data[2], 40);
    }

    #[test]
    fn op_resource_names() {
        assert_eq!(DeviceOp::DigitalWrite { pin: 9, value: 1 }.resource(), "pin 9");
        assert_eq!(DeviceOp::I2cWrite { address: 0x53, data: vec![] }.resource(), "i2c device 0x53");
    }
}
