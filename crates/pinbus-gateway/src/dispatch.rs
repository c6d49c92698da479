//! Command Dispatch Table.
//!
//! A [`DispatchTable`] maps a command name to a [`Handler`]. The table is
//! built once when a gateway is constructed and never changes afterwards.
//!
//! Handlers come in two shapes:
//!
//! * **mode-setting** (`set_mode_*`): extract the resource id, configure the
//!   device (handing it a [`ReportSink`][pinbus_hal::ReportSink] when the mode reports
//!   asynchronously), then record the new mode in the [`ResourceRegistry`].
//!   If the device refuses, the registry is left untouched.
//! * **value-setting** (`digital_write`, `pwm_write`, ...): a single
//!   pass-through call on the device. The registry is not consulted, so a
//!   write to a pin no mode command configured is forwarded as-is and the
//!   device decides.

use std::collections::HashMap;

use futures_util::future::BoxFuture;
use pinbus_hal::{
    DeviceAdapter, DeviceOp, DeviceQuery, ModeMetadata, PinConfig, ReportSender, ResourceRegistry,
};
use pinbus_types::{CommandEnvelope, GatewayError, PinMode, ReportKind, ResourceId};
use tracing::debug;

/// Signature shared by every table entry.
pub type Handler =
    for<'a> fn(&'a mut DispatchContext, &'a CommandEnvelope) -> BoxFuture<'a, Result<Outcome, GatewayError>>;

/// What a handler did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// A mode was applied to these resources.
    Configured { mode: PinMode, resources: Vec<ResourceId> },
    /// A value was passed through to the device.
    Written,
    /// An asynchronous request was started; the answer arrives as a report.
    Requested,
}

// ─────────────────────────────────────────────────────────────────────────────
// Context
// ─────────────────────────────────────────────────────────────────────────────

/// Mutable state handlers operate on: the registry, the device and the
/// sender that binds callbacks.
///
/// Owned by exactly one dispatch loop, so registry and device-callback
/// updates made by one handler are never interleaved with another's.
pub struct DispatchContext {
    registry: ResourceRegistry,
    device: Box<dyn DeviceAdapter>,
    reports: ReportSender,
}

impl DispatchContext {
    pub fn new(device: Box<dyn DeviceAdapter>, reports: ReportSender) -> Self {
        Self {
            registry: ResourceRegistry::new(),
            device,
            reports,
        }
    }

    pub fn registry(&self) -> &ResourceRegistry {
        &self.registry
    }

    pub fn device_mut(&mut self) -> &mut dyn DeviceAdapter {
        self.device.as_mut()
    }

    /// Configure the device, then record the mode.
    pub async fn configure(&mut self, config: PinConfig, tag: Option<String>) -> Result<Outcome, GatewayError> {
        let mode = config.mode();
        let resources = config.resources();
        let primary = config.primary();

        // Every reporting mode gets a fresh handle so events bound to the
        // previous configuration can be recognised as stale.
        let handle = match (primary, mode.report_kind()) {
            (Some(_), Some(_)) => Some(self.registry.issue_handle()),
            _ => None,
        };
        let sink = match (primary, config.report_kind(), handle) {
            (Some(resource), Some(kind), Some(handle)) => Some(self.reports.bind(resource, kind, handle)),
            _ => None,
        };

        self.device.configure(config, sink).await?;

        for resource in &resources {
            let mut metadata = ModeMetadata::tagged(tag.clone());
            if Some(*resource) == primary {
                if let Some(handle) = handle {
                    metadata = metadata.with_callback(handle);
                }
            }
            self.registry.set_mode(*resource, mode, metadata);
        }
        debug!(mode = %mode, resources = ?resources, "mode applied");
        Ok(Outcome::Configured { mode, resources })
    }

    pub async fn write(&mut self, op: DeviceOp) -> Result<Outcome, GatewayError> {
        self.device.write(op).await?;
        Ok(Outcome::Written)
    }

    /// Start an I2C read. The reply is bound to the I2C bus's current
    /// callback handle, so it is only reported while I2C stays configured.
    pub async fn request(&mut self, query: DeviceQuery) -> Result<Outcome, GatewayError> {
        let handle = match self.registry.callback(ResourceId::I2c) {
            Some(handle) => handle,
            None => self.registry.issue_handle(),
        };
        let sink = self.reports.bind(ResourceId::I2c, ReportKind::I2cData, handle);
        self.device.request(query, sink).await?;
        Ok(Outcome::Requested)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Table
// ─────────────────────────────────────────────────────────────────────────────

/// Immutable command-name → handler mapping.
#[derive(Clone)]
pub struct DispatchTable {
    entries: HashMap<&'static str, Handler>,
}

impl DispatchTable {
    pub fn from_entries(entries: &[(&'static str, Handler)]) -> Self {
        Self {
            entries: entries.iter().copied().collect(),
        }
    }

    /// The command set served by the Arduino gateway.
    pub fn arduino() -> Self {
        Self::from_entries(&[
            ("set_mode_digital_output", set_mode_digital_output),
            ("set_mode_digital_input", set_mode_digital_input),
            ("set_mode_digital_input_pullup", set_mode_digital_input_pullup),
            ("set_mode_analog_input", set_mode_analog_input),
            ("set_mode_pwm", set_mode_pwm),
            ("set_mode_servo", set_mode_servo),
            ("set_mode_tone", set_mode_tone),
            ("set_mode_i2c", set_mode_i2c),
            ("set_mode_sonar", set_mode_sonar),
            ("set_mode_stepper", set_mode_stepper),
            ("digital_write", digital_write),
            ("pwm_write", pwm_write),
            ("servo_position", servo_position),
            ("play_tone", play_tone),
            ("stepper_write", stepper_write),
            ("i2c_write", i2c_write),
            ("i2c_read", i2c_read),
            ("enable_digital_reporting", enable_digital_reporting),
            ("disable_digital_reporting", disable_digital_reporting),
            ("enable_analog_reporting", enable_analog_reporting),
            ("disable_analog_reporting", disable_analog_reporting),
        ])
    }

    pub fn lookup(&self, command: &str) -> Option<Handler> {
        self.entries.get(command).copied()
    }

    pub fn contains(&self, command: &str) -> bool {
        self.entries.contains_key(command)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Command names, sorted.
    pub fn commands(&self) -> Vec<&'static str> {
        let mut names: Vec<&'static str> = self.entries.keys().copied().collect();
        names.sort_unstable();
        names
    }

    /// Run the handler registered for `envelope.command()`.
    ///
    /// # Errors
    ///
    /// [`GatewayError::UnknownCommand`] when no handler matches, in which case
    /// neither the registry nor the device is touched. Otherwise whatever the
    /// handler signals.
    pub async fn dispatch(
        &self,
        ctx: &mut DispatchContext,
        envelope: &CommandEnvelope,
    ) -> Result<Outcome, GatewayError> {
        let handler = self
            .lookup(envelope.command())
            .ok_or_else(|| GatewayError::UnknownCommand(envelope.command().to_string()))?;
        handler(ctx, envelope).await
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Mode-setting handlers
// ─────────────────────────────────────────────────────────────────────────────

fn configure_pin<'a>(
    ctx: &'a mut DispatchContext,
    envelope: &'a CommandEnvelope,
    build: fn(u8) -> PinConfig,
) -> BoxFuture<'a, Result<Outcome, GatewayError>> {
    Box::pin(async move {
        let pin = envelope.require_u8("pin")?;
        ctx.configure(build(pin), envelope.tag()).await
    })
}

fn set_mode_digital_output<'a>(ctx: &'a mut DispatchContext, envelope: &'a CommandEnvelope) -> BoxFuture<'a, Result<Outcome, GatewayError>> {
    configure_pin(ctx, envelope, |pin| PinConfig::DigitalOutput { pin })
}

fn set_mode_digital_input<'a>(ctx: &'a mut DispatchContext, envelope: &'a CommandEnvelope) -> BoxFuture<'a, Result<Outcome, GatewayError>> {
    configure_pin(ctx, envelope, |pin| PinConfig::DigitalInput { pin })
}

fn set_mode_digital_input_pullup<'a>(ctx: &'a mut DispatchContext, envelope: &'a CommandEnvelope) -> BoxFuture<'a, Result<Outcome, GatewayError>> {
    configure_pin(ctx, envelope, |pin| PinConfig::DigitalInputPullup { pin })
}

fn set_mode_analog_input<'a>(ctx: &'a mut DispatchContext, envelope: &'a CommandEnvelope) -> BoxFuture<'a, Result<Outcome, GatewayError>> {
    configure_pin(ctx, envelope, |pin| PinConfig::AnalogInput { pin })
}

fn set_mode_pwm<'a>(ctx: &'a mut DispatchContext, envelope: &'a CommandEnvelope) -> BoxFuture<'a, Result<Outcome, GatewayError>> {
    configure_pin(ctx, envelope, |pin| PinConfig::Pwm { pin })
}

fn set_mode_servo<'a>(ctx: &'a mut DispatchContext, envelope: &'a CommandEnvelope) -> BoxFuture<'a, Result<Outcome, GatewayError>> {
    configure_pin(ctx, envelope, |pin| PinConfig::Servo { pin })
}

fn set_mode_tone<'a>(ctx: &'a mut DispatchContext, envelope: &'a CommandEnvelope) -> BoxFuture<'a, Result<Outcome, GatewayError>> {
    configure_pin(ctx, envelope, |pin| PinConfig::Tone { pin })
}

fn set_mode_i2c<'a>(ctx: &'a mut DispatchContext, envelope: &'a CommandEnvelope) -> BoxFuture<'a, Result<Outcome, GatewayError>> {
    Box::pin(async move { ctx.configure(PinConfig::I2c, envelope.tag()).await })
}

fn set_mode_sonar<'a>(ctx: &'a mut DispatchContext, envelope: &'a CommandEnvelope) -> BoxFuture<'a, Result<Outcome, GatewayError>> {
    Box::pin(async move {
        let trigger_pin = envelope.require_u8("trigger_pin")?;
        let echo_pin = envelope.require_u8("echo_pin")?;
        ctx.configure(PinConfig::Sonar { trigger_pin, echo_pin }, envelope.tag())
            .await
    })
}

fn set_mode_stepper<'a>(ctx: &'a mut DispatchContext, envelope: &'a CommandEnvelope) -> BoxFuture<'a, Result<Outcome, GatewayError>> {
    Box::pin(async move {
        let steps_per_revolution = envelope.require_u32("steps_per_revolution")?;
        let pins = envelope.require_u8_list("pins")?;
        ctx.configure(PinConfig::Stepper { steps_per_revolution, pins }, envelope.tag())
            .await
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Value-setting handlers
// ─────────────────────────────────────────────────────────────────────────────

fn pass_through<'a>(
    ctx: &'a mut DispatchContext,
    envelope: &'a CommandEnvelope,
    extract: fn(&CommandEnvelope) -> Result<DeviceOp, GatewayError>,
) -> BoxFuture<'a, Result<Outcome, GatewayError>> {
    Box::pin(async move {
        let op = extract(envelope)?;
        ctx.write(op).await
    })
}

fn digital_write<'a>(ctx: &'a mut DispatchContext, envelope: &'a CommandEnvelope) -> BoxFuture<'a, Result<Outcome, GatewayError>> {
    pass_through(ctx, envelope, |e| {
        Ok(DeviceOp::DigitalWrite {
            pin: e.require_u8("pin")?,
            value: e.require_u8("value")?,
        })
    })
}

fn pwm_write<'a>(ctx: &'a mut DispatchContext, envelope: &'a CommandEnvelope) -> BoxFuture<'a, Result<Outcome, GatewayError>> {
    pass_through(ctx, envelope, |e| {
        Ok(DeviceOp::PwmWrite {
            pin: e.require_u8("pin")?,
            value: e.require_u16("value")?,
        })
    })
}

fn servo_position<'a>(ctx: &'a mut DispatchContext, envelope: &'a CommandEnvelope) -> BoxFuture<'a, Result<Outcome, GatewayError>> {
    pass_through(ctx, envelope, |e| {
        Ok(DeviceOp::ServoPosition {
            pin: e.require_u8("pin")?,
            position: e.require_u8("position")?,
        })
    })
}

fn play_tone<'a>(ctx: &'a mut DispatchContext, envelope: &'a CommandEnvelope) -> BoxFuture<'a, Result<Outcome, GatewayError>> {
    pass_through(ctx, envelope, |e| {
        Ok(DeviceOp::PlayTone {
            pin: e.require_u8("pin")?,
            frequency: e.require_u16("freq")?,
            duration: e.require_u16("duration")?,
        })
    })
}

fn stepper_write<'a>(ctx: &'a mut DispatchContext, envelope: &'a CommandEnvelope) -> BoxFuture<'a, Result<Outcome, GatewayError>> {
    pass_through(ctx, envelope, |e| {
        Ok(DeviceOp::StepperWrite {
            motor_speed: e.require_u32("motor_speed")?,
            number_of_steps: e.require_i32("number_of_steps")?,
        })
    })
}

fn i2c_write<'a>(ctx: &'a mut DispatchContext, envelope: &'a CommandEnvelope) -> BoxFuture<'a, Result<Outcome, GatewayError>> {
    pass_through(ctx, envelope, |e| {
        Ok(DeviceOp::I2cWrite {
            address: e.require_u8("addr")?,
            data: e.require_u8_list("data")?,
        })
    })
}

fn i2c_read<'a>(ctx: &'a mut DispatchContext, envelope: &'a CommandEnvelope) -> BoxFuture<'a, Result<Outcome, GatewayError>> {
    Box::pin(async move {
        let query = DeviceQuery::I2cRead {
            address: envelope.require_u8("addr")?,
            register: envelope.optional_u8("register")?,
            number_of_bytes: envelope.require_u8("number_of_bytes")?,
        };
        ctx.request(query).await
    })
}

fn enable_digital_reporting<'a>(ctx: &'a mut DispatchContext, envelope: &'a CommandEnvelope) -> BoxFuture<'a, Result<Outcome, GatewayError>> {
    pass_through(ctx, envelope, |e| {
        Ok(DeviceOp::SetDigitalReporting { pin: e.require_u8("pin")?, enabled: true })
    })
}

fn disable_digital_reporting<'a>(ctx: &'a mut DispatchContext, envelope: &'a CommandEnvelope) -> BoxFuture<'a, Result<Outcome, GatewayError>> {
    pass_through(ctx, envelope, |e| {
        Ok(DeviceOp::SetDigitalReporting { pin: e.require_u8("pin")?, enabled: false })
    })
}

fn enable_analog_reporting<'a>(ctx: &'a mut DispatchContext, envelope: &'a CommandEnvelope) -> BoxFuture<'a, Result<Outcome, GatewayError>> {
    pass_through(ctx, envelope, |e| {
        Ok(DeviceOp::SetAnalogReporting { pin: e.require_u8("pin")?, enabled: true })
    })
}

fn disable_analog_reporting<'a>(ctx: &'a mut DispatchContext, envelope: &'a CommandEnvelope) -> BoxFuture<'a, Result<Outcome, GatewayError>> {
    pass_through(ctx, envelope, |e| {
        Ok(DeviceOp::SetAnalogReporting { pin: e.require_u8("pin")?, enabled: false })
    })
}
