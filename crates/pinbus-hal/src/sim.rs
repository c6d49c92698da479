//! In-process simulated microcontroller for tests and headless runs.
//!
//! [`SimBoard`] implements [`DeviceAdapter`] the way a real board behaves as
//! seen from the gateway: it validates pin numbers, refuses writes a pin's
//! current mode does not allow, keeps one callback slot per resource, and
//! answers I2C reads from a small register memory. Tests drive the input side
//! with [`SimBoard::inject_digital`], [`SimBoard::inject_analog`],
//! [`SimBoard::inject_sonar`] and [`SimBoard::tick`].
//!
//! `SimBoard` is a cheap handle: clones share the same board, so a test can
//! hand one clone to a gateway and keep another to inject events and inspect
//! the [call log][SimBoard::calls].
//!
//! # Example
//!
//! ```rust
//! use pinbus_hal::{DeviceAdapter, PinConfig, DeviceOp, SimBoard};
//!
//! # tokio_test_block(async {
//! let mut board = SimBoard::default();
//! board.open().await.unwrap();
//! board.configure(PinConfig::DigitalOutput { pin: 9 }, None).await.unwrap();
//! board.write(DeviceOp::DigitalWrite { pin: 9, value: 1 }).await.unwrap();
//! assert_eq!(board.pin_value(9), Some(1));
//! # });
//! # fn tokio_test_block<F: std::future::Future>(f: F) -> F::Output {
//! #     tokio::runtime::Runtime::new().unwrap().block_on(f)
//! # }
//! ```

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use pinbus_types::{GatewayError, PinMode, ResourceId};
use serde_json::{Value, json};
use tracing::{debug, info};

use crate::device::{DeviceAdapter, DeviceInfo, DeviceOp, DeviceQuery, PinConfig, ReportSink};
use crate::registry::CallbackHandle;

/// First element of an I2C read callback's data list.
const I2C_READ_REPORT: u8 = 10;
/// Largest servo angle accepted, in degrees.
const SERVO_MAX_DEGREES: u8 = 180;

// ────────────────────────────────────────────────────────────────────────────
// Configuration
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SimBoardConfig {
    /// Pins `0..digital_pins` are addressable.
    pub digital_pins: u8,
    /// Serial port the board pretends to sit on.
    pub com_port: Option<String>,
    /// Firmware instance id the board reports.
    pub instance_id: Option<u32>,
    /// When `false`, [`DeviceAdapter::open`] fails.
    pub reachable: bool,
}

impl Default for SimBoardConfig {
    fn default() -> Self {
        Self {
            digital_pins: 100,
            com_port: None,
            instance_id: None,
            reachable: true,
        }
    }
}

/// One recorded adapter call, in call order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceCall {
    Open,
    Configure(PinConfig),
    Write(DeviceOp),
    Request(DeviceQuery),
    Close,
}

// ────────────────────────────────────────────────────────────────────────────
// Board state
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug)]
struct Stepper {
    steps_per_revolution: u32,
    position: i64,
}

#[derive(Debug, Default)]
struct BoardState {
    open: bool,
    modes: HashMap<u8, PinMode>,
    i2c_enabled: bool,
    sinks: HashMap<ResourceId, ReportSink>,
    digital_reporting: HashSet<u8>,
    analog_reporting: HashSet<u8>,
    outputs: HashMap<u8, u16>,
    analog_levels: BTreeMap<u8, u16>,
    i2c_memory: HashMap<(u8, u8), u8>,
    stepper: Option<Stepper>,
    calls: Vec<DeviceCall>,
}

impl BoardState {
    fn mode(&self, pin: u8) -> PinMode {
        self.modes.get(&pin).copied().unwrap_or_default()
    }

    fn require_mode(&self, op: &DeviceOp, pin: u8, allowed: &[PinMode]) -> Result<(), GatewayError> {
        let mode = self.mode(pin);
        if allowed.contains(&mode) {
            Ok(())
        } else {
            Err(write_error(op, format!("pin is configured as {mode}")))
        }
    }

    fn emit(&self, resource: ResourceId, data: Vec<Value>) -> bool {
        match self.sinks.get(&resource) {
            Some(sink) => sink.emit(data),
            None => false,
        }
    }
}

/// Simulated board. See the [module docs][self].
#[derive(Debug, Clone, Default)]
pub struct SimBoard {
    config: Arc<SimBoardConfig>,
    state: Arc<Mutex<BoardState>>,
}

impl SimBoard {
    pub fn new(config: SimBoardConfig) -> Self {
        Self {
            config: Arc::new(config),
            state: Arc::new(Mutex::new(BoardState::default())),
        }
    }

    /// Every adapter call made so far.
    pub fn calls(&self) -> Vec<DeviceCall> {
        self.state.lock().calls.clone()
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().open
    }

    pub fn mode(&self, pin: u8) -> PinMode {
        self.state.lock().mode(pin)
    }

    /// Last value written to an output pin.
    pub fn pin_value(&self, pin: u8) -> Option<u16> {
        self.state.lock().outputs.get(&pin).copied()
    }

    /// Handle of the callback currently registered for `resource`.
    pub fn callback(&self, resource: ResourceId) -> Option<CallbackHandle> {
        self.state.lock().sinks.get(&resource).map(ReportSink::handle)
    }

    pub fn stepper_position(&self) -> Option<i64> {
        self.state.lock().stepper.as_ref().map(|s| s.position)
    }

    pub fn stepper_steps_per_revolution(&self) -> Option<u32> {
        self.state.lock().stepper.as_ref().map(|s| s.steps_per_revolution)
    }

    pub fn i2c_register(&self, address: u8, register: u8) -> Option<u8> {
        self.state.lock().i2c_memory.get(&(address, register)).copied()
    }

    /// Seed the simulated I2C device memory.
    pub fn set_i2c_register(&self, address: u8, register: u8, value: u8) {
        self.state.lock().i2c_memory.insert((address, register), value);
    }

    /// Drive a digital input pin. Returns whether a callback fired.
    pub fn inject_digital(&self, pin: u8, value: u8) -> bool {
        let state = self.state.lock();
        let mode = state.mode(pin);
        if !matches!(mode, PinMode::DigitalInput | PinMode::DigitalInputPullup)
            || !state.digital_reporting.contains(&pin)
        {
            return false;
        }
        state.emit(ResourceId::Pin(pin), reading(mode, pin, json!(value)))
    }

    /// Drive an analog input pin. The level is kept for [`SimBoard::tick`].
    pub fn inject_analog(&self, pin: u8, value: u16) -> bool {
        let mut state = self.state.lock();
        if state.mode(pin) != PinMode::AnalogInput {
            return false;
        }
        state.analog_levels.insert(pin, value);
        if !state.analog_reporting.contains(&pin) {
            return false;
        }
        state.emit(ResourceId::Pin(pin), reading(PinMode::AnalogInput, pin, json!(value)))
    }

    /// Report a sonar distance (centimetres) for the sensor on `trigger_pin`.
    pub fn inject_sonar(&self, trigger_pin: u8, distance: u16) -> bool {
        let state = self.state.lock();
        if state.mode(trigger_pin) != PinMode::Sonar {
            return false;
        }
        state.emit(
            ResourceId::Pin(trigger_pin),
            reading(PinMode::Sonar, trigger_pin, json!(distance)),
        )
    }

    /// Emit the current level of every reporting analog input, like one
    /// sampling period of the firmware. Returns the number of callbacks fired.
    pub fn tick(&self) -> usize {
        let state = self.state.lock();
        let mut fired = 0;
        for (&pin, &level) in &state.analog_levels {
            if state.mode(pin) != PinMode::AnalogInput || !state.analog_reporting.contains(&pin) {
                continue;
            }
            if state.emit(ResourceId::Pin(pin), reading(PinMode::AnalogInput, pin, json!(level))) {
                fired += 1;
            }
        }
        fired
    }

    fn check_pin(&self, pin: u8) -> Result<(), GatewayError> {
        if pin < self.config.digital_pins {
            Ok(())
        } else {
            Err(GatewayError::Configuration {
                resource: ResourceId::Pin(pin).to_string(),
                details: format!("board has {} pins", self.config.digital_pins),
            })
        }
    }

    fn validate(&self, config: &PinConfig) -> Result<(), GatewayError> {
        match config {
            PinConfig::I2c => Ok(()),
            PinConfig::Sonar { trigger_pin, echo_pin } if trigger_pin == echo_pin => {
                Err(GatewayError::Configuration {
                    resource: ResourceId::Pin(*trigger_pin).to_string(),
                    details: "sonar trigger and echo must be different pins".to_string(),
                })
            }
            PinConfig::Stepper { steps_per_revolution, pins } => {
                if !matches!(pins.len(), 2 | 4) {
                    return Err(GatewayError::Configuration {
                        resource: "stepper".to_string(),
                        details: format!("stepper needs 2 or 4 pins, got {}", pins.len()),
                    });
                }
                if *steps_per_revolution == 0 {
                    return Err(GatewayError::Configuration {
                        resource: "stepper".to_string(),
                        details: "steps_per_revolution must be positive".to_string(),
                    });
                }
                pins.iter().try_for_each(|pin| self.check_pin(*pin))
            }
            other => other.resources().into_iter().try_for_each(|resource| match resource {
                ResourceId::Pin(pin) => self.check_pin(pin),
                ResourceId::I2c => Ok(()),
            }),
        }
    }
}

/// `[mode, pin, value, timestamp]`, the layout of every pin callback.
fn reading(mode: PinMode, pin: u8, value: Value) -> Vec<Value> {
    vec![
        json!(mode_code(mode)),
        json!(pin),
        value,
        json!(chrono::Utc::now().timestamp()),
    ]
}

/// Numeric pin-mode code the firmware puts first in callback data.
fn mode_code(mode: PinMode) -> u8 {
    match mode {
        PinMode::DigitalInput => 0,
        PinMode::DigitalOutput => 1,
        PinMode::DigitalInputPullup => 2,
        PinMode::AnalogInput => 3,
        PinMode::Pwm => 4,
        PinMode::Servo => 5,
        PinMode::I2c => 6,
        PinMode::Sonar => 7,
        PinMode::Tone => 8,
        PinMode::Stepper => 9,
        PinMode::Unconfigured => 255,
    }
}

fn write_error(op: &DeviceOp, details: impl Into<String>) -> GatewayError {
    GatewayError::Write {
        resource: op.resource(),
        details: details.into(),
    }
}

#[async_trait]
impl DeviceAdapter for SimBoard {
    async fn open(&mut self) -> Result<DeviceInfo, GatewayError> {
        let mut state = self.state.lock();
        state.calls.push(DeviceCall::Open);
        if !self.config.reachable {
            let port = self.config.com_port.as_deref().unwrap_or("auto-detected port");
            return Err(GatewayError::Connection(format!("no board answering on {port}")));
        }
        state.open = true;
        info!(pins = self.config.digital_pins, "simulated board open");
        Ok(DeviceInfo {
            name: "SimBoard".to_string(),
            com_port: self.config.com_port.clone(),
            instance_id: self.config.instance_id,
        })
    }

    async fn configure(&mut self, config: PinConfig, sink: Option<ReportSink>) -> Result<(), GatewayError> {
        let mut state = self.state.lock();
        state.calls.push(DeviceCall::Configure(config.clone()));
        if !state.open {
            return Err(GatewayError::Configuration {
                resource: config.primary().map(|r| r.to_string()).unwrap_or_default(),
                details: "board is not open".to_string(),
            });
        }
        self.validate(&config)?;

        let mode = config.mode();
        for resource in config.resources() {
            state.sinks.remove(&resource);
            if let ResourceId::Pin(pin) = resource {
                state.modes.insert(pin, mode);
                state.outputs.remove(&pin);
                state.digital_reporting.remove(&pin);
                state.analog_reporting.remove(&pin);
                match mode {
                    PinMode::DigitalInput | PinMode::DigitalInputPullup => {
                        state.digital_reporting.insert(pin);
                    }
                    PinMode::AnalogInput => {
                        state.analog_reporting.insert(pin);
                    }
                    _ => {}
                }
            }
        }

        match &config {
            PinConfig::I2c => state.i2c_enabled = true,
            PinConfig::Stepper { steps_per_revolution, .. } => {
                state.stepper = Some(Stepper {
                    steps_per_revolution: *steps_per_revolution,
                    position: 0,
                });
            }
            _ => {}
        }

        if let (Some(sink), Some(primary)) = (sink, config.primary()) {
            state.sinks.insert(primary, sink);
        }
        debug!(mode = %mode, resources = ?config.resources(), "sim configure");
        Ok(())
    }

    async fn write(&mut self, op: DeviceOp) -> Result<(), GatewayError> {
        let mut state = self.state.lock();
        state.calls.push(DeviceCall::Write(op.clone()));
        if !state.open {
            return Err(write_error(&op, "board is not open"));
        }

        match &op {
            DeviceOp::DigitalWrite { pin, value } => {
                state.require_mode(&op, *pin, &[PinMode::DigitalOutput])?;
                if *value > 1 {
                    return Err(write_error(&op, format!("digital value must be 0 or 1, got {value}")));
                }
                state.outputs.insert(*pin, u16::from(*value));
            }
            DeviceOp::PwmWrite { pin, value } => {
                state.require_mode(&op, *pin, &[PinMode::Pwm])?;
                state.outputs.insert(*pin, *value);
            }
            DeviceOp::ServoPosition { pin, position } => {
                state.require_mode(&op, *pin, &[PinMode::Servo])?;
                if *position > SERVO_MAX_DEGREES {
                    return Err(write_error(&op, format!("servo position {position} exceeds {SERVO_MAX_DEGREES}")));
                }
                state.outputs.insert(*pin, u16::from(*position));
            }
            DeviceOp::PlayTone { pin, frequency, .. } => {
                state.require_mode(&op, *pin, &[PinMode::Tone])?;
                state.outputs.insert(*pin, *frequency);
            }
            DeviceOp::StepperWrite { number_of_steps, .. } => match state.stepper.as_mut() {
                Some(stepper) => stepper.position += i64::from(*number_of_steps),
                None => return Err(write_error(&op, "no stepper configured")),
            },
            DeviceOp::I2cWrite { address, data } => {
                if !state.i2c_enabled {
                    return Err(write_error(&op, "i2c is not enabled"));
                }
                // First byte selects the register; the rest fill consecutive registers.
                if let Some((register, bytes)) = data.split_first() {
                    for (offset, byte) in bytes.iter().enumerate() {
                        let reg = register.wrapping_add(offset as u8);
                        state.i2c_memory.insert((*address, reg), *byte);
                    }
                }
            }
            DeviceOp::SetDigitalReporting { pin, enabled } => {
                state.require_mode(&op, *pin, &[PinMode::DigitalInput, PinMode::DigitalInputPullup])?;
                if *enabled {
                    state.digital_reporting.insert(*pin);
                } else {
                    state.digital_reporting.remove(pin);
                }
            }
            DeviceOp::SetAnalogReporting { pin, enabled } => {
                state.require_mode(&op, *pin, &[PinMode::AnalogInput])?;
                if *enabled {
                    state.analog_reporting.insert(*pin);
                } else {
                    state.analog_reporting.remove(pin);
                }
            }
        }
        Ok(())
    }

    async fn request(&mut self, query: DeviceQuery, sink: ReportSink) -> Result<(), GatewayError> {
        let mut state = self.state.lock();
        state.calls.push(DeviceCall::Request(query.clone()));
        let DeviceQuery::I2cRead {
            address,
            register,
            number_of_bytes,
        } = query;
        if !state.open || !state.i2c_enabled {
            return Err(GatewayError::Write {
                resource: format!("i2c device {address:#04x}"),
                details: "i2c is not enabled".to_string(),
            });
        }

        let base = register.unwrap_or(0);
        let mut data = vec![
            json!(I2C_READ_REPORT),
            json!(0),
            json!(number_of_bytes),
            json!(address),
            json!(base),
        ];
        data.extend((0..number_of_bytes).map(|offset| {
            let reg = base.wrapping_add(offset);
            json!(state.i2c_memory.get(&(address, reg)).copied().unwrap_or(0))
        }));
        data.push(json!(chrono::Utc::now().timestamp()));
        sink.emit(data);
        Ok(())
    }

    async fn close(&mut self) -> Result<(), GatewayError> {
        let mut state = self.state.lock();
        state.calls.push(DeviceCall::Close);
        state.open = false;
        state.sinks.clear();
        info!("simulated board closed");
        Ok(())
    }
}
