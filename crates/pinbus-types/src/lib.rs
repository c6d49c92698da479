//! `pinbus-types` – shared data model for the pinbus gateways.
//!
//! Everything that crosses a crate boundary lives here: the pin modes and
//! resource identifiers tracked by the registry, the command / report
//! envelopes exchanged over the bus, the transport passthrough frame, and the
//! [`GatewayError`] taxonomy.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

/// Topic the Arduino gateway listens on for commands.
pub const TO_ARDUINO_GATEWAY: &str = "to_arduino_gateway";
/// Topic the Arduino gateway publishes its reports to.
pub const FROM_ARDUINO_GATEWAY: &str = "from_arduino_gateway";
/// Topic used to prime the pin-initialization component.
pub const PIN_INIT: &str = "pin_init";

// ─────────────────────────────────────────────────────────────────────────────
// Resources and modes
// ─────────────────────────────────────────────────────────────────────────────

/// Operating configuration of a resource.
///
/// A resource has exactly one active mode; [`PinMode::Unconfigured`] is what
/// the registry reports for a resource no mode-setting command has touched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PinMode {
    #[default]
    Unconfigured,
    DigitalOutput,
    DigitalInput,
    DigitalInputPullup,
    AnalogInput,
    Pwm,
    Servo,
    Tone,
    I2c,
    Sonar,
    Stepper,
}

impl PinMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            PinMode::Unconfigured => "unconfigured",
            PinMode::DigitalOutput => "digital_output",
            PinMode::DigitalInput => "digital_input",
            PinMode::DigitalInputPullup => "digital_input_pullup",
            PinMode::AnalogInput => "analog_input",
            PinMode::Pwm => "pwm",
            PinMode::Servo => "servo",
            PinMode::Tone => "tone",
            PinMode::I2c => "i2c",
            PinMode::Sonar => "sonar",
            PinMode::Stepper => "stepper",
        }
    }

    /// The report shape a resource in this mode produces asynchronously, if
    /// any.
    pub fn report_kind(&self) -> Option<ReportKind> {
        match self {
            PinMode::DigitalInput | PinMode::DigitalInputPullup => Some(ReportKind::DigitalInput),
            PinMode::AnalogInput => Some(ReportKind::AnalogInput),
            PinMode::I2c => Some(ReportKind::I2cData),
            PinMode::Sonar => Some(ReportKind::SonarData),
            _ => None,
        }
    }
}

impl fmt::Display for PinMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Addressable hardware resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceId {
    /// A GPIO line, addressed by pin number.
    Pin(u8),
    /// The board's I2C bus.
    I2c,
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceId::Pin(pin) => write!(f, "pin {pin}"),
            ResourceId::I2c => f.write_str("i2c"),
        }
    }
}

/// Shape of an asynchronous device report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportKind {
    DigitalInput,
    AnalogInput,
    I2cData,
    SonarData,
}

impl ReportKind {
    /// Value of the `report` key in the outbound envelope.
    pub fn as_str(&self) -> &'static str {
        match self {
            ReportKind::DigitalInput => "digital_input",
            ReportKind::AnalogInput => "analog_input",
            ReportKind::I2cData => "i2c_data",
            ReportKind::SonarData => "sonar_data",
        }
    }
}

impl fmt::Display for ReportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Bus messages
// ─────────────────────────────────────────────────────────────────────────────

/// A `(topic, envelope)` pair travelling over the message bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusMessage {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub topic: String,
    pub payload: Value,
}

impl BusMessage {
    pub fn new(topic: impl Into<String>, payload: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            topic: topic.into(),
            payload,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Command envelope
// ─────────────────────────────────────────────────────────────────────────────

/// An inbound `{command: <name>, ...fields}` message.
///
/// Only the `command` key is checked on construction. Every other field is
/// extracted lazily by the handler that needs it, and a missing or mistyped
/// field surfaces as [`GatewayError::MissingField`] /
/// [`GatewayError::InvalidField`] at that point.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandEnvelope {
    command: String,
    fields: Map<String, Value>,
}

impl CommandEnvelope {
    /// Wrap a decoded JSON value.
    ///
    /// # Errors
    ///
    /// [`GatewayError::MissingField`] when the value is not an object or has
    /// no string `command` key.
    pub fn from_value(value: Value) -> Result<Self, GatewayError> {
        let Value::Object(fields) = value else {
            return Err(GatewayError::MissingField {
                command: "<none>".to_string(),
                field: "command".to_string(),
            });
        };
        let command = fields
            .get("command")
            .and_then(Value::as_str)
            .ok_or_else(|| GatewayError::MissingField {
                command: "<none>".to_string(),
                field: "command".to_string(),
            })?
            .to_string();
        Ok(Self { command, fields })
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// The optional free-form `tag` used for UI grouping.
    pub fn tag(&self) -> Option<String> {
        self.fields
            .get("tag")
            .and_then(Value::as_str)
            .map(str::to_string)
    }

    pub fn require_u8(&self, field: &str) -> Result<u8, GatewayError> {
        self.integer(field, "an integer in 0..=255")
    }

    pub fn require_u16(&self, field: &str) -> Result<u16, GatewayError> {
        self.integer(field, "an integer in 0..=65535")
    }

    pub fn require_u32(&self, field: &str) -> Result<u32, GatewayError> {
        self.integer(field, "a non-negative 32-bit integer")
    }

    pub fn require_i32(&self, field: &str) -> Result<i32, GatewayError> {
        self.integer(field, "a signed 32-bit integer")
    }

    /// Like [`require_u8`][Self::require_u8] but absent or `null` yields
    /// `None`.
    pub fn optional_u8(&self, field: &str) -> Result<Option<u8>, GatewayError> {
        match self.fields.get(field) {
            None | Some(Value::Null) => Ok(None),
            Some(_) => self.require_u8(field).map(Some),
        }
    }

    /// Extract a JSON array of byte-sized integers.
    pub fn require_u8_list(&self, field: &str) -> Result<Vec<u8>, GatewayError> {
        let expected = "an array of integers in 0..=255";
        let items = self
            .require(field)?
            .as_array()
            .ok_or_else(|| self.invalid(field, expected))?;
        items
            .iter()
            .map(|v| {
                as_integer(v)
                    .and_then(|n| u8::try_from(n).ok())
                    .ok_or_else(|| self.invalid(field, expected))
            })
            .collect()
    }

    fn require(&self, field: &str) -> Result<&Value, GatewayError> {
        self.fields.get(field).ok_or_else(|| GatewayError::MissingField {
            command: self.command.clone(),
            field: field.to_string(),
        })
    }

    fn integer<T: TryFrom<i64>>(&self, field: &str, expected: &str) -> Result<T, GatewayError> {
        let value = self.require(field)?;
        as_integer(value)
            .and_then(|n| T::try_from(n).ok())
            .ok_or_else(|| self.invalid(field, expected))
    }

    fn invalid(&self, field: &str, expected: &str) -> GatewayError {
        GatewayError::InvalidField {
            command: self.command.clone(),
            field: field.to_string(),
            expected: expected.to_string(),
        }
    }
}

/// Integers arrive as JSON numbers; integral floats (`9.0`) are accepted too
/// since some flow editors emit every number as a double.
fn as_integer(value: &Value) -> Option<i64> {
    value.as_i64().or_else(|| {
        value
            .as_f64()
            .filter(|f| f.fract() == 0.0 && f.abs() < i64::MAX as f64)
            .map(|f| f as i64)
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Report envelope
// ─────────────────────────────────────────────────────────────────────────────

/// An outbound `{report: <kind>, ...fields}` message.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct ReportEnvelope(Map<String, Value>);

impl ReportEnvelope {
    pub fn new(kind: ReportKind) -> Self {
        let mut fields = Map::new();
        fields.insert("report".to_string(), Value::from(kind.as_str()));
        Self(fields)
    }

    /// Builder-style field insertion.
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.0.insert(key.to_string(), value.into());
        self
    }

    pub fn kind(&self) -> Option<&str> {
        self.0.get("report").and_then(Value::as_str)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Transport frame
// ─────────────────────────────────────────────────────────────────────────────

/// Whole-message text frame exchanged with a WebSocket client:
/// `{"payload": <opaque>}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportFrame {
    pub payload: Value,
}

impl TransportFrame {
    pub fn new(payload: Value) -> Self {
        Self { payload }
    }

    /// Decode a received text frame.
    ///
    /// # Errors
    ///
    /// [`GatewayError::Serialization`] for text that is not JSON,
    /// [`GatewayError::MissingField`] for JSON without a `payload` key.
    pub fn decode(text: &str) -> Result<Self, GatewayError> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| GatewayError::Serialization(format!("transport frame: {e}")))?;
        match value {
            Value::Object(mut fields) => match fields.remove("payload") {
                Some(payload) => Ok(Self { payload }),
                None => Err(GatewayError::MissingField {
                    command: "<transport frame>".to_string(),
                    field: "payload".to_string(),
                }),
            },
            _ => Err(GatewayError::MissingField {
                command: "<transport frame>".to_string(),
                field: "payload".to_string(),
            }),
        }
    }

    pub fn encode(&self) -> Result<String, GatewayError> {
        serde_json::to_string(self).map_err(|e| GatewayError::Serialization(e.to_string()))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Errors
// ─────────────────────────────────────────────────────────────────────────────

/// Error taxonomy shared by every gateway.
///
/// All variants except [`GatewayError::Connection`] are handled at the
/// boundary where they occur: the message or event is dropped and logged,
/// and the gateway keeps serving.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GatewayError {
    #[error("unknown command '{0}'")]
    UnknownCommand(String),

    #[error("'{command}' is missing required field '{field}'")]
    MissingField { command: String, field: String },

    #[error("'{command}' field '{field}' must be {expected}")]
    InvalidField {
        command: String,
        field: String,
        expected: String,
    },

    #[error("device rejected configuration of {resource}: {details}")]
    Configuration { resource: String, details: String },

    #[error("device rejected write to {resource}: {details}")]
    Write { resource: String, details: String },

    #[error("transport closed: {0}")]
    TransportClosed(String),

    #[error("{queue} queue is full ({capacity} pending); message dropped")]
    QueueFull { queue: String, capacity: usize },

    #[error("malformed {kind} report data: expected at least {expected} elements, got {actual}")]
    MalformedReportData {
        kind: String,
        expected: usize,
        actual: usize,
    },

    #[error("stale {kind} event for {resource}: resource was reconfigured")]
    StaleEvent { resource: String, kind: String },

    #[error("bus error: {0}")]
    Bus(String),

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("invalid gateway transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },
}

impl GatewayError {
    /// Only connection-establishment failures end the process.
    pub fn is_fatal(&self) -> bool {
        matches!(self, GatewayError::Connection(_))
    }

    /// Errors caused by the content of a message or event rather than by a
    /// collaborator.
    pub fn is_malformed_input(&self) -> bool {
        matches!(
            self,
            GatewayError::UnknownCommand(_)
                | GatewayError::MissingField { .. }
                | GatewayError::InvalidField { .. }
                | GatewayError::MalformedReportData { .. }
        )
    }

    /// Errors signalled by the device collaborator.
    pub fn is_device_failure(&self) -> bool {
        matches!(
            self,
            GatewayError::Configuration { .. } | GatewayError::Write { .. }
        )
    }
}
