//! Report Translator: device callbacks → `{report: <kind>, ...}` envelopes.
//!
//! | kind | raw data | envelope |
//! |---|---|---|
//! | `digital_input` | `[mode, pin, value, timestamp]` | `{report, pin, value, timestamp}` |
//! | `analog_input` | `[mode, pin, value, timestamp]` | `{report, pin, value, timestamp}` |
//! | `i2c_data` | any list | `{report, value: "a, b, c"}` |
//! | `sonar_data` | `[mode, trigger_pin, distance, ...]` | `{report, value: distance}` |
//!
//! [`translate`] is pure. [`ReportTranslator`] adds the stale-event check
//! against the [`ResourceRegistry`] and the logging. An event it cannot use
//! is dropped; nothing here can take the gateway down.

use pinbus_hal::{DeviceEvent, ResourceRegistry};
use pinbus_types::{GatewayError, PinMode, ReportEnvelope, ReportKind};
use serde_json::Value;
use tracing::{debug, warn};

/// Separator used to join I2C data into one string.
const I2C_JOIN: &str = ", ";

/// Map one device event to its envelope.
///
/// # Errors
///
/// [`GatewayError::MalformedReportData`] when `data` is shorter than `kind`
/// requires.
pub fn translate(event: &DeviceEvent) -> Result<ReportEnvelope, GatewayError> {
    let data = &event.data;
    match event.kind {
        ReportKind::DigitalInput | ReportKind::AnalogInput => {
            require_len(event, 4)?;
            Ok(ReportEnvelope::new(event.kind)
                .with("pin", data[1].clone())
                .with("value", data[2].clone())
                .with("timestamp", data[3].clone()))
        }
        ReportKind::SonarData => {
            require_len(event, 3)?;
            Ok(ReportEnvelope::new(event.kind).with("value", data[2].clone()))
        }
        ReportKind::I2cData => {
            let joined = data.iter().map(textual).collect::<Vec<_>>().join(I2C_JOIN);
            Ok(ReportEnvelope::new(event.kind).with("value", joined))
        }
    }
}

fn require_len(event: &DeviceEvent, expected: usize) -> Result<(), GatewayError> {
    if event.data.len() < expected {
        return Err(GatewayError::MalformedReportData {
            kind: event.kind.to_string(),
            expected,
            actual: event.data.len(),
        });
    }
    Ok(())
}

/// Strings render bare, everything else as its JSON text.
fn textual(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Counters kept by [`ReportTranslator`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TranslatorStats {
    pub translated: u64,
    pub stale: u64,
    pub malformed: u64,
}

/// Stateful front of [`translate`] used by gateway pipelines.
#[derive(Debug, Default)]
pub struct ReportTranslator {
    stats: TranslatorStats,
}

impl ReportTranslator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Translate `event` unless it is stale or malformed.
    ///
    /// An event is stale when its resource was reconfigured after the
    /// callback that produced it was registered. I2C read replies are
    /// request-scoped: while the I2C bus has never been configured there is
    /// no mode for them to be stale against, so they always pass.
    ///
    /// # Errors
    ///
    /// [`GatewayError::StaleEvent`] or [`GatewayError::MalformedReportData`],
    /// both already logged and counted.
    pub fn on_device_event(
        &mut self,
        registry: &ResourceRegistry,
        event: &DeviceEvent,
    ) -> Result<ReportEnvelope, GatewayError> {
        let live = match event.kind {
            ReportKind::I2cData if registry.get_mode(event.resource) == PinMode::Unconfigured => true,
            _ => registry.is_current(event.resource, event.handle),
        };
        if !live {
            self.stats.stale += 1;
            warn!(
                resource = %event.resource,
                kind = %event.kind,
                handle = %event.handle,
                mode = %registry.get_mode(event.resource),
                "dropping stale device event"
            );
            return Err(GatewayError::StaleEvent {
                resource: event.resource.to_string(),
                kind: event.kind.to_string(),
            });
        }

        match translate(event) {
            Ok(report) => {
                self.stats.translated += 1;
                debug!(
                    resource = %event.resource,
                    tag = registry.tag(event.resource).unwrap_or(""),
                    kind = %event.kind,
                    "device event translated"
                );
                Ok(report)
            }
            Err(e) => {
                self.stats.malformed += 1;
                warn!(resource = %event.resource, error = %e, "dropping device event");
                Err(e)
            }
        }
    }

    pub fn stats(&self) -> TranslatorStats {
        self.stats
    }
}
