//! Inbound Router: bus message → [`DispatchTable`].
//!
//! The router decodes the envelope, dispatches it and classifies whatever
//! goes wrong. Nothing it sees can stop the gateway: every error is logged,
//! counted and the message is dropped. No reply is sent to the publisher.

use pinbus_types::{CommandEnvelope, GatewayError};
use serde_json::Value;
use tracing::{debug, error, warn};

use crate::dispatch::{DispatchContext, DispatchTable, Outcome};

/// Per-router counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouterStats {
    pub dispatched: u64,
    pub unknown: u64,
    pub malformed: u64,
    pub device_failures: u64,
    pub other_failures: u64,
}

impl RouterStats {
    pub fn dropped(&self) -> u64 {
        self.unknown + self.malformed + self.device_failures + self.other_failures
    }
}

pub struct InboundRouter {
    table: DispatchTable,
    stats: RouterStats,
}

impl InboundRouter {
    pub fn new(table: DispatchTable) -> Self {
        Self {
            table,
            stats: RouterStats::default(),
        }
    }

    pub fn table(&self) -> &DispatchTable {
        &self.table
    }

    pub fn stats(&self) -> RouterStats {
        self.stats
    }

    /// Route one message received on `topic`.
    ///
    /// # Errors
    ///
    /// Returns the classified error after it has been logged and counted, so
    /// callers can decide whether they care. None of them is fatal.
    pub async fn route(
        &mut self,
        ctx: &mut DispatchContext,
        topic: &str,
        payload: Value,
    ) -> Result<Outcome, GatewayError> {
        let result = match CommandEnvelope::from_value(payload) {
            Ok(envelope) => {
                debug!(topic = %topic, command = %envelope.command(), "dispatching");
                self.table.dispatch(ctx, &envelope).await
            }
            Err(e) => Err(e),
        };

        match &result {
            Ok(outcome) => {
                self.stats.dispatched += 1;
                debug!(topic = %topic, outcome = ?outcome, "dispatched");
            }
            Err(e) => self.record_failure(topic, e),
        }
        result
    }

    fn record_failure(&mut self, topic: &str, err: &GatewayError) {
        match err {
            GatewayError::UnknownCommand(command) => {
                self.stats.unknown += 1;
                warn!(topic = %topic, command = %command, "unknown command; message dropped");
            }
            e if e.is_malformed_input() => {
                self.stats.malformed += 1;
                warn!(topic = %topic, error = %e, "malformed command; message dropped");
            }
            e if e.is_device_failure() => {
                self.stats.device_failures += 1;
                error!(topic = %topic, error = %e, "device rejected command");
            }
            e => {
                self.stats.other_failures += 1;
                error!(topic = %topic, error = %e, "command failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pinbus_hal::{DeviceAdapter, SimBoard, report_channel};
    use pinbus_types::{PinMode, ResourceId};
    use serde_json::json;

    async fn setup() -> (InboundRouter, DispatchContext, SimBoard) {
        let mut board = SimBoard::default();
        board.open().await.unwrap();
        let (reports, _events) = report_channel();
        let ctx = DispatchContext::new(Box::new(board.clone()), reports);
        (InboundRouter::new(DispatchTable::arduino()), ctx, board)
    }

    #[tokio::test]
    async fn routes_known_command() {
        let (mut router, mut ctx, board) = setup().await;
        let outcome = router
            .route(&mut ctx, "to_arduino_gateway", json!({"command": "set_mode_servo", "pin": 5, "tag": "servo"}))
            .await
            .unwrap();

        assert!(matches!(outcome, Outcome::Configured { mode: PinMode::Servo, .. }));
        assert_eq!(ctx.registry().get_mode(ResourceId::Pin(5)), PinMode::Servo);
        assert_eq!(board.mode(5), PinMode::Servo);
        assert_eq!(router.stats().dispatched, 1);
    }

    #[tokio::test]
    async fn classifies_every_failure() {
        let (mut router, mut ctx, _board) = setup().await;
        let topic = "to_arduino_gateway";

        // unknown
        assert!(router.route(&mut ctx, topic, json!({"command": "explode"})).await.is_err());
        // no command key at all
        assert!(router.route(&mut ctx, topic, json!({"pin": 3})).await.is_err());
        // not an object
        assert!(router.route(&mut ctx, topic, json!([1, 2, 3])).await.is_err());
        // missing field
        assert!(router.route(&mut ctx, topic, json!({"command": "digital_write", "pin": 3})).await.is_err());
        // wrong type
        assert!(router
            .route(&mut ctx, topic, json!({"command": "digital_write", "pin": "three", "value": 1}))
            .await
            .is_err());
        // device refusal (pin never configured)
        assert!(router
            .route(&mut ctx, topic, json!({"command": "digital_write", "pin": 3, "value": 1}))
            .await
            .is_err());

        assert_eq!(
            router.stats(),
            RouterStats {
                dispatched: 0,
                unknown: 1,
                malformed: 4,
                device_failures: 1,
                other_failures: 0,
            }
        );
        assert_eq!(router.stats().dropped(), 6);
        assert!(ctx.registry().is_empty());
    }

    #[tokio::test]
    async fn keeps_serving_after_a_bad_message() {
        let (mut router, mut ctx, board) = setup().await;
        let topic = "to_arduino_gateway";

        let _ = router.route(&mut ctx, topic, json!({"command": "nope"})).await;
        router
            .route(&mut ctx, topic, json!({"command": "set_mode_digital_output", "pin": 10}))
            .await
            .unwrap();
        router
            .route(&mut ctx, topic, json!({"command": "digital_write", "pin": 10, "value": 1}))
            .await
            .unwrap();
        assert_eq!(board.pin_value(10), Some(1));
    }
}
