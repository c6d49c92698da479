//! The bus collaborator contract.
//!
//! Gateways never assume which bus they run on. They hold an
//! `Arc<dyn MessageBus>` and only ever `subscribe` to topics and `publish`
//! envelopes:
//!
//! - [`EventBus`] – everything in one process.
//! - [`RemoteBus`][crate::backplane::RemoteBus] – a connection to a
//!   [`Backplane`][crate::backplane::Backplane] forwarder.

use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, StreamExt};
use pinbus_types::{BusMessage, GatewayError};
use serde_json::Value;

use crate::bus::EventBus;

/// Stream of `(topic, envelope)` deliveries for one subscription. Ends when
/// the bus closes.
pub type BusStream = BoxStream<'static, BusMessage>;

/// Every bus implementation must implement this trait.
///
/// # Contract
///
/// * `subscribe` – register interest in every topic starting with `topic`.
///   Messages published after the call returns are delivered in publish
///   order per publisher.
///
/// * `publish` – best-effort, fire-and-forget delivery of `payload` on
///   `topic`. Publishing with nobody subscribed succeeds.
#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn subscribe(&self, topic: &str) -> Result<BusStream, GatewayError>;

    async fn publish(&self, topic: &str, payload: Value) -> Result<(), GatewayError>;
}

#[async_trait]
impl MessageBus for EventBus {
    async fn subscribe(&self, topic: &str) -> Result<BusStream, GatewayError> {
        let subscriber = self.subscribe_topic(topic);
        Ok(stream::unfold(subscriber, |mut sub| async move {
            sub.recv().await.map(|message| (message, sub))
        })
        .boxed())
    }

    async fn publish(&self, topic: &str, payload: Value) -> Result<(), GatewayError> {
        self.publish_to(topic, payload).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    #[tokio::test]
    async fn event_bus_behind_trait_object() {
        let bus: Arc<dyn MessageBus> = Arc::new(EventBus::default());
        let mut stream = bus.subscribe("to_arduino_gateway").await.unwrap();

        bus.publish("to_arduino_gateway", json!({"command": "set_mode_servo", "pin": 5}))
            .await
            .unwrap();

        let message = stream.next().await.expect("one delivery");
        assert_eq!(message.payload["pin"], 5);
    }

    #[tokio::test]
    async fn per_publisher_order_is_preserved() {
        let bus = EventBus::default();
        let mut stream = MessageBus::subscribe(&bus, "seq").await.unwrap();

        for i in 0..10 {
            MessageBus::publish(&bus, "seq", json!({"n": i})).await.unwrap();
        }
        for i in 0..10 {
            let message = stream.next().await.unwrap();
            assert_eq!(message.payload["n"], i);
        }
    }
}
