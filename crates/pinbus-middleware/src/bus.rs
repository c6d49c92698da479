//! In-process, topic-based publish/subscribe bus.
//!
//! Uses a single [`tokio::sync::broadcast`] channel under the hood so that
//! every subscriber receives every message without any single subscriber
//! blocking the others. Subscribers filter by topic prefix, the same way the
//! networked backplane does.

use pinbus_types::{BusMessage, GatewayError};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Default channel capacity (number of buffered messages before old ones are
/// dropped for slow subscribers).
const DEFAULT_CAPACITY: usize = 256;

/// Shared message bus. Clone it cheaply – all clones share the same
/// underlying broadcast channel.
#[derive(Clone, Debug)]
pub struct EventBus {
    sender: broadcast::Sender<BusMessage>,
}

impl EventBus {
    /// Create a new bus with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish `payload` on `topic`.
    ///
    /// Returns the number of active receivers that were handed the message.
    /// Returns `Ok(0)` when nobody is listening; on a best-effort bus this is
    /// a normal condition, not an error.
    pub fn publish_to(&self, topic: &str, payload: Value) -> Result<usize, GatewayError> {
        self.publish(BusMessage::new(topic, payload))
    }

    /// Publish an already-built [`BusMessage`].
    pub fn publish(&self, message: BusMessage) -> Result<usize, GatewayError> {
        match self.sender.send(message) {
            Ok(n) => Ok(n),
            Err(broadcast::error::SendError(message)) => {
                debug!(topic = %message.topic, "no subscribers; message dropped");
                Ok(0)
            }
        }
    }

    /// Subscribe to every message on the bus, unfiltered.
    pub fn subscribe(&self) -> broadcast::Receiver<BusMessage> {
        self.sender.subscribe()
    }

    /// Number of live subscriptions, filtered or not.
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Subscribe to the messages whose topic starts with `topic`.
    pub fn subscribe_topic(&self, topic: impl Into<String>) -> TopicSubscriber {
        TopicSubscriber {
            topic: topic.into(),
            receiver: self.sender.subscribe(),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

/// A subscriber that only delivers messages whose topic starts with the
/// given prefix.
pub struct TopicSubscriber {
    topic: String,
    receiver: broadcast::Receiver<BusMessage>,
}

impl TopicSubscriber {
    /// Wait for the next message that matches this subscriber's topic filter.
    ///
    /// Returns `None` when the bus is closed and no further messages will
    /// arrive.
    pub async fn recv(&mut self) -> Option<BusMessage> {
        loop {
            match self.receiver.recv().await {
                Ok(message) if message.topic.starts_with(&self.topic) => {
                    return Some(message);
                }
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    // Subscriber fell behind; log and continue.
                    warn!(topic = %self.topic, lagged_by = n, "TopicSubscriber lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }
}
