//! Networked bus: a [`Backplane`] forwarder and the [`RemoteBus`] client.
//!
//! The backplane listens on two ports:
//!
//! | Port | Direction | Traffic |
//! |---|---|---|
//! | publisher port | client → backplane | `{"topic": t, "payload": p}` frames to forward |
//! | subscriber port | backplane → client | forwarded frames, after the client sent `{"subscribe": prefix}` |
//!
//! Frames are whole-message JSON text over WebSocket. Every published frame
//! is relayed to every subscriber connection holding a matching prefix.

use std::net::SocketAddr;

use futures_util::{SinkExt, StreamExt};
use pinbus_types::{BusMessage, GatewayError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::{accept_async, connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use async_trait::async_trait;

use crate::bus::EventBus;
use crate::message_bus::{BusStream, MessageBus};

/// Default port clients publish to.
pub const DEFAULT_PUBLISHER_PORT: u16 = 43124;
/// Default port clients subscribe on.
pub const DEFAULT_SUBSCRIBER_PORT: u16 = 43125;

/// Wire frame exchanged with the backplane.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BackplaneFrame {
    Publish { topic: String, payload: Value },
    Subscribe { subscribe: String },
}

impl BackplaneFrame {
    fn encode(&self) -> Result<String, GatewayError> {
        serde_json::to_string(self).map_err(|e| GatewayError::Serialization(e.to_string()))
    }

    fn decode(text: &str) -> Result<Self, GatewayError> {
        serde_json::from_str(text)
            .map_err(|e| GatewayError::Serialization(format!("backplane frame: {e}")))
    }
}

// ---------------------------------------------------------------------------
// Backplane (server)
// ---------------------------------------------------------------------------

/// The forwarder every remote gateway connects to.
pub struct Backplane {
    publisher: TcpListener,
    subscriber: TcpListener,
    bus: EventBus,
}

impl Backplane {
    /// Bind both listening sockets.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Connection`] if either port cannot be bound.
    pub async fn bind(publisher_addr: SocketAddr, subscriber_addr: SocketAddr) -> Result<Self, GatewayError> {
        let publisher = TcpListener::bind(publisher_addr).await.map_err(|e| {
            GatewayError::Connection(format!("backplane bind error on {publisher_addr}: {e}"))
        })?;
        let subscriber = TcpListener::bind(subscriber_addr).await.map_err(|e| {
            GatewayError::Connection(format!("backplane bind error on {subscriber_addr}: {e}"))
        })?;
        Ok(Self {
            publisher,
            subscriber,
            bus: EventBus::default(),
        })
    }

    pub fn publisher_addr(&self) -> Result<SocketAddr, GatewayError> {
        self.publisher
            .local_addr()
            .map_err(|e| GatewayError::Connection(e.to_string()))
    }

    pub fn subscriber_addr(&self) -> Result<SocketAddr, GatewayError> {
        self.subscriber
            .local_addr()
            .map_err(|e| GatewayError::Connection(e.to_string()))
    }

    /// Forward frames until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) -> Result<(), GatewayError> {
        info!(
            publisher = %self.publisher_addr()?,
            subscriber = %self.subscriber_addr()?,
            "backplane listening"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = self.publisher.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let bus = self.bus.clone();
                        let cancel = cancel.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_publisher(stream, peer, bus, cancel).await {
                                warn!(peer = %peer, error = %e, "publisher connection ended");
                            }
                        });
                    }
                    Err(e) => error!(error = %e, "publisher accept error"),
                },
                accepted = self.subscriber.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let bus = self.bus.clone();
                        let cancel = cancel.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_subscriber(stream, peer, bus, cancel).await {
                                warn!(peer = %peer, error = %e, "subscriber connection ended");
                            }
                        });
                    }
                    Err(e) => error!(error = %e, "subscriber accept error"),
                },
            }
        }

        info!("backplane stopped");
        Ok(())
    }
}

async fn handle_publisher(
    stream: TcpStream,
    peer: SocketAddr,
    bus: EventBus,
    cancel: CancellationToken,
) -> Result<(), GatewayError> {
    let mut ws = accept_async(stream).await.map_err(|e| {
        GatewayError::TransportClosed(format!("publisher handshake from {peer}: {e}"))
    })?;
    debug!(peer = %peer, "publisher connected");

    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = ws.next() => frame,
        };
        match frame {
            Some(Ok(Message::Text(text))) => match BackplaneFrame::decode(text.as_str()) {
                Ok(BackplaneFrame::Publish { topic, payload }) => {
                    bus.publish_to(&topic, payload)?;
                }
                Ok(BackplaneFrame::Subscribe { subscribe }) => {
                    warn!(peer = %peer, topic = %subscribe, "subscribe frame on publisher port ignored");
                }
                Err(e) => warn!(peer = %peer, error = %e, "dropping undecodable frame"),
            },
            Some(Ok(Message::Close(_))) | None => break,
            Some(Err(e)) => return Err(GatewayError::TransportClosed(format!("{peer}: {e}"))),
            _ => {}
        }
    }
    Ok(())
}

async fn handle_subscriber(
    stream: TcpStream,
    peer: SocketAddr,
    bus: EventBus,
    cancel: CancellationToken,
) -> Result<(), GatewayError> {
    let ws = accept_async(stream).await.map_err(|e| {
        GatewayError::TransportClosed(format!("subscriber handshake from {peer}: {e}"))
    })?;
    debug!(peer = %peer, "subscriber connected");

    let (mut ws_tx, mut ws_rx) = ws.split();
    let mut bus_rx = bus.subscribe();
    let mut prefixes: Vec<String> = Vec::new();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            // ── Downstream: forwarded traffic → client ───────────────────────
            result = bus_rx.recv() => match result {
                Ok(message) => {
                    if !prefixes.iter().any(|p| message.topic.starts_with(p.as_str())) {
                        continue;
                    }
                    let frame = BackplaneFrame::Publish {
                        topic: message.topic,
                        payload: message.payload,
                    };
                    if ws_tx.send(Message::Text(frame.encode()?.into())).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(peer = %peer, lagged_by = n, "subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            // ── Upstream: subscription requests ─────────────────────────────
            frame = ws_rx.next() => match frame {
                Some(Ok(Message::Text(text))) => match BackplaneFrame::decode(text.as_str()) {
                    Ok(BackplaneFrame::Subscribe { subscribe }) => {
                        debug!(peer = %peer, topic = %subscribe, "subscription added");
                        prefixes.push(subscribe);
                    }
                    Ok(BackplaneFrame::Publish { topic, .. }) => {
                        warn!(peer = %peer, topic = %topic, "publish frame on subscriber port ignored");
                    }
                    Err(e) => warn!(peer = %peer, error = %e, "dropping undecodable frame"),
                },
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(_)) => break,
                _ => {}
            },
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// RemoteBus (client)
// ---------------------------------------------------------------------------

/// [`MessageBus`] backed by a connection to a [`Backplane`].
///
/// Inbound traffic is re-published on a private [`EventBus`] so that
/// subscriptions behave exactly like in-process ones. When the backplane
/// drops either connection, [`RemoteBus::lost`] fires, every subscription
/// stream ends and further publishes fail.
pub struct RemoteBus {
    publish_tx: mpsc::UnboundedSender<String>,
    control_tx: mpsc::UnboundedSender<String>,
    local: EventBus,
    lost: CancellationToken,
}

impl RemoteBus {
    /// Connect to the backplane at `address`.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Connection`] when either port refuses the
    /// WebSocket handshake.
    pub async fn connect(address: &str, publisher_port: u16, subscriber_port: u16) -> Result<Self, GatewayError> {
        let publisher_url = format!("ws://{address}:{publisher_port}");
        let subscriber_url = format!("ws://{address}:{subscriber_port}");

        let (publisher_ws, _) = connect_async(publisher_url.as_str()).await.map_err(|e| {
            GatewayError::Connection(format!("backplane publisher {publisher_url}: {e}"))
        })?;
        let (subscriber_ws, _) = connect_async(subscriber_url.as_str()).await.map_err(|e| {
            GatewayError::Connection(format!("backplane subscriber {subscriber_url}: {e}"))
        })?;
        info!(publisher = %publisher_url, subscriber = %subscriber_url, "connected to backplane");

        let local = EventBus::default();
        let lost = CancellationToken::new();
        let (publish_tx, mut publish_rx) = mpsc::unbounded_channel::<String>();
        let (control_tx, mut control_rx) = mpsc::unbounded_channel::<String>();

        // Publisher connection: outbound frames only; inbound is drained so
        // control frames (ping/close) are still processed.
        let (mut pub_tx, mut pub_rx) = publisher_ws.split();
        let link = lost.clone();
        tokio::spawn(async move {
            while let Some(text) = publish_rx.recv().await {
                if pub_tx.send(Message::Text(text.into())).await.is_err() {
                    error!("backplane publisher connection lost");
                    link.cancel();
                    break;
                }
            }
        });
        let link = lost.clone();
        tokio::spawn(async move {
            while let Some(frame) = pub_rx.next().await {
                if matches!(frame, Ok(Message::Close(_)) | Err(_)) {
                    break;
                }
            }
            error!("backplane publisher connection closed");
            link.cancel();
        });

        // Subscriber connection: control frames out, forwarded traffic in.
        let (mut sub_tx, mut sub_rx) = subscriber_ws.split();
        tokio::spawn(async move {
            while let Some(text) = control_rx.recv().await {
                if sub_tx.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
        });
        let inbound = local.clone();
        let link = lost.clone();
        tokio::spawn(async move {
            while let Some(frame) = sub_rx.next().await {
                match frame {
                    Ok(Message::Text(text)) => match BackplaneFrame::decode(text.as_str()) {
                        Ok(BackplaneFrame::Publish { topic, payload }) => {
                            let _ = inbound.publish(BusMessage::new(topic, payload));
                        }
                        Ok(other) => warn!(frame = ?other, "unexpected frame from backplane"),
                        Err(e) => warn!(error = %e, "dropping undecodable frame"),
                    },
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
            error!("backplane subscriber connection closed");
            link.cancel();
        });

        Ok(Self {
            publish_tx,
            control_tx,
            local,
            lost,
        })
    }

    /// Cancelled once the connection to the backplane is gone.
    pub fn lost(&self) -> CancellationToken {
        self.lost.clone()
    }

    fn ensure_linked(&self) -> Result<(), GatewayError> {
        if self.lost.is_cancelled() {
            return Err(GatewayError::Bus("backplane connection lost".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl MessageBus for RemoteBus {
    async fn subscribe(&self, topic: &str) -> Result<BusStream, GatewayError> {
        self.ensure_linked()?;
        // Register locally first so nothing forwarded after the request is missed.
        let stream = MessageBus::subscribe(&self.local, topic)
            .await?
            .take_until(self.lost.clone().cancelled_owned())
            .boxed();
        let frame = BackplaneFrame::Subscribe {
            subscribe: topic.to_string(),
        };
        self.control_tx
            .send(frame.encode()?)
            .map_err(|_| GatewayError::Bus("backplane subscriber connection closed".to_string()))?;
        Ok(stream)
    }

    async fn publish(&self, topic: &str, payload: Value) -> Result<(), GatewayError> {
        self.ensure_linked()?;
        let frame = BackplaneFrame::Publish {
            topic: topic.to_string(),
            payload,
        };
        self.publish_tx
            .send(frame.encode()?)
            .map_err(|_| GatewayError::Bus("backplane publisher connection closed".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    #[test]
    fn frame_shapes() {
        let publish = BackplaneFrame::decode(r#"{"topic":"pin_init","payload":{"init_pins":0}}"#).unwrap();
        assert_eq!(
            publish,
            BackplaneFrame::Publish {
                topic: "pin_init".to_string(),
                payload: json!({"init_pins": 0}),
            }
        );

        let subscribe = BackplaneFrame::decode(r#"{"subscribe":"from_arduino_gateway"}"#).unwrap();
        assert_eq!(
            subscribe,
            BackplaneFrame::Subscribe {
                subscribe: "from_arduino_gateway".to_string()
            }
        );

        assert!(BackplaneFrame::decode(r#"{"nothing":1}"#).is_err());
    }

    #[tokio::test]
    async fn bind_conflict_is_a_connection_error() {
        let any: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let first = Backplane::bind(any, any).await.unwrap();
        let taken = first.publisher_addr().unwrap();

        let result = Backplane::bind(taken, any).await;
        assert!(matches!(result, Err(GatewayError::Connection(_))));
    }

    #[tokio::test]
    async fn frames_are_forwarded_between_remote_clients() -> Result<(), Box<dyn std::error::Error>> {
        let any: SocketAddr = "127.0.0.1:0".parse()?;
        let backplane = Backplane::bind(any, any).await?;
        let pub_port = backplane.publisher_addr()?.port();
        let sub_port = backplane.subscriber_addr()?.port();
        let cancel = CancellationToken::new();
        tokio::spawn(backplane.run(cancel.clone()));

        let listener = RemoteBus::connect("127.0.0.1", pub_port, sub_port).await?;
        let sender = RemoteBus::connect("127.0.0.1", pub_port, sub_port).await?;
        let mut stream = listener.subscribe("from_arduino").await?;

        // The subscribe request and the publish travel on different
        // connections, so keep publishing until the subscription is live.
        let received = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                sender
                    .publish("from_arduino_gateway", json!({"report": "sonar_data", "value": 42}))
                    .await
                    .unwrap();
                tokio::select! {
                    message = stream.next() => break message,
                    _ = tokio::time::sleep(Duration::from_millis(25)) => continue,
                }
            }
        })
        .await?
        .ok_or("stream ended")?;

        assert_eq!(received.topic, "from_arduino_gateway");
        assert_eq!(received.payload["value"], 42);
        cancel.cancel();
        Ok(())
    }

    #[tokio::test]
    async fn losing_the_backplane_ends_subscriptions() -> Result<(), Box<dyn std::error::Error>> {
        let any: SocketAddr = "127.0.0.1:0".parse()?;
        let backplane = Backplane::bind(any, any).await?;
        let pub_port = backplane.publisher_addr()?.port();
        let sub_port = backplane.subscriber_addr()?.port();
        let cancel = CancellationToken::new();
        let forwarder = tokio::spawn(backplane.run(cancel.clone()));

        let remote = RemoteBus::connect("127.0.0.1", pub_port, sub_port).await?;
        let mut stream = remote.subscribe("to_arduino_gateway").await?;
        let lost = remote.lost();
        assert!(!lost.is_cancelled());

        cancel.cancel();
        forwarder.await??;

        tokio::time::timeout(Duration::from_secs(5), lost.cancelled()).await?;
        assert!(tokio::time::timeout(Duration::from_secs(5), stream.next()).await?.is_none());
        assert!(matches!(
            remote.publish("to_arduino_gateway", json!({"command": "set_mode_i2c"})).await,
            Err(GatewayError::Bus(_))
        ));
        assert!(remote.subscribe("pin_init").await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn connect_to_nothing_fails() {
        // Bind and immediately drop to obtain a port nobody listens on.
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let result = RemoteBus::connect("127.0.0.1", port, port).await;
        assert!(matches!(result, Err(GatewayError::Connection(_))));
    }
}
