//! [`WsGateway`] – single-client WebSocket ↔ bus passthrough.
//!
//! Listens on `0.0.0.0:9000` by default. The listener runs as a source of
//! the [`GatewayShell`][pinbus_gateway::GatewayShell]: connection tasks only
//! push [`TransportEvent`]s into the shell's queue, and every bus publish or
//! client send happens in [`Pipeline::process`], one item at a time.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use pinbus_gateway::{DEFAULT_QUEUE_CAPACITY, Inbound, Outbound, Pipeline, SourceSet, TransportEvent};
use pinbus_types::{FROM_ARDUINO_GATEWAY, GatewayError, TO_ARDUINO_GATEWAY, TransportFrame};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Default TCP port for the WebSocket listener.
pub const DEFAULT_PORT: u16 = 9000;

/// Frames buffered for a client before further bus messages are dropped.
pub const CLIENT_QUEUE_CAPACITY: usize = DEFAULT_QUEUE_CAPACITY;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct WsConfig {
    pub bind_address: IpAddr,
    /// `0` picks a free port; see [`WsGateway::bound_addr`].
    pub port: u16,
    /// Bus topic whose messages are forwarded to the client.
    pub subscription: String,
    /// Bus topic client payloads are published on.
    pub publish_topic: String,
}

impl Default for WsConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
            subscription: FROM_ARDUINO_GATEWAY.to_string(),
            publish_topic: TO_ARDUINO_GATEWAY.to_string(),
        }
    }
}

/// Frame counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WsStats {
    /// Client frames published on the bus.
    pub upstream: u64,
    /// Bus messages sent to the client.
    pub downstream: u64,
    /// Client frames that did not decode to `{"payload": ...}`.
    pub malformed: u64,
    /// Bus messages that arrived with no client connected, or while the
    /// client's queue was full.
    pub undeliverable: u64,
}

// ---------------------------------------------------------------------------
// WsGateway
// ---------------------------------------------------------------------------

struct ActiveClient {
    peer: SocketAddr,
    sender: mpsc::Sender<String>,
}

pub struct WsGateway {
    config: WsConfig,
    client: Option<ActiveClient>,
    stats: WsStats,
    bound_tx: watch::Sender<Option<SocketAddr>>,
}

impl WsGateway {
    pub fn new(config: WsConfig) -> Self {
        let (bound_tx, _) = watch::channel(None);
        Self {
            config,
            client: None,
            stats: WsStats::default(),
            bound_tx,
        }
    }

    pub fn config(&self) -> &WsConfig {
        &self.config
    }

    /// Resolves to the listening address once the shell has connected.
    pub fn bound_addr(&self) -> watch::Receiver<Option<SocketAddr>> {
        self.bound_tx.subscribe()
    }

    /// Peer address of the connected client, if any.
    pub fn client(&self) -> Option<SocketAddr> {
        self.client.as_ref().map(|c| c.peer)
    }

    pub fn stats(&self) -> WsStats {
        self.stats
    }

    fn send_downstream(&mut self, payload: serde_json::Value) -> Result<(), GatewayError> {
        let Some(client) = &self.client else {
            self.stats.undeliverable += 1;
            debug!("no websocket client; bus message dropped");
            return Err(GatewayError::TransportClosed("no client connected".into()));
        };

        // A slow client loses messages; the dispatch loop never waits on it.
        let text = TransportFrame::new(payload).encode()?;
        match client.sender.try_send(text) {
            Ok(()) => {
                self.stats.downstream += 1;
                Ok(())
            }
            Err(TrySendError::Full(_)) => {
                self.stats.undeliverable += 1;
                let err = GatewayError::QueueFull {
                    queue: format!("websocket client {}", client.peer),
                    capacity: client.sender.max_capacity(),
                };
                warn!(error = %err, "client is not keeping up");
                Err(err)
            }
            Err(TrySendError::Closed(_)) => {
                let peer = client.peer;
                self.client = None;
                self.stats.undeliverable += 1;
                Err(GatewayError::TransportClosed(peer.to_string()))
            }
        }
    }

    async fn publish_upstream(&mut self, peer: SocketAddr, text: &str, out: &Outbound) -> Result<(), GatewayError> {
        if self.client() != Some(peer) {
            debug!(peer = %peer, "frame from an inactive connection ignored");
            return Ok(());
        }
        let frame = match TransportFrame::decode(text) {
            Ok(frame) => frame,
            Err(e) => {
                self.stats.malformed += 1;
                warn!(peer = %peer, error = %e, "malformed websocket frame dropped");
                return Err(e);
            }
        };
        debug!(peer = %peer, topic = %self.config.publish_topic, payload = %frame.payload, "client → bus");
        out.publish(&self.config.publish_topic, frame.payload).await?;
        self.stats.upstream += 1;
        Ok(())
    }
}

#[async_trait]
impl Pipeline for WsGateway {
    async fn connect(&mut self, sources: &mut SourceSet) -> Result<(), GatewayError> {
        let addr = SocketAddr::new(self.config.bind_address, self.config.port);
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| GatewayError::Connection(format!("websocket bind error on {addr}: {e}")))?;
        let local = listener
            .local_addr()
            .map_err(|e| GatewayError::Connection(format!("websocket listener address: {e}")))?;
        info!(addr = %local, "websocket listener bound");
        self.bound_tx.send_replace(Some(local));

        sources.subscribe(&self.config.subscription).await?;
        sources.spawn("ws-listener", move |tx, cancel| listen(listener, tx, cancel));
        Ok(())
    }

    async fn process(&mut self, item: Inbound, out: &Outbound) -> Result<(), GatewayError> {
        match item {
            Inbound::Bus(message) => self.send_downstream(message.payload),
            Inbound::Transport(TransportEvent::Connected { peer, sender }) => {
                info!(peer = %peer, "websocket client connected");
                self.client = Some(ActiveClient { peer, sender });
                Ok(())
            }
            Inbound::Transport(TransportEvent::Frame { peer, text }) => self.publish_upstream(peer, &text, out).await,
            Inbound::Transport(TransportEvent::Disconnected { peer }) => {
                if self.client() == Some(peer) {
                    self.client = None;
                    info!(peer = %peer, "websocket client disconnected");
                }
                Ok(())
            }
            Inbound::Device(_) => Ok(()),
        }
    }

    async fn close(&mut self) -> Result<(), GatewayError> {
        // Dropping the sender ends the connection task's outbound side.
        if let Some(client) = self.client.take() {
            debug!(peer = %client.peer, "releasing websocket client");
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Listener source
// ---------------------------------------------------------------------------

async fn listen(
    listener: TcpListener,
    tx: mpsc::Sender<Inbound>,
    cancel: CancellationToken,
) -> Result<(), GatewayError> {
    let busy = Arc::new(AtomicBool::new(false));
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    if busy.swap(true, Ordering::SeqCst) {
                        connections.spawn(reject(stream, peer));
                        continue;
                    }
                    connections.spawn(serve_client(stream, peer, tx.clone(), cancel.clone(), busy.clone()));
                }
                Err(e) => warn!(error = %e, "websocket accept error"),
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }

    while connections.join_next().await.is_some() {}
    Ok(())
}

/// Close a surplus connection right after the handshake.
async fn reject(stream: TcpStream, peer: SocketAddr) {
    warn!(peer = %peer, "websocket client rejected: another client is connected");
    if let Ok(mut ws) = accept_async(stream).await {
        let _ = ws.send(Message::Close(None)).await;
    }
}

async fn serve_client(
    stream: TcpStream,
    peer: SocketAddr,
    tx: mpsc::Sender<Inbound>,
    cancel: CancellationToken,
    busy: Arc<AtomicBool>,
) {
    let ws = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!(peer = %peer, error = %e, "websocket handshake failed");
            busy.store(false, Ordering::SeqCst);
            return;
        }
    };
    let (mut ws_tx, mut ws_rx) = ws.split();
    let (out_tx, mut out_rx) = mpsc::channel::<String>(CLIENT_QUEUE_CAPACITY);

    let connected = Inbound::Transport(TransportEvent::Connected { peer, sender: out_tx });
    if tx.send(connected).await.is_ok() {
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    let _ = ws_tx.send(Message::Close(None)).await;
                    break;
                }
                // ── Downstream: pipeline → client ──────────────────────────
                Some(text) = out_rx.recv() => {
                    if ws_tx.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                // ── Upstream: client → pipeline ────────────────────────────
                msg = ws_rx.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        let frame = Inbound::Transport(TransportEvent::Frame { peer, text: text.to_string() });
                        if tx.send(frame).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        debug!(peer = %peer, error = %e, "websocket read error");
                        break;
                    }
                    Some(Ok(_)) => {}
                },
            }
        }
    }

    // Announce the disconnect before freeing the slot so the next client's
    // `Connected` is always queued after it.
    let gone = Inbound::Transport(TransportEvent::Disconnected { peer });
    if cancel.is_cancelled() {
        let _ = tx.try_send(gone);
    } else {
        let _ = tx.send(gone).await;
    }
    busy.store(false, Ordering::SeqCst);
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use pinbus_gateway::{GatewayShell, ShellConfig, ShellSummary};
    use pinbus_middleware::EventBus;
    use serde_json::json;
    use std::time::Duration;
    use tokio::task::JoinHandle;
    use tokio_tungstenite::connect_async;

    fn local_config() -> WsConfig {
        WsConfig {
            bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 0,
            ..WsConfig::default()
        }
    }

    type Running = (JoinHandle<Result<ShellSummary, GatewayError>>, CancellationToken, SocketAddr);

    async fn start(bus: &EventBus) -> Running {
        let gateway = WsGateway::new(local_config());
        let mut bound = gateway.bound_addr();
        let mut shell = GatewayShell::new("ws-gateway", gateway, Arc::new(bus.clone()), ShellConfig::default());
        let cancel = shell.cancel_token();
        let handle = tokio::spawn(async move { shell.run().await });
        let addr = loop {
            if let Some(addr) = *bound.borrow_and_update() {
                break addr;
            }
            bound.changed().await.unwrap();
        };
        (handle, cancel, addr)
    }

    #[test]
    fn default_port_is_9000() {
        let config = WsConfig::default();
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.subscription, "from_arduino_gateway");
        assert_eq!(config.publish_topic, "to_arduino_gateway");
    }

    #[tokio::test]
    async fn frames_pass_through_both_ways() {
        let bus = EventBus::default();
        let mut commands = bus.subscribe_topic(TO_ARDUINO_GATEWAY);
        let (handle, cancel, addr) = start(&bus).await;

        let (mut client, _) = connect_async(format!("ws://{addr}")).await.unwrap();
        client
            .send(Message::Text(
                r#"{"payload":{"command":"digital_write","pin":9,"value":0}}"#.into(),
            ))
            .await
            .unwrap();

        // Upstream: inner payload, verbatim.
        let published = commands.recv().await.unwrap();
        assert_eq!(published.payload, json!({"command": "digital_write", "pin": 9, "value": 0}));

        // Downstream: wrapped as {payload}.
        bus.publish_to(FROM_ARDUINO_GATEWAY, json!({"report": "analog_input", "pin": 2, "value": 3}))
            .unwrap();
        let received = loop {
            match client.next().await.unwrap().unwrap() {
                Message::Text(text) => break serde_json::from_str::<serde_json::Value>(text.as_str()).unwrap(),
                _ => continue,
            }
        };
        assert_eq!(received, json!({"payload": {"report": "analog_input", "pin": 2, "value": 3}}));

        cancel.cancel();
        let summary = handle.await.unwrap().unwrap();
        assert_eq!(summary.exit_code, 0);
    }

    #[tokio::test]
    async fn second_client_is_turned_away() {
        let bus = EventBus::default();
        let mut commands = bus.subscribe_topic(TO_ARDUINO_GATEWAY);
        let (handle, cancel, addr) = start(&bus).await;

        let (mut first, _) = connect_async(format!("ws://{addr}")).await.unwrap();
        first.send(Message::Text(r#"{"payload":1}"#.into())).await.unwrap();
        assert_eq!(commands.recv().await.unwrap().payload, json!(1));

        let (mut second, _) = connect_async(format!("ws://{addr}")).await.unwrap();
        let closed = tokio::time::timeout(Duration::from_secs(5), second.next()).await.unwrap();
        assert!(matches!(closed, Some(Ok(Message::Close(_))) | None | Some(Err(_))));

        // The first client is unaffected.
        first.send(Message::Text(r#"{"payload":2}"#.into())).await.unwrap();
        assert_eq!(commands.recv().await.unwrap().payload, json!(2));

        cancel.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn malformed_frames_are_dropped_not_fatal() {
        let bus = EventBus::default();
        let mut commands = bus.subscribe_topic(TO_ARDUINO_GATEWAY);
        let (handle, cancel, addr) = start(&bus).await;

        let (mut client, _) = connect_async(format!("ws://{addr}")).await.unwrap();
        client.send(Message::Text("not json".into())).await.unwrap();
        client.send(Message::Text(r#"{"data":1}"#.into())).await.unwrap();
        client.send(Message::Text(r#"{"payload":"ok"}"#.into())).await.unwrap();

        assert_eq!(commands.recv().await.unwrap().payload, json!("ok"));

        cancel.cancel();
        let summary = handle.await.unwrap().unwrap();
        assert_eq!(summary.dropped, 2);
    }

    #[tokio::test]
    async fn occupied_port_is_a_startup_failure() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let config = WsConfig {
            bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: taken.local_addr().unwrap().port(),
            ..WsConfig::default()
        };
        let mut shell = GatewayShell::new(
            "ws-gateway",
            WsGateway::new(config),
            Arc::new(EventBus::default()),
            ShellConfig::default(),
        );

        let err = shell.run().await.unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn bus_messages_without_a_client_are_dropped() {
        let bus = EventBus::default();
        let mut gateway = WsGateway::new(local_config());
        let out = Outbound::new(Arc::new(bus.clone()));

        let message = pinbus_types::BusMessage::new(FROM_ARDUINO_GATEWAY, json!({"report": "i2c_data"}));
        let err = gateway.process(Inbound::Bus(message), &out).await.unwrap_err();
        assert!(matches!(err, GatewayError::TransportClosed(_)));
        assert_eq!(gateway.stats().undeliverable, 1);
    }

    #[tokio::test]
    async fn gateway_outlives_a_client_disconnect() {
        let bus = EventBus::default();
        let mut commands = bus.subscribe_topic(TO_ARDUINO_GATEWAY);
        let (handle, cancel, addr) = start(&bus).await;
        let url = format!("ws://{addr}");

        let (mut first, _) = connect_async(url.as_str()).await.unwrap();
        first.send(Message::Text(r#"{"payload":"first"}"#.into())).await.unwrap();
        assert_eq!(commands.recv().await.unwrap().payload, json!("first"));
        first.close(None).await.unwrap();
        drop(first);

        // The slot frees once the old connection is torn down; until then a
        // newcomer is turned away, so keep knocking.
        let mut second = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let (mut ws, _) = connect_async(url.as_str()).await.unwrap();
                let _ = ws.send(Message::Text(r#"{"payload":"second"}"#.into())).await;
                match tokio::time::timeout(Duration::from_millis(200), commands.recv()).await {
                    Ok(Some(message)) => {
                        assert_eq!(message.payload, json!("second"));
                        break ws;
                    }
                    _ => tokio::time::sleep(Duration::from_millis(20)).await,
                }
            }
        })
        .await
        .expect("second client accepted");

        bus.publish_to(FROM_ARDUINO_GATEWAY, json!({"report": "digital_input", "pin": 7, "value": 1}))
            .unwrap();
        let received = loop {
            match second.next().await.unwrap().unwrap() {
                Message::Text(text) => break serde_json::from_str::<serde_json::Value>(text.as_str()).unwrap(),
                _ => continue,
            }
        };
        assert_eq!(received, json!({"payload": {"report": "digital_input", "pin": 7, "value": 1}}));
        assert!(!handle.is_finished());

        cancel.cancel();
        let summary = handle.await.unwrap().unwrap();
        assert_eq!(summary.exit_code, 0);
    }

    #[tokio::test]
    async fn slow_client_loses_messages_instead_of_queueing_forever() {
        let bus = EventBus::default();
        let mut gateway = WsGateway::new(local_config());
        let out = Outbound::new(Arc::new(bus.clone()));
        let peer: SocketAddr = "127.0.0.1:40000".parse().unwrap();
        let (sender, mut client_rx) = mpsc::channel(1);

        gateway
            .process(Inbound::Transport(TransportEvent::Connected { peer, sender }), &out)
            .await
            .unwrap();
        let report = || pinbus_types::BusMessage::new(FROM_ARDUINO_GATEWAY, json!({"report": "sonar_data", "value": 9}));

        gateway.process(Inbound::Bus(report()), &out).await.unwrap();
        let err = gateway.process(Inbound::Bus(report()), &out).await.unwrap_err();
        assert!(matches!(err, GatewayError::QueueFull { capacity: 1, .. }));
        assert_eq!(gateway.client(), Some(peer));
        assert_eq!(gateway.stats().downstream, 1);
        assert_eq!(gateway.stats().undeliverable, 1);

        client_rx.recv().await.unwrap();
        gateway.process(Inbound::Bus(report()), &out).await.unwrap();
        assert_eq!(gateway.stats().downstream, 2);
    }
}
