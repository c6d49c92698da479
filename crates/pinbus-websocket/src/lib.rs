//! `pinbus-websocket` – the WebSocket transport gateway.
//!
//! Bridges one WebSocket client (typically a Node-RED flow) to the bus:
//!
//! 1. **Upstream**: every text frame `{"payload": <any>}` from the client is
//!    re-published verbatim, payload only, on a fixed bus topic
//!    (`to_arduino_gateway` by default).
//!
//! 2. **Downstream**: every bus message on the subscribed topic
//!    (`from_arduino_gateway` by default) is wrapped as `{"payload": <any>}`
//!    and sent to the client as one text frame.
//!
//! Exactly one client is served at a time; a second connection is closed
//! right after the handshake.
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use pinbus_gateway::{GatewayShell, ShellConfig};
//! use pinbus_middleware::EventBus;
//! use pinbus_websocket::{WsConfig, WsGateway};
//!
//! #[tokio::main]
//! async fn main() {
//!     let bus = Arc::new(EventBus::default());
//!     let mut shell = GatewayShell::new("ws-gateway", WsGateway::new(WsConfig::default()), bus, ShellConfig::default());
//!     shell.run().await.expect("ws gateway failed");
//! }
//! ```

pub mod server;

pub use server::{CLIENT_QUEUE_CAPACITY, DEFAULT_PORT, WsConfig, WsGateway, WsStats};
