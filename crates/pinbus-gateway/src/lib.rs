//! `pinbus-gateway` – the protocol gateway engine.
//!
//! Translates between a topic-addressed bus and a device (or a network
//! client, see `pinbus-websocket`).
//!
//! # Modules
//!
//! - [`dispatch`] – [`DispatchTable`][dispatch::DispatchTable]: command name
//!   → handler, and the [`DispatchContext`][dispatch::DispatchContext] every
//!   handler runs against (registry, device, report sender).
//! - [`router`] – [`InboundRouter`][router::InboundRouter]: decodes bus
//!   payloads, dispatches them and classifies failures. A bad message is
//!   logged and dropped; it never stops the gateway.
//! - [`report`] – [`ReportTranslator`][report::ReportTranslator]: device
//!   callbacks → `{report: <kind>, ...}` envelopes, with stale-event
//!   suppression.
//! - [`shell`] – [`GatewayShell`][shell::GatewayShell]: the lifecycle
//!   (`Created → Connecting → Running → Draining → Stopped`), the source
//!   tasks and the single dispatch loop. Pipelines plug in through
//!   [`Pipeline`][shell::Pipeline].
//! - [`arduino`] – [`ArduinoGateway`][arduino::ArduinoGateway]: the
//!   bus ↔ microcontroller pipeline.
//! - [`pin_init`] – [`PinInitializer`][pin_init::PinInitializer]: publishes
//!   a table of `set_mode_*` commands when asked.
//! - [`telemetry`] – [`init_tracing`][telemetry::init_tracing].

pub mod arduino;
pub mod dispatch;
pub mod pin_init;
pub mod report;
pub mod router;
pub mod shell;
pub mod telemetry;

pub use arduino::{ArduinoConfig, ArduinoGateway};
pub use dispatch::{DispatchContext, DispatchTable, Handler, Outcome};
pub use pin_init::{PinInitConfig, PinInitializer, PinSpec, default_pins};
pub use report::{ReportTranslator, TranslatorStats, translate};
pub use router::{InboundRouter, RouterStats};
pub use shell::{
    DEFAULT_DRAIN_GRACE, DEFAULT_QUEUE_CAPACITY, GatewayShell, GatewayState, Inbound, Outbound, Pipeline,
    ShellConfig, ShellSummary, SourceSet, TransportEvent,
};
pub use telemetry::{TracerProviderGuard, init_tracing};
