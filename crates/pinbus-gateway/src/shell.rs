//! Gateway Shell: lifecycle, source loops and the single dispatch loop.
//!
//! ```text
//!  bus subscription ─┐
//!  transport source ─┼─► bounded queue ─► one loop ─► Pipeline::process ─► Outbound (bus)
//!  device callbacks ─┘
//! ```
//!
//! Every source runs as its own task and only pushes [`Inbound`] items into
//! one bounded queue. A single loop pops them and awaits
//! [`Pipeline::process`] to completion before popping the next, so no two
//! dispatch or translation operations ever overlap inside one gateway.
//!
//! # States
//!
//! `Created → Connecting → Running → Draining → Stopped`, plus
//! `Connecting → Stopped` when startup fails. `Stopped` is terminal.
//!
//! # Shutdown
//!
//! Cancelling the shell's [`CancellationToken`] moves it to `Draining`:
//! sources stop, device events already queued are still processed until the
//! queue is empty or the grace period runs out, queued commands are
//! discarded, and [`Pipeline::close`] releases the device or transport.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use pinbus_hal::{DeviceEvent, EventReceiver};
use pinbus_middleware::MessageBus;
use pinbus_types::{BusMessage, GatewayError};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

// ─────────────────────────────────────────────────────────────────────────────
// Constants
// ─────────────────────────────────────────────────────────────────────────────

/// Default inbound queue depth.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Default time allowed for outstanding device callbacks to flush.
pub const DEFAULT_DRAIN_GRACE: Duration = Duration::from_millis(250);

// ─────────────────────────────────────────────────────────────────────────────
// State machine
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayState {
    Created,
    Connecting,
    Running,
    Draining,
    Stopped,
}

impl GatewayState {
    pub fn as_str(&self) -> &'static str {
        match self {
            GatewayState::Created => "created",
            GatewayState::Connecting => "connecting",
            GatewayState::Running => "running",
            GatewayState::Draining => "draining",
            GatewayState::Stopped => "stopped",
        }
    }

    pub fn can_transition_to(self, next: GatewayState) -> bool {
        use GatewayState::*;
        matches!(
            (self, next),
            (Created, Connecting)
                | (Connecting, Running)
                | (Connecting, Stopped)
                | (Running, Draining)
                | (Draining, Stopped)
        )
    }
}

impl fmt::Display for GatewayState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Inbound items
// ─────────────────────────────────────────────────────────────────────────────

/// Something that happened on the transport side.
#[derive(Debug)]
pub enum TransportEvent {
    /// A client connected; `sender` delivers text frames to it.
    Connected {
        peer: SocketAddr,
        sender: mpsc::Sender<String>,
    },
    /// A text frame arrived from the active client.
    Frame { peer: SocketAddr, text: String },
    Disconnected { peer: SocketAddr },
}

/// One item on the inbound queue.
#[derive(Debug)]
pub enum Inbound {
    Bus(BusMessage),
    Transport(TransportEvent),
    Device(DeviceEvent),
}

impl Inbound {
    pub fn source(&self) -> &'static str {
        match self {
            Inbound::Bus(_) => "bus",
            Inbound::Transport(_) => "transport",
            Inbound::Device(_) => "device",
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Outbound channel
// ─────────────────────────────────────────────────────────────────────────────

/// Where pipelines publish envelopes.
#[derive(Clone)]
pub struct Outbound {
    bus: Arc<dyn MessageBus>,
}

impl Outbound {
    pub fn new(bus: Arc<dyn MessageBus>) -> Self {
        Self { bus }
    }

    pub async fn publish(&self, topic: &str, payload: Value) -> Result<(), GatewayError> {
        self.bus.publish(topic, payload).await
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Sources
// ─────────────────────────────────────────────────────────────────────────────

/// Registry of source tasks feeding the inbound queue.
///
/// Handed to [`Pipeline::connect`]; every source stops when the shell's
/// token is cancelled.
pub struct SourceSet {
    tx: mpsc::Sender<Inbound>,
    cancel: CancellationToken,
    bus: Arc<dyn MessageBus>,
    tasks: JoinSet<()>,
}

impl SourceSet {
    fn new(tx: mpsc::Sender<Inbound>, cancel: CancellationToken, bus: Arc<dyn MessageBus>) -> Self {
        Self {
            tx,
            cancel,
            bus,
            tasks: JoinSet::new(),
        }
    }

    /// Subscribe to `topic` and forward every delivery as [`Inbound::Bus`].
    pub async fn subscribe(&mut self, topic: &str) -> Result<(), GatewayError> {
        let mut stream = self.bus.subscribe(topic).await?;
        let tx = self.tx.clone();
        let cancel = self.cancel.clone();
        let topic = topic.to_string();
        info!(topic = %topic, "subscribed");

        self.tasks.spawn(async move {
            loop {
                let message = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    message = stream.next() => match message {
                        Some(message) => message,
                        None => {
                            warn!(topic = %topic, "bus subscription closed");
                            break;
                        }
                    },
                };
                if !forward(&tx, &cancel, Inbound::Bus(message)).await {
                    break;
                }
            }
            debug!(topic = %topic, "bus source stopped");
        });
        Ok(())
    }

    /// Forward device callbacks as [`Inbound::Device`]. On cancellation the
    /// callbacks already delivered are flushed into the queue first.
    pub fn device_events(&mut self, mut events: EventReceiver) {
        let tx = self.tx.clone();
        let cancel = self.cancel.clone();

        self.tasks.spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        while let Ok(event) = events.try_recv() {
                            if tx.try_send(Inbound::Device(event)).is_err() {
                                break;
                            }
                        }
                        break;
                    }
                    event = events.recv() => match event {
                        Some(event) => {
                            if !forward(&tx, &cancel, Inbound::Device(event)).await {
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
            debug!("device source stopped");
        });
    }

    /// Run an arbitrary source (e.g. a transport listener).
    pub fn spawn<F, Fut>(&mut self, name: &'static str, source: F)
    where
        F: FnOnce(mpsc::Sender<Inbound>, CancellationToken) -> Fut,
        Fut: Future<Output = Result<(), GatewayError>> + Send + 'static,
    {
        let fut = source(self.tx.clone(), self.cancel.clone());
        self.tasks.spawn(async move {
            match fut.await {
                Ok(()) => debug!(source = name, "source stopped"),
                Err(e) => error!(source = name, error = %e, "source failed"),
            }
        });
    }

    /// Stop every source and drop the queue's last sender.
    async fn shutdown(mut self, deadline: Instant) {
        drop(self.tx);
        let joined = tokio::time::timeout_at(deadline, async {
            while self.tasks.join_next().await.is_some() {}
        })
        .await;
        if joined.is_err() {
            warn!(remaining = self.tasks.len(), "sources did not stop in time; aborting");
            self.tasks.shutdown().await;
        }
    }
}

/// Push `item` unless cancellation wins first. A device event that loses the
/// race is still offered to the queue so draining can flush it. Returns
/// whether the source should keep going.
async fn forward(tx: &mpsc::Sender<Inbound>, cancel: &CancellationToken, item: Inbound) -> bool {
    tokio::select! {
        biased;
        permit = tx.reserve() => match permit {
            Ok(permit) => {
                permit.send(item);
                true
            }
            Err(_) => false,
        },
        _ = cancel.cancelled() => {
            if matches!(item, Inbound::Device(_)) {
                let _ = tx.try_send(item);
            }
            false
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Pipeline contract
// ─────────────────────────────────────────────────────────────────────────────

/// What a concrete gateway plugs into the shell.
///
/// # Contract
///
/// * `connect` – open the device and/or transport and register sources.
///   An error here is a startup failure and ends the shell.
/// * `started` – called once on entering `Running` (e.g. to prime a
///   companion component).
/// * `process` – handle one inbound item. Errors are already classified and
///   logged by the pipeline; the shell only counts them.
/// * `close` – release the device / transport during shutdown.
#[async_trait]
pub trait Pipeline: Send {
    async fn connect(&mut self, sources: &mut SourceSet) -> Result<(), GatewayError>;

    async fn started(&mut self, _out: &Outbound) -> Result<(), GatewayError> {
        Ok(())
    }

    async fn process(&mut self, item: Inbound, out: &Outbound) -> Result<(), GatewayError>;

    async fn close(&mut self) -> Result<(), GatewayError>;
}

// ─────────────────────────────────────────────────────────────────────────────
// Shell
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ShellConfig {
    pub queue_capacity: usize,
    pub drain_grace: Duration,
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            drain_grace: DEFAULT_DRAIN_GRACE,
        }
    }
}

/// Recorded outcome of one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellSummary {
    pub gateway: String,
    /// Items the pipeline handled successfully.
    pub processed: u64,
    /// Items the pipeline rejected (unknown, malformed, device refusal...).
    pub dropped: u64,
    /// Queued non-device items thrown away while draining.
    pub discarded: u64,
    pub exit_code: i32,
}

pub struct GatewayShell<P> {
    name: String,
    pipeline: P,
    bus: Arc<dyn MessageBus>,
    config: ShellConfig,
    state: GatewayState,
    cancel: CancellationToken,
}

impl<P: Pipeline> GatewayShell<P> {
    pub fn new(name: impl Into<String>, pipeline: P, bus: Arc<dyn MessageBus>, config: ShellConfig) -> Self {
        Self {
            name: name.into(),
            pipeline,
            bus,
            config,
            state: GatewayState::Created,
            cancel: CancellationToken::new(),
        }
    }

    /// Share an externally owned token, e.g. one cancelled by a signal
    /// handler for several shells at once.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn state(&self) -> GatewayState {
        self.state
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pipeline(&self) -> &P {
        &self.pipeline
    }

    fn transition(&mut self, next: GatewayState) -> Result<(), GatewayError> {
        if !self.state.can_transition_to(next) {
            return Err(GatewayError::InvalidTransition {
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        info!(gateway = %self.name, from = %self.state, to = %next, "state transition");
        self.state = next;
        Ok(())
    }

    /// Run the gateway until its token is cancelled.
    ///
    /// # Errors
    ///
    /// [`GatewayError::InvalidTransition`] when the shell already ran, or the
    /// startup error returned by [`Pipeline::connect`].
    pub async fn run(&mut self) -> Result<ShellSummary, GatewayError> {
        self.transition(GatewayState::Connecting)?;

        let (tx, mut rx) = mpsc::channel(self.config.queue_capacity.max(1));
        let mut sources = SourceSet::new(tx, self.cancel.clone(), self.bus.clone());
        let outbound = Outbound::new(self.bus.clone());

        if let Err(e) = self.pipeline.connect(&mut sources).await {
            error!(gateway = %self.name, error = %e, "startup failed");
            sources.shutdown(Instant::now() + self.config.drain_grace).await;
            self.transition(GatewayState::Stopped)?;
            return Err(e);
        }

        self.transition(GatewayState::Running)?;
        if let Err(e) = self.pipeline.started(&outbound).await {
            warn!(gateway = %self.name, error = %e, "start hook failed");
        }

        let mut summary = ShellSummary {
            gateway: self.name.clone(),
            processed: 0,
            dropped: 0,
            discarded: 0,
            exit_code: 0,
        };

        // ── Running: one item at a time ──────────────────────────────────────
        let cancel = self.cancel.clone();
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                item = rx.recv() => match item {
                    Some(item) => self.handle(item, &outbound, &mut summary).await,
                    None => break,
                },
            }
        }

        // ── Draining ─────────────────────────────────────────────────────────
        self.transition(GatewayState::Draining)?;
        let deadline = Instant::now() + self.config.drain_grace;
        sources.shutdown(deadline).await;

        loop {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some(item @ Inbound::Device(_))) => self.handle(item, &outbound, &mut summary).await,
                Ok(Some(item)) => {
                    summary.discarded += 1;
                    debug!(gateway = %self.name, source = item.source(), "discarded while draining");
                }
                Ok(None) => break,
                Err(_) => {
                    warn!(gateway = %self.name, "drain grace period elapsed");
                    break;
                }
            }
        }
        rx.close();
        while let Ok(item) = rx.try_recv() {
            summary.discarded += 1;
            debug!(gateway = %self.name, source = item.source(), "discarded after grace period");
        }

        if let Err(e) = self.pipeline.close().await {
            warn!(gateway = %self.name, error = %e, "close failed");
        }
        self.transition(GatewayState::Stopped)?;
        info!(
            gateway = %self.name,
            processed = summary.processed,
            dropped = summary.dropped,
            discarded = summary.discarded,
            "gateway stopped"
        );
        Ok(summary)
    }

    async fn handle(&mut self, item: Inbound, out: &Outbound, summary: &mut ShellSummary) {
        let source = item.source();
        match self.pipeline.process(item, out).await {
            Ok(()) => summary.processed += 1,
            Err(e) => {
                summary.dropped += 1;
                debug!(gateway = %self.name, source, error = %e, "inbound item dropped");
            }
        }
    }
}
