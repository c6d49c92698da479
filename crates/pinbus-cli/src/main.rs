//! `pinbus` – command line entry point.
//!
//! One binary, one component per process:
//!
//! | Subcommand | Component |
//! |---|---|
//! | `backplane` | message forwarder every other component connects to |
//! | `arduino-gateway` | bus ↔ board gateway (simulated board) |
//! | `ws-gateway` | bus ↔ single WebSocket client passthrough |
//! | `pin-init` | publishes the pin-mode table when asked |
//! | `local` | the three gateways on one in-process bus, no backplane |
//!
//! Ctrl-C / SIGTERM cancels every shell; the process exits 0 after a clean
//! drain and 1 after a fatal startup error.

mod config;

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use pinbus_gateway::{ArduinoGateway, GatewayShell, PinInitializer, Pipeline, ShellSummary, init_tracing};
use pinbus_hal::{SimBoard, SimBoardConfig};
use pinbus_middleware::{Backplane, EventBus, MessageBus, RemoteBus};
use pinbus_types::GatewayError;
use pinbus_websocket::{WsConfig, WsGateway};
use tokio::task::{JoinError, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::Config;

/// Analog sampling period of the simulated board.
const SAMPLE_PERIOD: Duration = Duration::from_millis(500);

// ─────────────────────────────────────────────────────────────────────────────
// Command line
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "pinbus")]
#[command(version, about = "Protocol gateways between a pub/sub bus and Arduino-class boards")]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file [default: ~/.pinbus/config.toml]
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug, Clone, Default)]
struct BusArgs {
    /// Backplane address (bind address for `backplane`)
    #[arg(short = 'b', long = "bus-address")]
    address: Option<String>,

    /// Backplane publisher port
    #[arg(short = 'p', long)]
    publisher_port: Option<u16>,

    /// Backplane subscriber port
    #[arg(short = 's', long)]
    subscriber_port: Option<u16>,

    /// Process name shown in the banner
    #[arg(short = 'n', long = "name")]
    process_name: Option<String>,

    /// Write a log file: `-l`, `-l true` or `-l false`
    #[arg(short = 'l', long, num_args = 0..=1, default_missing_value = "true")]
    log: Option<bool>,
}

#[derive(Args, Debug, Clone, Default)]
struct ComponentArgs {
    #[command(flatten)]
    bus: BusArgs,

    /// Use a private in-process bus instead of the backplane (smoke tests)
    #[arg(long)]
    local: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the backplane forwarder
    Backplane {
        #[command(flatten)]
        bus: BusArgs,
    },

    /// Run the Arduino gateway
    ArduinoGateway {
        #[command(flatten)]
        common: ComponentArgs,

        /// Serial port of the board
        #[arg(short = 'c', long)]
        com_port: Option<String>,

        /// Expected firmware instance id
        #[arg(short = 'i', long)]
        instance_id: Option<u32>,

        /// Command topics to subscribe to
        #[arg(short = 'm', long = "subscribe", num_args = 1..)]
        subscriptions: Vec<String>,

        /// Topic reports are published on
        #[arg(short = 'r', long)]
        report_topic: Option<String>,
    },

    /// Run the WebSocket gateway
    WsGateway {
        #[command(flatten)]
        common: ComponentArgs,

        /// WebSocket listening port
        #[arg(short = 'i', long = "ws-port")]
        port: Option<u16>,

        /// Topic forwarded to the client
        #[arg(short = 'm', long = "subscribe")]
        subscription: Option<String>,
    },

    /// Run the pin initializer
    PinInit {
        #[command(flatten)]
        common: ComponentArgs,

        /// Topic that triggers initialization
        #[arg(short = 'm', long = "subscribe")]
        subscription: Option<String>,
    },

    /// Run all gateways on one in-process bus with a simulated board
    Local {
        /// WebSocket listening port
        #[arg(short = 'i', long = "ws-port")]
        port: Option<u16>,

        /// Serial port the simulated board reports
        #[arg(short = 'c', long)]
        com_port: Option<String>,

        /// Write a log file: `-l`, `-l true` or `-l false`
        #[arg(short = 'l', long, num_args = 0..=1, default_missing_value = "true")]
        log: Option<bool>,
    },
}

// ─────────────────────────────────────────────────────────────────────────────
// Resolved plan
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Component {
    Backplane,
    Arduino,
    WebSocket,
    PinInit,
    Local,
}

impl Component {
    /// Service name for tracing and the log file.
    fn service(self) -> &'static str {
        match self {
            Component::Backplane => "backplane",
            Component::Arduino => "arduino_gateway",
            Component::WebSocket => "ws_gateway",
            Component::PinInit => "pin_init",
            Component::Local => "pinbus_local",
        }
    }
}

/// Config merged with the command line.
#[derive(Debug, Clone)]
struct Plan {
    component: Component,
    process_name: String,
    local: bool,
    cfg: Config,
}

impl Plan {
    fn resolve(command: Command, mut cfg: Config) -> Self {
        let (component, name, local) = match command {
            Command::Backplane { bus } => {
                let name = apply_bus_args(&mut cfg, &bus);
                (Component::Backplane, name.unwrap_or_else(|| "Backplane".to_string()), false)
            }
            Command::ArduinoGateway {
                common,
                com_port,
                instance_id,
                subscriptions,
                report_topic,
            } => {
                let name = apply_bus_args(&mut cfg, &common.bus);
                if com_port.is_some() {
                    cfg.arduino.com_port = com_port;
                }
                if instance_id.is_some() {
                    cfg.arduino.instance_id = instance_id;
                }
                if !subscriptions.is_empty() {
                    cfg.arduino.subscriptions = subscriptions;
                }
                if let Some(topic) = report_topic {
                    cfg.arduino.report_topic = topic;
                }
                let name = name.unwrap_or_else(|| cfg.arduino.process_name.clone());
                (Component::Arduino, name, common.local)
            }
            Command::WsGateway {
                common,
                port,
                subscription,
            } => {
                let name = apply_bus_args(&mut cfg, &common.bus);
                if let Some(port) = port {
                    cfg.websocket.port = port;
                }
                if let Some(topic) = subscription {
                    cfg.websocket.subscription = topic;
                }
                let name = name.unwrap_or_else(|| cfg.websocket.process_name.clone());
                (Component::WebSocket, name, common.local)
            }
            Command::PinInit { common, subscription } => {
                let name = apply_bus_args(&mut cfg, &common.bus);
                if let Some(topic) = subscription {
                    cfg.pin_init.subscription = topic;
                }
                let name = name.unwrap_or_else(|| cfg.pin_init.process_name.clone());
                (Component::PinInit, name, common.local)
            }
            Command::Local { port, com_port, log } => {
                if let Some(port) = port {
                    cfg.websocket.port = port;
                }
                if com_port.is_some() {
                    cfg.arduino.com_port = com_port;
                }
                if let Some(log) = log {
                    cfg.log = log;
                }
                (Component::Local, "pinbus local".to_string(), true)
            }
        };
        Self {
            component,
            process_name: name,
            local,
            cfg,
        }
    }

    fn log_file(&self) -> Option<PathBuf> {
        self.cfg.log.then(|| config::log_path(self.component.service()))
    }
}

/// Fold the shared flags into `cfg`; returns the `-n` override.
fn apply_bus_args(cfg: &mut Config, args: &BusArgs) -> Option<String> {
    if let Some(address) = &args.address {
        cfg.bus.address = address.clone();
    }
    if let Some(port) = args.publisher_port {
        cfg.bus.publisher_port = port;
    }
    if let Some(port) = args.subscriber_port {
        cfg.bus.subscriber_port = port;
    }
    if let Some(log) = args.log {
        cfg.log = log;
    }
    args.process_name.clone()
}

// ─────────────────────────────────────────────────────────────────────────────
// main
// ─────────────────────────────────────────────────────────────────────────────

fn main() -> ExitCode {
    let cli = Cli::parse();

    let cfg = match config::load_or_default(cli.config.as_deref()) {
        Ok(cfg) => cfg,
        Err(e) => {
            println!("{}: {}", "Config error".red(), e);
            println!("  Using default configuration.");
            Config::default()
        }
    };
    let plan = Plan::resolve(cli.command, cfg);

    print_banner(&plan);

    // Tracing first: the OTLP exporter must exist before the runtime does.
    let log_file = plan.log_file();
    let _guard = match init_tracing(plan.component.service(), log_file.as_deref()) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("{}: {}", "Cannot open log file".red(), e);
            return ExitCode::FAILURE;
        }
    };
    if let Some(path) = &log_file {
        println!("  Logging to {}", path.display().to_string().bold());
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("{}: {}", "Cannot start async runtime".red(), e);
            return ExitCode::FAILURE;
        }
    };

    // ── Ctrl-C / SIGTERM ──────────────────────────────────────────────────
    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        println!();
        println!("{}", "⚠  Interrupt received – shutting down …".yellow().bold());
        on_signal.cancel();
    }) {
        warn!(error = %e, "Failed to install Ctrl-C handler; graceful shutdown on Ctrl-C will not be available");
    }

    match runtime.block_on(run(plan, cancel)) {
        Ok(code) => {
            println!("{}", "  ✓ Stopped.".green());
            ExitCode::from(code)
        }
        Err(e) => {
            error!(error = %e, "fatal error");
            eprintln!("{} {}", "✗".red().bold(), e);
            ExitCode::FAILURE
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Components
// ─────────────────────────────────────────────────────────────────────────────

async fn run(plan: Plan, cancel: CancellationToken) -> Result<u8, GatewayError> {
    match plan.component {
        Component::Backplane => run_backplane(&plan.cfg, cancel).await,
        Component::Arduino => {
            let gateway = arduino_gateway(&plan.cfg, cancel.clone());
            run_component(&plan, gateway, cancel).await
        }
        Component::WebSocket => run_component(&plan, ws_gateway(&plan.cfg), cancel).await,
        Component::PinInit => {
            let init = PinInitializer::new(plan.cfg.pin_init.initializer_config())?;
            run_component(&plan, init, cancel).await
        }
        Component::Local => run_local(&plan.cfg, cancel).await,
    }
}

/// Run one gateway on the configured bus. Losing the backplane stops the
/// gateway and is reported as fatal.
async fn run_component<P: Pipeline + 'static>(
    plan: &Plan,
    pipeline: P,
    cancel: CancellationToken,
) -> Result<u8, GatewayError> {
    let (bus, lost) = connect_bus(plan).await?;
    if let Some(lost) = lost.clone() {
        let stop = cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = stop.cancelled() => {}
                _ = lost.cancelled() => {
                    error!("backplane connection lost; shutting down");
                    stop.cancel();
                }
            }
        });
    }

    let summary = GatewayShell::new(plan.process_name.clone(), pipeline, bus, plan.cfg.shell.shell_config())
        .with_cancel(cancel)
        .run()
        .await?;
    if lost.is_some_and(|lost| lost.is_cancelled()) {
        return Err(GatewayError::Connection("backplane connection lost".to_string()));
    }
    Ok(exit_code(&[report(&summary)]))
}

async fn run_backplane(cfg: &Config, cancel: CancellationToken) -> Result<u8, GatewayError> {
    let ip: IpAddr = cfg
        .bus
        .address
        .parse()
        .map_err(|e| GatewayError::Connection(format!("invalid backplane address {}: {e}", cfg.bus.address)))?;
    let backplane = Backplane::bind(
        SocketAddr::new(ip, cfg.bus.publisher_port),
        SocketAddr::new(ip, cfg.bus.subscriber_port),
    )
    .await?;
    println!(
        "  Publisher port {}  Subscriber port {}",
        backplane.publisher_addr()?.to_string().bold(),
        backplane.subscriber_addr()?.to_string().bold()
    );
    backplane.run(cancel).await?;
    Ok(0)
}

/// Everything on one in-process bus. The pin initializer subscribes first so
/// it cannot miss the gateway's priming message. The first component to fail
/// cancels the others.
async fn run_local(cfg: &Config, cancel: CancellationToken) -> Result<u8, GatewayError> {
    let bus = EventBus::default();
    let shared: Arc<dyn MessageBus> = Arc::new(bus.clone());
    let shell_config = cfg.shell.shell_config();
    let mut shells = JoinSet::new();
    let mut codes = Vec::new();
    let mut first_error = None;

    let before = bus.receiver_count();
    let init = PinInitializer::new(cfg.pin_init.initializer_config())?;
    shells.spawn(run_shell(
        GatewayShell::new(cfg.pin_init.process_name.clone(), init, shared.clone(), shell_config.clone())
            .with_cancel(cancel.clone()),
    ));
    let subscribed = async {
        while bus.receiver_count() == before {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    };
    tokio::select! {
        _ = subscribed => {}
        Some(result) = shells.join_next() => {
            settle(result, &cancel, &mut codes, &mut first_error);
            if let Some(e) = first_error.take() {
                return Err(e);
            }
        }
    }

    shells.spawn(run_shell(
        GatewayShell::new(cfg.websocket.process_name.clone(), ws_gateway(cfg), shared.clone(), shell_config.clone())
            .with_cancel(cancel.clone()),
    ));
    shells.spawn(run_shell(
        GatewayShell::new(
            cfg.arduino.process_name.clone(),
            arduino_gateway(cfg, cancel.clone()),
            shared,
            shell_config,
        )
        .with_cancel(cancel.clone()),
    ));
    info!(ws_port = cfg.websocket.port, "local stack running");

    while let Some(result) = shells.join_next().await {
        settle(result, &cancel, &mut codes, &mut first_error);
    }
    match first_error {
        Some(e) => Err(e),
        None => Ok(exit_code(&codes)),
    }
}

/// Record one finished shell. An error cancels every shell still running.
fn settle(
    result: Result<Result<ShellSummary, GatewayError>, JoinError>,
    cancel: &CancellationToken,
    codes: &mut Vec<i32>,
    first_error: &mut Option<GatewayError>,
) {
    match flatten(result) {
        Ok(summary) => codes.push(report(&summary)),
        Err(e) => {
            if !cancel.is_cancelled() {
                error!(error = %e, "local component failed; stopping the others");
                cancel.cancel();
            }
            first_error.get_or_insert(e);
        }
    }
}

async fn run_shell<P: Pipeline + 'static>(mut shell: GatewayShell<P>) -> Result<ShellSummary, GatewayError> {
    shell.run().await
}

fn flatten(result: Result<Result<ShellSummary, GatewayError>, JoinError>) -> Result<ShellSummary, GatewayError> {
    result.map_err(|e| GatewayError::Connection(format!("gateway task failed: {e}")))?
}

/// The bus a component runs on, plus the backplane's loss signal when it is
/// remote.
async fn connect_bus(plan: &Plan) -> Result<(Arc<dyn MessageBus>, Option<CancellationToken>), GatewayError> {
    if plan.local {
        info!("using a private in-process bus");
        return Ok((Arc::new(EventBus::default()), None));
    }
    let bus = &plan.cfg.bus;
    let remote = RemoteBus::connect(&bus.address, bus.publisher_port, bus.subscriber_port).await?;
    let lost = remote.lost();
    Ok((Arc::new(remote), Some(lost)))
}

/// The simulated board samples its analog inputs every [`SAMPLE_PERIOD`]
/// until `cancel` fires.
fn arduino_gateway(cfg: &Config, cancel: CancellationToken) -> ArduinoGateway {
    let board = SimBoard::new(SimBoardConfig {
        digital_pins: cfg.arduino.digital_pins,
        com_port: cfg.arduino.com_port.clone(),
        instance_id: cfg.arduino.instance_id,
        reachable: true,
    });
    let sampler = board.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SAMPLE_PERIOD);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    sampler.tick();
                }
            }
        }
    });
    ArduinoGateway::new(Box::new(board), cfg.arduino.gateway_config())
}

fn ws_gateway(cfg: &Config) -> WsGateway {
    WsGateway::new(WsConfig {
        bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        port: cfg.websocket.port,
        subscription: cfg.websocket.subscription.clone(),
        publish_topic: cfg.websocket.publish_topic.clone(),
    })
}

fn report(summary: &ShellSummary) -> i32 {
    println!(
        "  {} processed {}, dropped {}, discarded {}",
        summary.gateway.bold(),
        summary.processed,
        summary.dropped,
        summary.discarded
    );
    summary.exit_code
}

/// Worst exit code of the given shells.
fn exit_code(codes: &[i32]) -> u8 {
    codes
        .iter()
        .map(|&code| u8::try_from(code).unwrap_or(1))
        .max()
        .unwrap_or(0)
}

// ─────────────────────────────────────────────────────────────────────────────
// Banner
// ─────────────────────────────────────────────────────────────────────────────

fn print_banner(plan: &Plan) {
    println!();
    println!("{}", r#"        _       __              "#.bold().cyan());
    println!("{}", r#"   ___ (_)__   / /  __ _____    "#.bold().cyan());
    println!("{}", r#"  / _ \/ / _ \/ _ \/ // (_-<    "#.bold().cyan());
    println!("{}", r#" / .__/_/_//_/_.__/\_,_/___/    "#.bold().cyan());
    println!("{}", r#"/_/                             "#.bold().cyan());
    println!();
    println!(
        "  {} {}",
        plan.process_name.bold(),
        format!("v{}", env!("CARGO_PKG_VERSION")).dimmed()
    );
    if plan.local {
        println!("  Bus: {}", "in-process".dimmed());
    } else {
        println!(
            "  Backplane: {}  (pub {}, sub {})",
            plan.cfg.bus.address.bold(),
            plan.cfg.bus.publisher_port,
            plan.cfg.bus.subscriber_port
        );
    }
    println!();
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    fn plan(args: &[&str]) -> Plan {
        let cli = Cli::try_parse_from(args).expect("valid command line");
        Plan::resolve(cli.command, Config::default())
    }

    #[test]
    fn command_line_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn arduino_flags_override_config() {
        let plan = plan(&[
            "pinbus",
            "arduino-gateway",
            "-b",
            "10.0.0.5",
            "-p",
            "5000",
            "-c",
            "/dev/ttyUSB0",
            "-i",
            "9",
            "-m",
            "to_board_a",
            "to_board_b",
            "-r",
            "from_board",
            "-n",
            "Board A",
        ]);
        assert_eq!(plan.component, Component::Arduino);
        assert_eq!(plan.process_name, "Board A");
        assert_eq!(plan.cfg.bus.address, "10.0.0.5");
        assert_eq!(plan.cfg.bus.publisher_port, 5000);
        assert_eq!(plan.cfg.bus.subscriber_port, 43125);
        assert_eq!(plan.cfg.arduino.com_port.as_deref(), Some("/dev/ttyUSB0"));
        assert_eq!(plan.cfg.arduino.instance_id, Some(9));
        assert_eq!(plan.cfg.arduino.subscriptions, vec!["to_board_a", "to_board_b"]);
        assert_eq!(plan.cfg.arduino.report_topic, "from_board");
        assert!(!plan.local);
    }

    #[test]
    fn ws_port_flag_and_default_name() {
        let plan = plan(&["pinbus", "ws-gateway", "-i", "9100"]);
        assert_eq!(plan.component, Component::WebSocket);
        assert_eq!(plan.cfg.websocket.port, 9100);
        assert_eq!(plan.process_name, "WebSocket Gateway");
    }

    #[test]
    fn log_switch_forms() {
        assert!(plan(&["pinbus", "pin-init", "-l"]).cfg.log);
        assert!(plan(&["pinbus", "pin-init", "-l", "true"]).cfg.log);
        assert!(!plan(&["pinbus", "pin-init", "-l", "false"]).cfg.log);
        assert!(!plan(&["pinbus", "pin-init"]).cfg.log);
        assert!(plan(&["pinbus", "pin-init"]).log_file().is_none());
        assert!(
            plan(&["pinbus", "pin-init", "-l"])
                .log_file()
                .is_some_and(|p| p.ends_with("pin_init.log"))
        );
    }

    #[test]
    fn local_runs_in_process() {
        let plan = plan(&["pinbus", "local", "-i", "9200"]);
        assert_eq!(plan.component, Component::Local);
        assert!(plan.local);
        assert_eq!(plan.cfg.websocket.port, 9200);
    }

    #[test]
    fn worst_exit_code_wins() {
        assert_eq!(exit_code(&[]), 0);
        assert_eq!(exit_code(&[0, 0]), 0);
        assert_eq!(exit_code(&[0, 1]), 1);
        assert_eq!(exit_code(&[-3]), 1);
    }

    #[tokio::test]
    async fn unreachable_backplane_is_fatal() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        let port = taken.local_addr().expect("addr").port();
        drop(taken);

        let plan = plan(&[
            "pinbus",
            "pin-init",
            "-b",
            "127.0.0.1",
            "-p",
            &port.to_string(),
            "-s",
            &port.to_string(),
        ]);
        let err = run(plan, CancellationToken::new()).await.unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn losing_the_backplane_is_fatal() {
        let any: SocketAddr = "127.0.0.1:0".parse().expect("addr");
        let backplane = Backplane::bind(any, any).await.expect("bind backplane");
        let publisher = backplane.publisher_addr().expect("addr").port().to_string();
        let subscriber = backplane.subscriber_addr().expect("addr").port().to_string();
        let stop_backplane = CancellationToken::new();
        tokio::spawn(backplane.run(stop_backplane.clone()));

        let plan = plan(&["pinbus", "pin-init", "-b", "127.0.0.1", "-p", &publisher, "-s", &subscriber]);
        let component = tokio::spawn(run(plan, CancellationToken::new()));
        tokio::time::sleep(Duration::from_millis(200)).await;
        stop_backplane.cancel();

        let err = tokio::time::timeout(Duration::from_secs(5), component)
            .await
            .expect("component stopped")
            .expect("component task")
            .unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn local_pin_init_round_trip() {
        let cancel = CancellationToken::new();
        let plan = plan(&["pinbus", "pin-init", "--local"]);
        let stopper = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            stopper.cancel();
        });
        assert_eq!(run(plan, cancel).await.expect("clean shutdown"), 0);
    }

    #[tokio::test]
    async fn local_stack_stops_when_a_component_cannot_start() {
        let taken = std::net::TcpListener::bind("0.0.0.0:0").expect("bind");
        let mut cfg = Config::default();
        cfg.websocket.port = taken.local_addr().expect("addr").port();
        let cancel = CancellationToken::new();

        let result = tokio::time::timeout(Duration::from_secs(3), run_local(&cfg, cancel.clone()))
            .await
            .expect("local stack shut down after the failure");

        assert!(result.unwrap_err().is_fatal());
        assert!(cancel.is_cancelled());
    }
}
