//! Configuration file – reads `~/.pinbus/config.toml`.
//!
//! Every key is optional; a missing file means all defaults. Precedence is
//! defaults < file < `PINBUS_*` environment < command-line flags (the last
//! step happens in `main`).

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use pinbus_gateway::{ArduinoConfig, PinInitConfig, PinSpec, ShellConfig, default_pins};
use pinbus_middleware::backplane::{DEFAULT_PUBLISHER_PORT, DEFAULT_SUBSCRIBER_PORT};
use pinbus_types::{FROM_ARDUINO_GATEWAY, PIN_INIT, TO_ARDUINO_GATEWAY};
use pinbus_websocket::DEFAULT_PORT as DEFAULT_WS_PORT;
use serde::{Deserialize, Serialize};

// ─────────────────────────────────────────────────────────────────────────────
// Sections
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusSection {
    /// Backplane host for clients, bind address for `pinbus backplane`.
    pub address: String,
    pub publisher_port: u16,
    pub subscriber_port: u16,
}

impl Default for BusSection {
    fn default() -> Self {
        Self {
            address: "127.0.0.1".to_string(),
            publisher_port: DEFAULT_PUBLISHER_PORT,
            subscriber_port: DEFAULT_SUBSCRIBER_PORT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArduinoSection {
    pub process_name: String,
    pub subscriptions: Vec<String>,
    pub report_topic: String,
    pub prime_pin_init: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub com_port: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<u32>,
    pub digital_pins: u8,
}

impl Default for ArduinoSection {
    fn default() -> Self {
        Self {
            process_name: "Arduino Gateway".to_string(),
            subscriptions: vec![TO_ARDUINO_GATEWAY.to_string()],
            report_topic: FROM_ARDUINO_GATEWAY.to_string(),
            prime_pin_init: true,
            com_port: None,
            instance_id: None,
            digital_pins: 100,
        }
    }
}

impl ArduinoSection {
    pub fn gateway_config(&self) -> ArduinoConfig {
        ArduinoConfig {
            subscriptions: self.subscriptions.clone(),
            report_topic: self.report_topic.clone(),
            prime_pin_init: self.prime_pin_init,
            ..ArduinoConfig::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WebSocketSection {
    pub process_name: String,
    pub port: u16,
    pub subscription: String,
    pub publish_topic: String,
}

impl Default for WebSocketSection {
    fn default() -> Self {
        Self {
            process_name: "WebSocket Gateway".to_string(),
            port: DEFAULT_WS_PORT,
            subscription: FROM_ARDUINO_GATEWAY.to_string(),
            publish_topic: TO_ARDUINO_GATEWAY.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PinInitSection {
    pub process_name: String,
    pub subscription: String,
    pub publish_topic: String,
    pub pins: Vec<PinSpec>,
}

impl Default for PinInitSection {
    fn default() -> Self {
        Self {
            process_name: "Pin Initializer".to_string(),
            subscription: PIN_INIT.to_string(),
            publish_topic: TO_ARDUINO_GATEWAY.to_string(),
            pins: default_pins(),
        }
    }
}

impl PinInitSection {
    pub fn initializer_config(&self) -> PinInitConfig {
        PinInitConfig {
            subscription: self.subscription.clone(),
            publish_topic: self.publish_topic.clone(),
            pins: self.pins.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShellSection {
    pub drain_grace_ms: u64,
    pub queue_capacity: usize,
}

impl Default for ShellSection {
    fn default() -> Self {
        let defaults = ShellConfig::default();
        Self {
            drain_grace_ms: defaults.drain_grace.as_millis() as u64,
            queue_capacity: defaults.queue_capacity,
        }
    }
}

impl ShellSection {
    pub fn shell_config(&self) -> ShellConfig {
        ShellConfig {
            queue_capacity: self.queue_capacity,
            drain_grace: Duration::from_millis(self.drain_grace_ms),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Config
// ─────────────────────────────────────────────────────────────────────────────

/// Persisted user configuration stored in `~/.pinbus/config.toml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Write a log file under `~/.pinbus/logs/`.
    pub log: bool,
    pub bus: BusSection,
    pub arduino: ArduinoSection,
    pub websocket: WebSocketSection,
    pub pin_init: PinInitSection,
    pub shell: ShellSection,
}

fn home_dir() -> String {
    std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .unwrap_or_else(|_| ".".to_string())
}

/// Return the path to `~/.pinbus/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(&home_dir())
}

/// Build the config path relative to the given home directory.
pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".pinbus").join("config.toml")
}

/// Where a component's log file goes when logging is on.
pub fn log_path(component: &str) -> PathBuf {
    PathBuf::from(home_dir())
        .join(".pinbus")
        .join("logs")
        .join(format!("{component}.log"))
}

/// Load the config from a specific path. Returns `None` if the file does
/// not exist.
pub fn load_from(path: &Path) -> Result<Option<Config>, String> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read config at {}: {}", path.display(), e))?;
    let cfg: Config = toml::from_str(&raw).map_err(|e| format!("Failed to parse config: {}", e))?;
    Ok(Some(cfg))
}

/// Load `path` (or the default location), falling back to defaults when the
/// file is absent, then apply environment overrides.
pub fn load_or_default(path: Option<&Path>) -> Result<Config, String> {
    let path = path.map(Path::to_path_buf).unwrap_or_else(config_path);
    let mut cfg = load_from(&path)?.unwrap_or_default();
    apply_env_overrides(&mut cfg);
    Ok(cfg)
}

/// Apply `PINBUS_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `PINBUS_BUS_ADDRESS` | `bus.address` |
/// | `PINBUS_PUBLISHER_PORT` | `bus.publisher_port` |
/// | `PINBUS_SUBSCRIBER_PORT` | `bus.subscriber_port` |
/// | `PINBUS_WS_PORT` | `websocket.port` |
/// | `PINBUS_COM_PORT` | `arduino.com_port` |
///
/// Unparseable port numbers are ignored.
pub fn apply_env_overrides(cfg: &mut Config) {
    if let Ok(v) = std::env::var("PINBUS_BUS_ADDRESS") {
        cfg.bus.address = v;
    }
    if let Ok(v) = std::env::var("PINBUS_PUBLISHER_PORT")
        && let Ok(port) = v.parse::<u16>()
    {
        cfg.bus.publisher_port = port;
    }
    if let Ok(v) = std::env::var("PINBUS_SUBSCRIBER_PORT")
        && let Ok(port) = v.parse::<u16>()
    {
        cfg.bus.subscriber_port = port;
    }
    if let Ok(v) = std::env::var("PINBUS_WS_PORT")
        && let Ok(port) = v.parse::<u16>()
    {
        cfg.websocket.port = port;
    }
    if let Ok(v) = std::env::var("PINBUS_COM_PORT") {
        cfg.arduino.com_port = Some(v);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pinbus_types::PinMode;

    #[test]
    fn defaults_match_the_original_deployment() {
        let cfg = Config::default();
        assert!(!cfg.log);
        assert_eq!(cfg.bus.publisher_port, 43124);
        assert_eq!(cfg.bus.subscriber_port, 43125);
        assert_eq!(cfg.websocket.port, 9000);
        assert_eq!(cfg.arduino.subscriptions, vec!["to_arduino_gateway".to_string()]);
        assert_eq!(cfg.arduino.report_topic, "from_arduino_gateway");
        assert_eq!(cfg.pin_init.pins.len(), 6);
        assert_eq!(cfg.shell.shell_config().drain_grace, Duration::from_millis(250));
    }

    #[test]
    fn config_path_points_to_pinbus_dir() {
        let p = config_path_for_home("/home/testuser");
        assert!(p.to_string_lossy().contains(".pinbus"));
        assert!(p.to_string_lossy().ends_with("config.toml"));
    }

    #[test]
    fn load_from_returns_none_when_missing() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());
        assert!(load_from(&path).expect("no error").is_none());
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            r#"
log = true

[websocket]
port = 9100

[[pin_init.pins]]
mode = "digital_input"
pin = 12
tag = "button"
"#,
        )
        .expect("write");

        let cfg = load_from(&path).expect("load ok").expect("some");
        assert!(cfg.log);
        assert_eq!(cfg.websocket.port, 9100);
        assert_eq!(cfg.websocket.subscription, "from_arduino_gateway");
        assert_eq!(cfg.pin_init.pins, vec![PinSpec::new(PinMode::DigitalInput, 12, "button")]);
        assert_eq!(cfg.shell.queue_capacity, 1024);
    }

    #[test]
    fn roundtrip_default_config() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("config.toml");
        let raw = toml::to_string_pretty(&Config::default()).expect("serialize");
        fs::write(&path, raw).expect("write");

        let loaded = load_from(&path).expect("load ok").expect("some");
        assert_eq!(loaded.arduino, ArduinoSection::default());
        assert_eq!(loaded.pin_init, PinInitSection::default());
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("config.toml");
        fs::write(&path, "[bus]\npublisher_port = \"many\"\n").expect("write");
        assert!(load_from(&path).is_err());
    }

    // Env-var tests touch disjoint variables so they can run in parallel.

    #[test]
    fn apply_env_overrides_changes_bus_address() {
        // SAFETY: no other test reads this env-var.
        unsafe { std::env::set_var("PINBUS_BUS_ADDRESS", "192.168.2.10") };
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.bus.address, "192.168.2.10");
        unsafe { std::env::remove_var("PINBUS_BUS_ADDRESS") };
    }

    #[test]
    fn apply_env_overrides_changes_ws_port() {
        // SAFETY: no other test reads this env-var.
        unsafe { std::env::set_var("PINBUS_WS_PORT", "9999") };
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.websocket.port, 9999);
        unsafe { std::env::remove_var("PINBUS_WS_PORT") };
    }

    #[test]
    fn apply_env_overrides_ignores_invalid_port() {
        // SAFETY: no other test reads this env-var.
        unsafe { std::env::set_var("PINBUS_SUBSCRIBER_PORT", "not-a-port") };
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.bus.subscriber_port, DEFAULT_SUBSCRIBER_PORT);
        unsafe { std::env::remove_var("PINBUS_SUBSCRIBER_PORT") };
    }

    #[test]
    fn apply_env_overrides_sets_com_port() {
        // SAFETY: no other test reads this env-var.
        unsafe { std::env::set_var("PINBUS_COM_PORT", "/dev/ttyACM0") };
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.arduino.com_port.as_deref(), Some("/dev/ttyACM0"));
        unsafe { std::env::remove_var("PINBUS_COM_PORT") };
    }
}
