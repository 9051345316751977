// MIT License - Copyright (c) 2026 Peter Wright
// Bridge configuration

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::constants::*;
use crate::error::{BridgeError, Result};
use crate::protocol::{MessageClass, ParamType};

/// Top-level configuration, read from a TOML or YAML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    pub transport: TransportConfig,
    pub mqtt: MqttConfig,
    pub protocol: ProtocolConfig,
    #[serde(default)]
    pub mapping: MappingConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    #[serde(default)]
    pub diagnostics: DiagnosticsConfig,
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

/// Where the panel is reached.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TransportConfig {
    /// TCP-serial converter (e.g. ser2net) at `host:port`.
    Tcp { host: String, port: u16 },
    /// Local serial device.
    Serial(SerialConfig),
    /// In-process panel simulator.
    Simulator(SimulatorConfig),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialConfig {
    /// Device path, e.g. `/dev/ttyUSB0`.
    pub port: String,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    #[serde(default = "default_data_bits")]
    pub data_bits: u8,
    #[serde(default)]
    pub parity: Parity,
    #[serde(default = "default_stop_bits")]
    pub stop_bits: u8,
    #[serde(default)]
    pub flow_control: FlowControl,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    #[default]
    None,
    Odd,
    Even,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowControl {
    #[default]
    None,
    /// RTS/CTS
    Hardware,
    /// XON/XOFF
    Software,
}

fn default_baud_rate() -> u32 {
    9600
}
fn default_data_bits() -> u8 {
    8
}
fn default_stop_bits() -> u8 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulatorConfig {
    /// Code the simulated panel accepts.
    pub pin: String,
    #[serde(default = "default_response_delay")]
    pub response_delay_ms: u64,
    #[serde(default)]
    pub sections: Vec<SimulatedSection>,
    /// Lines the simulated panel emits on its own.
    #[serde(default)]
    pub periodic: Vec<PeriodicLine>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulatedSection {
    pub code: u32,
    #[serde(default)]
    pub armed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeriodicLine {
    pub every_secs: u64,
    pub line: String,
}

fn default_response_delay() -> u64 {
    500
}

// ---------------------------------------------------------------------------
// MQTT
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    /// Broker URL, `mqtt://host:port`.
    pub url: String,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default, skip_serializing)]
    pub password: Option<String>,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
}

fn default_client_id() -> String {
    "ja2mqtt".to_string()
}
fn default_keep_alive() -> u64 {
    30
}

// ---------------------------------------------------------------------------
// Protocol catalog
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolConfig {
    #[serde(default)]
    pub framing: FramingConfig,
    pub messages: Vec<MessageDef>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FramingConfig {
    #[serde(default = "default_terminator")]
    pub terminator: String,
    #[serde(default)]
    pub checksum: ChecksumKind,
    #[serde(default = "default_separator")]
    pub checksum_separator: char,
    #[serde(default = "default_max_frame_len")]
    pub max_frame_len: usize,
}

impl Default for FramingConfig {
    fn default() -> Self {
        Self {
            terminator: default_terminator(),
            checksum: ChecksumKind::None,
            checksum_separator: default_separator(),
            max_frame_len: default_max_frame_len(),
        }
    }
}

fn default_terminator() -> String {
    DEFAULT_TERMINATOR.to_string()
}
fn default_separator() -> char {
    DEFAULT_CHECKSUM_SEPARATOR
}
fn default_max_frame_len() -> usize {
    DEFAULT_MAX_FRAME_LEN
}

/// Checksum appended to each frame body.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumKind {
    #[default]
    None,
    /// XOR of all body bytes, two hex digits.
    Xor8,
    /// CRC-16 (reflected 0x8005, init 0xFFFF) of the body, four hex digits.
    Crc16,
}

/// One message kind of the panel protocol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageDef {
    pub kind: String,
    pub class: MessageClass,
    /// Wire layout, e.g. `"ZONE {zone} {open}"`.
    pub format: String,
    #[serde(default)]
    pub params: BTreeMap<String, ParamType>,
    /// For commands: kinds that complete the request.
    #[serde(default)]
    pub responses: Vec<String>,
}

// ---------------------------------------------------------------------------
// Mapping rules
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MappingConfig {
    /// Constants available to every template (installation topology, PIN...).
    #[serde(default)]
    pub vars: BTreeMap<String, String>,
    /// Panel → MQTT rules.
    #[serde(default)]
    pub inbound: Vec<InboundRuleDef>,
    /// MQTT → panel rules.
    #[serde(default)]
    pub outbound: Vec<OutboundRuleDef>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundRuleDef {
    #[serde(default)]
    pub name: Option<String>,
    /// Regular expression matched against the whole message kind.
    pub kind: String,
    #[serde(default)]
    pub when: BTreeMap<String, String>,
    pub topic: String,
    pub payload: PayloadTemplateDef,
    #[serde(default)]
    pub transforms: BTreeMap<String, TransformDef>,
    #[serde(default)]
    pub retain: bool,
    #[serde(default)]
    pub disabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundRuleDef {
    #[serde(default)]
    pub name: Option<String>,
    /// Topic filter; `+` and `#` wildcards are allowed.
    pub topic: String,
    #[serde(default)]
    pub format: PayloadFormat,
    #[serde(default)]
    pub when: BTreeMap<String, String>,
    /// Command kind to send.
    pub kind: String,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
    #[serde(default)]
    pub transforms: BTreeMap<String, TransformDef>,
    #[serde(default)]
    pub reply_topic: Option<String>,
    #[serde(default)]
    pub disabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PayloadTemplateDef {
    Text(String),
    Json(serde_json::Value),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadFormat {
    #[default]
    Text,
    Json,
}

/// Value transform applied to one parameter before templating.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransformDef {
    #[serde(default)]
    pub scale: Option<f64>,
    #[serde(default)]
    pub offset: Option<f64>,
    #[serde(default)]
    pub map: BTreeMap<String, String>,
    /// Used when `map` has no entry for the value.
    #[serde(default)]
    pub default: Option<String>,
}

// ---------------------------------------------------------------------------
// Engine, reconnect, diagnostics
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_max_sequence")]
    pub max_sequence: u32,
    #[serde(default = "default_degraded_after")]
    pub degraded_after: u32,
    #[serde(default = "default_recover_after")]
    pub recover_after: u32,
    /// Reset the link after this many consecutive frame errors.
    #[serde(default)]
    pub reconnect_after_frame_errors: Option<u32>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: default_request_timeout(),
            queue_capacity: default_queue_capacity(),
            max_sequence: default_max_sequence(),
            degraded_after: default_degraded_after(),
            recover_after: default_recover_after(),
            reconnect_after_frame_errors: None,
        }
    }
}

impl EngineConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

fn default_request_timeout() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_MS
}
fn default_queue_capacity() -> usize {
    DEFAULT_QUEUE_CAPACITY
}
fn default_max_sequence() -> u32 {
    DEFAULT_MAX_SEQUENCE
}
fn default_degraded_after() -> u32 {
    DEFAULT_DEGRADED_AFTER
}
fn default_recover_after() -> u32 {
    DEFAULT_RECOVER_AFTER
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    #[serde(default = "default_initial_backoff")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_backoff")]
    pub max_delay_ms: u64,
    /// A link that stayed up this long resets the backoff.
    #[serde(default = "default_backoff_reset")]
    pub reset_after_secs: u64,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_write_timeout")]
    pub write_timeout_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_backoff(),
            max_delay_ms: default_max_backoff(),
            reset_after_secs: default_backoff_reset(),
            connect_timeout_ms: default_connect_timeout(),
            write_timeout_ms: default_write_timeout(),
        }
    }
}

fn default_initial_backoff() -> u64 {
    DEFAULT_INITIAL_BACKOFF_MS
}
fn default_max_backoff() -> u64 {
    DEFAULT_MAX_BACKOFF_MS
}
fn default_backoff_reset() -> u64 {
    DEFAULT_BACKOFF_RESET_SECS
}
fn default_connect_timeout() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_MS
}
fn default_write_timeout() -> u64 {
    DEFAULT_WRITE_TIMEOUT_MS
}

/// Topics for bridge-generated diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosticsConfig {
    /// Link state, published retained.
    #[serde(default = "default_status_topic")]
    pub status_topic: String,
    #[serde(default = "default_frame_error_topic")]
    pub frame_error_topic: String,
    #[serde(default = "default_timeout_topic")]
    pub timeout_topic: String,
    /// Payload, resolution and backpressure errors.
    #[serde(default = "default_error_topic")]
    pub error_topic: String,
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        Self {
            status_topic: default_status_topic(),
            frame_error_topic: default_frame_error_topic(),
            timeout_topic: default_timeout_topic(),
            error_topic: default_error_topic(),
        }
    }
}

fn default_status_topic() -> String {
    "ja2mqtt/status".to_string()
}
fn default_frame_error_topic() -> String {
    "ja2mqtt/diag/frame".to_string()
}
fn default_timeout_topic() -> String {
    "ja2mqtt/diag/timeout".to_string()
}
fn default_error_topic() -> String {
    "ja2mqtt/diag/error".to_string()
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

impl BridgeConfig {
    /// Read a configuration file, substituting `${VAR}` references from the
    /// process environment merged with the optional env file.
    pub fn load(path: &Path, env_file: Option<&Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            BridgeError::config(format!("cannot read {}: {e}", path.display()))
        })?;
        let mut env: HashMap<String, String> = std::env::vars().collect();
        if let Some(env_path) = env_file {
            env.extend(read_env_file(env_path)?);
        }
        let text = substitute_env(&text, &env)?;

        let yaml = matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("yaml" | "yml")
        );
        let config = if yaml {
            Self::from_yaml_str(&text)?
        } else {
            Self::from_toml_str(&text)?
        };
        debug!("Configuration loaded from {}", path.display());
        Ok(config)
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(text).map_err(|e| BridgeError::config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let config: Self =
            serde_yaml::from_str(text).map_err(|e| BridgeError::config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Range checks on scalar settings. Rule and catalog consistency is
    /// checked when the catalog and mapping table are compiled.
    pub fn validate(&self) -> Result<()> {
        if self.protocol.framing.terminator.is_empty() {
            return Err(BridgeError::config("protocol.framing.terminator must not be empty"));
        }
        if self.protocol.framing.max_frame_len == 0 {
            return Err(BridgeError::config("protocol.framing.max_frame_len must be positive"));
        }
        if self.engine.queue_capacity == 0 {
            return Err(BridgeError::config("engine.queue_capacity must be positive"));
        }
        if self.engine.request_timeout_ms == 0 {
            return Err(BridgeError::config("engine.request_timeout_ms must be positive"));
        }
        if self.engine.max_sequence == 0 {
            return Err(BridgeError::config("engine.max_sequence must be positive"));
        }
        if self.reconnect.initial_delay_ms == 0
            || self.reconnect.max_delay_ms < self.reconnect.initial_delay_ms
        {
            return Err(BridgeError::config(
                "reconnect delays must satisfy 0 < initial_delay_ms <= max_delay_ms",
            ));
        }
        if let TransportConfig::Serial(serial) = &self.transport {
            if !(5..=8).contains(&serial.data_bits) {
                return Err(BridgeError::config("transport.data_bits must be 5-8"));
            }
            if !(1..=2).contains(&serial.stop_bits) {
                return Err(BridgeError::config("transport.stop_bits must be 1 or 2"));
            }
        }
        parse_mqtt_url(&self.mqtt.url)?;
        Ok(())
    }
}

/// Parse an MQTT URL like "mqtt://host:port" into (host, port).
pub fn parse_mqtt_url(url: &str) -> Result<(String, u16)> {
    let stripped = url
        .strip_prefix("mqtt://")
        .or_else(|| url.strip_prefix("tcp://"))
        .unwrap_or(url);

    let (host, port_str) = stripped
        .rsplit_once(':')
        .ok_or_else(|| BridgeError::config("MQTT URL must be in format mqtt://host:port"))?;

    let port: u16 = port_str
        .parse()
        .map_err(|_| BridgeError::config(format!("invalid MQTT port number: {port_str}")))?;

    if host.is_empty() {
        return Err(BridgeError::config("MQTT URL has no host"));
    }
    Ok((host.to_string(), port))
}

/// Replace every `${NAME}` in `text` with its value from `env`.
pub fn substitute_env(text: &str, env: &HashMap<String, String>) -> Result<String> {
    let pattern =
        Regex::new(r"\$\{([A-Z0-9_]+)\}").map_err(|e| BridgeError::config(e.to_string()))?;
    let mut missing = None;
    let replaced = pattern.replace_all(text, |caps: &regex::Captures<'_>| {
        let name = &caps[1];
        match env.get(name) {
            Some(value) => value.clone(),
            None => {
                missing.get_or_insert_with(|| name.to_string());
                String::new()
            }
        }
    });
    match missing {
        Some(name) => Err(BridgeError::config(format!(
            "environment variable ${{{name}}} is not set"
        ))),
        None => Ok(replaced.into_owned()),
    }
}

/// Read `NAME=value` lines; `#` starts a comment line, quotes are stripped.
pub fn read_env_file(path: &Path) -> Result<HashMap<String, String>> {
    let text = std::fs::read_to_string(path).map_err(|e| {
        BridgeError::config(format!("cannot read env file {}: {e}", path.display()))
    })?;
    parse_env(&text)
}

fn parse_env(text: &str) -> Result<HashMap<String, String>> {
    let mut env = HashMap::new();
    for line in text.lines().map(str::trim) {
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (key, value) = line.split_once('=').unwrap_or((line, ""));
        let key = key.trim();
        if key.is_empty()
            || !key
                .chars()
                .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_')
        {
            return Err(BridgeError::config(format!("invalid variable name '{key}'")));
        }
        let value = value.trim().trim_matches(|c| c == '"' || c == '\'');
        env.insert(key.to_string(), value.to_string());
    }
    Ok(env)
}
