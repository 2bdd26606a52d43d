//! Load config from file and environment.

use serde::Deserialize;
use std::path::PathBuf;
use std::str::FromStr;

/// Talker configuration. File: ~/.config/jsontalkie/config.toml or /etc/jsontalkie/config.toml.
/// Env overrides: TALKIE_NAME, TALKIE_PORT, TALKIE_SOCKET, TALKIE_SERIAL_PATH.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Talker name (default Talker-xx, random).
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default = "default_description")]
    pub description: String,
    /// Transport: udp, serial or dummy.
    #[serde(default)]
    pub socket: SocketKind,
    /// UDP port (default 5005).
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_serial_path")]
    pub serial_path: String,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// Retry window in milliseconds (default 500).
    #[serde(default = "default_max_delay")]
    pub max_delay: u16,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Seconds between canned broadcasts (default 30).
    #[serde(default = "default_announce_secs")]
    pub announce_secs: u64,
    /// env_logger filter used when RUST_LOG is unset (default info).
    #[serde(default)]
    pub log_level: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SocketKind {
    #[default]
    Udp,
    Serial,
    Dummy,
}

impl FromStr for SocketKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "udp" => Ok(SocketKind::Udp),
            "serial" => Ok(SocketKind::Serial),
            "dummy" => Ok(SocketKind::Dummy),
            other => Err(format!("unknown socket {:?}", other)),
        }
    }
}

fn default_name() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("Talker-{}", &id[..2])
}
fn default_description() -> String {
    "A simple Talker!".to_string()
}
fn default_port() -> u16 {
    talkie_core::DEFAULT_PORT
}
fn default_serial_path() -> String {
    "/dev/ttyUSB0".to_string()
}
fn default_baud_rate() -> u32 {
    crate::serial::DEFAULT_BAUD_RATE
}
fn default_max_delay() -> u16 {
    talkie_core::DEFAULT_MAX_DELAY
}
fn default_poll_interval_ms() -> u64 {
    1
}
fn default_announce_secs() -> u64 {
    30
}

impl Default for Config {
    fn default() -> Self {
        Self {
            name: default_name(),
            description: default_description(),
            socket: SocketKind::default(),
            port: default_port(),
            serial_path: default_serial_path(),
            baud_rate: default_baud_rate(),
            max_delay: default_max_delay(),
            poll_interval_ms: default_poll_interval_ms(),
            announce_secs: default_announce_secs(),
            log_level: None,
        }
    }
}

/// Load config: merge default, then config file (if present), then env vars.
/// Also returns what was ignored along the way, for logging once the logger
/// (whose level comes from this config) is up.
pub fn load() -> (Config, Vec<String>) {
    let mut warnings = Vec::new();
    let mut c = load_file(&mut warnings).unwrap_or_default();
    warnings.extend(apply_env(&mut c, |k| std::env::var(k).ok()));
    (c, warnings)
}

fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) -> Vec<String> {
    let mut warnings = Vec::new();
    if let Some(s) = var("TALKIE_NAME") {
        if !s.is_empty() {
            c.name = s;
        }
    }
    if let Some(s) = var("TALKIE_PORT") {
        match s.parse::<u16>() {
            Ok(p) => c.port = p,
            Err(e) => warnings.push(format!("TALKIE_PORT ignored: {}", e)),
        }
    }
    if let Some(s) = var("TALKIE_SOCKET") {
        match s.parse() {
            Ok(kind) => c.socket = kind,
            Err(e) => warnings.push(format!("TALKIE_SOCKET ignored: {}", e)),
        }
    }
    if let Some(s) = var("TALKIE_SERIAL_PATH") {
        c.serial_path = s;
    }
    warnings
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/jsontalkie/config.toml"));
    }
    out.push(PathBuf::from("/etc/jsontalkie/config.toml"));
    out
}

fn load_file(warnings: &mut Vec<String>) -> Option<Config> {
    for p in config_paths() {
        if p.exists() {
            if let Ok(s) = std::fs::read_to_string(&p) {
                match toml::from_str::<Config>(&s) {
                    Ok(c) => return Some(c),
                    Err(e) => warnings.push(format!("ignoring {}: {}", p.display(), e)),
                }
            }
            break;
        }
    }
    None
}
