//! Load config from file and environment.

use std::path::PathBuf;
use std::time::Duration;

use pairlink_core::{FetchSchedule, SessionConfig};
use serde::Deserialize;

/// Daemon configuration. File: ~/.config/pairlink/config.toml or /etc/pairlink/config.toml.
/// Env overrides: PAIRLINK_DISCOVERY_PORT, PAIRLINK_TRANSPORT_PORT, PAIRLINK_DEVICE_NAME,
/// PAIRLINK_POLL_INTERVAL_MS, PAIRLINK_FETCH_INTERVAL_SECS, PAIRLINK_FETCH_WINDOW_SECS.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Discovery UDP port (default 45690).
    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,
    /// Transport TCP port served by `serve` (default 45691).
    #[serde(default = "default_transport_port")]
    pub transport_port: u16,
    /// Name advertised by `serve`.
    #[serde(default = "default_device_name")]
    pub device_name: String,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_read_buffer_size")]
    pub read_buffer_size: usize,
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Consecutive failed transfers before the connection is dropped; 0 disables.
    #[serde(default = "default_io_failure_limit")]
    pub io_failure_limit: u32,
    /// How long one discovery scan listens for beacons.
    #[serde(default = "default_scan_duration_secs")]
    pub scan_duration_secs: u64,
    #[serde(default = "default_fetch_interval_secs")]
    pub fetch_interval_secs: u64,
    #[serde(default = "default_fetch_window_secs")]
    pub fetch_window_secs: u64,
    /// Disconnect a fetch run on its first payload.
    #[serde(default)]
    pub fetch_finish_on_payload: bool,
    /// tracing filter directive; RUST_LOG wins when set.
    #[serde(default)]
    pub log_filter: Option<String>,
}

fn default_discovery_port() -> u16 {
    45690
}
fn default_transport_port() -> u16 {
    45691
}
fn default_device_name() -> String {
    "pairlink".to_owned()
}
fn default_poll_interval_ms() -> u64 {
    100
}
fn default_read_buffer_size() -> usize {
    1024
}
fn default_read_timeout_ms() -> u64 {
    2000
}
fn default_connect_timeout_ms() -> u64 {
    10_000
}
fn default_io_failure_limit() -> u32 {
    3
}
fn default_scan_duration_secs() -> u64 {
    12
}
fn default_fetch_interval_secs() -> u64 {
    60
}
fn default_fetch_window_secs() -> u64 {
    30
}

impl Default for Config {
    fn default() -> Self {
        Self {
            discovery_port: default_discovery_port(),
            transport_port: default_transport_port(),
            device_name: default_device_name(),
            poll_interval_ms: default_poll_interval_ms(),
            read_buffer_size: default_read_buffer_size(),
            read_timeout_ms: default_read_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            io_failure_limit: default_io_failure_limit(),
            scan_duration_secs: default_scan_duration_secs(),
            fetch_interval_secs: default_fetch_interval_secs(),
            fetch_window_secs: default_fetch_window_secs(),
            fetch_finish_on_payload: false,
            log_filter: None,
        }
    }
}

impl Config {
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig::default()
            .with_poll_interval(Duration::from_millis(self.poll_interval_ms))
            .with_read_buffer_size(self.read_buffer_size)
            .with_read_timeout(Duration::from_millis(self.read_timeout_ms))
            .with_connect_timeout(Duration::from_millis(self.connect_timeout_ms))
            .with_io_failure_limit(self.io_failure_limit)
    }

    pub fn fetch_schedule(&self) -> FetchSchedule {
        FetchSchedule {
            interval: Duration::from_secs(self.fetch_interval_secs),
            window: Duration::from_secs(self.fetch_window_secs),
            finish_on_payload: self.fetch_finish_on_payload,
        }
    }

    pub fn scan_duration(&self) -> Duration {
        Duration::from_secs(self.scan_duration_secs)
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_default();
    apply_env(&mut c, |k| std::env::var(k).ok());
    c
}

fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(p) = var("PAIRLINK_DISCOVERY_PORT").and_then(|s| s.parse().ok()) {
        c.discovery_port = p;
    }
    if let Some(p) = var("PAIRLINK_TRANSPORT_PORT").and_then(|s| s.parse().ok()) {
        c.transport_port = p;
    }
    if let Some(name) = var("PAIRLINK_DEVICE_NAME").filter(|s| !s.is_empty()) {
        c.device_name = name;
    }
    if let Some(ms) = var("PAIRLINK_POLL_INTERVAL_MS").and_then(|s| s.parse().ok()) {
        c.poll_interval_ms = ms;
    }
    if let Some(secs) = var("PAIRLINK_FETCH_INTERVAL_SECS").and_then(|s| s.parse().ok()) {
        c.fetch_interval_secs = secs;
    }
    if let Some(secs) = var("PAIRLINK_FETCH_WINDOW_SECS").and_then(|s| s.parse().ok()) {
        c.fetch_window_secs = secs;
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/pairlink/config.toml"));
    }
    out.push(PathBuf::from("/etc/pairlink/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    for p in config_paths() {
        if p.exists() {
            if let Ok(s) = std::fs::read_to_string(&p) {
                if let Ok(c) = toml::from_str::<Config>(&s) {
                    return Some(c);
                }
            }
            break;
        }
    }
    None
}
