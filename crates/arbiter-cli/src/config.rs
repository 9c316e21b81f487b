//! Configuration – reads `~/.arbiter/config.toml`.
//!
//! Every field is optional in the file; missing fields take their defaults
//! and a missing file means all defaults.  Environment variables override
//! single fields after the file is read.
//!
//! | Variable | Effect |
//! |---|---|
//! | `ARBITER_CONFIG` | Path of the config file |
//! | `ARBITER_BRIDGE_ADDR` | `bridge_addr` |
//! | `ARBITER_TICK_PERIOD_MS` | `tick_period_ms` |
//! | `ARBITER_HEARTBEAT_TIMEOUT_MS` | `heartbeat_timeout_ms` |

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use arbiter_runtime::SelectorConfig;
use arbiter_types::ArbiterError;
use serde::{Deserialize, Serialize};

/// Persisted operator configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Listen address of the WebSocket command bridge.
    #[serde(default = "default_bridge_addr")]
    pub bridge_addr: String,

    /// Watchdog tick period in milliseconds.
    #[serde(default = "default_tick_period_ms")]
    pub tick_period_ms: u64,

    /// Remote heartbeat timeout in milliseconds.
    #[serde(default = "default_heartbeat_timeout_ms")]
    pub heartbeat_timeout_ms: u64,

    /// Capacity of the selector's inbound queue.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

fn default_bridge_addr() -> String {
    "127.0.0.1:9090".to_string()
}
fn default_tick_period_ms() -> u64 {
    10
}
fn default_heartbeat_timeout_ms() -> u64 {
    1000
}
fn default_queue_capacity() -> usize {
    256
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bridge_addr: default_bridge_addr(),
            tick_period_ms: default_tick_period_ms(),
            heartbeat_timeout_ms: default_heartbeat_timeout_ms(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

impl Config {
    /// Parsed bridge listen address.
    pub fn bridge_socket_addr(&self) -> Result<SocketAddr, ArbiterError> {
        self.bridge_addr
            .parse()
            .map_err(|e| ArbiterError::Config(format!("invalid bridge_addr {:?}: {e}", self.bridge_addr)))
    }

    /// Validate and convert into the selector's start-up parameters.
    pub fn selector_config(&self) -> Result<SelectorConfig, ArbiterError> {
        if self.tick_period_ms == 0 {
            return Err(ArbiterError::Config("tick_period_ms must be positive".into()));
        }
        if self.heartbeat_timeout_ms == 0 {
            return Err(ArbiterError::Config("heartbeat_timeout_ms must be positive".into()));
        }
        if self.queue_capacity == 0 {
            return Err(ArbiterError::Config("queue_capacity must be positive".into()));
        }
        Ok(SelectorConfig {
            tick_period: Duration::from_millis(self.tick_period_ms),
            heartbeat_timeout: Duration::from_millis(self.heartbeat_timeout_ms),
            queue_capacity: self.queue_capacity,
        })
    }
}

/// Path of the config file: `$ARBITER_CONFIG`, else `~/.arbiter/config.toml`.
pub fn config_path() -> PathBuf {
    if let Ok(path) = std::env::var("ARBITER_CONFIG") {
        return PathBuf::from(path);
    }
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".arbiter").join("config.toml")
}

/// Load the config with environment overrides applied.
pub fn load() -> Result<Config, ArbiterError> {
    let mut cfg = load_from(&config_path())?;
    apply_overrides(&mut cfg, |key| std::env::var(key).ok());
    Ok(cfg)
}

/// Read `path`, or defaults when it does not exist.
pub(crate) fn load_from(path: &Path) -> Result<Config, ArbiterError> {
    if !path.exists() {
        return Ok(Config::default());
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| ArbiterError::Config(format!("failed to read {}: {e}", path.display())))?;
    toml::from_str(&raw)
        .map_err(|e| ArbiterError::Config(format!("failed to parse {}: {e}", path.display())))
}

/// Apply `ARBITER_*` overrides.  `lookup` returns the variable's value, if set.
/// Unparseable numbers are ignored.
pub(crate) fn apply_overrides(cfg: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(v) = lookup("ARBITER_BRIDGE_ADDR") {
        cfg.bridge_addr = v;
    }
    if let Some(v) = lookup("ARBITER_TICK_PERIOD_MS")
        && let Ok(ms) = v.parse::<u64>()
    {
        cfg.tick_period_ms = ms;
    }
    if let Some(v) = lookup("ARBITER_HEARTBEAT_TIMEOUT_MS")
        && let Ok(ms) = v.parse::<u64>()
    {
        cfg.heartbeat_timeout_ms = ms;
    }
}
