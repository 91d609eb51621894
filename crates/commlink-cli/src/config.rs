//! Process configuration – reads `~/.commlink/config.toml`.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

/// Persisted microservice configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// Opaque deployment scope prefixed to every topic.
    #[serde(default = "default_scope")]
    pub scope: String,

    /// Interface name; the microservice identity becomes
    /// `<scope>__INTERFACE__<interface_name>`.
    #[serde(default = "default_interface_name")]
    pub interface_name: String,

    /// Logical targets served by this interface.
    #[serde(default)]
    pub targets: Vec<String>,

    /// TCP endpoint of the device link.
    #[serde(default = "default_connect_addr")]
    pub connect_addr: String,

    #[serde(default = "default_true")]
    pub auto_reconnect: bool,

    #[serde(default = "default_reconnect_delay_secs")]
    pub reconnect_delay_secs: u64,

    #[serde(default = "default_true")]
    pub read_allowed: bool,

    /// Directory for deduplicated exception files.
    #[serde(default = "default_exception_dir")]
    pub exception_dir: String,
}

fn default_scope() -> String {
    "DEFAULT".to_string()
}
fn default_interface_name() -> String {
    "SERIAL_INT".to_string()
}
fn default_connect_addr() -> String {
    "127.0.0.1:7779".to_string()
}
fn default_reconnect_delay_secs() -> u64 {
    5
}
fn default_exception_dir() -> String {
    "exceptions".to_string()
}
fn default_true() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        Self {
            scope: default_scope(),
            interface_name: default_interface_name(),
            targets: Vec::new(),
            connect_addr: default_connect_addr(),
            auto_reconnect: true,
            reconnect_delay_secs: default_reconnect_delay_secs(),
            read_allowed: true,
            exception_dir: default_exception_dir(),
        }
    }
}

impl Config {
    /// The microservice identity this config describes.
    pub fn microservice_name(&self) -> String {
        format!("{}__INTERFACE__{}", self.scope, self.interface_name)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }
}

/// Return the path to `~/.commlink/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

/// Build the config path relative to the given home directory.
/// Extracted for testability without mutating environment variables.
pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".commlink").join("config.toml")
}

/// Load the config from disk. Returns `None` if the file does not exist.
pub fn load() -> Result<Option<Config>, String> {
    load_from(&config_path())
}

/// Load the config from a specific path.
pub(crate) fn load_from(path: &PathBuf) -> Result<Option<Config>, String> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read config at {}: {}", path.display(), e))?;
    let mut cfg: Config =
        toml::from_str(&raw).map_err(|e| format!("Failed to parse config: {}", e))?;
    apply_env_overrides(&mut cfg);
    Ok(Some(cfg))
}

/// Apply `COMMLINK_*` environment variable overrides to `cfg`.
///
/// Supported variables:
///
/// | Variable | Config field |
/// |---|---|
/// | `COMMLINK_SCOPE` | `scope` |
/// | `COMMLINK_INTERFACE_NAME` | `interface_name` |
/// | `COMMLINK_CONNECT_ADDR` | `connect_addr` |
/// | `COMMLINK_RECONNECT_DELAY_SECS` | `reconnect_delay_secs` |
pub fn apply_env_overrides(cfg: &mut Config) {
    if let Ok(v) = std::env::var("COMMLINK_SCOPE") {
        cfg.scope = v;
    }
    if let Ok(v) = std::env::var("COMMLINK_INTERFACE_NAME") {
        cfg.interface_name = v;
    }
    if let Ok(v) = std::env::var("COMMLINK_CONNECT_ADDR") {
        cfg.connect_addr = v;
    }
    if let Ok(v) = std::env::var("COMMLINK_RECONNECT_DELAY_SECS") {
        if let Ok(secs) = v.parse::<u64>() {
            cfg.reconnect_delay_secs = secs;
        }
    }
}

/// Save the config to disk, creating `~/.commlink/` if necessary.
pub fn save(cfg: &Config) -> Result<(), String> {
    save_to(cfg, &config_path())
}

/// Save the config to a specific path.
pub(crate) fn save_to(cfg: &Config, path: &PathBuf) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory: {}", e))?;
    }
    let raw =
        toml::to_string_pretty(cfg).map_err(|e| format!("Failed to serialize config: {}", e))?;
    fs::write(path, raw).map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))
}
