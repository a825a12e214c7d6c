//! User settings persistence.
//!
//! Stores operator preferences in `~/.walletgate/settings.json`, optionally
//! overlaid by `~/.walletgate/config.toml`. Settings are loaded with
//! env var > TOML > settings.json > default priority; env vars are applied
//! later by the config resolvers.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::bootstrap::walletgate_dir;

/// Operator settings persisted to disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Settings {
    #[serde(default)]
    pub database: DatabaseSettings,

    #[serde(default)]
    pub gateway: GatewaySettings,

    #[serde(default)]
    pub broker: BrokerSettings,

    #[serde(default)]
    pub accounts: AccountSettings,

    #[serde(default)]
    pub logging: LoggingSettings,
}

/// Where the durable store lives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct DatabaseSettings {
    /// Path to the local libSQL file (default `~/.walletgate/walletgate.db`).
    #[serde(default)]
    pub libsql_path: Option<String>,

    /// Turso URL for embedded-replica sync. The auth token is env-only.
    #[serde(default)]
    pub libsql_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewaySettings {
    #[serde(default = "default_gateway_host")]
    pub host: String,

    #[serde(default = "default_gateway_port")]
    pub port: u16,

    /// Bridge calls allowed per minute.
    #[serde(default = "default_bridge_rate_limit")]
    pub bridge_rate_limit: u64,
}

fn default_gateway_host() -> String {
    "127.0.0.1".to_string()
}

fn default_gateway_port() -> u16 {
    7420
}

fn default_bridge_rate_limit() -> u64 {
    60
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            host: default_gateway_host(),
            port: default_gateway_port(),
            bridge_rate_limit: default_bridge_rate_limit(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerSettings {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// How long a resolved-but-unconsumed slot survives before it may be reclaimed.
    #[serde(default = "default_orphan_grace_secs")]
    pub orphan_grace_secs: u64,

    #[serde(default = "default_window_width")]
    pub window_width: u32,

    #[serde(default = "default_window_height")]
    pub window_height: u32,

    /// Base URL approval surfaces load from. Derived from the gateway address when unset.
    #[serde(default)]
    pub approval_base_url: Option<String>,

    /// `browser` or `headless`.
    #[serde(default = "default_window_host")]
    pub window_host: String,
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_request_timeout_secs() -> u64 {
    60
}

fn default_orphan_grace_secs() -> u64 {
    5
}

fn default_window_width() -> u32 {
    400
}

fn default_window_height() -> u32 {
    600
}

fn default_window_host() -> String {
    "browser".to_string()
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            request_timeout_secs: default_request_timeout_secs(),
            orphan_grace_secs: default_orphan_grace_secs(),
            window_width: default_window_width(),
            window_height: default_window_height(),
            approval_base_url: None,
            window_host: default_window_host(),
        }
    }
}

/// Development account manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountSettings {
    #[serde(default = "default_dev_address")]
    pub dev_address: String,

    /// Decimal string, e.g. `"100.5"`.
    #[serde(default = "default_dev_balance")]
    pub dev_balance: String,
}

fn default_dev_address() -> String {
    "0xdev0000000000000000000000000000000000001".to_string()
}

fn default_dev_balance() -> String {
    "100".to_string()
}

impl Default for AccountSettings {
    fn default() -> Self {
        Self {
            dev_address: default_dev_address(),
            dev_balance: default_dev_balance(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// `pretty` or `json`.
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            format: default_log_format(),
        }
    }
}

impl Settings {
    /// Get the default settings file path (~/.walletgate/settings.json).
    pub fn default_path() -> PathBuf {
        walletgate_dir().join("settings.json")
    }

    /// Load settings from disk, returning default if not found.
    pub fn load() -> Self {
        Self::load_from(&Self::default_path())
    }

    /// Load settings from a specific path. Unreadable or malformed files
    /// fall back to defaults.
    pub fn load_from(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(data) => serde_json::from_str(&data).unwrap_or_else(|e| {
                tracing::warn!("Ignoring malformed settings file {}: {}", path.display(), e);
                Self::default()
            }),
            Err(_) => Self::default(),
        }
    }

    /// Default TOML config file path (~/.walletgate/config.toml).
    pub fn default_toml_path() -> PathBuf {
        walletgate_dir().join("config.toml")
    }

    /// Overlay the keys written in a TOML file onto `self`.
    ///
    /// Only keys present in the file are applied, so a file that sets
    /// `broker.poll_interval_ms` leaves every other value as it was, even
    /// one the file could have restated at its default. Returns `Ok(false)`
    /// when the file does not exist.
    pub fn overlay_toml(&mut self, path: &Path) -> Result<bool, String> {
        let data = match std::fs::read_to_string(path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(format!("cannot read {}: {e}", path.display())),
        };

        // Type-check the whole file before touching anything.
        toml::from_str::<Settings>(&data)
            .map_err(|e| format!("invalid TOML in {}: {e}", path.display()))?;
        let written: toml::Table = toml::from_str(&data)
            .map_err(|e| format!("invalid TOML in {}: {e}", path.display()))?;

        let mut current = serde_json::to_value(&*self).map_err(|e| e.to_string())?;
        let written = serde_json::to_value(written).map_err(|e| e.to_string())?;
        overlay(&mut current, written);
        *self = serde_json::from_value(current)
            .map_err(|e| format!("invalid settings in {}: {e}", path.display()))?;
        Ok(true)
    }

    /// Write a commented TOML config file with current settings.
    pub fn save_toml(&self, path: &Path) -> Result<(), String> {
        let body = toml::to_string_pretty(self).map_err(|e| format!("cannot encode settings: {e}"))?;
        let content = format!(
            "# walletgate configuration file.\n\
             #\n\
             # Priority: env var > this file > settings.json > defaults.\n\
             # The gateway auth token and libSQL auth token are env-only.\n\
             # Run `walletgate config init --force` to regenerate this file.\n\
             \n\
             {body}"
        );

        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir).map_err(|e| format!("cannot create {}: {e}", dir.display()))?;
        }
        std::fs::write(path, content).map_err(|e| format!("cannot write {}: {e}", path.display()))
    }

    /// Every leaf setting as `section.key = value`, sorted by key.
    pub fn list(&self) -> Vec<(String, String)> {
        let mut flat = BTreeMap::new();
        if let Ok(tree) = serde_json::to_value(self) {
            flatten("", &tree, &mut flat);
        }
        flat.into_iter().collect()
    }
}

/// Replace leaves of `base` with those present in `written`, recursing into
/// tables both sides have.
fn overlay(base: &mut JsonValue, written: JsonValue) {
    match (base, written) {
        (JsonValue::Object(base), JsonValue::Object(written)) => {
            for (key, value) in written {
                match base.get_mut(&key) {
                    Some(slot) => overlay(slot, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}

fn flatten(prefix: &str, value: &JsonValue, out: &mut BTreeMap<String, String>) {
    let rendered = match value {
        JsonValue::Object(fields) => {
            for (key, child) in fields {
                let path = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{prefix}.{key}")
                };
                flatten(&path, child, out);
            }
            return;
        }
        JsonValue::Null => "(unset)".to_string(),
        JsonValue::String(s) => s.clone(),
        other => other.to_string(),
    };
    out.insert(prefix.to_string(), rendered);
}
