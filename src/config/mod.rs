//! Configuration for walletgate.
//!
//! Settings are loaded with priority: env var > TOML config file >
//! `settings.json` > default. Bootstrap vars (`LIBSQL_*`, the gateway token)
//! live in `~/.walletgate/.env`, loaded via dotenvy early in startup.

mod broker;
mod database;
mod gateway;
pub(crate) mod helpers;

use std::str::FromStr;

use rust_decimal::Decimal;

use crate::error::ConfigError;
use crate::settings::Settings;

pub use self::broker::{BrokerConfig, WindowHostKind};
pub use self::database::{DatabaseConfig, default_libsql_path};
pub use self::gateway::GatewayConfig;

/// Main configuration for the broker daemon.
#[derive(Debug, Clone)]
pub struct Config {
    pub database: DatabaseConfig,
    pub gateway: GatewayConfig,
    pub broker: BrokerConfig,
    pub accounts: AccountsConfig,
    pub logging: LoggingConfig,
}

/// Development account manager seed.
#[derive(Debug, Clone)]
pub struct AccountsConfig {
    pub dev_address: String,
    pub dev_balance: Decimal,
}

impl AccountsConfig {
    pub(crate) fn resolve(settings: &Settings) -> Result<Self, ConfigError> {
        let dev_address = helpers::optional_env("WALLET_DEV_ADDRESS")?
            .unwrap_or_else(|| settings.accounts.dev_address.clone());

        let raw_balance = helpers::optional_env("WALLET_DEV_BALANCE")?
            .unwrap_or_else(|| settings.accounts.dev_balance.clone());
        let dev_balance =
            Decimal::from_str(raw_balance.trim()).map_err(|e| ConfigError::InvalidValue {
                key: "WALLET_DEV_BALANCE".to_string(),
                message: format!("must be a decimal amount: {e}"),
            })?;
        if dev_balance.is_sign_negative() {
            return Err(ConfigError::InvalidValue {
                key: "WALLET_DEV_BALANCE".to_string(),
                message: "must not be negative".to_string(),
            });
        }

        Ok(Self {
            dev_address,
            dev_balance,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub format: LogFormat,
}

impl LoggingConfig {
    pub(crate) fn resolve(settings: &Settings) -> Result<Self, ConfigError> {
        let raw = helpers::optional_env("LOG_FORMAT")?
            .unwrap_or_else(|| settings.logging.format.clone());
        let format = match helpers::normalize_variant(&raw).as_str() {
            "pretty" | "text" => LogFormat::Pretty,
            "json" => LogFormat::Json,
            _ => {
                return Err(ConfigError::InvalidValue {
                    key: "LOG_FORMAT".to_string(),
                    message: format!("expected 'pretty' or 'json', got '{raw}'"),
                });
            }
        };
        Ok(Self { format })
    }
}

impl Config {
    /// Load configuration from environment variables and the files under
    /// `~/.walletgate`.
    ///
    /// Loads both `./.env` (standard, higher priority) and
    /// `~/.walletgate/.env` (lower priority) via dotenvy, which never
    /// overwrites existing vars.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_env_with_toml(None)
    }

    /// Load from env with an optional TOML config file overlay.
    pub fn from_env_with_toml(toml_path: Option<&std::path::Path>) -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        crate::bootstrap::load_walletgate_env();
        let mut settings = Settings::load();

        // Overlay TOML config file (values win over JSON settings)
        Self::apply_toml_overlay(&mut settings, toml_path)?;

        Self::build(&settings)
    }

    /// Load and merge a TOML config file into settings.
    ///
    /// If `explicit_path` is `Some`, loads from that path (errors are fatal).
    /// If `None`, tries the default path `~/.walletgate/config.toml` (missing
    /// file is silently ignored).
    fn apply_toml_overlay(
        settings: &mut Settings,
        explicit_path: Option<&std::path::Path>,
    ) -> Result<(), ConfigError> {
        let path = explicit_path
            .map(std::path::PathBuf::from)
            .unwrap_or_else(Settings::default_toml_path);

        match settings.overlay_toml(&path) {
            Ok(true) => tracing::debug!("Loaded TOML config from {}", path.display()),
            Ok(false) if explicit_path.is_some() => {
                return Err(ConfigError::ParseError(format!(
                    "Config file not found: {}",
                    path.display()
                )));
            }
            Ok(false) => {}
            Err(e) if explicit_path.is_some() => return Err(ConfigError::ParseError(e)),
            Err(e) => tracing::warn!("Ignoring default config file: {}", e),
        }
        Ok(())
    }

    /// Resolve every section against `settings`, env vars taking priority.
    pub fn build(settings: &Settings) -> Result<Self, ConfigError> {
        Ok(Self {
            database: DatabaseConfig::resolve(settings)?,
            gateway: GatewayConfig::resolve(settings)?,
            broker: BrokerConfig::resolve(settings)?,
            accounts: AccountsConfig::resolve(settings)?,
            logging: LoggingConfig::resolve(settings)?,
        })
    }

    /// Base URL approval surfaces load from.
    pub fn approval_base_url(&self) -> String {
        self.broker
            .approval_base_url
            .clone()
            .unwrap_or_else(|| self.gateway.base_url())
    }
}
