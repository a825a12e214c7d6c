use secrecy::SecretString;

use crate::config::helpers::{optional_env, parse_env_or, require_positive};
use crate::error::ConfigError;
use crate::settings::Settings;

/// Local HTTP gateway: bridge endpoint, approval surface and operator API.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    /// Bearer token for the approval surface and operator API. When unset,
    /// `serve` generates one and persists it to `~/.walletgate/.env`.
    pub auth_token: Option<SecretString>,
    /// Bridge calls allowed per minute across all sites.
    pub bridge_rate_limit: u64,
}

impl GatewayConfig {
    pub(crate) fn resolve(settings: &Settings) -> Result<Self, ConfigError> {
        let host = optional_env("GATEWAY_HOST")?.unwrap_or_else(|| settings.gateway.host.clone());

        let port: u16 = parse_env_or("GATEWAY_PORT", settings.gateway.port, "a valid port number")?;

        let bridge_rate_limit = require_positive(
            "BRIDGE_RATE_LIMIT",
            parse_env_or(
                "BRIDGE_RATE_LIMIT",
                settings.gateway.bridge_rate_limit,
                "a positive integer",
            )?,
        )?;

        Ok(Self {
            host,
            port,
            auth_token: optional_env("GATEWAY_AUTH_TOKEN")?.map(SecretString::from),
            bridge_rate_limit,
        })
    }

    /// `http://host:port`, used as the default approval base URL.
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}
