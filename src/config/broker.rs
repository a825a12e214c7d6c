use std::time::Duration;

use crate::config::helpers::{normalize_variant, optional_env, parse_env_or, require_positive};
use crate::error::ConfigError;
use crate::settings::Settings;

/// How approval surfaces are presented.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowHostKind {
    /// Open the approval page in the system browser.
    Browser,
    /// Record windows without showing anything (CI, remote hosts, tests).
    Headless,
}

impl WindowHostKind {
    fn parse(value: &str, key: &str) -> Result<Self, ConfigError> {
        match normalize_variant(value).as_str() {
            "browser" | "system_browser" => Ok(Self::Browser),
            "headless" | "none" => Ok(Self::Headless),
            _ => Err(ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("expected 'browser' or 'headless', got '{value}'"),
            }),
        }
    }
}

/// Timing and presentation of the approval flow.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub poll_interval: Duration,
    pub request_timeout: Duration,
    pub orphan_grace: Duration,
    pub window_width: u32,
    pub window_height: u32,
    /// Overrides the gateway address approval surfaces are loaded from.
    pub approval_base_url: Option<String>,
    pub window_host: WindowHostKind,
}

impl BrokerConfig {
    pub(crate) fn resolve(settings: &Settings) -> Result<Self, ConfigError> {
        let poll_interval_ms = require_positive(
            "BROKER_POLL_INTERVAL_MS",
            parse_env_or(
                "BROKER_POLL_INTERVAL_MS",
                settings.broker.poll_interval_ms,
                "a positive integer",
            )?,
        )?;

        let request_timeout_secs = require_positive(
            "BROKER_REQUEST_TIMEOUT_SECS",
            parse_env_or(
                "BROKER_REQUEST_TIMEOUT_SECS",
                settings.broker.request_timeout_secs,
                "a positive integer",
            )?,
        )?;

        if poll_interval_ms >= request_timeout_secs.saturating_mul(1000) {
            return Err(ConfigError::InvalidValue {
                key: "BROKER_POLL_INTERVAL_MS".to_string(),
                message: "must be shorter than the request timeout".to_string(),
            });
        }

        // A resolved slot must outlive at least two poller ticks, or a new
        // request could reclaim it before its caller collects the outcome.
        let orphan_grace_secs = parse_env_or(
            "BROKER_ORPHAN_GRACE_SECS",
            settings.broker.orphan_grace_secs,
            "a non-negative integer",
        )?;
        if orphan_grace_secs.saturating_mul(1000) < poll_interval_ms.saturating_mul(2) {
            return Err(ConfigError::InvalidValue {
                key: "BROKER_ORPHAN_GRACE_SECS".to_string(),
                message: format!(
                    "must be at least twice the poll interval ({poll_interval_ms} ms)"
                ),
            });
        }

        let window_width: u32 =
            parse_env_or("APPROVAL_WINDOW_WIDTH", settings.broker.window_width, "a positive integer")?;
        let window_height: u32 = parse_env_or(
            "APPROVAL_WINDOW_HEIGHT",
            settings.broker.window_height,
            "a positive integer",
        )?;
        require_positive("APPROVAL_WINDOW_WIDTH", u64::from(window_width))?;
        require_positive("APPROVAL_WINDOW_HEIGHT", u64::from(window_height))?;

        let approval_base_url = optional_env("APPROVAL_BASE_URL")?
            .or_else(|| settings.broker.approval_base_url.clone())
            .map(|raw| {
                url::Url::parse(&raw)
                    .map(|_| raw.trim_end_matches('/').to_string())
                    .map_err(|e| ConfigError::InvalidValue {
                        key: "APPROVAL_BASE_URL".to_string(),
                        message: format!("must be an absolute URL: {e}"),
                    })
            })
            .transpose()?;

        let window_host = WindowHostKind::parse(
            &optional_env("APPROVAL_WINDOW_HOST")?
                .unwrap_or_else(|| settings.broker.window_host.clone()),
            "APPROVAL_WINDOW_HOST",
        )?;

        Ok(Self {
            poll_interval: Duration::from_millis(poll_interval_ms),
            request_timeout: Duration::from_secs(request_timeout_secs),
            orphan_grace: Duration::from_secs(orphan_grace_secs),
            window_width,
            window_height,
            approval_base_url,
            window_host,
        })
    }
}
