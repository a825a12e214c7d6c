//! Website origin normalization.
//!
//! An origin is the trust key for the whole broker, so two spellings of the
//! same site must collapse to one value:
//!
//! ```text
//! "HTTPS://A.Example:443/path?q"  ──►  "https://a.example"
//! "http://localhost:8080/"        ──►  "http://localhost:8080"
//! ```

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};

/// Reason an origin string was refused.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OriginError {
    #[error("Invalid origin: {0}")]
    Invalid(String),
    #[error("Unsupported origin scheme: {0}")]
    UnsupportedScheme(String),
    #[error("Origin must not contain userinfo")]
    Userinfo,
}

/// Normalized `scheme://host[:port]` identity of a website.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct Origin(String);

impl Origin {
    /// Parse and normalize. Accepts a bare origin or any URL on that origin.
    pub fn parse(raw: &str) -> Result<Self, OriginError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed == "null" {
            return Err(OriginError::Invalid(format!("{trimmed:?}")));
        }

        let parsed = url::Url::parse(trimmed)
            .map_err(|e| OriginError::Invalid(format!("{trimmed}: {e}")))?;

        let scheme = parsed.scheme();
        if scheme != "http" && scheme != "https" {
            return Err(OriginError::UnsupportedScheme(scheme.to_string()));
        }

        // Reject user:pass@host to prevent host-confusion spoofing.
        if !parsed.username().is_empty() || parsed.password().is_some() {
            return Err(OriginError::Userinfo);
        }

        if parsed.host_str().is_none_or(str::is_empty) {
            return Err(OriginError::Invalid(format!("{trimmed}: empty host")));
        }

        // `Url` lower-cases the host and drops default ports already.
        Ok(Self(parsed.origin().ascii_serialization()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Host part, for display in approval screens.
    pub fn host(&self) -> &str {
        self.0
            .split_once("://")
            .map(|(_, rest)| rest)
            .unwrap_or(&self.0)
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for Origin {
    type Err = OriginError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl<'de> Deserialize<'de> for Origin {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}
