//! Error types for walletgate.

use std::time::Duration;

use serde::Serialize;

use crate::broker::RequestKind;

/// Top-level error type for the broker runtime.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("Gateway error: {0}")]
    Gateway(#[from] GatewayError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Slot for {kind} is already occupied by request {request_id}")]
    SlotOccupied {
        kind: RequestKind,
        request_id: uuid::Uuid,
    },

    #[error("LibSQL error: {0}")]
    LibSql(#[from] libsql::Error),
}

/// Gateway/transport errors.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("{name} failed to start: {reason}")]
    StartupFailed { name: String, reason: String },
}

/// Errors produced while brokering a website request.
///
/// The first seven variants are the externally meaningful taxonomy; the
/// remaining ones are internal failures that the website only ever sees as a
/// generic rejection.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("Unsupported method: {0}")]
    UnsupportedMethod(String),

    #[error("Invalid parameters for {method}: {reason}")]
    InvalidParams { method: String, reason: String },

    #[error("A {kind} request is already pending")]
    RequestAlreadyPending { kind: RequestKind },

    #[error("User rejected the request: {reason}")]
    UserRejected { reason: String },

    #[error("{kind} request timed out after {after:?}")]
    Timeout { kind: RequestKind, after: Duration },

    #[error("{kind} approval window closed without a decision")]
    Abandoned { kind: RequestKind },

    #[error("Privileged action failed: {reason}")]
    PrivilegedActionFailed { reason: String },

    #[error("Account manager error: {0}")]
    AccountManager(String),

    #[error("Approval window error: {reason}")]
    Window { reason: String },

    #[error("Store error: {0}")]
    Store(#[from] DatabaseError),
}

/// Website-visible rejection payload.
///
/// This is the only shape an error takes once it crosses the bridge: no store
/// details, no distinction between timeout and abandonment.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct BridgeRejection {
    pub code: &'static str,
    pub retryable: bool,
    pub message: String,
}

impl BridgeRejection {
    pub fn new(code: &'static str, retryable: bool, message: impl Into<String>) -> Self {
        Self {
            code,
            retryable,
            message: message.into(),
        }
    }
}

const GENERIC_REJECTION: &str = "User rejected the request.";

impl BrokerError {
    /// Stable diagnostic label, used in logs to tell failure modes apart.
    pub fn label(&self) -> &'static str {
        match self {
            Self::UnsupportedMethod(_) => "unsupported_method",
            Self::InvalidParams { .. } => "invalid_params",
            Self::RequestAlreadyPending { .. } => "request_already_pending",
            Self::UserRejected { .. } => "user_rejected",
            Self::Timeout { .. } => "timeout",
            Self::Abandoned { .. } => "abandoned",
            Self::PrivilegedActionFailed { .. } => "privileged_action_failed",
            Self::AccountManager(_) => "account_manager",
            Self::Window { .. } => "window",
            Self::Store(_) => "store",
        }
    }

    /// Whether the caller may retry the same call later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RequestAlreadyPending { .. })
    }

    /// Map to the payload delivered to the website.
    pub fn to_rejection(&self) -> BridgeRejection {
        match self {
            Self::UnsupportedMethod(method) => BridgeRejection::new(
                "unsupported_method",
                false,
                format!("The method '{method}' is not supported."),
            ),
            Self::InvalidParams { .. } => {
                BridgeRejection::new("invalid_params", false, self.to_string())
            }
            Self::RequestAlreadyPending { .. } => BridgeRejection::new(
                "request_already_pending",
                true,
                "A request of this type is already awaiting approval. Try again later.",
            ),
            Self::UserRejected { reason } => {
                BridgeRejection::new("user_rejected", false, reason.clone())
            }
            // The site learns only that the request was not approved.
            Self::Timeout { .. } | Self::Abandoned { .. } => {
                BridgeRejection::new("user_rejected", false, GENERIC_REJECTION)
            }
            Self::PrivilegedActionFailed { reason } => {
                BridgeRejection::new("action_failed", false, reason.clone())
            }
            Self::AccountManager(_) | Self::Window { .. } | Self::Store(_) => {
                BridgeRejection::new("internal_error", false, "The wallet could not process the request.")
            }
        }
    }
}

/// Result type alias for the broker runtime.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_and_abandonment_look_identical_to_sites() {
        let timeout = BrokerError::Timeout {
            kind: RequestKind::Transaction,
            after: Duration::from_secs(60),
        };
        let abandoned = BrokerError::Abandoned {
            kind: RequestKind::Transaction,
        };

        assert_eq!(timeout.to_rejection(), abandoned.to_rejection());
        assert_ne!(timeout.label(), abandoned.label());
    }

    #[test]
    fn only_pending_conflicts_are_retryable() {
        let pending = BrokerError::RequestAlreadyPending {
            kind: RequestKind::Signature,
        };
        assert!(pending.is_retryable());
        assert!(pending.to_rejection().retryable);

        let rejected = BrokerError::UserRejected {
            reason: "no".to_string(),
        };
        assert!(!rejected.is_retryable());
        assert!(!rejected.to_rejection().retryable);
    }

    #[test]
    fn store_details_never_reach_sites() {
        let err = BrokerError::Store(DatabaseError::Query(
            "no such table: pending_requests".to_string(),
        ));
        let rejection = err.to_rejection();

        assert_eq!(rejection.code, "internal_error");
        assert!(!rejection.message.contains("pending_requests"));
    }

    #[test]
    fn serializes_rejection_payload() {
        let rejection = BrokerError::UnsupportedMethod("eth_foo".to_string()).to_rejection();
        let value = serde_json::to_value(&rejection).expect("valid json");

        assert_eq!(value["code"], "unsupported_method");
        assert_eq!(value["retryable"], false);
    }
}
