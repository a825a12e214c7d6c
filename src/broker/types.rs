//! Records shared by every broker context.
//!
//! Everything here round-trips through the durable store, so all of it is
//! `Serialize`/`Deserialize` and nothing holds live references.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SubsecRound, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::broker::origin::Origin;

/// Current time at the millisecond precision the store persists, so records
/// compare equal after a round trip.
pub fn timestamp_now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}

/// Browser tab identifier reported by the bridge.
pub type TabId = i64;

/// The three approval slots. Each kind has its own single-flight slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    Connection,
    Transaction,
    Signature,
}

impl RequestKind {
    pub const ALL: [RequestKind; 3] = [Self::Connection, Self::Transaction, Self::Signature];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connection => "connection",
            Self::Transaction => "transaction",
            Self::Signature => "signature",
        }
    }
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RequestKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "connection" | "connect" => Ok(Self::Connection),
            "transaction" | "tx" => Ok(Self::Transaction),
            "signature" | "sign" => Ok(Self::Signature),
            other => Err(format!(
                "unknown request kind '{other}', expected connection, transaction or signature"
            )),
        }
    }
}

/// Transfer requested by a site.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionPayload {
    pub to: String,
    #[serde(with = "rust_decimal::serde::str")]
    pub amount: Decimal,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_ref: Option<String>,
}

/// Kind-specific request body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RequestPayload {
    Connection,
    Transaction(TransactionPayload),
    Signature { message: String },
}

impl RequestPayload {
    pub fn kind(&self) -> RequestKind {
        match self {
            Self::Connection => RequestKind::Connection,
            Self::Transaction(_) => RequestKind::Transaction,
            Self::Signature { .. } => RequestKind::Signature,
        }
    }

    /// Reject payloads that no approval screen could meaningfully show.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            Self::Connection => Ok(()),
            Self::Transaction(tx) => {
                if tx.to.trim().is_empty() {
                    return Err("recipient 'to' must not be empty".to_string());
                }
                if tx.amount <= Decimal::ZERO {
                    return Err(format!("amount must be positive, got {}", tx.amount));
                }
                if tx.token_ref.as_deref().is_some_and(|t| t.trim().is_empty()) {
                    return Err("tokenRef must not be empty when present".to_string());
                }
                Ok(())
            }
            Self::Signature { message } => {
                if message.is_empty() {
                    Err("message must not be empty".to_string())
                } else {
                    Ok(())
                }
            }
        }
    }
}

/// Successful result of a privileged action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ApprovalResult {
    Accounts { addresses: Vec<String> },
    TransactionHash { hash: String },
    Signature { signature: String },
}

impl ApprovalResult {
    /// Value handed back to the website for this result.
    pub fn to_bridge_value(&self) -> serde_json::Value {
        match self {
            Self::Accounts { addresses } => serde_json::json!(addresses),
            Self::TransactionHash { hash } => serde_json::Value::String(hash.clone()),
            Self::Signature { signature } => serde_json::Value::String(signature.clone()),
        }
    }
}

/// Who caused a rejection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionCause {
    /// The operator clicked reject.
    User,
    /// The account manager failed while performing the approved action.
    ActionFailed,
}

/// Terminal value attached to a pending request. Immutable once written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RequestOutcome {
    Approved { result: ApprovalResult },
    Rejected { reason: String, cause: RejectionCause },
    Expired,
    Abandoned,
}

impl RequestOutcome {
    pub fn approved(result: ApprovalResult) -> Self {
        Self::Approved { result }
    }

    pub fn rejected_by_user(reason: impl Into<String>) -> Self {
        Self::Rejected {
            reason: reason.into(),
            cause: RejectionCause::User,
        }
    }

    pub fn action_failed(reason: impl Into<String>) -> Self {
        Self::Rejected {
            reason: reason.into(),
            cause: RejectionCause::ActionFailed,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Approved { .. } => "approved",
            Self::Rejected {
                cause: RejectionCause::User,
                ..
            } => "rejected",
            Self::Rejected {
                cause: RejectionCause::ActionFailed,
                ..
            } => "action_failed",
            Self::Expired => "expired",
            Self::Abandoned => "abandoned",
        }
    }
}

/// The single in-flight approval record for a kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingRequest {
    pub request_id: Uuid,
    pub kind: RequestKind,
    pub origin: Origin,
    pub requester_tab_id: TabId,
    pub payload: RequestPayload,
    pub opened_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<RequestOutcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
}

impl PendingRequest {
    pub fn new(origin: Origin, requester_tab_id: TabId, payload: RequestPayload) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            kind: payload.kind(),
            origin,
            requester_tab_id,
            payload,
            opened_at: timestamp_now(),
            outcome: None,
            resolved_at: None,
        }
    }

    /// Still waiting for a decision.
    pub fn is_open(&self) -> bool {
        self.outcome.is_none()
    }
}

/// Persisted per-origin permission to see an account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteTrustEntry {
    pub origin: Origin,
    pub account_address: String,
    pub connected_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
}

/// Identifier of an approval surface. Random so ids never collide across
/// restarts of the process that opened them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WindowId(pub Uuid);

impl WindowId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for WindowId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for WindowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for WindowId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Handle of an open approval surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalWindowHandle {
    pub window_id: WindowId,
    pub kind: RequestKind,
    pub request_id: Uuid,
    pub opened_for_tab_id: TabId,
    pub opened_at: DateTime<Utc>,
}

/// Event pushed to the tabs of a site.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TabEvent {
    AccountsChanged { accounts: Vec<String> },
    Disconnected,
}

/// A [`TabEvent`] addressed to an origin, optionally narrowed to one tab.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeEvent {
    pub origin: Origin,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tab_id: Option<TabId>,
    #[serde(flatten)]
    pub event: TabEvent,
}

impl BridgeEvent {
    /// Whether a subscriber for `(origin, tab_id)` should receive this event.
    pub fn is_for(&self, origin: &Origin, tab_id: TabId) -> bool {
        &self.origin == origin && self.tab_id.is_none_or(|target| target == tab_id)
    }
}
