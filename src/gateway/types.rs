//! Request and response DTOs for the gateway.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::broker::{Decision, PendingRequest, SiteTrustEntry, TabId};
use crate::error::BridgeRejection;

// --- Bridge ---

/// One call from the in-page bridge.
#[derive(Debug, Deserialize)]
pub struct BridgeCall {
    /// Opaque correlation id, echoed back.
    #[serde(default)]
    pub id: serde_json::Value,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
    pub tab_id: TabId,
}

#[derive(Debug, Serialize)]
pub struct BridgeReply {
    pub id: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<BridgeRejection>,
}

impl BridgeReply {
    pub fn ok(id: serde_json::Value, result: serde_json::Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(id: serde_json::Value, error: BridgeRejection) -> Self {
        Self {
            id,
            result: None,
            error: Some(error),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    pub tab_id: TabId,
}

// --- Approval surface ---

/// The approval page passes the id of the surface it was opened as.
#[derive(Debug, Deserialize)]
pub struct ApprovalLoadQuery {
    #[serde(default)]
    pub window_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct DecisionRequest {
    pub request_id: Uuid,
    #[serde(flatten)]
    pub decision: Decision,
}

#[derive(Debug, Serialize)]
pub struct WindowClosedResponse {
    /// `abandoned`, `already_settled` or `unknown`.
    pub status: &'static str,
}

// --- Operator API ---

#[derive(Debug, Serialize)]
pub struct SitesResponse {
    pub sites: Vec<SiteTrustEntry>,
}

#[derive(Debug, Serialize)]
pub struct RevokeResponse {
    pub origin: String,
    pub removed: bool,
}

#[derive(Debug, Serialize)]
pub struct PendingResponse {
    pub pending: Vec<PendingRequest>,
}

// --- Health ---

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}
