//! Entry point for calls arriving from the in-page bridge.
//!
//! The origin passed to [`RequestIngress::dispatch`] must come from the
//! transport boundary (the bridge's `Origin` header), never from `params`.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::Value;

use crate::broker::{
    ApprovalResult, ApprovalWindowOrchestrator, BalanceSource, Origin,
    PendingRequest, PendingRequestStore, RequestOutcome, RequestPayload, ResolutionPoller,
    SiteTrustRegistry, TabEvent, TabId, TabNotifier, TransactionPayload,
};
use crate::error::BrokerError;

/// The fixed method surface exposed to websites.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeMethod {
    RequestAccounts,
    GetBalance,
    SendTransaction,
    SignMessage,
    Disconnect,
}

impl BridgeMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RequestAccounts => "requestAccounts",
            Self::GetBalance => "getBalance",
            Self::SendTransaction => "sendTransaction",
            Self::SignMessage => "signMessage",
            Self::Disconnect => "disconnect",
        }
    }
}

impl fmt::Display for BridgeMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BridgeMethod {
    type Err = BrokerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "requestAccounts" => Ok(Self::RequestAccounts),
            "getBalance" => Ok(Self::GetBalance),
            "sendTransaction" => Ok(Self::SendTransaction),
            "signMessage" => Ok(Self::SignMessage),
            "disconnect" => Ok(Self::Disconnect),
            other => Err(BrokerError::UnsupportedMethod(other.to_string())),
        }
    }
}

/// Wire shape of `sendTransaction` params.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TransactionParams {
    to: String,
    amount: Value,
    #[serde(default, alias = "token_ref")]
    token_ref: Option<String>,
}

/// Validates bridge calls and routes them to the fast or slow path.
pub struct RequestIngress {
    registry: Arc<SiteTrustRegistry>,
    pending: Arc<PendingRequestStore>,
    windows: Arc<ApprovalWindowOrchestrator>,
    poller: Arc<ResolutionPoller>,
    balances: Arc<dyn BalanceSource>,
    notifier: Arc<dyn TabNotifier>,
}

impl RequestIngress {
    pub fn new(
        registry: Arc<SiteTrustRegistry>,
        pending: Arc<PendingRequestStore>,
        windows: Arc<ApprovalWindowOrchestrator>,
        poller: Arc<ResolutionPoller>,
        balances: Arc<dyn BalanceSource>,
        notifier: Arc<dyn TabNotifier>,
    ) -> Self {
        Self {
            registry,
            pending,
            windows,
            poller,
            balances,
            notifier,
        }
    }

    /// Handle one call. The returned value is what the website receives.
    pub async fn dispatch(
        &self,
        method: &str,
        params: &Value,
        origin: &Origin,
        tab_id: TabId,
    ) -> Result<Value, BrokerError> {
        let method: BridgeMethod = method.parse()?;
        tracing::debug!(%method, %origin, tab_id, "Bridge call");

        let result = match method {
            BridgeMethod::RequestAccounts => self.request_accounts(origin, tab_id).await,
            BridgeMethod::GetBalance => self.get_balance(method, params).await,
            BridgeMethod::SendTransaction => {
                let payload = parse_transaction(method, params)?;
                self.slow_path(method, RequestPayload::Transaction(payload), origin, tab_id)
                    .await
                    .map(|result| result.to_bridge_value())
            }
            BridgeMethod::SignMessage => {
                let message = parse_string_param(method, params, "message")?;
                self.slow_path(method, RequestPayload::Signature { message }, origin, tab_id)
                    .await
                    .map(|result| result.to_bridge_value())
            }
            BridgeMethod::Disconnect => self.disconnect(origin, tab_id).await,
        };

        if let Err(e) = &result {
            tracing::info!(%method, %origin, tab_id, error = e.label(), "Bridge call failed: {}", e);
        }
        result
    }

    async fn request_accounts(&self, origin: &Origin, tab_id: TabId) -> Result<Value, BrokerError> {
        if let Some(entry) = self.registry.lookup(origin).await? {
            self.registry.touch(origin).await?;
            tracing::info!(%origin, "Trusted site, answering without approval");
            return Ok(serde_json::json!([entry.account_address]));
        }

        let result = self
            .slow_path(BridgeMethod::RequestAccounts, RequestPayload::Connection, origin, tab_id)
            .await?;
        if let ApprovalResult::Accounts { addresses } = &result {
            self.notifier.notify_tab(
                origin,
                Some(tab_id),
                TabEvent::AccountsChanged {
                    accounts: addresses.clone(),
                },
            );
        }
        Ok(result.to_bridge_value())
    }

    async fn get_balance(&self, method: BridgeMethod, params: &Value) -> Result<Value, BrokerError> {
        let address = parse_string_param(method, params, "address")?;
        let balance = self
            .balances
            .cached_balance(&address)
            .await
            .map_err(|e| BrokerError::AccountManager(e.to_string()))?
            .unwrap_or(Decimal::ZERO);
        Ok(Value::String(balance.normalize().to_string()))
    }

    async fn disconnect(&self, origin: &Origin, tab_id: TabId) -> Result<Value, BrokerError> {
        let removed = self.registry.remove(origin).await?;
        if !removed {
            tracing::debug!(%origin, "Disconnect from untrusted site");
        }
        self.notifier
            .notify_tab(origin, Some(tab_id), TabEvent::Disconnected);
        Ok(Value::Bool(true))
    }

    /// Open the slot and the window, then wait for the decision.
    async fn slow_path(
        &self,
        method: BridgeMethod,
        payload: RequestPayload,
        origin: &Origin,
        tab_id: TabId,
    ) -> Result<ApprovalResult, BrokerError> {
        let kind = payload.kind();
        payload.validate().map_err(|reason| invalid(method, reason))?;

        let request = PendingRequest::new(origin.clone(), tab_id, payload);
        self.pending.open(&request).await?;
        tracing::info!(%kind, %origin, request_id = %request.request_id, "Awaiting approval");

        if let Err(e) = self.windows.open(kind, &request).await {
            tracing::error!(%kind, "Could not open approval window: {}", e);
            // Release the slot we hold, and only ours.
            self.pending
                .resolve_request(kind, request.request_id, RequestOutcome::Abandoned)
                .await?;
            self.pending.take_outcome(kind, request.request_id).await?;
            return Err(e);
        }

        self.poller.wait(kind, request.request_id).await
    }
}

/// Positional params arrive as an array; named params as an object.
fn first_param(params: &Value) -> &Value {
    match params {
        Value::Array(items) => items.first().unwrap_or(&Value::Null),
        other => other,
    }
}

fn invalid(method: BridgeMethod, reason: impl Into<String>) -> BrokerError {
    BrokerError::InvalidParams {
        method: method.to_string(),
        reason: reason.into(),
    }
}

fn parse_string_param(method: BridgeMethod, params: &Value, field: &str) -> Result<String, BrokerError> {
    let value = match first_param(params) {
        Value::Object(map) => map.get(field).unwrap_or(&Value::Null),
        other => other,
    };
    match value {
        Value::String(s) if !s.is_empty() => Ok(s.clone()),
        Value::String(_) => Err(invalid(method, format!("'{field}' must not be empty"))),
        Value::Null => Err(invalid(method, format!("missing '{field}'"))),
        other => Err(invalid(method, format!("'{field}' must be a string, got {other}"))),
    }
}

fn parse_transaction(method: BridgeMethod, params: &Value) -> Result<TransactionPayload, BrokerError> {
    let raw: TransactionParams = serde_json::from_value(first_param(params).clone())
        .map_err(|e| invalid(method, e.to_string()))?;
    let amount = match &raw.amount {
        Value::String(s) => Decimal::from_str(s.trim()),
        Value::Number(n) => Decimal::from_str(&n.to_string()),
        other => return Err(invalid(method, format!("amount must be a string or number, got {other}"))),
    }
    .map_err(|e| invalid(method, format!("invalid amount: {e}")))?;

    Ok(TransactionPayload {
        to: raw.to,
        amount,
        token_ref: raw.token_ref,
    })
}
