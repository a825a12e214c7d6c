//! Logic behind the approval surface, shared by every request kind.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::broker::{
    AccountError, AccountManager, ApprovalResult, ApprovalWindowOrchestrator, Origin,
    PendingRequest, PendingRequestStore, RequestKind, RequestOutcome, RequestPayload,
    SiteTrustRegistry, WindowId,
};
use crate::db::ResolveStatus;
use crate::error::BrokerError;

const DEFAULT_REJECT_REASON: &str = "User rejected the request.";

/// One labelled line on the approval screen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ViewField {
    pub label: String,
    pub value: String,
}

impl ViewField {
    fn new(label: &str, value: impl Into<String>) -> Self {
        Self {
            label: label.to_string(),
            value: value.into(),
        }
    }
}

/// Render-ready description of a pending request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApprovalView {
    pub request_id: Uuid,
    pub kind: RequestKind,
    pub origin: Origin,
    pub title: String,
    pub details: Vec<ViewField>,
    pub opened_at: DateTime<Utc>,
}

impl ApprovalView {
    fn render(request: &PendingRequest) -> Self {
        let origin = request.origin.to_string();
        let host = request.origin.host();
        let (title, details) = match &request.payload {
            RequestPayload::Connection => (
                format!("{host} wants to connect"),
                vec![
                    ViewField::new("Site", &origin),
                    ViewField::new("Access", "View your account address"),
                ],
            ),
            RequestPayload::Transaction(tx) => {
                let asset = tx.token_ref.clone().unwrap_or_else(|| "native".to_string());
                (
                    format!("{host} wants to send {} {asset}", tx.amount),
                    vec![
                        ViewField::new("Site", &origin),
                        ViewField::new("To", &tx.to),
                        ViewField::new("Amount", tx.amount.to_string()),
                        ViewField::new("Asset", asset),
                    ],
                )
            }
            RequestPayload::Signature { message } => (
                format!("{host} wants you to sign a message"),
                vec![
                    ViewField::new("Site", &origin),
                    ViewField::new("Message", message),
                ],
            ),
        };
        Self {
            request_id: request.request_id,
            kind: request.kind,
            origin: request.origin.clone(),
            title,
            details,
            opened_at: request.opened_at,
        }
    }
}

/// What the surface shows when it loads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ApprovalScreen {
    /// The request expired or was consumed before the surface loaded.
    NoPendingRequest,
    Pending(ApprovalView),
}

/// The operator's choice.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum Decision {
    Approve,
    Reject {
        #[serde(default)]
        reason: Option<String>,
    },
}

/// Result of [`ApprovalController::decide`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DecisionOutcome {
    /// The outcome was written; the caller will receive it.
    Recorded { outcome: RequestOutcome },
    /// Another party (timeout, window close) settled the request first.
    AlreadySettled { outcome: RequestOutcome },
    NoPendingRequest,
}

/// Reads the pending request for its kind and writes the operator's decision.
pub struct ApprovalController {
    pending: Arc<PendingRequestStore>,
    registry: Arc<SiteTrustRegistry>,
    windows: Arc<ApprovalWindowOrchestrator>,
    accounts: Arc<dyn AccountManager>,
}

impl ApprovalController {
    pub fn new(
        pending: Arc<PendingRequestStore>,
        registry: Arc<SiteTrustRegistry>,
        windows: Arc<ApprovalWindowOrchestrator>,
        accounts: Arc<dyn AccountManager>,
    ) -> Self {
        Self {
            pending,
            registry,
            windows,
            accounts,
        }
    }

    pub async fn load(&self, kind: RequestKind) -> Result<ApprovalScreen, BrokerError> {
        match self.pending.peek(kind).await? {
            Some(request) if request.is_open() => Ok(ApprovalScreen::Pending(ApprovalView::render(&request))),
            _ => Ok(ApprovalScreen::NoPendingRequest),
        }
    }

    /// Like [`load`](Self::load), but only for the surface that was opened
    /// for the current request. A stale surface left over from an earlier
    /// request of the same kind sees `NoPendingRequest`.
    pub async fn load_for_window(
        &self,
        kind: RequestKind,
        window_id: WindowId,
    ) -> Result<ApprovalScreen, BrokerError> {
        let Some(handle) = self
            .windows
            .handle_for(kind)
            .await?
            .filter(|h| h.window_id == window_id)
        else {
            return Ok(ApprovalScreen::NoPendingRequest);
        };
        match self.pending.peek(kind).await? {
            Some(request) if request.is_open() && request.request_id == handle.request_id => {
                Ok(ApprovalScreen::Pending(ApprovalView::render(&request)))
            }
            _ => Ok(ApprovalScreen::NoPendingRequest),
        }
    }

    /// Apply the operator's decision to `request_id`.
    ///
    /// On approval the privileged action runs first; its failure is written
    /// as a rejection so the request never stays unresolved. A connecting
    /// site is trusted only once its approval is the outcome on record. The
    /// surface for the request is closed once an outcome is written.
    pub async fn decide(
        &self,
        kind: RequestKind,
        request_id: Uuid,
        decision: Decision,
    ) -> Result<DecisionOutcome, BrokerError> {
        let request = match self.pending.peek(kind).await? {
            Some(request) if request.request_id == request_id => request,
            _ => return Ok(DecisionOutcome::NoPendingRequest),
        };
        if let Some(outcome) = request.outcome {
            return Ok(DecisionOutcome::AlreadySettled { outcome });
        }

        let outcome = match decision {
            Decision::Reject { reason } => RequestOutcome::rejected_by_user(
                reason
                    .filter(|r| !r.trim().is_empty())
                    .unwrap_or_else(|| DEFAULT_REJECT_REASON.to_string()),
            ),
            Decision::Approve => match self.perform(&request).await {
                Ok(result) => RequestOutcome::approved(result),
                Err(e) => {
                    tracing::warn!(%kind, %request_id, "Privileged action failed: {}", e);
                    RequestOutcome::action_failed(e.to_string())
                }
            },
        };

        let decided = match self
            .pending
            .resolve_request(kind, request_id, outcome.clone())
            .await?
        {
            ResolveStatus::Written => {
                self.trust_connected_site(&request, &outcome).await;
                DecisionOutcome::Recorded { outcome }
            }
            ResolveStatus::AlreadyResolved(existing) => {
                if matches!(outcome, RequestOutcome::Approved { .. }) {
                    tracing::warn!(
                        %kind,
                        %request_id,
                        existing = existing.label(),
                        "Action performed but the request was settled first"
                    );
                }
                DecisionOutcome::AlreadySettled { outcome: existing }
            }
            ResolveStatus::NoPendingRequest => return Ok(DecisionOutcome::NoPendingRequest),
        };

        self.windows.close(kind, request_id).await?;
        Ok(decided)
    }

    /// Only account-layer errors come out of here; their text is what the
    /// website sees as the rejection reason.
    async fn perform(&self, request: &PendingRequest) -> Result<ApprovalResult, AccountError> {
        match &request.payload {
            RequestPayload::Connection => {
                let address = self.accounts.active_address().await?;
                Ok(ApprovalResult::Accounts {
                    addresses: vec![address],
                })
            }
            RequestPayload::Transaction(tx) => {
                let hash = self.accounts.submit_transaction(tx).await?;
                Ok(ApprovalResult::TransactionHash { hash })
            }
            RequestPayload::Signature { message } => {
                let signature = self.accounts.sign_message(message).await?;
                Ok(ApprovalResult::Signature { signature })
            }
        }
    }

    /// The approval is already delivered at this point, so a failed trust
    /// write is logged rather than surfaced; the site is prompted again on
    /// its next connect.
    async fn trust_connected_site(&self, request: &PendingRequest, outcome: &RequestOutcome) {
        let RequestOutcome::Approved {
            result: ApprovalResult::Accounts { addresses },
        } = outcome
        else {
            return;
        };
        let Some(address) = addresses.first() else {
            return;
        };
        if let Err(e) = self.registry.upsert(&request.origin, address).await {
            tracing::error!(
                origin = %request.origin,
                request_id = %request.request_id,
                "Failed to record site trust: {}",
                e
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use rust_decimal::Decimal;

    use crate::broker::{
        AccountError, DevAccountManager, HeadlessWindowHost, TransactionPayload,
    };
    use crate::db::Database;
    use crate::db::libsql::LibSqlBackend;
    use crate::db::libsql::test_support::temp_backend;

    use super::*;

    /// Account manager that fails every privileged call and counts attempts.
    #[derive(Default)]
    struct BrokenAccounts {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl AccountManager for BrokenAccounts {
        async fn active_address(&self) -> Result<String, AccountError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(AccountError::Locked)
        }

        async fn submit_transaction(&self, _payload: &TransactionPayload) -> Result<String, AccountError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(AccountError::Failed("nonce too low".to_string()))
        }

        async fn sign_message(&self, _message: &str) -> Result<String, AccountError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(AccountError::Locked)
        }
    }

    /// Hands out an address, but only after the request has already
    /// expired underneath the controller.
    struct ExpiringAccounts {
        pending: Arc<PendingRequestStore>,
    }

    #[async_trait]
    impl AccountManager for ExpiringAccounts {
        async fn active_address(&self) -> Result<String, AccountError> {
            self.pending
                .resolve(RequestKind::Connection, RequestOutcome::Expired)
                .await
                .unwrap();
            Ok("addr1".to_string())
        }

        async fn submit_transaction(&self, _payload: &TransactionPayload) -> Result<String, AccountError> {
            Err(AccountError::Locked)
        }

        async fn sign_message(&self, _message: &str) -> Result<String, AccountError> {
            Err(AccountError::Locked)
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        backend: LibSqlBackend,
        pending: Arc<PendingRequestStore>,
        registry: Arc<SiteTrustRegistry>,
        windows: Arc<ApprovalWindowOrchestrator>,
        host: Arc<HeadlessWindowHost>,
    }

    async fn fixture() -> Fixture {
        let (dir, backend) = temp_backend().await;
        let store: Arc<dyn Database> = Arc::new(backend.clone());
        let host = Arc::new(HeadlessWindowHost::new());
        Fixture {
            _dir: dir,
            backend,
            pending: Arc::new(PendingRequestStore::new(
                store.clone(),
                Duration::from_secs(60),
                Duration::from_secs(5),
            )),
            registry: Arc::new(SiteTrustRegistry::new(store.clone())),
            windows: Arc::new(ApprovalWindowOrchestrator::new(
                store,
                host.clone(),
                "http://localhost:7420",
                400,
                600,
            )),
            host,
        }
    }

    impl Fixture {
        fn controller(&self, accounts: Arc<dyn AccountManager>) -> ApprovalController {
            ApprovalController::new(
                self.pending.clone(),
                self.registry.clone(),
                self.windows.clone(),
                accounts,
            )
        }

        async fn open(&self, payload: RequestPayload) -> PendingRequest {
            let request = PendingRequest::new(Origin::parse("https://a.example").unwrap(), 5, payload);
            self.pending.open(&request).await.unwrap();
            self.windows.open(request.kind, &request).await.unwrap();
            request
        }
    }

    fn dev_accounts() -> Arc<dyn AccountManager> {
        Arc::new(DevAccountManager::new("addr1", Decimal::new(100, 0)))
    }

    #[tokio::test]
    async fn load_without_request_shows_terminal_state() {
        let f = fixture().await;
        let controller = f.controller(dev_accounts());
        assert_eq!(
            controller.load(RequestKind::Transaction).await.unwrap(),
            ApprovalScreen::NoPendingRequest
        );
    }

    #[tokio::test]
    async fn load_renders_transaction_details() {
        let f = fixture().await;
        f.open(RequestPayload::Transaction(TransactionPayload {
            to: "addr2".to_string(),
            amount: Decimal::new(5, 0),
            token_ref: None,
        }))
        .await;

        let ApprovalScreen::Pending(view) = f.controller(dev_accounts()).load(RequestKind::Transaction).await.unwrap()
        else {
            panic!("expected a pending request");
        };
        assert_eq!(view.title, "a.example wants to send 5 native");
        assert!(view.details.contains(&ViewField::new("Site", "https://a.example")));
        assert!(view.details.contains(&ViewField::new("To", "addr2")));
    }

    #[tokio::test]
    async fn load_for_window_ignores_stale_surfaces() {
        let f = fixture().await;
        let first = f.open(RequestPayload::Connection).await;
        let stale_window = f.host.opened()[0].window_id;
        f.pending
            .resolve(RequestKind::Connection, RequestOutcome::Expired)
            .await
            .unwrap();
        f.pending
            .take_outcome(RequestKind::Connection, first.request_id)
            .await
            .unwrap();

        let second = f.open(RequestPayload::Connection).await;
        let current_window = f.host.opened()[1].window_id;
        let controller = f.controller(dev_accounts());

        assert_eq!(
            controller
                .load_for_window(RequestKind::Connection, stale_window)
                .await
                .unwrap(),
            ApprovalScreen::NoPendingRequest
        );
        let ApprovalScreen::Pending(view) = controller
            .load_for_window(RequestKind::Connection, current_window)
            .await
            .unwrap()
        else {
            panic!("expected the current surface to see its request");
        };
        assert_eq!(view.request_id, second.request_id);
        assert_eq!(
            controller
                .load_for_window(RequestKind::Connection, WindowId::new())
                .await
                .unwrap(),
            ApprovalScreen::NoPendingRequest
        );
    }

    #[tokio::test]
    async fn approving_connection_trusts_the_site() {
        let f = fixture().await;
        let request = f.open(RequestPayload::Connection).await;
        let window_id = f.host.opened()[0].window_id;

        let decided = f
            .controller(dev_accounts())
            .decide(RequestKind::Connection, request.request_id, Decision::Approve)
            .await
            .unwrap();

        assert_eq!(
            decided,
            DecisionOutcome::Recorded {
                outcome: RequestOutcome::approved(ApprovalResult::Accounts {
                    addresses: vec!["addr1".to_string()]
                })
            }
        );
        let entry = f.registry.lookup(&request.origin).await.unwrap().unwrap();
        assert_eq!(entry.account_address, "addr1");
        assert!(!f.host.is_live(window_id));
    }

    #[tokio::test]
    async fn connection_settled_mid_action_leaves_site_untrusted() {
        let f = fixture().await;
        let request = f.open(RequestPayload::Connection).await;
        let accounts = Arc::new(ExpiringAccounts {
            pending: f.pending.clone(),
        });

        let decided = f
            .controller(accounts)
            .decide(RequestKind::Connection, request.request_id, Decision::Approve)
            .await
            .unwrap();

        assert_eq!(
            decided,
            DecisionOutcome::AlreadySettled {
                outcome: RequestOutcome::Expired
            }
        );
        assert!(f.registry.lookup(&request.origin).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn trust_write_failure_keeps_approval_and_hides_store_detail() {
        let f = fixture().await;
        let request = f.open(RequestPayload::Connection).await;
        let conn = f.backend.connect().await.unwrap();
        conn.execute("DROP TABLE site_trust", ()).await.unwrap();

        let decided = f
            .controller(dev_accounts())
            .decide(RequestKind::Connection, request.request_id, Decision::Approve)
            .await
            .unwrap();

        let approved = RequestOutcome::approved(ApprovalResult::Accounts {
            addresses: vec!["addr1".to_string()],
        });
        assert_eq!(
            decided,
            DecisionOutcome::Recorded {
                outcome: approved.clone()
            }
        );
        let stored = f.pending.peek(RequestKind::Connection).await.unwrap().unwrap();
        assert_eq!(stored.outcome, Some(approved));
    }

    #[tokio::test]
    async fn reject_uses_default_reason() {
        let f = fixture().await;
        let request = f
            .open(RequestPayload::Signature {
                message: "gm".to_string(),
            })
            .await;

        let decided = f
            .controller(dev_accounts())
            .decide(
                RequestKind::Signature,
                request.request_id,
                Decision::Reject { reason: None },
            )
            .await
            .unwrap();
        assert_eq!(
            decided,
            DecisionOutcome::Recorded {
                outcome: RequestOutcome::rejected_by_user(DEFAULT_REJECT_REASON)
            }
        );
    }

    #[tokio::test]
    async fn failed_action_is_written_as_rejection() {
        let f = fixture().await;
        let request = f
            .open(RequestPayload::Transaction(TransactionPayload {
                to: "addr2".to_string(),
                amount: Decimal::new(5, 0),
                token_ref: None,
            }))
            .await;

        let decided = f
            .controller(Arc::new(BrokenAccounts::default()))
            .decide(RequestKind::Transaction, request.request_id, Decision::Approve)
            .await
            .unwrap();

        let DecisionOutcome::Recorded { outcome } = decided else {
            panic!("expected the failure to be recorded");
        };
        assert_eq!(outcome.label(), "action_failed");
        let RequestOutcome::Rejected { reason, .. } = &outcome else {
            panic!("expected a rejection");
        };
        assert_eq!(reason, &AccountError::Failed("nonce too low".to_string()).to_string());
        let stored = f.pending.peek(RequestKind::Transaction).await.unwrap().unwrap();
        assert_eq!(stored.outcome, Some(outcome));
    }

    #[tokio::test]
    async fn stale_decision_performs_no_action() {
        let f = fixture().await;
        let request = f.open(RequestPayload::Connection).await;
        f.pending
            .resolve(RequestKind::Connection, RequestOutcome::Expired)
            .await
            .unwrap();

        let accounts = Arc::new(BrokenAccounts::default());
        let controller = f.controller(accounts.clone());

        let decided = controller
            .decide(RequestKind::Connection, request.request_id, Decision::Approve)
            .await
            .unwrap();
        assert_eq!(
            decided,
            DecisionOutcome::AlreadySettled {
                outcome: RequestOutcome::Expired
            }
        );

        let decided = controller
            .decide(RequestKind::Connection, Uuid::new_v4(), Decision::Approve)
            .await
            .unwrap();
        assert_eq!(decided, DecisionOutcome::NoPendingRequest);
        assert_eq!(accounts.calls.load(Ordering::SeqCst), 0);
    }
}
