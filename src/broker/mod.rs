//! Cross-context approval broker.
//!
//! A website, the privileged background, and the approval surface never
//! share memory. They meet only in the durable store:
//!
//! ```text
//!   website ──► RequestIngress ──┬─► SiteTrustRegistry (fast path)
//!                                │
//!                                └─► PendingRequestStore ◄── ApprovalController
//!                                    + ApprovalWindowOrchestrator     (surface)
//!                                          │
//!                                          ▼
//!                                  ResolutionPoller ──► reply to website
//! ```

mod account;
mod controller;
mod ingress;
mod notify;
mod origin;
mod pending;
mod poller;
mod registry;
mod types;
mod window;

use std::sync::Arc;

pub use account::{AccountError, AccountManager, BalanceSource, DevAccountManager};
pub use controller::{ApprovalController, ApprovalScreen, ApprovalView, Decision, DecisionOutcome, ViewField};
pub use ingress::{BridgeMethod, RequestIngress};
pub use notify::{BroadcastNotifier, TabNotifier};
pub use origin::{Origin, OriginError};
pub use pending::PendingRequestStore;
pub use poller::ResolutionPoller;
pub use registry::SiteTrustRegistry;
pub use types::{
    ApprovalResult, ApprovalWindowHandle, BridgeEvent, PendingRequest, RejectionCause,
    RequestKind, RequestOutcome, RequestPayload, SiteTrustEntry, TabEvent, TabId,
    TransactionPayload, WindowId, timestamp_now,
};
pub use window::{ApprovalWindowOrchestrator, BrowserWindowHost, HeadlessWindowHost, WindowHost, WindowSpec};

use crate::config::BrokerConfig;
use crate::db::Database;

/// Collaborators the broker does not own.
pub struct BrokerDeps {
    pub store: Arc<dyn Database>,
    pub window_host: Arc<dyn WindowHost>,
    pub accounts: Arc<dyn AccountManager>,
    pub balances: Arc<dyn BalanceSource>,
    pub notifier: Arc<BroadcastNotifier>,
}

/// Every broker component, wired against one store.
#[derive(Clone)]
pub struct Broker {
    pub registry: Arc<SiteTrustRegistry>,
    pub pending: Arc<PendingRequestStore>,
    pub windows: Arc<ApprovalWindowOrchestrator>,
    pub ingress: Arc<RequestIngress>,
    pub controller: Arc<ApprovalController>,
    pub notifier: Arc<BroadcastNotifier>,
}

impl Broker {
    /// `approval_base_url` is where approval surfaces load the gateway from;
    /// `approval_token` is handed to them so they can call it back.
    pub fn new(
        config: &BrokerConfig,
        approval_base_url: &str,
        approval_token: Option<&str>,
        deps: BrokerDeps,
    ) -> Self {
        let registry = Arc::new(SiteTrustRegistry::new(deps.store.clone()));
        let pending = Arc::new(PendingRequestStore::new(
            deps.store.clone(),
            config.request_timeout,
            config.orphan_grace,
        ));
        let mut windows = ApprovalWindowOrchestrator::new(
            deps.store,
            deps.window_host,
            approval_base_url,
            config.window_width,
            config.window_height,
        );
        if let Some(token) = approval_token {
            windows = windows.with_access_token(token);
        }
        let windows = Arc::new(windows);
        let poller = Arc::new(ResolutionPoller::new(
            pending.clone(),
            windows.clone(),
            config.poll_interval,
            config.request_timeout,
        ));
        let notifier_dyn: Arc<dyn TabNotifier> = deps.notifier.clone();
        let ingress = Arc::new(RequestIngress::new(
            registry.clone(),
            pending.clone(),
            windows.clone(),
            poller,
            deps.balances,
            notifier_dyn,
        ));
        let controller = Arc::new(ApprovalController::new(
            pending.clone(),
            registry.clone(),
            windows.clone(),
            deps.accounts,
        ));

        Self {
            registry,
            pending,
            windows,
            ingress,
            controller,
            notifier: deps.notifier,
        }
    }

    /// Revoke a site from the operator side and tell all its tabs.
    pub async fn revoke_site(&self, origin: &Origin) -> Result<bool, crate::error::BrokerError> {
        let removed = self.registry.remove(origin).await?;
        if removed {
            self.notifier.notify_tab(origin, None, TabEvent::Disconnected);
        }
        Ok(removed)
    }
}
