//! Approval window lifecycle.
//!
//! The orchestrator persists a handle for every surface it opens and turns a
//! "closed without deciding" notification into an `Abandoned` outcome. The
//! actual surface is produced by a [`WindowHost`]:
//!
//! ```text
//!   open(kind, request)
//!        │ put_window(handle)
//!        ▼
//!   WindowHost::open(spec) ──► surface ──► POST /approval/windows/{id}/closed
//!                                              │
//!                                              ▼
//!                                       on_closed(window_id)
//! ```

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use uuid::Uuid;

use crate::broker::{ApprovalWindowHandle, PendingRequest, RequestKind, WindowId, timestamp_now};
use crate::db::{Database, WindowClosed};
use crate::error::BrokerError;

/// What a host needs to put a surface on screen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowSpec {
    pub window_id: WindowId,
    pub kind: RequestKind,
    pub url: String,
    pub width: u32,
    pub height: u32,
}

/// Something that can show and dismiss approval surfaces.
#[async_trait]
pub trait WindowHost: Send + Sync {
    async fn open(&self, spec: &WindowSpec) -> Result<(), BrokerError>;

    /// Best effort. A surface that is already gone is not an error.
    async fn close(&self, window_id: WindowId) -> Result<(), BrokerError>;
}

/// Opens the approval page in the operator's default browser.
///
/// Browsers give no handle back, so `close` only logs; the page reports
/// its own closure through the gateway.
pub struct BrowserWindowHost;

#[async_trait]
impl WindowHost for BrowserWindowHost {
    async fn open(&self, spec: &WindowSpec) -> Result<(), BrokerError> {
        open::that_detached(&spec.url).map_err(|e| BrokerError::Window {
            reason: format!("failed to launch browser for {}: {}", spec.url, e),
        })?;
        tracing::info!(window_id = %spec.window_id, kind = %spec.kind, "Approval page opened in browser");
        Ok(())
    }

    async fn close(&self, window_id: WindowId) -> Result<(), BrokerError> {
        tracing::debug!(%window_id, "Browser approval page left open; it closes itself after deciding");
        Ok(())
    }
}

/// Records surfaces instead of showing them.
///
/// Used when the operator drives approvals through the gateway API directly,
/// and by tests.
#[derive(Default)]
pub struct HeadlessWindowHost {
    opened: Mutex<Vec<WindowSpec>>,
    live: Mutex<HashSet<WindowId>>,
}

impl HeadlessWindowHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every surface ever opened, in order.
    pub fn opened(&self) -> Vec<WindowSpec> {
        self.opened.lock().map(|o| o.clone()).unwrap_or_default()
    }

    /// Whether `window_id` was opened and not closed since.
    pub fn is_live(&self, window_id: WindowId) -> bool {
        self.live
            .lock()
            .map(|live| live.contains(&window_id))
            .unwrap_or(false)
    }
}

#[async_trait]
impl WindowHost for HeadlessWindowHost {
    async fn open(&self, spec: &WindowSpec) -> Result<(), BrokerError> {
        tracing::info!(window_id = %spec.window_id, kind = %spec.kind, url = %spec.url, "Approval surface ready");
        if let Ok(mut opened) = self.opened.lock() {
            opened.push(spec.clone());
        }
        if let Ok(mut live) = self.live.lock() {
            live.insert(spec.window_id);
        }
        Ok(())
    }

    async fn close(&self, window_id: WindowId) -> Result<(), BrokerError> {
        if let Ok(mut live) = self.live.lock() {
            live.remove(&window_id);
        }
        Ok(())
    }
}

/// Opens one fixed-size surface per pending request and watches it close.
pub struct ApprovalWindowOrchestrator {
    store: Arc<dyn Database>,
    host: Arc<dyn WindowHost>,
    base_url: String,
    access_token: Option<String>,
    width: u32,
    height: u32,
}

impl ApprovalWindowOrchestrator {
    pub fn new(
        store: Arc<dyn Database>,
        host: Arc<dyn WindowHost>,
        base_url: impl Into<String>,
        width: u32,
        height: u32,
    ) -> Self {
        Self {
            store,
            host,
            base_url: base_url.into(),
            access_token: None,
            width,
            height,
        }
    }

    /// Token the approval page presents back to the gateway.
    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    /// Page the surface loads for a kind.
    pub fn approval_url(&self, kind: RequestKind, window_id: WindowId) -> String {
        let mut url = format!(
            "{}/approve?kind={}&window_id={}",
            self.base_url.trim_end_matches('/'),
            kind,
            window_id
        );
        if let Some(token) = &self.access_token {
            url.push_str("&token=");
            url.push_str(&urlencoding::encode(token));
        }
        url
    }

    /// Show a surface for `request` and persist its handle.
    ///
    /// The handle is stored before the host is asked to open, so a surface
    /// that closes immediately still finds it.
    pub async fn open(
        &self,
        kind: RequestKind,
        request: &PendingRequest,
    ) -> Result<ApprovalWindowHandle, BrokerError> {
        let handle = ApprovalWindowHandle {
            window_id: WindowId::new(),
            kind,
            request_id: request.request_id,
            opened_for_tab_id: request.requester_tab_id,
            opened_at: timestamp_now(),
        };
        self.store.put_window(&handle).await?;

        let spec = WindowSpec {
            window_id: handle.window_id,
            kind,
            url: self.approval_url(kind, handle.window_id),
            width: self.width,
            height: self.height,
        };
        if let Err(e) = self.host.open(&spec).await {
            if let Err(cleanup) = self.store.delete_window(handle.window_id).await {
                tracing::warn!(window_id = %handle.window_id, "Failed to drop handle of unopened window: {}", cleanup);
            }
            return Err(e);
        }

        tracing::info!(
            %kind,
            window_id = %handle.window_id,
            request_id = %request.request_id,
            origin = %request.origin,
            "Approval window opened"
        );
        Ok(handle)
    }

    /// A surface closed. If it still owned an undecided request, that
    /// request becomes `Abandoned`.
    pub async fn on_closed(&self, window_id: WindowId) -> Result<WindowClosed, BrokerError> {
        let closed = self.store.close_window(window_id, timestamp_now()).await?;
        match &closed {
            WindowClosed::Abandoned(handle) => tracing::warn!(
                kind = %handle.kind,
                %window_id,
                request_id = %handle.request_id,
                "Approval window closed without a decision"
            ),
            WindowClosed::AlreadySettled(handle) => {
                tracing::debug!(kind = %handle.kind, %window_id, "Approval window closed after decision")
            }
            WindowClosed::Unknown => tracing::debug!(%window_id, "Close notification for unknown window"),
        }
        Ok(closed)
    }

    /// Stored handle for a kind, if a surface is open.
    pub async fn handle_for(&self, kind: RequestKind) -> Result<Option<ApprovalWindowHandle>, BrokerError> {
        Ok(self.store.get_window(kind).await?)
    }

    /// Close the surface showing `request_id`, if it is still the one on
    /// record for `kind`.
    pub async fn close(
        &self,
        kind: RequestKind,
        request_id: Uuid,
    ) -> Result<Option<ApprovalWindowHandle>, BrokerError> {
        let Some(handle) = self
            .handle_for(kind)
            .await?
            .filter(|h| h.request_id == request_id)
        else {
            return Ok(None);
        };
        self.store.delete_window(handle.window_id).await?;
        self.dismiss(&handle).await;
        Ok(Some(handle))
    }

    /// Ask the host to take a surface down without touching the store.
    pub async fn dismiss(&self, handle: &ApprovalWindowHandle) {
        if let Err(e) = self.host.close(handle.window_id).await {
            tracing::warn!(window_id = %handle.window_id, "Failed to close approval window: {}", e);
        } else {
            tracing::debug!(kind = %handle.kind, window_id = %handle.window_id, "Approval window closed");
        }
    }
}
