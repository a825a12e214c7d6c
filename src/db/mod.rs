//! Durable store abstraction.
//!
//! The store is the only channel between the bridge, the background poller
//! and the approval surface. Every trait method re-reads persisted state;
//! implementations must not cache rows across calls.

pub mod libsql;
pub(crate) mod libsql_migrations;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::broker::{
    ApprovalWindowHandle, Origin, PendingRequest, RequestKind, RequestOutcome, SiteTrustEntry,
    WindowId,
};
use crate::config::DatabaseConfig;
use crate::error::DatabaseError;

/// Result of writing an outcome into a slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolveStatus {
    /// The outcome was recorded.
    Written,
    /// The slot already carried an outcome; it was left untouched.
    AlreadyResolved(RequestOutcome),
    /// The slot is empty or holds a different request.
    NoPendingRequest,
}

/// What happened when a window-closed notification was applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WindowClosed {
    /// No stored handle has this id (already consumed, or never ours).
    Unknown,
    /// The request was still open and is now `Abandoned`.
    Abandoned(ApprovalWindowHandle),
    /// The request had already been decided or consumed; only the handle was dropped.
    AlreadySettled(ApprovalWindowHandle),
}

/// Cutoffs after which a slot is considered orphaned.
///
/// A slot is stale when it is still unresolved but was opened before
/// `unresolved_before`, or when it carries an outcome that nobody consumed
/// since `resolved_before`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StaleCutoffs {
    pub unresolved_before: DateTime<Utc>,
    pub resolved_before: DateTime<Utc>,
}

impl StaleCutoffs {
    pub fn is_stale(&self, request: &PendingRequest) -> bool {
        match request.resolved_at {
            Some(resolved_at) if request.outcome.is_some() => resolved_at < self.resolved_before,
            _ => request.opened_at < self.unresolved_before,
        }
    }
}

/// Persistence for the site trust registry.
#[async_trait]
pub trait TrustStore: Send + Sync {
    async fn get_site(&self, origin: &Origin) -> Result<Option<SiteTrustEntry>, DatabaseError>;

    /// Insert or update the entry, keeping `connected_at` of an existing row.
    async fn upsert_site(
        &self,
        origin: &Origin,
        account_address: &str,
        now: DateTime<Utc>,
    ) -> Result<SiteTrustEntry, DatabaseError>;

    /// Bump `last_used_at`. Returns false when no entry exists.
    async fn touch_site(&self, origin: &Origin, now: DateTime<Utc>) -> Result<bool, DatabaseError>;

    /// Returns false when no entry existed.
    async fn delete_site(&self, origin: &Origin) -> Result<bool, DatabaseError>;

    /// All entries, oldest connection first.
    async fn list_sites(&self) -> Result<Vec<SiteTrustEntry>, DatabaseError>;
}

/// Persistence for the single-slot-per-kind pending request store.
#[async_trait]
pub trait PendingStore: Send + Sync {
    /// Occupy the slot for `request.kind`, reclaiming it first if the current
    /// occupant is stale under `cutoffs`. Fails with
    /// [`DatabaseError::SlotOccupied`] otherwise.
    ///
    /// Returns the reclaimed occupant, if any.
    async fn insert_pending(
        &self,
        request: &PendingRequest,
        cutoffs: StaleCutoffs,
    ) -> Result<Option<PendingRequest>, DatabaseError>;

    async fn get_pending(&self, kind: RequestKind) -> Result<Option<PendingRequest>, DatabaseError>;

    async fn list_pending(&self) -> Result<Vec<PendingRequest>, DatabaseError>;

    /// Compare-and-set the outcome: only written when the slot holds a
    /// request (matching `request_id` when given) with no outcome yet.
    async fn set_outcome(
        &self,
        kind: RequestKind,
        request_id: Option<Uuid>,
        outcome: &RequestOutcome,
        now: DateTime<Utc>,
    ) -> Result<ResolveStatus, DatabaseError>;

    /// Atomically remove a resolved slot and its window handle, returning
    /// the outcome. `None` when the slot is empty, holds another request, or
    /// is still unresolved.
    async fn take_outcome(
        &self,
        kind: RequestKind,
        request_id: Uuid,
    ) -> Result<Option<RequestOutcome>, DatabaseError>;

    /// Unconditionally empty the slot and drop its window handle.
    async fn delete_pending(&self, kind: RequestKind) -> Result<Option<PendingRequest>, DatabaseError>;

    /// Remove every stale slot (and window handle), returning what was removed.
    async fn sweep_stale(&self, cutoffs: StaleCutoffs) -> Result<Vec<PendingRequest>, DatabaseError>;
}

/// Persistence for approval window handles.
#[async_trait]
pub trait WindowStore: Send + Sync {
    /// Store the handle for `handle.kind`, replacing any previous one.
    async fn put_window(&self, handle: &ApprovalWindowHandle) -> Result<(), DatabaseError>;

    async fn get_window(&self, kind: RequestKind) -> Result<Option<ApprovalWindowHandle>, DatabaseError>;

    async fn find_window(&self, window_id: WindowId) -> Result<Option<ApprovalWindowHandle>, DatabaseError>;

    async fn delete_window(&self, window_id: WindowId) -> Result<bool, DatabaseError>;

    /// Apply a window-closed notification in one step: if the handle's
    /// request is still open write `Abandoned`, then drop the handle.
    async fn close_window(
        &self,
        window_id: WindowId,
        now: DateTime<Utc>,
    ) -> Result<WindowClosed, DatabaseError>;
}

/// Backend-agnostic database handle used by the broker.
#[async_trait]
pub trait Database: TrustStore + PendingStore + WindowStore + Send + Sync {
    /// Run schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;
}

/// Open the configured backend and run migrations.
pub async fn connect_from_config(config: &DatabaseConfig) -> Result<Arc<dyn Database>, DatabaseError> {
    let backend = match (&config.libsql_url, &config.libsql_auth_token) {
        (Some(url), Some(token)) => {
            use secrecy::ExposeSecret;
            tracing::info!(path = %config.libsql_path.display(), %url, "Opening libSQL embedded replica");
            self::libsql::LibSqlBackend::new_remote_replica(&config.libsql_path, url, token.expose_secret())
                .await?
        }
        _ => {
            tracing::info!(path = %config.libsql_path.display(), "Opening local libSQL database");
            self::libsql::LibSqlBackend::new_local(&config.libsql_path).await?
        }
    };
    backend.run_migrations().await?;
    Ok(Arc::new(backend))
}
