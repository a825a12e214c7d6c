//! Single-slot-per-kind pending request store.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use uuid::Uuid;

use crate::broker::{PendingRequest, RequestKind, RequestOutcome, timestamp_now};
use crate::db::{Database, ResolveStatus, StaleCutoffs};
use crate::error::{BrokerError, DatabaseError};

/// Durable holder of the one in-flight request per [`RequestKind`].
///
/// This is the only channel between the background poller and the approval
/// surface, so nothing is kept in memory between calls.
#[derive(Clone)]
pub struct PendingRequestStore {
    store: Arc<dyn Database>,
    request_timeout: Duration,
    orphan_grace: Duration,
}

impl PendingRequestStore {
    pub fn new(store: Arc<dyn Database>, request_timeout: Duration, orphan_grace: Duration) -> Self {
        Self {
            store,
            request_timeout,
            orphan_grace,
        }
    }

    /// Occupy the slot for the request's kind.
    ///
    /// Fails with [`BrokerError::RequestAlreadyPending`] while another
    /// request of the same kind is in flight. A slot left behind by a
    /// restarted poller (unresolved past timeout + grace, or resolved and
    /// never consumed within the grace) is reclaimed instead.
    pub async fn open(&self, request: &PendingRequest) -> Result<(), BrokerError> {
        let cutoffs = self.cutoffs(timestamp_now());
        match self.store.insert_pending(request, cutoffs).await {
            Ok(reclaimed) => {
                if let Some(stale) = reclaimed {
                    tracing::warn!(
                        kind = %request.kind,
                        stale_request = %stale.request_id,
                        stale_origin = %stale.origin,
                        "Reclaimed orphaned pending slot"
                    );
                }
                tracing::debug!(
                    kind = %request.kind,
                    request_id = %request.request_id,
                    origin = %request.origin,
                    "Pending slot opened"
                );
                Ok(())
            }
            Err(DatabaseError::SlotOccupied { kind, request_id }) => {
                tracing::info!(%kind, occupied_by = %request_id, origin = %request.origin, "Slot busy");
                Err(BrokerError::RequestAlreadyPending { kind })
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn peek(&self, kind: RequestKind) -> Result<Option<PendingRequest>, BrokerError> {
        Ok(self.store.get_pending(kind).await?)
    }

    /// Every occupied slot.
    pub async fn list(&self) -> Result<Vec<PendingRequest>, BrokerError> {
        Ok(self.store.list_pending().await?)
    }

    /// Attach `outcome` to whatever request occupies the slot.
    ///
    /// Idempotent: an empty or already-resolved slot is left untouched and
    /// reported through the returned status, never as an error.
    pub async fn resolve(
        &self,
        kind: RequestKind,
        outcome: RequestOutcome,
    ) -> Result<ResolveStatus, BrokerError> {
        self.write_outcome(kind, None, outcome).await
    }

    /// Like [`resolve`](Self::resolve), but only if the slot still holds
    /// `request_id`.
    pub async fn resolve_request(
        &self,
        kind: RequestKind,
        request_id: Uuid,
        outcome: RequestOutcome,
    ) -> Result<ResolveStatus, BrokerError> {
        self.write_outcome(kind, Some(request_id), outcome).await
    }

    async fn write_outcome(
        &self,
        kind: RequestKind,
        request_id: Option<Uuid>,
        outcome: RequestOutcome,
    ) -> Result<ResolveStatus, BrokerError> {
        let status = self
            .store
            .set_outcome(kind, request_id, &outcome, timestamp_now())
            .await?;
        match &status {
            ResolveStatus::Written => {
                tracing::info!(%kind, outcome = outcome.label(), "Pending request resolved");
            }
            ResolveStatus::AlreadyResolved(existing) => {
                tracing::debug!(
                    %kind,
                    ignored = outcome.label(),
                    existing = existing.label(),
                    "Slot already resolved"
                );
            }
            ResolveStatus::NoPendingRequest => {
                tracing::debug!(%kind, ignored = outcome.label(), "No pending request to resolve");
            }
        }
        Ok(status)
    }

    /// Consume a resolved request: the slot and its window handle are
    /// removed in the same step that hands back the outcome.
    pub async fn take_outcome(
        &self,
        kind: RequestKind,
        request_id: Uuid,
    ) -> Result<Option<RequestOutcome>, BrokerError> {
        Ok(self.store.take_outcome(kind, request_id).await?)
    }

    /// Empty the slot regardless of its state.
    pub async fn clear(&self, kind: RequestKind) -> Result<Option<PendingRequest>, BrokerError> {
        let removed = self.store.delete_pending(kind).await?;
        if let Some(request) = &removed {
            tracing::info!(%kind, request_id = %request.request_id, "Pending slot cleared");
        }
        Ok(removed)
    }

    /// Remove every orphaned slot. Run once before serving traffic.
    pub async fn sweep_stale(&self) -> Result<Vec<PendingRequest>, BrokerError> {
        let swept = self.store.sweep_stale(self.cutoffs(timestamp_now())).await?;
        for request in &swept {
            tracing::warn!(
                kind = %request.kind,
                request_id = %request.request_id,
                origin = %request.origin,
                resolved = request.outcome.is_some(),
                "Swept orphaned pending slot"
            );
        }
        Ok(swept)
    }

    /// Whether `request` would be reclaimed by the next `open` or sweep.
    pub fn is_stale(&self, request: &PendingRequest) -> bool {
        self.cutoffs(timestamp_now()).is_stale(request)
    }

    fn cutoffs(&self, now: DateTime<Utc>) -> StaleCutoffs {
        let grace = to_delta(self.orphan_grace);
        StaleCutoffs {
            unresolved_before: sub_or_min(now, to_delta(self.request_timeout) + grace),
            resolved_before: sub_or_min(now, grace),
        }
    }
}

fn to_delta(duration: Duration) -> TimeDelta {
    TimeDelta::from_std(duration).unwrap_or(TimeDelta::days(365))
}

fn sub_or_min(now: DateTime<Utc>, delta: TimeDelta) -> DateTime<Utc> {
    now.checked_sub_signed(delta).unwrap_or(DateTime::<Utc>::MIN_UTC)
}
