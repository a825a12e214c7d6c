//! Pending request slot persistence.
//!
//! One row per [`RequestKind`]; the primary key on `kind` is the
//! single-flight guarantee. All mutations run under `BEGIN IMMEDIATE` so the
//! read that decides what to write and the write itself cannot interleave
//! with another connection.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::Connection;
use uuid::Uuid;

use super::{
    LibSqlBackend, collect_rows, finish_tx, first_row, fmt_opt_ts, fmt_ts, get_i64, get_json,
    get_opt_text, get_opt_ts, get_text, get_ts, opt_text_owned, to_json,
};
use crate::broker::{Origin, PendingRequest, RequestKind, RequestOutcome};
use crate::db::{PendingStore, ResolveStatus, StaleCutoffs};
use crate::error::DatabaseError;

const PENDING_COLUMNS: &str =
    "request_id, kind, origin, requester_tab_id, payload, opened_at, outcome, resolved_at";

fn row_to_pending(row: &libsql::Row) -> Result<PendingRequest, DatabaseError> {
    let request_id = Uuid::parse_str(&get_text(row, 0))
        .map_err(|e| DatabaseError::Serialization(format!("request_id: {}", e)))?;
    let kind = get_text(row, 1)
        .parse::<RequestKind>()
        .map_err(DatabaseError::Serialization)?;
    let origin = Origin::parse(&get_text(row, 2))
        .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
    let outcome = match get_opt_text(row, 6) {
        Some(raw) if !raw.is_empty() => Some(
            serde_json::from_str::<RequestOutcome>(&raw)
                .map_err(|e| DatabaseError::Serialization(format!("outcome: {}", e)))?,
        ),
        _ => None,
    };

    Ok(PendingRequest {
        request_id,
        kind,
        origin,
        requester_tab_id: get_i64(row, 3),
        payload: get_json(row, 4)?,
        opened_at: get_ts(row, 5)?,
        outcome,
        resolved_at: get_opt_ts(row, 7)?,
    })
}

async fn select_slot(
    conn: &Connection,
    kind: RequestKind,
) -> Result<Option<PendingRequest>, DatabaseError> {
    let rows = conn
        .query(
            &format!("SELECT {PENDING_COLUMNS} FROM pending_requests WHERE kind = ?1"),
            libsql::params![kind.as_str()],
        )
        .await?;
    first_row(rows, row_to_pending).await
}

/// Drop the slot row and whatever window handle belongs to it.
async fn clear_slot(conn: &Connection, kind: RequestKind) -> Result<(), DatabaseError> {
    conn.execute(
        "DELETE FROM pending_requests WHERE kind = ?1",
        libsql::params![kind.as_str()],
    )
    .await?;
    conn.execute(
        "DELETE FROM approval_windows WHERE kind = ?1",
        libsql::params![kind.as_str()],
    )
    .await?;
    Ok(())
}

#[async_trait]
impl PendingStore for LibSqlBackend {
    async fn insert_pending(
        &self,
        request: &PendingRequest,
        cutoffs: StaleCutoffs,
    ) -> Result<Option<PendingRequest>, DatabaseError> {
        let conn = self.begin_immediate().await?;
        let result = async {
            let reclaimed = match select_slot(&conn, request.kind).await? {
                Some(existing) if cutoffs.is_stale(&existing) => {
                    clear_slot(&conn, request.kind).await?;
                    Some(existing)
                }
                Some(existing) => {
                    return Err(DatabaseError::SlotOccupied {
                        kind: request.kind,
                        request_id: existing.request_id,
                    });
                }
                None => None,
            };

            let outcome = request.outcome.as_ref().map(to_json).transpose()?;
            conn.execute(
                &format!(
                    "INSERT INTO pending_requests ({PENDING_COLUMNS}) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"
                ),
                libsql::params![
                    request.request_id.to_string(),
                    request.kind.as_str(),
                    request.origin.as_str(),
                    request.requester_tab_id,
                    to_json(&request.payload)?,
                    fmt_ts(&request.opened_at),
                    opt_text_owned(outcome),
                    fmt_opt_ts(&request.resolved_at),
                ],
            )
            .await?;
            Ok(reclaimed)
        }
        .await;
        finish_tx(&conn, result).await
    }

    async fn get_pending(&self, kind: RequestKind) -> Result<Option<PendingRequest>, DatabaseError> {
        let conn = self.connect().await?;
        select_slot(&conn, kind).await
    }

    async fn list_pending(&self) -> Result<Vec<PendingRequest>, DatabaseError> {
        let conn = self.connect().await?;
        let rows = conn
            .query(
                &format!("SELECT {PENDING_COLUMNS} FROM pending_requests ORDER BY opened_at ASC"),
                (),
            )
            .await?;
        collect_rows(rows, row_to_pending).await
    }

    async fn set_outcome(
        &self,
        kind: RequestKind,
        request_id: Option<Uuid>,
        outcome: &RequestOutcome,
        now: DateTime<Utc>,
    ) -> Result<ResolveStatus, DatabaseError> {
        let conn = self.begin_immediate().await?;
        let result = async {
            let Some(current) = select_slot(&conn, kind).await? else {
                return Ok(ResolveStatus::NoPendingRequest);
            };
            if request_id.is_some_and(|id| id != current.request_id) {
                return Ok(ResolveStatus::NoPendingRequest);
            }
            if let Some(existing) = current.outcome {
                return Ok(ResolveStatus::AlreadyResolved(existing));
            }

            conn.execute(
                "UPDATE pending_requests SET outcome = ?2, resolved_at = ?3 \
                 WHERE kind = ?1 AND outcome IS NULL",
                libsql::params![kind.as_str(), to_json(outcome)?, fmt_ts(&now)],
            )
            .await?;
            Ok(ResolveStatus::Written)
        }
        .await;
        finish_tx(&conn, result).await
    }

    async fn take_outcome(
        &self,
        kind: RequestKind,
        request_id: Uuid,
    ) -> Result<Option<RequestOutcome>, DatabaseError> {
        let conn = self.begin_immediate().await?;
        let result = async {
            let taken = match select_slot(&conn, kind).await? {
                Some(current) if current.request_id == request_id => current.outcome,
                _ => None,
            };
            if taken.is_some() {
                clear_slot(&conn, kind).await?;
            }
            Ok(taken)
        }
        .await;
        finish_tx(&conn, result).await
    }

    async fn delete_pending(&self, kind: RequestKind) -> Result<Option<PendingRequest>, DatabaseError> {
        let conn = self.begin_immediate().await?;
        let result = async {
            let current = select_slot(&conn, kind).await?;
            clear_slot(&conn, kind).await?;
            Ok(current)
        }
        .await;
        finish_tx(&conn, result).await
    }

    async fn sweep_stale(&self, cutoffs: StaleCutoffs) -> Result<Vec<PendingRequest>, DatabaseError> {
        let conn = self.begin_immediate().await?;
        let result = async {
            let rows = conn
                .query(&format!("SELECT {PENDING_COLUMNS} FROM pending_requests"), ())
                .await?;
            let stale: Vec<PendingRequest> = collect_rows(rows, row_to_pending)
                .await?
                .into_iter()
                .filter(|request| cutoffs.is_stale(request))
                .collect();
            for request in &stale {
                clear_slot(&conn, request.kind).await?;
            }
            Ok(stale)
        }
        .await;
        finish_tx(&conn, result).await
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use pretty_assertions::assert_eq;

    use crate::broker::{
        ApprovalResult, ApprovalWindowHandle, RequestPayload, WindowId, timestamp_now,
    };
    use crate::db::WindowStore;
    use crate::db::libsql::test_support::temp_backend;

    use super::*;

    fn request(kind_payload: RequestPayload) -> PendingRequest {
        PendingRequest::new(Origin::parse("https://a.example").unwrap(), 3, kind_payload)
    }

    /// Cutoffs under which nothing opened in this test counts as stale.
    fn fresh_cutoffs() -> StaleCutoffs {
        let long_ago = timestamp_now() - Duration::hours(1);
        StaleCutoffs {
            unresolved_before: long_ago,
            resolved_before: long_ago,
        }
    }

    #[tokio::test]
    async fn second_insert_for_same_kind_is_rejected() {
        let (_dir, backend) = temp_backend().await;
        let first = request(RequestPayload::Connection);
        let second = request(RequestPayload::Connection);

        assert_eq!(backend.insert_pending(&first, fresh_cutoffs()).await.unwrap(), None);
        let err = backend
            .insert_pending(&second, fresh_cutoffs())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            DatabaseError::SlotOccupied { kind: RequestKind::Connection, request_id } if request_id == first.request_id
        ));

        let stored = backend.get_pending(RequestKind::Connection).await.unwrap().unwrap();
        assert_eq!(stored, first);
    }

    #[tokio::test]
    async fn kinds_have_independent_slots() {
        let (_dir, backend) = temp_backend().await;
        backend
            .insert_pending(&request(RequestPayload::Connection), fresh_cutoffs())
            .await
            .unwrap();
        backend
            .insert_pending(
                &request(RequestPayload::Signature {
                    message: "hello".to_string(),
                }),
                fresh_cutoffs(),
            )
            .await
            .unwrap();

        assert_eq!(backend.list_pending().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn stale_occupant_is_reclaimed_on_insert() {
        let (_dir, backend) = temp_backend().await;
        let mut old = request(RequestPayload::Connection);
        old.opened_at = timestamp_now() - Duration::minutes(10);
        backend.insert_pending(&old, fresh_cutoffs()).await.unwrap();

        let cutoffs = StaleCutoffs {
            unresolved_before: timestamp_now() - Duration::minutes(1),
            resolved_before: timestamp_now() - Duration::seconds(5),
        };
        let fresh = request(RequestPayload::Connection);
        let reclaimed = backend.insert_pending(&fresh, cutoffs).await.unwrap();

        assert_eq!(reclaimed.map(|r| r.request_id), Some(old.request_id));
        let stored = backend.get_pending(RequestKind::Connection).await.unwrap().unwrap();
        assert_eq!(stored.request_id, fresh.request_id);
    }

    #[tokio::test]
    async fn outcome_is_written_once() {
        let (_dir, backend) = temp_backend().await;
        let pending = request(RequestPayload::Connection);
        backend.insert_pending(&pending, fresh_cutoffs()).await.unwrap();

        let approved = RequestOutcome::approved(ApprovalResult::Accounts {
            addresses: vec!["addr1".to_string()],
        });
        let status = backend
            .set_outcome(RequestKind::Connection, None, &approved, timestamp_now())
            .await
            .unwrap();
        assert_eq!(status, ResolveStatus::Written);

        let status = backend
            .set_outcome(
                RequestKind::Connection,
                None,
                &RequestOutcome::Expired,
                timestamp_now(),
            )
            .await
            .unwrap();
        assert_eq!(status, ResolveStatus::AlreadyResolved(approved.clone()));

        let stored = backend.get_pending(RequestKind::Connection).await.unwrap().unwrap();
        assert_eq!(stored.outcome, Some(approved));
        assert!(stored.resolved_at.is_some());
    }

    #[tokio::test]
    async fn outcome_for_other_request_id_is_ignored() {
        let (_dir, backend) = temp_backend().await;
        let pending = request(RequestPayload::Connection);
        backend.insert_pending(&pending, fresh_cutoffs()).await.unwrap();

        let status = backend
            .set_outcome(
                RequestKind::Connection,
                Some(Uuid::new_v4()),
                &RequestOutcome::rejected_by_user("no"),
                timestamp_now(),
            )
            .await
            .unwrap();
        assert_eq!(status, ResolveStatus::NoPendingRequest);

        let status = backend
            .set_outcome(
                RequestKind::Transaction,
                None,
                &RequestOutcome::Expired,
                timestamp_now(),
            )
            .await
            .unwrap();
        assert_eq!(status, ResolveStatus::NoPendingRequest);
    }

    #[tokio::test]
    async fn take_outcome_consumes_slot_and_window() {
        let (_dir, backend) = temp_backend().await;
        let pending = request(RequestPayload::Connection);
        backend.insert_pending(&pending, fresh_cutoffs()).await.unwrap();
        let handle = ApprovalWindowHandle {
            window_id: WindowId::new(),
            kind: RequestKind::Connection,
            request_id: pending.request_id,
            opened_for_tab_id: 3,
            opened_at: timestamp_now(),
        };
        backend.put_window(&handle).await.unwrap();

        // Unresolved: nothing to take, slot stays.
        assert_eq!(
            backend
                .take_outcome(RequestKind::Connection, pending.request_id)
                .await
                .unwrap(),
            None
        );
        assert!(backend.get_pending(RequestKind::Connection).await.unwrap().is_some());

        let rejected = RequestOutcome::rejected_by_user("nope");
        backend
            .set_outcome(RequestKind::Connection, None, &rejected, timestamp_now())
            .await
            .unwrap();

        assert_eq!(
            backend.take_outcome(RequestKind::Connection, Uuid::new_v4()).await.unwrap(),
            None
        );
        assert_eq!(
            backend
                .take_outcome(RequestKind::Connection, pending.request_id)
                .await
                .unwrap(),
            Some(rejected)
        );
        assert!(backend.get_pending(RequestKind::Connection).await.unwrap().is_none());
        assert!(backend.get_window(RequestKind::Connection).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn sweep_removes_only_stale_slots() {
        let (_dir, backend) = temp_backend().await;
        let now = timestamp_now();

        let mut abandoned_open = request(RequestPayload::Connection);
        abandoned_open.opened_at = now - Duration::minutes(5);
        backend.insert_pending(&abandoned_open, fresh_cutoffs()).await.unwrap();

        let live = request(RequestPayload::Signature {
            message: "hi".to_string(),
        });
        backend.insert_pending(&live, fresh_cutoffs()).await.unwrap();

        let cutoffs = StaleCutoffs {
            unresolved_before: now - Duration::minutes(1),
            resolved_before: now - Duration::seconds(5),
        };
        let swept = backend.sweep_stale(cutoffs).await.unwrap();

        assert_eq!(swept.len(), 1);
        assert_eq!(swept[0].request_id, abandoned_open.request_id);
        let remaining = backend.list_pending().await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].request_id, live.request_id);
    }

    #[tokio::test]
    async fn delete_pending_returns_previous_occupant() {
        let (_dir, backend) = temp_backend().await;
        let pending = request(RequestPayload::Connection);
        backend.insert_pending(&pending, fresh_cutoffs()).await.unwrap();

        let removed = backend.delete_pending(RequestKind::Connection).await.unwrap();
        assert_eq!(removed.map(|r| r.request_id), Some(pending.request_id));
        assert_eq!(backend.delete_pending(RequestKind::Connection).await.unwrap(), None);
    }
}
