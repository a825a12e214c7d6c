//! Approval window handle persistence.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::{LibSqlBackend, finish_tx, first_row, fmt_ts, get_i64, get_text, get_ts, to_json};
use crate::broker::{ApprovalWindowHandle, RequestKind, RequestOutcome, WindowId};
use crate::db::{WindowClosed, WindowStore};
use crate::error::DatabaseError;

const WINDOW_COLUMNS: &str = "kind, window_id, request_id, opened_for_tab_id, opened_at";

fn row_to_window(row: &libsql::Row) -> Result<ApprovalWindowHandle, DatabaseError> {
    let kind = get_text(row, 0)
        .parse::<RequestKind>()
        .map_err(DatabaseError::Serialization)?;
    let window_id = get_text(row, 1)
        .parse::<WindowId>()
        .map_err(|e| DatabaseError::Serialization(format!("window_id: {}", e)))?;
    let request_id = Uuid::parse_str(&get_text(row, 2))
        .map_err(|e| DatabaseError::Serialization(format!("request_id: {}", e)))?;
    Ok(ApprovalWindowHandle {
        window_id,
        kind,
        request_id,
        opened_for_tab_id: get_i64(row, 3),
        opened_at: get_ts(row, 4)?,
    })
}

#[async_trait]
impl WindowStore for LibSqlBackend {
    async fn put_window(&self, handle: &ApprovalWindowHandle) -> Result<(), DatabaseError> {
        let conn = self.connect().await?;
        conn.execute(
            &format!(
                "INSERT OR REPLACE INTO approval_windows ({WINDOW_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5)"
            ),
            libsql::params![
                handle.kind.as_str(),
                handle.window_id.to_string(),
                handle.request_id.to_string(),
                handle.opened_for_tab_id,
                fmt_ts(&handle.opened_at),
            ],
        )
        .await?;
        Ok(())
    }

    async fn get_window(&self, kind: RequestKind) -> Result<Option<ApprovalWindowHandle>, DatabaseError> {
        let conn = self.connect().await?;
        let rows = conn
            .query(
                &format!("SELECT {WINDOW_COLUMNS} FROM approval_windows WHERE kind = ?1"),
                libsql::params![kind.as_str()],
            )
            .await?;
        first_row(rows, row_to_window).await
    }

    async fn find_window(&self, window_id: WindowId) -> Result<Option<ApprovalWindowHandle>, DatabaseError> {
        let conn = self.connect().await?;
        let rows = conn
            .query(
                &format!("SELECT {WINDOW_COLUMNS} FROM approval_windows WHERE window_id = ?1"),
                libsql::params![window_id.to_string()],
            )
            .await?;
        first_row(rows, row_to_window).await
    }

    async fn delete_window(&self, window_id: WindowId) -> Result<bool, DatabaseError> {
        let conn = self.connect().await?;
        let changed = conn
            .execute(
                "DELETE FROM approval_windows WHERE window_id = ?1",
                libsql::params![window_id.to_string()],
            )
            .await?;
        Ok(changed > 0)
    }

    async fn close_window(
        &self,
        window_id: WindowId,
        now: DateTime<Utc>,
    ) -> Result<WindowClosed, DatabaseError> {
        let conn = self.begin_immediate().await?;
        let result = async {
            let rows = conn
                .query(
                    &format!("SELECT {WINDOW_COLUMNS} FROM approval_windows WHERE window_id = ?1"),
                    libsql::params![window_id.to_string()],
                )
                .await?;
            let Some(handle) = first_row(rows, row_to_window).await? else {
                return Ok(WindowClosed::Unknown);
            };

            // Only an open slot for the same request becomes Abandoned.
            let abandoned = conn
                .execute(
                    "UPDATE pending_requests SET outcome = ?3, resolved_at = ?4 \
                     WHERE kind = ?1 AND request_id = ?2 AND outcome IS NULL",
                    libsql::params![
                        handle.kind.as_str(),
                        handle.request_id.to_string(),
                        to_json(&RequestOutcome::Abandoned)?,
                        fmt_ts(&now),
                    ],
                )
                .await?;
            conn.execute(
                "DELETE FROM approval_windows WHERE window_id = ?1",
                libsql::params![window_id.to_string()],
            )
            .await?;

            if abandoned > 0 {
                Ok(WindowClosed::Abandoned(handle))
            } else {
                Ok(WindowClosed::AlreadySettled(handle))
            }
        }
        .await;
        finish_tx(&conn, result).await
    }
}
