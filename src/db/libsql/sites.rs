//! Site trust registry persistence.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{LibSqlBackend, collect_rows, finish_tx, first_row, fmt_ts, get_text, get_ts};
use crate::broker::{Origin, SiteTrustEntry};
use crate::db::TrustStore;
use crate::error::DatabaseError;

/// Explicit column list for site_trust (matches positional access in `row_to_site`).
const SITE_COLUMNS: &str = "origin, account_address, connected_at, last_used_at";

fn row_to_site(row: &libsql::Row) -> Result<SiteTrustEntry, DatabaseError> {
    let origin = Origin::parse(&get_text(row, 0))
        .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
    Ok(SiteTrustEntry {
        origin,
        account_address: get_text(row, 1),
        connected_at: get_ts(row, 2)?,
        last_used_at: get_ts(row, 3)?,
    })
}

#[async_trait]
impl TrustStore for LibSqlBackend {
    async fn get_site(&self, origin: &Origin) -> Result<Option<SiteTrustEntry>, DatabaseError> {
        let conn = self.connect().await?;
        let rows = conn
            .query(
                &format!("SELECT {SITE_COLUMNS} FROM site_trust WHERE origin = ?1"),
                libsql::params![origin.as_str()],
            )
            .await?;
        first_row(rows, row_to_site).await
    }

    async fn upsert_site(
        &self,
        origin: &Origin,
        account_address: &str,
        now: DateTime<Utc>,
    ) -> Result<SiteTrustEntry, DatabaseError> {
        let conn = self.begin_immediate().await?;
        let result = async {
            conn.execute(
                r#"
                INSERT INTO site_trust (origin, account_address, connected_at, last_used_at)
                VALUES (?1, ?2, ?3, ?3)
                ON CONFLICT (origin) DO UPDATE SET
                    account_address = excluded.account_address,
                    last_used_at = excluded.last_used_at
                "#,
                libsql::params![origin.as_str(), account_address, fmt_ts(&now)],
            )
            .await?;

            let rows = conn
                .query(
                    &format!("SELECT {SITE_COLUMNS} FROM site_trust WHERE origin = ?1"),
                    libsql::params![origin.as_str()],
                )
                .await?;
            first_row(rows, row_to_site).await?.ok_or_else(|| {
                DatabaseError::Query(format!("site_trust row for {origin} vanished after upsert"))
            })
        }
        .await;
        finish_tx(&conn, result).await
    }

    async fn touch_site(&self, origin: &Origin, now: DateTime<Utc>) -> Result<bool, DatabaseError> {
        let conn = self.connect().await?;
        let changed = conn
            .execute(
                "UPDATE site_trust SET last_used_at = ?2 WHERE origin = ?1",
                libsql::params![origin.as_str(), fmt_ts(&now)],
            )
            .await?;
        Ok(changed > 0)
    }

    async fn delete_site(&self, origin: &Origin) -> Result<bool, DatabaseError> {
        let conn = self.connect().await?;
        let changed = conn
            .execute(
                "DELETE FROM site_trust WHERE origin = ?1",
                libsql::params![origin.as_str()],
            )
            .await?;
        Ok(changed > 0)
    }

    async fn list_sites(&self) -> Result<Vec<SiteTrustEntry>, DatabaseError> {
        let conn = self.connect().await?;
        let rows = conn
            .query(
                &format!("SELECT {SITE_COLUMNS} FROM site_trust ORDER BY connected_at ASC, origin ASC"),
                (),
            )
            .await?;
        collect_rows(rows, row_to_site).await
    }
}
