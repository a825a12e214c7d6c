//! libSQL implementation of the broker store.
//!
//! The database is either a plain local file or an embedded replica that
//! syncs to a remote libSQL server. Every read-modify-write runs inside
//! `BEGIN IMMEDIATE`, which takes the write lock up front and gives the slot
//! operations compare-and-swap semantics across processes sharing the file.

mod pending;
mod sites;
mod windows;

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use libsql::{Builder, Connection, Database as LibSqlDatabase, Row, Rows, Value};

use crate::db::Database;
use crate::db::libsql_migrations;
use crate::error::DatabaseError;

/// Milliseconds a connection waits on a locked file before giving up.
const BUSY_TIMEOUT_MS: u32 = 5000;

/// Broker store backed by a libSQL file.
///
/// Clones share the database handle; each operation opens its own
/// connection.
#[derive(Clone)]
pub struct LibSqlBackend {
    db: Arc<LibSqlDatabase>,
}

impl LibSqlBackend {
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        ensure_parent_dir(path)?;
        let db = Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("cannot open {}: {e}", path.display())))?;
        Ok(Self { db: Arc::new(db) })
    }

    /// Local file kept in sync with a remote libSQL server.
    pub async fn new_remote_replica(
        path: &Path,
        url: &str,
        auth_token: &str,
    ) -> Result<Self, DatabaseError> {
        ensure_parent_dir(path)?;
        let db = Builder::new_remote_replica(path, url.to_string(), auth_token.to_string())
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("cannot open replica of {url}: {e}")))?;
        Ok(Self { db: Arc::new(db) })
    }

    /// New connection with the busy timeout applied, so a writer in another
    /// process makes us wait instead of failing with "database is locked".
    pub async fn connect(&self) -> Result<Connection, DatabaseError> {
        let conn = self
            .db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("cannot connect: {e}")))?;
        conn.query(&format!("PRAGMA busy_timeout = {BUSY_TIMEOUT_MS}"), ())
            .await
            .map_err(|e| DatabaseError::Pool(format!("cannot set busy_timeout: {e}")))?;
        Ok(conn)
    }

    /// Open a connection with an immediate (write-locked) transaction.
    pub(crate) async fn begin_immediate(&self) -> Result<Connection, DatabaseError> {
        let conn = self.connect().await?;
        conn.execute("BEGIN IMMEDIATE", ())
            .await
            .map_err(|e| DatabaseError::Query(format!("cannot begin transaction: {e}")))?;
        Ok(conn)
    }
}

fn ensure_parent_dir(path: &Path) -> Result<(), DatabaseError> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => std::fs::create_dir_all(parent)
            .map_err(|e| DatabaseError::Pool(format!("cannot create {}: {e}", parent.display()))),
        _ => Ok(()),
    }
}

/// Commit on success, roll back on failure, and pass the result through.
pub(crate) async fn finish_tx<T>(
    conn: &Connection,
    result: Result<T, DatabaseError>,
) -> Result<T, DatabaseError> {
    match result {
        Ok(value) => {
            conn.execute("COMMIT", ())
                .await
                .map_err(|e| DatabaseError::Query(format!("commit failed: {e}")))?;
            Ok(value)
        }
        Err(err) => {
            if let Err(rollback_err) = conn.execute("ROLLBACK", ()).await {
                tracing::warn!("Rollback after failed transaction also failed: {}", rollback_err);
            }
            Err(err)
        }
    }
}

// --- Column codecs ---
//
// Timestamps are written as RFC 3339 with millisecond precision so that
// string comparison in SQL orders them correctly.

pub(crate) fn fmt_ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(crate) fn fmt_opt_ts(dt: &Option<DateTime<Utc>>) -> Value {
    dt.as_ref().map_or(Value::Null, |dt| Value::Text(fmt_ts(dt)))
}

pub(crate) fn opt_text_owned(s: Option<String>) -> Value {
    s.map_or(Value::Null, Value::Text)
}

/// Accepts our own format plus SQLite's `CURRENT_TIMESTAMP` shape.
pub(crate) fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, String> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%d %H:%M:%S"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .map(|ndt| ndt.and_utc())
        .ok_or_else(|| format!("unparseable timestamp: {s:?}"))
}

/// NULL reads as the empty string.
pub(crate) fn get_text(row: &Row, idx: i32) -> String {
    row.get::<String>(idx).unwrap_or_default()
}

pub(crate) fn get_opt_text(row: &Row, idx: i32) -> Option<String> {
    row.get::<String>(idx).ok()
}

pub(crate) fn get_i64(row: &Row, idx: i32) -> i64 {
    row.get::<i64>(idx).unwrap_or(0)
}

/// Broker timestamps drive staleness decisions, so a corrupt value is an
/// error rather than a silent default.
pub(crate) fn get_ts(row: &Row, idx: i32) -> Result<DateTime<Utc>, DatabaseError> {
    parse_timestamp(&get_text(row, idx)).map_err(|e| {
        tracing::warn!(column = idx, "Corrupt timestamp: {}", e);
        DatabaseError::Serialization(e)
    })
}

pub(crate) fn get_opt_ts(row: &Row, idx: i32) -> Result<Option<DateTime<Utc>>, DatabaseError> {
    match get_opt_text(row, idx).filter(|s| !s.is_empty()) {
        Some(s) => parse_timestamp(&s).map(Some).map_err(DatabaseError::Serialization),
        None => Ok(None),
    }
}

pub(crate) fn get_json<T: serde::de::DeserializeOwned>(row: &Row, idx: i32) -> Result<T, DatabaseError> {
    serde_json::from_str(&get_text(row, idx))
        .map_err(|e| DatabaseError::Serialization(format!("column {idx}: {e}")))
}

pub(crate) fn to_json<T: serde::Serialize>(value: &T) -> Result<String, DatabaseError> {
    serde_json::to_string(value).map_err(|e| DatabaseError::Serialization(e.to_string()))
}

pub(crate) async fn collect_rows<T>(
    mut rows: Rows,
    convert: impl Fn(&Row) -> Result<T, DatabaseError>,
) -> Result<Vec<T>, DatabaseError> {
    let mut out = Vec::new();
    while let Some(row) = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Query(e.to_string()))?
    {
        out.push(convert(&row)?);
    }
    Ok(out)
}

pub(crate) async fn first_row<T>(
    mut rows: Rows,
    convert: impl Fn(&Row) -> Result<T, DatabaseError>,
) -> Result<Option<T>, DatabaseError> {
    rows.next()
        .await
        .map_err(|e| DatabaseError::Query(e.to_string()))?
        .map(|row| convert(&row))
        .transpose()
}

#[async_trait]
impl Database for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        let conn = self.connect().await?;
        // Sticky on the file; the poller reads while the gateway writes.
        conn.query("PRAGMA journal_mode=WAL", ())
            .await
            .map_err(|e| DatabaseError::Migration(format!("cannot enable WAL: {e}")))?;
        conn.execute_batch(libsql_migrations::SCHEMA)
            .await
            .map_err(|e| DatabaseError::Migration(format!("schema setup failed: {e}")))?;
        Ok(())
    }
}
