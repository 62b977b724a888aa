//! libSQL implementation of the `Database` trait.
//!
//! Supports local file and in-memory databases.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};

use crate::error::DatabaseError;
use crate::jobs::model::JobStatus;
use crate::store::migrations;
use crate::store::traits::{Database, TransitionRecord};

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.init_schema().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.init_schema().await?;
        Ok(backend)
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

/// Convert `Option<String>` to libsql Value.
fn opt_text_owned(s: Option<String>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s),
        None => libsql::Value::Null,
    }
}

fn status_from_str(s: &str) -> Result<JobStatus, DatabaseError> {
    serde_json::from_value(serde_json::Value::String(s.to_string()))
        .map_err(|e| DatabaseError::Serialization(format!("unknown job status '{s}': {e}")))
}

fn row_to_transition(row: &libsql::Row) -> Result<TransitionRecord, DatabaseError> {
    let read = |e: libsql::Error| DatabaseError::Query(format!("transition row parse: {e}"));
    let job_id: String = row.get(0).map_err(read)?;
    let from: String = row.get(1).map_err(read)?;
    let to: String = row.get(2).map_err(read)?;
    let reason: Option<String> = row.get(3).ok();
    let at: String = row.get(4).map_err(read)?;

    Ok(TransitionRecord {
        job_id,
        from: status_from_str(&from)?,
        to: status_from_str(&to)?,
        reason,
        at: parse_datetime(&at),
    })
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl Database for LibSqlBackend {
    async fn init_schema(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Key-value ───────────────────────────────────────────────────

    async fn get_value(&self, key: &str) -> Result<Option<serde_json::Value>, DatabaseError> {
        let conn = self.conn();
        let mut rows = conn
            .query("SELECT value FROM kv_store WHERE key = ?1", params![key])
            .await
            .map_err(|e| DatabaseError::Query(format!("get_value: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let value_str: String = row
                    .get(0)
                    .map_err(|e| DatabaseError::Query(format!("get_value row parse: {e}")))?;
                let value = serde_json::from_str(&value_str)
                    .map_err(|e| DatabaseError::Serialization(format!("{key}: {e}")))?;
                Ok(Some(value))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_value: {e}"))),
        }
    }

    async fn set_value(&self, key: &str, value: &serde_json::Value) -> Result<(), DatabaseError> {
        let conn = self.conn();
        let now = Utc::now().to_rfc3339();
        let value_str = serde_json::to_string(value)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;

        conn.execute(
            "INSERT INTO kv_store (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT (key) DO UPDATE SET value = ?2, updated_at = ?3",
            params![key, value_str, now],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("set_value: {e}")))?;

        debug!(key, "Value written");
        Ok(())
    }

    async fn delete_value(&self, key: &str) -> Result<bool, DatabaseError> {
        let conn = self.conn();
        let count = conn
            .execute("DELETE FROM kv_store WHERE key = ?1", params![key])
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_value: {e}")))?;
        Ok(count > 0)
    }

    // ── Audit trail ─────────────────────────────────────────────────

    async fn record_transition(&self, record: &TransitionRecord) -> Result<(), DatabaseError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO job_transitions (job_id, from_status, to_status, reason, at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                record.job_id.clone(),
                record.from.to_string(),
                record.to.to_string(),
                opt_text_owned(record.reason.clone()),
                record.at.to_rfc3339(),
            ],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("record_transition: {e}")))?;
        Ok(())
    }

    async fn list_transitions(&self, job_id: &str) -> Result<Vec<TransitionRecord>, DatabaseError> {
        let conn = self.conn();
        let mut rows = conn
            .query(
                "SELECT job_id, from_status, to_status, reason, at
                 FROM job_transitions WHERE job_id = ?1 ORDER BY id ASC",
                params![job_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_transitions: {e}")))?;

        let mut records = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("list_transitions: {e}")))?
        {
            records.push(row_to_transition(&row)?);
        }
        Ok(records)
    }

    async fn clear_transitions(&self) -> Result<usize, DatabaseError> {
        let conn = self.conn();
        let count = conn
            .execute("DELETE FROM job_transitions", ())
            .await
            .map_err(|e| DatabaseError::Query(format!("clear_transitions: {e}")))?;
        Ok(count as usize)
    }
}
