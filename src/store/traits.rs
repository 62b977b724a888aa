//! `Database` trait, the single async interface for all persistence.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DatabaseError;
use crate::jobs::model::{JobId, JobStatus};

/// One row of a job's audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub job_id: JobId,
    pub from: JobStatus,
    pub to: JobStatus,
    /// Failure reason for transitions into `skipped`.
    pub reason: Option<String>,
    pub at: DateTime<Utc>,
}

/// Backend-agnostic durable storage.
///
/// Values are JSON documents under stable keys (see `store::keys`).
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn init_schema(&self) -> Result<(), DatabaseError>;

    // ── Key-value ───────────────────────────────────────────────────

    /// Read the document stored under `key`.
    async fn get_value(&self, key: &str) -> Result<Option<serde_json::Value>, DatabaseError>;

    /// Insert or replace the document stored under `key`.
    async fn set_value(&self, key: &str, value: &serde_json::Value) -> Result<(), DatabaseError>;

    /// Delete `key`. Returns whether anything was removed.
    async fn delete_value(&self, key: &str) -> Result<bool, DatabaseError>;

    // ── Audit trail ─────────────────────────────────────────────────

    /// Append a status transition to the audit trail.
    async fn record_transition(&self, record: &TransitionRecord) -> Result<(), DatabaseError>;

    /// All transitions for a job, oldest first.
    async fn list_transitions(&self, job_id: &str) -> Result<Vec<TransitionRecord>, DatabaseError>;

    /// Drop the whole audit trail. Returns the number of rows removed.
    async fn clear_transitions(&self) -> Result<usize, DatabaseError>;
}
