//! Version-tracked database migrations for the libSQL backend.
//!
//! `_migrations` records every applied version; only newer ones run.

use libsql::Connection;

use crate::error::DatabaseError;

/// A single migration step.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// All migrations in order. Add new versions to the end.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "kv_store",
        sql: r#"
            CREATE TABLE IF NOT EXISTS kv_store (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
        "#,
    },
    Migration {
        version: 2,
        name: "job_transitions",
        sql: r#"
            CREATE TABLE IF NOT EXISTS job_transitions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                job_id TEXT NOT NULL,
                from_status TEXT NOT NULL,
                to_status TEXT NOT NULL,
                reason TEXT,
                at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_job_transitions_job ON job_transitions(job_id);
        "#,
    },
];

/// Bring the schema up to the newest version in `MIGRATIONS`.
pub async fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        (),
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("_migrations table: {e}")))?;

    let from = schema_version(conn).await?;
    let mut applied = 0;
    for step in MIGRATIONS.iter().filter(|m| m.version > from) {
        tracing::info!(version = step.version, name = step.name, "Applying migration");
        conn.execute_batch(step.sql)
            .await
            .map_err(|e| DatabaseError::Migration(format!("V{} {}: {e}", step.version, step.name)))?;
        conn.execute(
            "INSERT OR IGNORE INTO _migrations (version, name) VALUES (?1, ?2)",
            libsql::params![step.version, step.name],
        )
        .await
        .map_err(|e| DatabaseError::Migration(format!("recording V{}: {e}", step.version)))?;
        applied += 1;
    }

    let version = schema_version(conn).await?;
    tracing::debug!(from, version, applied, "Schema up to date");
    Ok(())
}

/// Highest recorded version; 0 on a fresh database.
async fn schema_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| DatabaseError::Migration(format!("schema version: {e}")))?;
    let Some(row) = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Migration(format!("schema version: {e}")))?
    else {
        return Ok(0);
    };
    row.get(0)
        .map_err(|e| DatabaseError::Migration(format!("schema version: {e}")))
}
