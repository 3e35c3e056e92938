//! Database schema migrations.
//!
//! v1 creates tasks, approvals, fingerprints, audit_log and the
//! schema_migrations tracking table. v2 adds the claim lease column.

use rusqlite::Connection;
use tracing::info;

use vault_core::error::StoreError;
use vault_core::store::StoreResult;

/// Run all pending database migrations.
pub fn run_migrations(conn: &Connection) -> StoreResult<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version     INTEGER PRIMARY KEY NOT NULL,
            name        TEXT NOT NULL,
            applied_at  INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
        );",
    )
    .map_err(|e| StoreError::Backend(format!("Failed to create migrations table: {}", e)))?;

    let current_version: i64 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
            [],
            |row| row.get(0),
        )
        .map_err(|e| StoreError::Backend(format!("Failed to query migration version: {}", e)))?;

    if current_version < 1 {
        apply_v1(conn)?;
        info!("Applied migration v1: initial_schema");
    }

    if current_version < 2 {
        apply_v2(conn)?;
        info!("Applied migration v2: claim_lease");
    }

    Ok(())
}

/// Version 1: Initial schema.
fn apply_v1(conn: &Connection) -> StoreResult<()> {
    conn.execute_batch(
        "
        -- One row per task. plan and failure are JSON documents.
        CREATE TABLE IF NOT EXISTS tasks (
            id              TEXT PRIMARY KEY NOT NULL,
            fingerprint     TEXT NOT NULL UNIQUE,
            content         TEXT NOT NULL,
            source          TEXT,
            lifecycle_state TEXT NOT NULL
                            CHECK (lifecycle_state IN ('pending', 'planned', 'executing',
                                   'awaiting_approval', 'done', 'failed', 'quarantined')),
            bucket          TEXT NOT NULL,
            category        TEXT,
            risk_tier       TEXT CHECK (risk_tier IS NULL OR risk_tier IN ('low', 'medium', 'high')),
            plan            TEXT,
            iteration_count INTEGER NOT NULL DEFAULT 0,
            claimed_by      TEXT,
            failure         TEXT,
            version         INTEGER NOT NULL DEFAULT 0,
            created_at      INTEGER NOT NULL,
            updated_at      INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_tasks_state
            ON tasks (lifecycle_state, created_at ASC);

        -- Approval requests for risky steps.
        CREATE TABLE IF NOT EXISTS approvals (
            request_id      TEXT PRIMARY KEY NOT NULL,
            task_id         TEXT NOT NULL,
            step_index      INTEGER NOT NULL,
            context         TEXT NOT NULL DEFAULT '',
            decision        TEXT NOT NULL DEFAULT 'pending'
                            CHECK (decision IN ('pending', 'approved', 'rejected')),
            decided_by      TEXT,
            decided_at      INTEGER,
            created_at      INTEGER NOT NULL,
            expires_at      INTEGER NOT NULL,
            FOREIGN KEY (task_id) REFERENCES tasks(id) ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS idx_approvals_task
            ON approvals (task_id, step_index);

        CREATE INDEX IF NOT EXISTS idx_approvals_pending
            ON approvals (decision, created_at)
            WHERE decision = 'pending';

        -- Append-only set of content hashes.
        CREATE TABLE IF NOT EXISTS fingerprints (
            hash            TEXT PRIMARY KEY NOT NULL,
            first_seen_at   INTEGER NOT NULL
        );

        -- Append-only audit trail.
        CREATE TABLE IF NOT EXISTS audit_log (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            timestamp       INTEGER NOT NULL,
            task_id         TEXT,
            event_type      TEXT NOT NULL,
            detail          TEXT NOT NULL DEFAULT ''
        );

        CREATE INDEX IF NOT EXISTS idx_audit_task
            ON audit_log (task_id, id ASC)
            WHERE task_id IS NOT NULL;

        INSERT INTO schema_migrations (version, name) VALUES (1, 'initial_schema');
        ",
    )
    .map_err(|e| StoreError::Backend(format!("Migration v1 failed: {}", e)))?;

    Ok(())
}

/// Version 2: claim renewal time, so a claim left by a dead process expires.
fn apply_v2(conn: &Connection) -> StoreResult<()> {
    conn.execute_batch(
        "
        ALTER TABLE tasks ADD COLUMN claimed_at INTEGER;

        INSERT INTO schema_migrations (version, name) VALUES (2, 'claim_lease');
        ",
    )
    .map_err(|e| StoreError::Backend(format!("Migration v2 failed: {}", e)))?;

    Ok(())
}
