//! Read-only reporting queries over the whole vault.

use std::sync::Arc;

use serde::Serialize;

use vault_core::store::StoreResult;
use vault_core::types::LifecycleState;

use crate::db::{backend, Database};

/// Storage statistics from the database.
#[derive(Debug, Clone, Serialize)]
pub struct VaultStats {
    /// One entry per lifecycle state, in lifecycle order, zeros included.
    pub tasks_by_state: Vec<(LifecycleState, u64)>,
    pub total_tasks: u64,
    pub pending_approvals: u64,
    pub fingerprints: u64,
    pub audit_entries: u64,
    pub db_size_bytes: u64,
}

impl VaultStats {
    pub fn count(&self, state: LifecycleState) -> u64 {
        self.tasks_by_state
            .iter()
            .find(|(s, _)| *s == state)
            .map(|(_, n)| *n)
            .unwrap_or(0)
    }
}

/// Aggregate queries used by `vault stats`.
pub struct QueryService {
    db: Arc<Database>,
}

impl QueryService {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub fn stats(&self) -> StoreResult<VaultStats> {
        self.db.with_conn(|conn| {
            let mut stmt = conn
                .prepare("SELECT lifecycle_state, COUNT(*) FROM tasks GROUP BY lifecycle_state")
                .map_err(backend)?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
                })
                .map_err(backend)?;

            let mut tasks_by_state: Vec<(LifecycleState, u64)> =
                LifecycleState::ALL.iter().map(|s| (*s, 0)).collect();
            for row in rows {
                let (state, count) = row.map_err(backend)?;
                if let Some(slot) = tasks_by_state
                    .iter_mut()
                    .find(|(s, _)| s.to_string() == state)
                {
                    slot.1 = count as u64;
                }
            }
            let total_tasks = tasks_by_state.iter().map(|(_, n)| n).sum();

            let pending_approvals: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM approvals WHERE decision = 'pending'",
                    [],
                    |row| row.get(0),
                )
                .map_err(backend)?;

            let fingerprints: i64 = conn
                .query_row("SELECT COUNT(*) FROM fingerprints", [], |row| row.get(0))
                .map_err(backend)?;

            let audit_entries: i64 = conn
                .query_row("SELECT COUNT(*) FROM audit_log", [], |row| row.get(0))
                .map_err(backend)?;

            // page_count * page_size gives approximate DB size.
            let page_count: i64 = conn
                .query_row("PRAGMA page_count", [], |row| row.get(0))
                .map_err(backend)?;
            let page_size: i64 = conn
                .query_row("PRAGMA page_size", [], |row| row.get(0))
                .map_err(backend)?;

            Ok(VaultStats {
                tasks_by_state,
                total_tasks,
                pending_approvals: pending_approvals as u64,
                fingerprints: fingerprints as u64,
                audit_entries: audit_entries as u64,
                db_size_bytes: (page_count * page_size) as u64,
            })
        })
    }
}
