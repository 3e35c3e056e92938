//! SQLite-backed implementations of the persistence traits.
//!
//! All four stores share one `Arc<Database>`. Plans and failure details are
//! stored as JSON documents; everything a query filters on has its own
//! column.

use std::sync::Arc;

use rusqlite::OptionalExtension;
use uuid::Uuid;

use vault_core::error::StoreError;
use vault_core::store::{ApprovalStore, AuditLog, FingerprintStore, StoreResult, TaskStore};
use vault_core::types::{
    ApprovalRequest, AuditEntry, AuditEvent, Decision, FailureInfo, Fingerprint, LifecycleState,
    Plan, Task, Timestamp,
};

use crate::db::{backend, Database};

const TASK_COLUMNS: &str = "id, fingerprint, content, source, lifecycle_state, plan,
     iteration_count, claimed_by, failure, version, created_at, updated_at, claimed_at";

const APPROVAL_COLUMNS: &str = "request_id, task_id, step_index, context, decision,
     decided_by, decided_at, created_at, expires_at";

// =============================================================================
// Tasks
// =============================================================================

/// Task records in the `tasks` table.
pub struct SqliteTaskStore {
    db: Arc<Database>,
}

impl SqliteTaskStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }
}

impl TaskStore for SqliteTaskStore {
    fn insert(&self, task: &Task) -> StoreResult<()> {
        let plan = task.plan.as_ref().map(serde_json::to_string).transpose()?;
        let failure = task.failure.as_ref().map(serde_json::to_string).transpose()?;

        self.db.with_tx(|tx| {
            let exists: Option<String> = tx
                .query_row(
                    "SELECT id FROM tasks WHERE fingerprint = ?1",
                    rusqlite::params![task.fingerprint.as_str()],
                    |row| row.get(0),
                )
                .optional()
                .map_err(backend)?;
            if exists.is_some() {
                return Err(StoreError::DuplicateFingerprint(task.fingerprint.to_string()));
            }

            tx.execute(
                "INSERT INTO tasks (id, fingerprint, content, source, lifecycle_state, bucket,
                                    category, risk_tier, plan, iteration_count, claimed_by,
                                    failure, version, created_at, updated_at, claimed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
                rusqlite::params![
                    task.id.to_string(),
                    task.fingerprint.as_str(),
                    task.content,
                    task.source,
                    task.lifecycle_state.to_string(),
                    task.bucket(),
                    task.plan.as_ref().map(|p| p.category.to_string()),
                    task.risk_tier().map(|t| t.to_string()),
                    plan,
                    task.iteration_count,
                    task.claimed_by.map(|c| c.to_string()),
                    failure,
                    task.version as i64,
                    task.created_at.0,
                    task.updated_at.0,
                    task.claimed_at.map(|t| t.0),
                ],
            )
            .map_err(|e| StoreError::Backend(format!("Failed to insert task: {}", e)))?;
            Ok(())
        })
    }

    fn get(&self, id: Uuid) -> StoreResult<Option<Task>> {
        self.db.with_conn(|conn| {
            let sql = format!("SELECT {} FROM tasks WHERE id = ?1", TASK_COLUMNS);
            let result = conn
                .query_row(&sql, rusqlite::params![id.to_string()], |row| {
                    Ok(row_to_task(row))
                })
                .optional()
                .map_err(backend)?;

            match result {
                Some(task) => Ok(Some(task?)),
                None => Ok(None),
            }
        })
    }

    fn find_by_fingerprint(&self, hash: &Fingerprint) -> StoreResult<Option<Task>> {
        self.db.with_conn(|conn| {
            let sql = format!("SELECT {} FROM tasks WHERE fingerprint = ?1", TASK_COLUMNS);
            let result = conn
                .query_row(&sql, rusqlite::params![hash.as_str()], |row| {
                    Ok(row_to_task(row))
                })
                .optional()
                .map_err(backend)?;

            match result {
                Some(task) => Ok(Some(task?)),
                None => Ok(None),
            }
        })
    }

    fn list(&self, state: Option<LifecycleState>, limit: usize) -> StoreResult<Vec<Task>> {
        self.db.with_conn(|conn| {
            let sql = format!(
                "SELECT {} FROM tasks
                 WHERE (?1 IS NULL OR lifecycle_state = ?1)
                 ORDER BY created_at ASC, id ASC
                 LIMIT ?2",
                TASK_COLUMNS
            );
            let mut stmt = conn.prepare(&sql).map_err(backend)?;
            let rows = stmt
                .query_map(
                    rusqlite::params![state.map(|s| s.to_string()), limit as i64],
                    |row| Ok(row_to_task(row)),
                )
                .map_err(backend)?;

            let mut tasks = Vec::new();
            for row in rows {
                tasks.push(row.map_err(backend)??);
            }
            Ok(tasks)
        })
    }

    fn compare_and_swap(&self, task: &Task) -> StoreResult<Task> {
        let plan = task.plan.as_ref().map(serde_json::to_string).transpose()?;
        let failure = task.failure.as_ref().map(serde_json::to_string).transpose()?;

        self.db.with_tx(|tx| {
            let changed = tx
                .execute(
                    "UPDATE tasks
                     SET lifecycle_state = ?1, bucket = ?2, category = ?3, risk_tier = ?4,
                         plan = ?5, iteration_count = ?6, claimed_by = ?7, failure = ?8,
                         updated_at = ?9, claimed_at = ?10, version = version + 1
                     WHERE id = ?11 AND version = ?12",
                    rusqlite::params![
                        task.lifecycle_state.to_string(),
                        task.bucket(),
                        task.plan.as_ref().map(|p| p.category.to_string()),
                        task.risk_tier().map(|t| t.to_string()),
                        plan,
                        task.iteration_count,
                        task.claimed_by.map(|c| c.to_string()),
                        failure,
                        task.updated_at.0,
                        task.claimed_at.map(|t| t.0),
                        task.id.to_string(),
                        task.version as i64,
                    ],
                )
                .map_err(|e| StoreError::Backend(format!("Failed to update task: {}", e)))?;

            if changed == 0 {
                let actual: Option<i64> = tx
                    .query_row(
                        "SELECT version FROM tasks WHERE id = ?1",
                        rusqlite::params![task.id.to_string()],
                        |row| row.get(0),
                    )
                    .optional()
                    .map_err(backend)?;
                return match actual {
                    Some(actual) => Err(StoreError::VersionConflict {
                        expected: task.version,
                        actual: actual as u64,
                    }),
                    None => Err(StoreError::NotFound(format!("task {}", task.id))),
                };
            }

            let mut stored = task.clone();
            stored.version = task.version + 1;
            Ok(stored)
        })
    }

    fn renew_claim(&self, id: Uuid, worker: Uuid, at: Timestamp) -> StoreResult<bool> {
        self.db.with_conn(|conn| {
            let changed = conn
                .execute(
                    "UPDATE tasks SET claimed_at = ?1 WHERE id = ?2 AND claimed_by = ?3",
                    rusqlite::params![at.0, id.to_string(), worker.to_string()],
                )
                .map_err(|e| StoreError::Backend(format!("Failed to renew claim: {}", e)))?;
            Ok(changed > 0)
        })
    }

    fn release_claim(&self, id: Uuid, worker: Uuid) -> StoreResult<bool> {
        self.db.with_conn(|conn| {
            let changed = conn
                .execute(
                    "UPDATE tasks SET claimed_by = NULL, claimed_at = NULL
                     WHERE id = ?1 AND claimed_by = ?2",
                    rusqlite::params![id.to_string(), worker.to_string()],
                )
                .map_err(|e| StoreError::Backend(format!("Failed to release claim: {}", e)))?;
            Ok(changed > 0)
        })
    }
}

fn row_to_task(row: &rusqlite::Row<'_>) -> StoreResult<Task> {
    let id: String = row.get(0).map_err(backend)?;
    let fingerprint: String = row.get(1).map_err(backend)?;
    let content: String = row.get(2).map_err(backend)?;
    let source: Option<String> = row.get(3).map_err(backend)?;
    let state: String = row.get(4).map_err(backend)?;
    let plan: Option<String> = row.get(5).map_err(backend)?;
    let iteration_count: u32 = row.get(6).map_err(backend)?;
    let claimed_by: Option<String> = row.get(7).map_err(backend)?;
    let failure: Option<String> = row.get(8).map_err(backend)?;
    let version: i64 = row.get(9).map_err(backend)?;
    let created_at: i64 = row.get(10).map_err(backend)?;
    let updated_at: i64 = row.get(11).map_err(backend)?;
    let claimed_at: Option<i64> = row.get(12).map_err(backend)?;

    Ok(Task {
        id: parse_uuid(&id)?,
        fingerprint: Fingerprint(fingerprint),
        content,
        source,
        lifecycle_state: state.parse().map_err(StoreError::Backend)?,
        plan: plan
            .map(|p| serde_json::from_str::<Plan>(&p))
            .transpose()?,
        iteration_count,
        claimed_by: claimed_by.as_deref().map(parse_uuid).transpose()?,
        claimed_at: claimed_at.map(Timestamp),
        failure: failure
            .map(|f| serde_json::from_str::<FailureInfo>(&f))
            .transpose()?,
        version: version as u64,
        created_at: Timestamp(created_at),
        updated_at: Timestamp(updated_at),
    })
}

fn parse_uuid(s: &str) -> StoreResult<Uuid> {
    Uuid::parse_str(s).map_err(|e| StoreError::Backend(format!("Invalid UUID {}: {}", s, e)))
}

// =============================================================================
// Approvals
// =============================================================================

/// Approval requests in the `approvals` table.
pub struct SqliteApprovalStore {
    db: Arc<Database>,
}

impl SqliteApprovalStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }
}

impl ApprovalStore for SqliteApprovalStore {
    fn insert_if_absent(&self, request: &ApprovalRequest) -> StoreResult<ApprovalRequest> {
        self.db.with_tx(|tx| {
            tx.execute(
                "INSERT OR IGNORE INTO approvals (request_id, task_id, step_index, context, decision,
                                                  decided_by, decided_at, created_at, expires_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                rusqlite::params![
                    request.request_id,
                    request.task_id.to_string(),
                    request.step_index,
                    request.context,
                    request.decision.to_string(),
                    request.decided_by,
                    request.decided_at.map(|t| t.0),
                    request.created_at.0,
                    request.expires_at.0,
                ],
            )
            .map_err(|e| StoreError::Backend(format!("Failed to insert approval: {}", e)))?;

            load_approval(tx, &request.request_id)?
                .ok_or_else(|| StoreError::NotFound(request.request_id.clone()))
        })
    }

    fn get(&self, request_id: &str) -> StoreResult<Option<ApprovalRequest>> {
        self.db.with_conn(|conn| load_approval(conn, request_id))
    }

    fn set_decision(
        &self,
        request_id: &str,
        decision: Decision,
        decided_by: &str,
        at: Timestamp,
    ) -> StoreResult<ApprovalRequest> {
        self.db.with_tx(|tx| {
            let changed = tx
                .execute(
                    "UPDATE approvals SET decision = ?1, decided_by = ?2, decided_at = ?3
                     WHERE request_id = ?4 AND decision = 'pending'",
                    rusqlite::params![decision.to_string(), decided_by, at.0, request_id],
                )
                .map_err(|e| StoreError::Backend(format!("Failed to record decision: {}", e)))?;

            let stored = load_approval(tx, request_id)?
                .ok_or_else(|| StoreError::NotFound(request_id.to_string()))?;
            if changed == 0 {
                return Err(StoreError::AlreadyDecided(request_id.to_string()));
            }
            Ok(stored)
        })
    }

    fn list_pending(&self) -> StoreResult<Vec<ApprovalRequest>> {
        self.db.with_conn(|conn| {
            let sql = format!(
                "SELECT {} FROM approvals WHERE decision = 'pending' ORDER BY created_at ASC",
                APPROVAL_COLUMNS
            );
            query_approvals(conn, &sql, rusqlite::params![])
        })
    }

    fn for_task(&self, task_id: Uuid) -> StoreResult<Vec<ApprovalRequest>> {
        self.db.with_conn(|conn| {
            let sql = format!(
                "SELECT {} FROM approvals WHERE task_id = ?1 ORDER BY step_index ASC",
                APPROVAL_COLUMNS
            );
            query_approvals(conn, &sql, rusqlite::params![task_id.to_string()])
        })
    }
}

fn load_approval(
    conn: &rusqlite::Connection,
    request_id: &str,
) -> StoreResult<Option<ApprovalRequest>> {
    let sql = format!("SELECT {} FROM approvals WHERE request_id = ?1", APPROVAL_COLUMNS);
    let result = conn
        .query_row(&sql, rusqlite::params![request_id], |row| {
            Ok(row_to_approval(row))
        })
        .optional()
        .map_err(backend)?;

    match result {
        Some(request) => Ok(Some(request?)),
        None => Ok(None),
    }
}

fn query_approvals(
    conn: &rusqlite::Connection,
    sql: &str,
    params: &[&dyn rusqlite::ToSql],
) -> StoreResult<Vec<ApprovalRequest>> {
    let mut stmt = conn.prepare(sql).map_err(backend)?;
    let rows = stmt
        .query_map(params, |row| Ok(row_to_approval(row)))
        .map_err(backend)?;

    let mut requests = Vec::new();
    for row in rows {
        requests.push(row.map_err(backend)??);
    }
    Ok(requests)
}

fn row_to_approval(row: &rusqlite::Row<'_>) -> StoreResult<ApprovalRequest> {
    let request_id: String = row.get(0).map_err(backend)?;
    let task_id: String = row.get(1).map_err(backend)?;
    let step_index: u32 = row.get(2).map_err(backend)?;
    let context: String = row.get(3).map_err(backend)?;
    let decision: String = row.get(4).map_err(backend)?;
    let decided_by: Option<String> = row.get(5).map_err(backend)?;
    let decided_at: Option<i64> = row.get(6).map_err(backend)?;
    let created_at: i64 = row.get(7).map_err(backend)?;
    let expires_at: i64 = row.get(8).map_err(backend)?;

    Ok(ApprovalRequest {
        request_id,
        task_id: parse_uuid(&task_id)?,
        step_index,
        context,
        decision: decision.parse().map_err(StoreError::Backend)?,
        decided_by,
        decided_at: decided_at.map(Timestamp),
        created_at: Timestamp(created_at),
        expires_at: Timestamp(expires_at),
    })
}

// =============================================================================
// Fingerprints
// =============================================================================

/// Content hashes in the `fingerprints` table.
pub struct SqliteFingerprintStore {
    db: Arc<Database>,
}

impl SqliteFingerprintStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }
}

impl FingerprintStore for SqliteFingerprintStore {
    fn contains(&self, hash: &Fingerprint) -> StoreResult<bool> {
        self.db.with_conn(|conn| {
            let found: Option<i64> = conn
                .query_row(
                    "SELECT 1 FROM fingerprints WHERE hash = ?1",
                    rusqlite::params![hash.as_str()],
                    |row| row.get(0),
                )
                .optional()
                .map_err(backend)?;
            Ok(found.is_some())
        })
    }

    fn first_seen(&self, hash: &Fingerprint) -> StoreResult<Option<Timestamp>> {
        self.db.with_conn(|conn| {
            let at: Option<i64> = conn
                .query_row(
                    "SELECT first_seen_at FROM fingerprints WHERE hash = ?1",
                    rusqlite::params![hash.as_str()],
                    |row| row.get(0),
                )
                .optional()
                .map_err(backend)?;
            Ok(at.map(Timestamp))
        })
    }

    fn insert(&self, hash: &Fingerprint, at: Timestamp) -> StoreResult<bool> {
        self.db.with_conn(|conn| {
            let inserted = conn
                .execute(
                    "INSERT OR IGNORE INTO fingerprints (hash, first_seen_at) VALUES (?1, ?2)",
                    rusqlite::params![hash.as_str(), at.0],
                )
                .map_err(|e| StoreError::Backend(format!("Failed to record fingerprint: {}", e)))?;
            Ok(inserted > 0)
        })
    }

    fn count(&self) -> StoreResult<u64> {
        self.db.with_conn(|conn| {
            let count: i64 = conn
                .query_row("SELECT COUNT(*) FROM fingerprints", [], |row| row.get(0))
                .map_err(backend)?;
            Ok(count as u64)
        })
    }
}

// =============================================================================
// Audit log
// =============================================================================

/// Append-only rows in the `audit_log` table.
pub struct SqliteAuditLog {
    db: Arc<Database>,
}

impl SqliteAuditLog {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }
}

impl AuditLog for SqliteAuditLog {
    fn append(&self, entry: AuditEntry) -> StoreResult<AuditEntry> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO audit_log (timestamp, task_id, event_type, detail)
                 VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![
                    entry.timestamp.0,
                    entry.task_id.map(|id| id.to_string()),
                    entry.event_type.to_string(),
                    entry.detail,
                ],
            )
            .map_err(|e| StoreError::Backend(format!("Failed to append audit entry: {}", e)))?;

            Ok(AuditEntry {
                id: conn.last_insert_rowid(),
                ..entry
            })
        })
    }

    fn for_task(&self, task_id: Uuid) -> StoreResult<Vec<AuditEntry>> {
        self.db.with_conn(|conn| {
            query_audit(
                conn,
                "SELECT id, timestamp, task_id, event_type, detail
                 FROM audit_log WHERE task_id = ?1 ORDER BY id ASC",
                rusqlite::params![task_id.to_string()],
            )
        })
    }

    fn recent(&self, limit: usize) -> StoreResult<Vec<AuditEntry>> {
        self.db.with_conn(|conn| {
            query_audit(
                conn,
                "SELECT id, timestamp, task_id, event_type, detail
                 FROM audit_log ORDER BY id DESC LIMIT ?1",
                rusqlite::params![limit as i64],
            )
        })
    }
}

fn query_audit(
    conn: &rusqlite::Connection,
    sql: &str,
    params: &[&dyn rusqlite::ToSql],
) -> StoreResult<Vec<AuditEntry>> {
    let mut stmt = conn.prepare(sql).map_err(backend)?;
    let rows = stmt
        .query_map(params, |row| Ok(row_to_audit(row)))
        .map_err(backend)?;

    let mut entries = Vec::new();
    for row in rows {
        entries.push(row.map_err(backend)??);
    }
    Ok(entries)
}

fn row_to_audit(row: &rusqlite::Row<'_>) -> StoreResult<AuditEntry> {
    let id: i64 = row.get(0).map_err(backend)?;
    let timestamp: i64 = row.get(1).map_err(backend)?;
    let task_id: Option<String> = row.get(2).map_err(backend)?;
    let event_type: String = row.get(3).map_err(backend)?;
    let detail: String = row.get(4).map_err(backend)?;

    Ok(AuditEntry {
        id,
        timestamp: Timestamp(timestamp),
        task_id: task_id.as_deref().map(parse_uuid).transpose()?,
        event_type: event_type
            .parse::<AuditEvent>()
            .map_err(StoreError::Backend)?,
        detail,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use vault_core::types::{RiskTier, Step, StepStatus, TaskCategory};

    fn make_db() -> Arc<Database> {
        Arc::new(Database::in_memory().unwrap())
    }

    fn make_task(content: &str) -> Task {
        Task::new(
            Fingerprint(format!("{:0>64}", content.len())),
            content.to_string(),
            Some("note.md".to_string()),
            Timestamp(1_000),
        )
    }

    fn make_plan() -> Plan {
        Plan {
            category: TaskCategory::Email,
            risk_tier: RiskTier::Medium,
            steps: vec![
                Step::new(1, "Analyze email content and recipient", false),
                Step::new(2, "Send email", true),
            ],
        }
    }

    fn make_request(task_id: Uuid) -> ApprovalRequest {
        ApprovalRequest {
            request_id: ApprovalRequest::request_id_for(task_id, 2),
            task_id,
            step_index: 2,
            context: "Send email".to_string(),
            decision: Decision::Pending,
            decided_by: None,
            decided_at: None,
            created_at: Timestamp(1_000),
            expires_at: Timestamp(61_000),
        }
    }

    #[test]
    fn test_task_insert_and_get() {
        let store = SqliteTaskStore::new(make_db());
        let task = make_task("email bob@example.com");
        store.insert(&task).unwrap();

        let loaded = store.get(task.id).unwrap().unwrap();
        assert_eq!(loaded.id, task.id);
        assert_eq!(loaded.content, task.content);
        assert_eq!(loaded.source.as_deref(), Some("note.md"));
        assert_eq!(loaded.lifecycle_state, LifecycleState::Pending);
        assert!(loaded.plan.is_none());
        assert_eq!(loaded.version, 0);

        assert!(store.get(Uuid::new_v4()).unwrap().is_none());
    }

    #[test]
    fn test_task_duplicate_fingerprint_rejected() {
        let store = SqliteTaskStore::new(make_db());
        let task = make_task("same");
        store.insert(&task).unwrap();

        let mut twin = make_task("same");
        twin.id = Uuid::new_v4();
        let err = store.insert(&twin).unwrap_err();
        assert!(matches!(err, StoreError::DuplicateFingerprint(_)));

        let found = store.find_by_fingerprint(&task.fingerprint).unwrap().unwrap();
        assert_eq!(found.id, task.id);
    }

    #[test]
    fn test_compare_and_swap_bumps_version() {
        let store = SqliteTaskStore::new(make_db());
        let task = make_task("plan me");
        store.insert(&task).unwrap();

        let mut next = task.clone();
        next.lifecycle_state = LifecycleState::Planned;
        next.plan = Some(make_plan());
        next.claimed_by = Some(Uuid::new_v4());
        next.claimed_at = Some(Timestamp(2_000));
        let stored = store.compare_and_swap(&next).unwrap();
        assert_eq!(stored.version, 1);

        let loaded = store.get(task.id).unwrap().unwrap();
        assert_eq!(loaded.version, 1);
        assert_eq!(loaded.lifecycle_state, LifecycleState::Planned);
        assert_eq!(loaded.plan, next.plan);
        assert_eq!(loaded.claimed_by, next.claimed_by);
        assert_eq!(loaded.claimed_at, Some(Timestamp(2_000)));
        assert_eq!(loaded.risk_tier(), Some(RiskTier::Medium));
    }

    #[test]
    fn test_claim_renew_and_release_keep_version() {
        let store = SqliteTaskStore::new(make_db());
        let task = make_task("lease");
        store.insert(&task).unwrap();

        let holder = Uuid::new_v4();
        let mut claimed = task.clone();
        claimed.claimed_by = Some(holder);
        claimed.claimed_at = Some(Timestamp(1_000));
        store.compare_and_swap(&claimed).unwrap();

        assert!(store.renew_claim(task.id, holder, Timestamp(9_000)).unwrap());
        assert!(!store.renew_claim(task.id, Uuid::new_v4(), Timestamp(9_500)).unwrap());
        let loaded = store.get(task.id).unwrap().unwrap();
        assert_eq!(loaded.claimed_at, Some(Timestamp(9_000)));
        assert_eq!(loaded.version, 1);

        assert!(!store.release_claim(task.id, Uuid::new_v4()).unwrap());
        assert!(store.release_claim(task.id, holder).unwrap());
        let loaded = store.get(task.id).unwrap().unwrap();
        assert!(loaded.claimed_by.is_none());
        assert!(loaded.claimed_at.is_none());
        assert_eq!(loaded.version, 1);
        assert!(!store.renew_claim(task.id, holder, Timestamp(10_000)).unwrap());
    }

    #[test]
    fn test_compare_and_swap_stale_version_conflicts() {
        let store = SqliteTaskStore::new(make_db());
        let task = make_task("race");
        store.insert(&task).unwrap();

        let mut first = task.clone();
        first.lifecycle_state = LifecycleState::Planned;
        store.compare_and_swap(&first).unwrap();

        let mut second = task.clone();
        second.lifecycle_state = LifecycleState::Quarantined;
        let err = store.compare_and_swap(&second).unwrap_err();
        assert!(matches!(
            err,
            StoreError::VersionConflict {
                expected: 0,
                actual: 1
            }
        ));
    }

    #[test]
    fn test_compare_and_swap_missing_task() {
        let store = SqliteTaskStore::new(make_db());
        let err = store.compare_and_swap(&make_task("ghost")).unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[test]
    fn test_list_filters_by_state() {
        let store = SqliteTaskStore::new(make_db());
        let a = make_task("a");
        let b = make_task("bb");
        store.insert(&a).unwrap();
        store.insert(&b).unwrap();

        let mut done = b.clone();
        done.lifecycle_state = LifecycleState::Done;
        store.compare_and_swap(&done).unwrap();

        assert_eq!(store.list(None, 10).unwrap().len(), 2);
        let pending = store.list(Some(LifecycleState::Pending), 10).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, a.id);
        assert_eq!(store.list(None, 1).unwrap().len(), 1);
    }

    #[test]
    fn test_plan_step_status_persists() {
        let store = SqliteTaskStore::new(make_db());
        let task = make_task("steps");
        store.insert(&task).unwrap();

        let mut next = task.clone();
        let mut plan = make_plan();
        plan.steps[0].status = StepStatus::Completed;
        plan.steps[0].attempts = 2;
        next.plan = Some(plan);
        next.iteration_count = 1;
        store.compare_and_swap(&next).unwrap();

        let loaded = store.get(task.id).unwrap().unwrap();
        let step = loaded.plan.unwrap().steps[0].clone();
        assert_eq!(step.status, StepStatus::Completed);
        assert_eq!(step.attempts, 2);
        assert_eq!(loaded.iteration_count, 1);
    }

    #[test]
    fn test_approval_insert_if_absent_is_idempotent() {
        let db = make_db();
        let tasks = SqliteTaskStore::new(db.clone());
        let approvals = SqliteApprovalStore::new(db);
        let task = make_task("approve me");
        tasks.insert(&task).unwrap();

        let request = make_request(task.id);
        let first = approvals.insert_if_absent(&request).unwrap();
        let mut later = request.clone();
        later.expires_at = Timestamp(999_999);
        let second = approvals.insert_if_absent(&later).unwrap();

        assert_eq!(first, second);
        assert_eq!(second.expires_at, Timestamp(61_000));
        assert_eq!(approvals.list_pending().unwrap().len(), 1);
    }

    #[test]
    fn test_approval_decision_written_once() {
        let db = make_db();
        let tasks = SqliteTaskStore::new(db.clone());
        let approvals = SqliteApprovalStore::new(db);
        let task = make_task("decide");
        tasks.insert(&task).unwrap();
        let request = approvals.insert_if_absent(&make_request(task.id)).unwrap();

        let decided = approvals
            .set_decision(&request.request_id, Decision::Rejected, "alice", Timestamp(5_000))
            .unwrap();
        assert_eq!(decided.decision, Decision::Rejected);
        assert_eq!(decided.decided_by.as_deref(), Some("alice"));
        assert_eq!(decided.decided_at, Some(Timestamp(5_000)));

        let err = approvals
            .set_decision(&request.request_id, Decision::Approved, "bob", Timestamp(6_000))
            .unwrap_err();
        assert!(matches!(err, StoreError::AlreadyDecided(_)));
        assert_eq!(
            approvals.get(&request.request_id).unwrap().unwrap().decision,
            Decision::Rejected
        );
        assert!(approvals.list_pending().unwrap().is_empty());
        assert_eq!(approvals.for_task(task.id).unwrap().len(), 1);
    }

    #[test]
    fn test_approval_unknown_request() {
        let approvals = SqliteApprovalStore::new(make_db());
        let err = approvals
            .set_decision("nope-step-1", Decision::Approved, "bob", Timestamp(1))
            .unwrap_err();
        assert!(matches!(&err, StoreError::NotFound(id) if id == "nope-step-1"));
        assert!(approvals.get("nope-step-1").unwrap().is_none());
    }

    #[test]
    fn test_fingerprint_insert_if_absent() {
        let store = SqliteFingerprintStore::new(make_db());
        let hash = Fingerprint("ab".repeat(32));

        assert!(!store.contains(&hash).unwrap());
        assert_eq!(store.first_seen(&hash).unwrap(), None);
        assert!(store.insert(&hash, Timestamp(1)).unwrap());
        assert!(!store.insert(&hash, Timestamp(2)).unwrap());
        assert!(store.contains(&hash).unwrap());
        assert_eq!(store.first_seen(&hash).unwrap(), Some(Timestamp(1)));
        assert_eq!(store.count().unwrap(), 1);
    }

    #[test]
    fn test_audit_append_and_query() {
        let log = SqliteAuditLog::new(make_db());
        let task_id = Uuid::new_v4();

        let first = log
            .append(AuditEntry::new(Timestamp(1), Some(task_id), AuditEvent::TaskSubmitted, "new"))
            .unwrap();
        log.append(AuditEntry::new(Timestamp(2), None, AuditEvent::InboxArchived, "a.md"))
            .unwrap();
        log.append(AuditEntry::new(
            Timestamp(3),
            Some(task_id),
            AuditEvent::StateTransition,
            "pending -> planned",
        ))
        .unwrap();

        assert!(first.id > 0);
        let trail = log.for_task(task_id).unwrap();
        assert_eq!(trail.len(), 2);
        assert_eq!(trail[0].event_type, AuditEvent::TaskSubmitted);
        assert_eq!(trail[1].detail, "pending -> planned");

        let recent = log.recent(2).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].event_type, AuditEvent::StateTransition);
    }
}
