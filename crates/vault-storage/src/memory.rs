//! In-memory implementations of the persistence traits.
//!
//! Same contracts as the SQLite stores, without durability. Used by tests
//! and by anything that wants a throwaway vault.

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use uuid::Uuid;

use vault_core::error::StoreError;
use vault_core::store::{ApprovalStore, AuditLog, FingerprintStore, StoreResult, TaskStore};
use vault_core::types::{
    ApprovalRequest, AuditEntry, Decision, Fingerprint, LifecycleState, Task, Timestamp,
};

fn poisoned<E: std::fmt::Display>(e: E) -> StoreError {
    StoreError::Backend(format!("lock poisoned: {}", e))
}

/// Tasks keyed by id.
#[derive(Default)]
pub struct InMemoryTaskStore {
    tasks: RwLock<HashMap<Uuid, Task>>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TaskStore for InMemoryTaskStore {
    fn insert(&self, task: &Task) -> StoreResult<()> {
        let mut tasks = self.tasks.write().map_err(poisoned)?;
        if tasks.values().any(|t| t.fingerprint == task.fingerprint) {
            return Err(StoreError::DuplicateFingerprint(task.fingerprint.to_string()));
        }
        tasks.insert(task.id, task.clone());
        Ok(())
    }

    fn get(&self, id: Uuid) -> StoreResult<Option<Task>> {
        let tasks = self.tasks.read().map_err(poisoned)?;
        Ok(tasks.get(&id).cloned())
    }

    fn find_by_fingerprint(&self, hash: &Fingerprint) -> StoreResult<Option<Task>> {
        let tasks = self.tasks.read().map_err(poisoned)?;
        Ok(tasks.values().find(|t| &t.fingerprint == hash).cloned())
    }

    fn list(&self, state: Option<LifecycleState>, limit: usize) -> StoreResult<Vec<Task>> {
        let tasks = self.tasks.read().map_err(poisoned)?;
        let mut matching: Vec<Task> = tasks
            .values()
            .filter(|t| state.map_or(true, |s| t.lifecycle_state == s))
            .cloned()
            .collect();
        matching.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        matching.truncate(limit);
        Ok(matching)
    }

    fn compare_and_swap(&self, task: &Task) -> StoreResult<Task> {
        let mut tasks = self.tasks.write().map_err(poisoned)?;
        let stored = tasks
            .get_mut(&task.id)
            .ok_or_else(|| StoreError::NotFound(format!("task {}", task.id)))?;
        if stored.version != task.version {
            return Err(StoreError::VersionConflict {
                expected: task.version,
                actual: stored.version,
            });
        }
        let mut next = task.clone();
        next.version = task.version + 1;
        // Identity fields are fixed at creation.
        next.fingerprint = stored.fingerprint.clone();
        next.content = stored.content.clone();
        next.created_at = stored.created_at;
        *stored = next.clone();
        Ok(next)
    }

    fn renew_claim(&self, id: Uuid, worker: Uuid, at: Timestamp) -> StoreResult<bool> {
        let mut tasks = self.tasks.write().map_err(poisoned)?;
        match tasks.get_mut(&id) {
            Some(task) if task.claimed_by == Some(worker) => {
                task.claimed_at = Some(at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn release_claim(&self, id: Uuid, worker: Uuid) -> StoreResult<bool> {
        let mut tasks = self.tasks.write().map_err(poisoned)?;
        match tasks.get_mut(&id) {
            Some(task) if task.claimed_by == Some(worker) => {
                task.claimed_by = None;
                task.claimed_at = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

/// Approval requests keyed by request id.
#[derive(Default)]
pub struct InMemoryApprovalStore {
    requests: RwLock<BTreeMap<String, ApprovalRequest>>,
}

impl InMemoryApprovalStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ApprovalStore for InMemoryApprovalStore {
    fn insert_if_absent(&self, request: &ApprovalRequest) -> StoreResult<ApprovalRequest> {
        let mut requests = self.requests.write().map_err(poisoned)?;
        Ok(requests
            .entry(request.request_id.clone())
            .or_insert_with(|| request.clone())
            .clone())
    }

    fn get(&self, request_id: &str) -> StoreResult<Option<ApprovalRequest>> {
        let requests = self.requests.read().map_err(poisoned)?;
        Ok(requests.get(request_id).cloned())
    }

    fn set_decision(
        &self,
        request_id: &str,
        decision: Decision,
        decided_by: &str,
        at: Timestamp,
    ) -> StoreResult<ApprovalRequest> {
        let mut requests = self.requests.write().map_err(poisoned)?;
        let request = requests
            .get_mut(request_id)
            .ok_or_else(|| StoreError::NotFound(request_id.to_string()))?;
        if request.decision != Decision::Pending {
            return Err(StoreError::AlreadyDecided(request_id.to_string()));
        }
        request.decision = decision;
        request.decided_by = Some(decided_by.to_string());
        request.decided_at = Some(at);
        Ok(request.clone())
    }

    fn list_pending(&self) -> StoreResult<Vec<ApprovalRequest>> {
        let requests = self.requests.read().map_err(poisoned)?;
        let mut pending: Vec<ApprovalRequest> = requests
            .values()
            .filter(|r| r.decision == Decision::Pending)
            .cloned()
            .collect();
        pending.sort_by_key(|r| r.created_at);
        Ok(pending)
    }

    fn for_task(&self, task_id: Uuid) -> StoreResult<Vec<ApprovalRequest>> {
        let requests = self.requests.read().map_err(poisoned)?;
        let mut found: Vec<ApprovalRequest> = requests
            .values()
            .filter(|r| r.task_id == task_id)
            .cloned()
            .collect();
        found.sort_by_key(|r| r.step_index);
        Ok(found)
    }
}

/// Seen content hashes with their first-seen time.
#[derive(Default)]
pub struct InMemoryFingerprintStore {
    hashes: RwLock<HashMap<Fingerprint, Timestamp>>,
}

impl InMemoryFingerprintStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl FingerprintStore for InMemoryFingerprintStore {
    fn contains(&self, hash: &Fingerprint) -> StoreResult<bool> {
        let hashes = self.hashes.read().map_err(poisoned)?;
        Ok(hashes.contains_key(hash))
    }

    fn first_seen(&self, hash: &Fingerprint) -> StoreResult<Option<Timestamp>> {
        let hashes = self.hashes.read().map_err(poisoned)?;
        Ok(hashes.get(hash).copied())
    }

    fn insert(&self, hash: &Fingerprint, at: Timestamp) -> StoreResult<bool> {
        let mut hashes = self.hashes.write().map_err(poisoned)?;
        if hashes.contains_key(hash) {
            return Ok(false);
        }
        hashes.insert(hash.clone(), at);
        Ok(true)
    }

    fn count(&self) -> StoreResult<u64> {
        let hashes = self.hashes.read().map_err(poisoned)?;
        Ok(hashes.len() as u64)
    }
}

/// Audit entries in append order.
#[derive(Default)]
pub struct InMemoryAuditLog {
    entries: RwLock<Vec<AuditEntry>>,
}

impl InMemoryAuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every entry, oldest first.
    pub fn all(&self) -> StoreResult<Vec<AuditEntry>> {
        let entries = self.entries.read().map_err(poisoned)?;
        Ok(entries.clone())
    }
}

impl AuditLog for InMemoryAuditLog {
    fn append(&self, mut entry: AuditEntry) -> StoreResult<AuditEntry> {
        let mut entries = self.entries.write().map_err(poisoned)?;
        entry.id = entries.len() as i64 + 1;
        entries.push(entry.clone());
        Ok(entry)
    }

    fn for_task(&self, task_id: Uuid) -> StoreResult<Vec<AuditEntry>> {
        let entries = self.entries.read().map_err(poisoned)?;
        Ok(entries
            .iter()
            .filter(|e| e.task_id == Some(task_id))
            .cloned()
            .collect())
    }

    fn recent(&self, limit: usize) -> StoreResult<Vec<AuditEntry>> {
        let entries = self.entries.read().map_err(poisoned)?;
        Ok(entries.iter().rev().take(limit).cloned().collect())
    }
}
