//! Persistence traits.
//!
//! The engine only talks to storage through these traits, so the SQLite
//! backend and the in-memory backend are interchangeable. Calls are
//! synchronous and short; a returned `Ok` means the write is durable.

use uuid::Uuid;

use crate::error::StoreError;
use crate::types::{
    ApprovalRequest, AuditEntry, Decision, Fingerprint, LifecycleState, Task, Timestamp,
};

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Task records. `compare_and_swap` is the only way to change a stored task.
pub trait TaskStore: Send + Sync {
    /// Store a new task. Fails with `DuplicateFingerprint` when a task with
    /// the same fingerprint already exists.
    fn insert(&self, task: &Task) -> StoreResult<()>;

    fn get(&self, id: Uuid) -> StoreResult<Option<Task>>;

    fn find_by_fingerprint(&self, hash: &Fingerprint) -> StoreResult<Option<Task>>;

    /// Tasks ordered by creation time, optionally filtered by state.
    fn list(&self, state: Option<LifecycleState>, limit: usize) -> StoreResult<Vec<Task>>;

    /// Write `task` only if the stored version equals `task.version`.
    ///
    /// Returns the stored task with its version bumped, or
    /// `VersionConflict` when another writer got there first.
    fn compare_and_swap(&self, task: &Task) -> StoreResult<Task>;

    /// Move `claimed_at` forward if `worker` still holds the task. Does not
    /// bump the version. Returns `false` when the claim is gone.
    fn renew_claim(&self, id: Uuid, worker: Uuid, at: Timestamp) -> StoreResult<bool>;

    /// Clear the claim if `worker` still holds it. Does not bump the version.
    fn release_claim(&self, id: Uuid, worker: Uuid) -> StoreResult<bool>;
}

/// Approval requests. Decisions are written once, from `Pending`.
pub trait ApprovalStore: Send + Sync {
    /// Insert the request unless one with the same id exists; either way
    /// return the stored record.
    fn insert_if_absent(&self, request: &ApprovalRequest) -> StoreResult<ApprovalRequest>;

    fn get(&self, request_id: &str) -> StoreResult<Option<ApprovalRequest>>;

    fn set_decision(
        &self,
        request_id: &str,
        decision: Decision,
        decided_by: &str,
        at: Timestamp,
    ) -> StoreResult<ApprovalRequest>;

    fn list_pending(&self) -> StoreResult<Vec<ApprovalRequest>>;

    fn for_task(&self, task_id: Uuid) -> StoreResult<Vec<ApprovalRequest>>;
}

/// Append-only set of content hashes, each with the time it was first seen.
pub trait FingerprintStore: Send + Sync {
    fn contains(&self, hash: &Fingerprint) -> StoreResult<bool>;

    fn first_seen(&self, hash: &Fingerprint) -> StoreResult<Option<Timestamp>>;

    /// Atomic insert-if-absent. Returns `true` when this call added the hash.
    fn insert(&self, hash: &Fingerprint, at: Timestamp) -> StoreResult<bool>;

    fn count(&self) -> StoreResult<u64>;
}

/// Append-only audit trail.
pub trait AuditLog: Send + Sync {
    /// Append an entry and return it with its assigned id.
    fn append(&self, entry: AuditEntry) -> StoreResult<AuditEntry>;

    /// Entries for one task, oldest first.
    fn for_task(&self, task_id: Uuid) -> StoreResult<Vec<AuditEntry>>;

    /// Most recent entries, newest first.
    fn recent(&self, limit: usize) -> StoreResult<Vec<AuditEntry>>;
}
