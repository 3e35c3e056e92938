//! Task lifecycle management.
//!
//! Every change to a stored task goes through [`TaskLifecycle`]: state
//! changes are validated against the state machine, written to the audit
//! log, then committed with compare-and-swap. Every commit of a claimed task
//! also renews the claim.

pub mod state_machine;

use std::sync::Arc;

use tracing::{debug, warn};
use uuid::Uuid;
use vault_core::clock::Clock;
use vault_core::error::StoreError;
use vault_core::store::{AuditLog, TaskStore};
use vault_core::types::{AuditEntry, AuditEvent, FailureInfo, LifecycleState, Task};

use crate::error::TaskError;
use crate::task::state_machine::validate_transition;

/// Validated, audited writes to the task store.
#[derive(Clone)]
pub struct TaskLifecycle {
    tasks: Arc<dyn TaskStore>,
    audit: Arc<dyn AuditLog>,
    clock: Arc<dyn Clock>,
}

impl TaskLifecycle {
    pub fn new(tasks: Arc<dyn TaskStore>, audit: Arc<dyn AuditLog>, clock: Arc<dyn Clock>) -> Self {
        Self {
            tasks,
            audit,
            clock,
        }
    }

    pub fn tasks(&self) -> &Arc<dyn TaskStore> {
        &self.tasks
    }

    /// Load a task or fail with `NotFound`.
    pub fn get(&self, id: Uuid) -> Result<Task, TaskError> {
        self.tasks.get(id)?.ok_or(TaskError::NotFound(id))
    }

    /// Append an audit entry stamped with the current time.
    pub fn record(
        &self,
        task_id: Option<Uuid>,
        event: AuditEvent,
        detail: impl Into<String>,
    ) -> Result<(), TaskError> {
        self.audit
            .append(AuditEntry::new(self.clock.now(), task_id, event, detail))?;
        Ok(())
    }

    /// Move `task` to `to`, applying `mutate` to the new record first.
    ///
    /// Returns `Conflict` when the stored task changed since `task` was
    /// read; the caller should reload.
    pub fn transition<F>(
        &self,
        task: &Task,
        to: LifecycleState,
        detail: &str,
        mutate: F,
    ) -> Result<Task, TaskError>
    where
        F: FnOnce(&mut Task),
    {
        let from = task.lifecycle_state;
        validate_transition(from, to)?;

        let mut next = task.clone();
        mutate(&mut next);
        next.lifecycle_state = to;
        self.stamp(&mut next);

        let line = if detail.is_empty() {
            format!("{} -> {}", from, to)
        } else {
            format!("{} -> {}: {}", from, to, detail)
        };
        self.record(Some(task.id), AuditEvent::StateTransition, line.clone())?;

        match self.tasks.compare_and_swap(&next) {
            Ok(stored) => {
                debug!(task_id = %task.id, %from, %to, "Task transitioned");
                Ok(stored)
            }
            Err(StoreError::VersionConflict { expected, actual }) => {
                warn!(task_id = %task.id, %from, %to, expected, actual, "Transition lost a race");
                self.record(
                    Some(task.id),
                    AuditEvent::TransitionAborted,
                    format!("{} (version {} is now {})", line, expected, actual),
                )?;
                Err(TaskError::Conflict(task.id))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Move `task` to a terminal failure state with the given reason.
    pub fn fail(
        &self,
        task: &Task,
        to: LifecycleState,
        failure: FailureInfo,
    ) -> Result<Task, TaskError> {
        let detail = format!("{}: {}", failure.kind, failure.detail);
        self.transition(task, to, &detail, |t| {
            t.failure = Some(failure);
        })
    }

    /// Persist a change that keeps the lifecycle state (step progress,
    /// iteration count, claim).
    pub fn save(&self, task: &Task) -> Result<Task, TaskError> {
        let mut next = task.clone();
        self.stamp(&mut next);
        match self.tasks.compare_and_swap(&next) {
            Ok(stored) => Ok(stored),
            Err(StoreError::VersionConflict { .. }) => Err(TaskError::Conflict(task.id)),
            Err(e) => Err(e.into()),
        }
    }

    /// Extend `worker`'s claim on `id`. `false` means another worker took
    /// the task over or the claim was released.
    pub fn renew_claim(&self, id: Uuid, worker: Uuid) -> Result<bool, TaskError> {
        Ok(self.tasks.renew_claim(id, worker, self.clock.now())?)
    }

    pub fn release_claim(&self, id: Uuid, worker: Uuid) -> Result<bool, TaskError> {
        Ok(self.tasks.release_claim(id, worker)?)
    }

    fn stamp(&self, task: &mut Task) {
        let now = self.clock.now();
        task.touch(now);
        task.claimed_at = task.claimed_by.map(|_| now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vault_core::clock::ManualClock;
    use vault_core::types::{FailureKind, Fingerprint, Timestamp};
    use vault_storage::{InMemoryAuditLog, InMemoryTaskStore};

    fn make_lifecycle() -> (TaskLifecycle, Arc<InMemoryTaskStore>, Arc<InMemoryAuditLog>) {
        let tasks = Arc::new(InMemoryTaskStore::new());
        let audit = Arc::new(InMemoryAuditLog::new());
        let clock = Arc::new(ManualClock::default());
        let lifecycle = TaskLifecycle::new(tasks.clone(), audit.clone(), clock);
        (lifecycle, tasks, audit)
    }

    fn make_task(tasks: &InMemoryTaskStore) -> Task {
        let task = Task::new(
            Fingerprint("aa".repeat(32)),
            "Review notes".to_string(),
            None,
            Timestamp(0),
        );
        tasks.insert(&task).unwrap();
        task
    }

    #[test]
    fn test_transition_persists_and_audits() {
        let (lifecycle, tasks, audit) = make_lifecycle();
        let task = make_task(&tasks);

        let planned = lifecycle
            .transition(&task, LifecycleState::Planned, "claimed", |t| {
                t.claimed_by = Some(Uuid::nil());
            })
            .unwrap();

        assert_eq!(planned.lifecycle_state, LifecycleState::Planned);
        assert_eq!(planned.version, 1);
        assert!(planned.updated_at >= task.updated_at);
        let stored = lifecycle.get(task.id).unwrap();
        assert_eq!(stored.claimed_by, Some(Uuid::nil()));
        assert_eq!(stored.claimed_at, Some(planned.updated_at));

        let trail = audit.for_task(task.id).unwrap();
        assert_eq!(trail.len(), 1);
        assert_eq!(trail[0].event_type, AuditEvent::StateTransition);
        assert_eq!(trail[0].detail, "pending -> planned: claimed");
    }

    #[test]
    fn test_invalid_transition_writes_nothing() {
        let (lifecycle, tasks, audit) = make_lifecycle();
        let task = make_task(&tasks);

        let err = lifecycle
            .transition(&task, LifecycleState::Done, "", |_| {})
            .unwrap_err();
        assert!(matches!(
            err,
            TaskError::InvalidTransition(LifecycleState::Pending, LifecycleState::Done)
        ));
        assert!(audit.all().unwrap().is_empty());
        assert_eq!(lifecycle.get(task.id).unwrap().version, 0);
    }

    #[test]
    fn test_stale_transition_is_aborted() {
        let (lifecycle, tasks, audit) = make_lifecycle();
        let task = make_task(&tasks);

        lifecycle
            .transition(&task, LifecycleState::Quarantined, "operator", |_| {})
            .unwrap();
        let err = lifecycle
            .transition(&task, LifecycleState::Planned, "", |_| {})
            .unwrap_err();
        assert!(matches!(err, TaskError::Conflict(_)));

        let events: Vec<AuditEvent> = audit
            .for_task(task.id)
            .unwrap()
            .into_iter()
            .map(|e| e.event_type)
            .collect();
        assert_eq!(
            events,
            vec![
                AuditEvent::StateTransition,
                AuditEvent::StateTransition,
                AuditEvent::TransitionAborted
            ]
        );
        assert_eq!(
            lifecycle.get(task.id).unwrap().lifecycle_state,
            LifecycleState::Quarantined
        );
    }

    #[test]
    fn test_fail_records_reason() {
        let (lifecycle, tasks, _) = make_lifecycle();
        let task = make_task(&tasks);
        let failure = FailureInfo {
            kind: FailureKind::Defect,
            step_index: None,
            detail: "no steps".into(),
        };

        let stored = lifecycle
            .fail(&task, LifecycleState::Quarantined, failure.clone())
            .unwrap();
        assert_eq!(stored.failure, Some(failure));
    }

    #[test]
    fn test_claim_renewal_and_release() {
        let (lifecycle, tasks, _) = make_lifecycle();
        let task = make_task(&tasks);
        let worker = Uuid::new_v4();

        let mut claimed = task.clone();
        claimed.claimed_by = Some(worker);
        let stored = lifecycle.save(&claimed).unwrap();
        assert!(stored.claimed_at.is_some());

        assert!(lifecycle.renew_claim(task.id, worker).unwrap());
        assert!(!lifecycle.renew_claim(task.id, Uuid::new_v4()).unwrap());
        assert!(lifecycle.release_claim(task.id, worker).unwrap());

        let released = lifecycle.get(task.id).unwrap();
        assert!(released.claimed_by.is_none());
        assert!(released.claimed_at.is_none());
        // Saving an unclaimed task leaves no lease behind.
        assert!(lifecycle.save(&released).unwrap().claimed_at.is_none());
    }

    #[test]
    fn test_save_detects_conflict() {
        let (lifecycle, tasks, _) = make_lifecycle();
        let task = make_task(&tasks);

        let mut first = task.clone();
        first.iteration_count = 1;
        lifecycle.save(&first).unwrap();

        let mut stale = task.clone();
        stale.iteration_count = 2;
        assert!(matches!(
            lifecycle.save(&stale).unwrap_err(),
            TaskError::Conflict(_)
        ));
        assert!(matches!(
            lifecycle.get(Uuid::new_v4()).unwrap_err(),
            TaskError::NotFound(_)
        ));
    }
}
