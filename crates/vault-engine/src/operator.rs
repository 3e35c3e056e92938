//! Operator surface: decisions, cancellation and read-only views.

use std::sync::Arc;

use tracing::{info, warn};
use uuid::Uuid;
use vault_core::clock::Clock;
use vault_core::store::{ApprovalStore, AuditLog, TaskStore};
use vault_core::types::{
    ApprovalRequest, AuditEntry, AuditEvent, Decision, FailureInfo, FailureKind, LifecycleState,
    StepStatus, Task,
};

use crate::error::{ApprovalError, EngineError, TaskError};
use crate::orchestrator::{Stores, TaskReport};
use crate::task::TaskLifecycle;

pub struct Operator {
    approvals: Arc<dyn ApprovalStore>,
    audit: Arc<dyn AuditLog>,
    lifecycle: TaskLifecycle,
    clock: Arc<dyn Clock>,
}

impl Operator {
    pub fn new(stores: &Stores, clock: Arc<dyn Clock>) -> Self {
        Self {
            approvals: Arc::clone(&stores.approvals),
            audit: Arc::clone(&stores.audit),
            lifecycle: TaskLifecycle::new(
                Arc::clone(&stores.tasks),
                Arc::clone(&stores.audit),
                Arc::clone(&clock),
            ),
            clock,
        }
    }

    /// Approve a pending request. An expired request is refused: the gate
    /// has already treated it, or will treat it, as unanswered.
    pub fn approve(&self, request_id: &str, by: &str) -> Result<ApprovalRequest, EngineError> {
        let request = self
            .approvals
            .get(request_id)?
            .ok_or_else(|| ApprovalError::UnknownRequest(request_id.to_string()))?;
        if request.decision == Decision::Pending && request.is_expired(self.clock.now()) {
            warn!(%request_id, by, expires_at = %request.expires_at, "Refusing late approval");
            return Err(ApprovalError::Expired(request_id.to_string()).into());
        }
        self.decide(request_id, Decision::Approved, by)
    }

    pub fn reject(&self, request_id: &str, by: &str) -> Result<ApprovalRequest, EngineError> {
        self.decide(request_id, Decision::Rejected, by)
    }

    fn decide(
        &self,
        request_id: &str,
        decision: Decision,
        by: &str,
    ) -> Result<ApprovalRequest, EngineError> {
        let decided = self
            .approvals
            .set_decision(request_id, decision, by, self.clock.now())
            .map_err(ApprovalError::from)?;
        self.lifecycle.record(
            Some(decided.task_id),
            AuditEvent::ApprovalDecided,
            format!("{} {} by {}", request_id, decision, by),
        )?;
        info!(%request_id, %decision, by, "Approval decided");
        Ok(decided)
    }

    /// Stop a task from any non-terminal state. The owning worker notices at
    /// its next step boundary or suspension point.
    pub fn quarantine(&self, task_id: Uuid, reason: &str) -> Result<Task, EngineError> {
        loop {
            let task = self.lifecycle.get(task_id)?;
            if task.lifecycle_state.is_terminal() {
                return Err(TaskError::InvalidTransition(
                    task.lifecycle_state,
                    LifecycleState::Quarantined,
                )
                .into());
            }

            let step_index = task
                .plan
                .as_ref()
                .and_then(|p| p.next_open_step())
                .filter(|s| s.status == StepStatus::InProgress)
                .map(|s| s.index);
            let failure = FailureInfo {
                kind: FailureKind::OperatorQuarantine,
                step_index,
                detail: reason.to_string(),
            };
            match self
                .lifecycle
                .fail(&task, LifecycleState::Quarantined, failure)
            {
                Ok(stored) => {
                    info!(%task_id, reason, "Task quarantined by operator");
                    return Ok(stored);
                }
                Err(TaskError::Conflict(_)) => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    pub fn status(&self, task_id: Uuid) -> Result<TaskReport, EngineError> {
        let task = self.lifecycle.get(task_id)?;
        Ok(TaskReport::load(self.approvals.as_ref(), &task)?)
    }

    pub fn list(
        &self,
        state: Option<LifecycleState>,
        limit: usize,
    ) -> Result<Vec<TaskReport>, EngineError> {
        let tasks = self.lifecycle.tasks().list(state, limit)?;
        tasks
            .iter()
            .map(|t| TaskReport::load(self.approvals.as_ref(), t).map_err(EngineError::from))
            .collect()
    }

    pub fn pending_approvals(&self) -> Result<Vec<ApprovalRequest>, EngineError> {
        Ok(self.approvals.list_pending()?)
    }

    /// Audit trail of one task, oldest first.
    pub fn audit_trail(&self, task_id: Uuid) -> Result<Vec<AuditEntry>, EngineError> {
        self.lifecycle.get(task_id)?;
        Ok(self.audit.for_task(task_id)?)
    }
}
