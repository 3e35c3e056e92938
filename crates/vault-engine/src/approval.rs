//! Human approval gate for risky steps.
//!
//! The gate persists requests and polls for a decision written by an
//! operator. It never writes a decision itself: an unanswered request runs
//! out its deadline and is reported as [`ApprovalOutcome::TimedOut`].

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};
use uuid::Uuid;
use vault_core::clock::Clock;
use vault_core::config::ApprovalConfig;
use vault_core::store::{ApprovalStore, AuditLog, TaskStore};
use vault_core::types::{
    ApprovalRequest, AuditEntry, AuditEvent, Decision, LifecycleState, Timestamp,
};

use crate::error::ApprovalError;

/// How an approval wait ended. Everything except `Approved` stops the task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalOutcome {
    Approved,
    /// A human explicitly said no.
    Rejected,
    /// Nobody answered before the deadline.
    TimedOut,
    /// The owning task was quarantined or removed while waiting.
    Cancelled,
}

impl ApprovalOutcome {
    pub fn is_approved(&self) -> bool {
        matches!(self, ApprovalOutcome::Approved)
    }
}

impl fmt::Display for ApprovalOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApprovalOutcome::Approved => write!(f, "approved"),
            ApprovalOutcome::Rejected => write!(f, "rejected"),
            ApprovalOutcome::TimedOut => write!(f, "timed_out"),
            ApprovalOutcome::Cancelled => write!(f, "cancelled"),
        }
    }
}

pub struct ApprovalGate {
    approvals: Arc<dyn ApprovalStore>,
    tasks: Arc<dyn TaskStore>,
    audit: Arc<dyn AuditLog>,
    clock: Arc<dyn Clock>,
    config: ApprovalConfig,
}

impl ApprovalGate {
    pub fn new(
        approvals: Arc<dyn ApprovalStore>,
        tasks: Arc<dyn TaskStore>,
        audit: Arc<dyn AuditLog>,
        clock: Arc<dyn Clock>,
        config: ApprovalConfig,
    ) -> Self {
        Self {
            approvals,
            tasks,
            audit,
            clock,
            config,
        }
    }

    /// Default wait passed to [`await_decision`](Self::await_decision).
    pub fn timeout(&self) -> Duration {
        self.config.timeout()
    }

    fn record(&self, task_id: Uuid, event: AuditEvent, detail: String) -> Result<(), ApprovalError> {
        self.audit
            .append(AuditEntry::new(self.clock.now(), Some(task_id), event, detail))?;
        Ok(())
    }

    /// Persist a pending request for one step and return its id.
    ///
    /// Requesting again for the same step returns the existing request
    /// unchanged, decision included.
    pub fn request_approval(
        &self,
        task_id: Uuid,
        step_index: u32,
        context: &str,
    ) -> Result<String, ApprovalError> {
        let request_id = ApprovalRequest::request_id_for(task_id, step_index);
        if let Some(existing) = self.approvals.get(&request_id)? {
            debug!(%request_id, decision = %existing.decision, "Approval request already exists");
            return Ok(existing.request_id);
        }

        let now = self.clock.now();
        let request = ApprovalRequest {
            request_id: request_id.clone(),
            task_id,
            step_index,
            context: context.to_string(),
            decision: Decision::Pending,
            decided_by: None,
            decided_at: None,
            created_at: now,
            expires_at: now.plus(self.config.timeout()),
        };
        let stored = self.approvals.insert_if_absent(&request)?;
        self.record(
            task_id,
            AuditEvent::ApprovalRequested,
            format!(
                "{} for step {} (expires {})",
                stored.request_id, step_index, stored.expires_at
            ),
        )?;
        info!(%request_id, %task_id, step = step_index, "Approval requested");
        Ok(stored.request_id)
    }

    /// Wait for a decision on `request_id`, for at most `timeout` and never
    /// past the request's own expiry. An approval written at or after the
    /// expiry counts as no answer.
    ///
    /// When `holder` is set, its claim on the task is renewed on every poll;
    /// losing the claim to another worker ends the wait as cancelled.
    pub async fn await_decision(
        &self,
        request_id: &str,
        timeout: Duration,
        holder: Option<Uuid>,
    ) -> Result<ApprovalOutcome, ApprovalError> {
        let request = self
            .approvals
            .get(request_id)?
            .ok_or_else(|| ApprovalError::UnknownRequest(request_id.to_string()))?;
        let task_id = request.task_id;
        let deadline: Timestamp = request.expires_at.min(self.clock.now().plus(timeout));
        let poll = self.config.poll_interval();

        loop {
            let task = self.tasks.get(task_id)?;
            let live = task
                .as_ref()
                .map_or(false, |t| !t.lifecycle_state.is_terminal());
            if !live {
                let state = task
                    .map(|t| t.lifecycle_state.to_string())
                    .unwrap_or_else(|| "missing".to_string());
                self.record(
                    task_id,
                    AuditEvent::ApprovalCancelled,
                    format!("{} abandoned: task is {}", request_id, state),
                )?;
                info!(%request_id, %task_id, "Approval wait cancelled");
                return Ok(ApprovalOutcome::Cancelled);
            }

            let now = self.clock.now();
            if let Some(worker) = holder {
                if !self.tasks.renew_claim(task_id, worker, now)? {
                    self.record(
                        task_id,
                        AuditEvent::ApprovalCancelled,
                        format!("{} abandoned: claim lost", request_id),
                    )?;
                    warn!(%request_id, %task_id, %worker, "Claim lost while awaiting approval");
                    return Ok(ApprovalOutcome::Cancelled);
                }
            }

            let current = self
                .approvals
                .get(request_id)?
                .ok_or_else(|| ApprovalError::UnknownRequest(request_id.to_string()))?;
            match current.decision {
                Decision::Approved if current.approved_in_time() => {
                    return Ok(ApprovalOutcome::Approved)
                }
                Decision::Approved => {
                    let decided_at = current.decided_at.unwrap_or(now);
                    self.record(
                        task_id,
                        AuditEvent::ApprovalTimeout,
                        format!(
                            "{} approved at {} after expiry {}",
                            request_id, decided_at, current.expires_at
                        ),
                    )?;
                    warn!(%request_id, %task_id, "Approval arrived after expiry, treating as rejected");
                    return Ok(ApprovalOutcome::TimedOut);
                }
                Decision::Rejected => return Ok(ApprovalOutcome::Rejected),
                Decision::Pending => {}
            }

            if now >= deadline {
                self.record(
                    task_id,
                    AuditEvent::ApprovalTimeout,
                    format!("{} unanswered at {}", request_id, deadline),
                )?;
                warn!(%request_id, %task_id, "Approval timed out, treating as rejected");
                return Ok(ApprovalOutcome::TimedOut);
            }

            self.clock.sleep(poll.min(now.until(deadline))).await;
        }
    }
}
