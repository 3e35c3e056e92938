//! Execution loop.
//!
//! Coordinates the full pipeline from submission through planning, approval
//! and step execution. The loop is state driven: every iteration reloads the
//! task and acts on its persisted state, so a restarted process picks up at
//! the exact step where the previous one stopped.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use vault_core::clock::Clock;
use vault_core::config::{EngineConfig, VaultConfig};
use vault_core::error::StoreError;
use vault_core::store::{ApprovalStore, AuditLog, FingerprintStore, StoreResult, TaskStore};
use vault_core::types::{
    ApprovalRequest, AuditEvent, Decision, FailureInfo, FailureKind, Fingerprint,
    LifecycleState, RiskTier, Step, StepStatus, Task,
};
use vault_storage::{
    Database, InMemoryApprovalStore, InMemoryAuditLog, InMemoryFingerprintStore,
    InMemoryTaskStore, SqliteApprovalStore, SqliteAuditLog, SqliteFingerprintStore,
    SqliteTaskStore,
};

use crate::approval::{ApprovalGate, ApprovalOutcome};
use crate::capability::{CapabilityRegistry, LocalCapability, StepContext};
use crate::error::{EngineError, PlanError, TaskError};
use crate::fingerprint::FingerprintTracker;
use crate::invoker::{ActionInvoker, AttemptObserver, AttemptRecord, InvocationOutcome, RetryPolicy};
use crate::operator::Operator;
use crate::planner::{KeywordPlanner, Planner};
use crate::task::TaskLifecycle;

/// Upper bound on tasks picked up by one `run_pending` pass.
const RUN_BATCH: usize = 10_000;

// =============================================================================
// Stores
// =============================================================================

/// The four persistence handles the engine works against.
#[derive(Clone)]
pub struct Stores {
    pub tasks: Arc<dyn TaskStore>,
    pub approvals: Arc<dyn ApprovalStore>,
    pub fingerprints: Arc<dyn FingerprintStore>,
    pub audit: Arc<dyn AuditLog>,
}

impl Stores {
    pub fn in_memory() -> Self {
        Self {
            tasks: Arc::new(InMemoryTaskStore::new()),
            approvals: Arc::new(InMemoryApprovalStore::new()),
            fingerprints: Arc::new(InMemoryFingerprintStore::new()),
            audit: Arc::new(InMemoryAuditLog::new()),
        }
    }

    pub fn sqlite(db: Arc<Database>) -> Self {
        Self {
            tasks: Arc::new(SqliteTaskStore::new(Arc::clone(&db))),
            approvals: Arc::new(SqliteApprovalStore::new(Arc::clone(&db))),
            fingerprints: Arc::new(SqliteFingerprintStore::new(Arc::clone(&db))),
            audit: Arc::new(SqliteAuditLog::new(db)),
        }
    }
}

// =============================================================================
// Reports
// =============================================================================

/// Operator-facing snapshot of one task.
#[derive(Debug, Clone, Serialize)]
pub struct TaskReport {
    pub task_id: Uuid,
    pub title: String,
    pub state: LifecycleState,
    pub bucket: &'static str,
    pub risk_tier: Option<RiskTier>,
    pub iteration_count: u32,
    pub failure: Option<FailureInfo>,
    pub steps: Vec<Step>,
    /// Undecided approval request, if the task is waiting on one.
    pub pending_request: Option<String>,
}

impl TaskReport {
    pub fn load(approvals: &dyn ApprovalStore, task: &Task) -> StoreResult<Self> {
        let pending_request = approvals
            .for_task(task.id)?
            .into_iter()
            .find(|r| r.decision == Decision::Pending)
            .map(|r| r.request_id);
        Ok(Self {
            task_id: task.id,
            title: task.title(),
            state: task.lifecycle_state,
            bucket: task.bucket(),
            risk_tier: task.risk_tier(),
            iteration_count: task.iteration_count,
            failure: task.failure.clone(),
            steps: task.plan.as_ref().map(|p| p.steps.clone()).unwrap_or_default(),
            pending_request,
        })
    }
}

/// Result of [`Orchestrator::submit`].
#[derive(Debug, Clone)]
pub enum Submission {
    Created(Task),
    /// Byte-identical content was submitted before.
    Duplicate { task_id: Uuid, fingerprint: Fingerprint },
}

impl Submission {
    pub fn task_id(&self) -> Uuid {
        match self {
            Submission::Created(task) => task.id,
            Submission::Duplicate { task_id, .. } => *task_id,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, Submission::Duplicate { .. })
    }
}

// =============================================================================
// Worker registry
// =============================================================================

/// Marks a worker id live for as long as the guard exists. Dropping the
/// guard also gives up the worker's lease on its task, so the next run,
/// in this process or another, does not wait out the claim timeout.
struct WorkerGuard<'a> {
    live: &'a Mutex<HashSet<Uuid>>,
    tasks: &'a dyn TaskStore,
    task_id: Uuid,
    id: Uuid,
}

impl<'a> WorkerGuard<'a> {
    fn register(
        live: &'a Mutex<HashSet<Uuid>>,
        tasks: &'a dyn TaskStore,
        task_id: Uuid,
    ) -> Result<Self, EngineError> {
        let id = Uuid::new_v4();
        live.lock()
            .map_err(|_| StoreError::Backend("worker registry lock poisoned".into()))?
            .insert(id);
        Ok(Self {
            live,
            tasks,
            task_id,
            id,
        })
    }
}

impl Drop for WorkerGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.tasks.release_claim(self.task_id, self.id) {
            warn!(task_id = %self.task_id, worker_id = %self.id, error = %e, "Failed to release claim");
        }
        if let Ok(mut live) = self.live.lock() {
            live.remove(&self.id);
        }
    }
}

enum Flow {
    Continue,
    Stop,
}

// =============================================================================
// Orchestrator
// =============================================================================

pub struct Orchestrator {
    stores: Stores,
    lifecycle: TaskLifecycle,
    tracker: FingerprintTracker,
    planner: Arc<dyn Planner>,
    registry: CapabilityRegistry,
    gate: ApprovalGate,
    invoker: ActionInvoker,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
    live_workers: Mutex<HashSet<Uuid>>,
}

impl Orchestrator {
    pub fn new(
        stores: Stores,
        planner: Arc<dyn Planner>,
        registry: CapabilityRegistry,
        clock: Arc<dyn Clock>,
        config: &VaultConfig,
    ) -> Self {
        let lifecycle = TaskLifecycle::new(
            Arc::clone(&stores.tasks),
            Arc::clone(&stores.audit),
            Arc::clone(&clock),
        );
        let tracker = FingerprintTracker::new(Arc::clone(&stores.fingerprints), Arc::clone(&clock));
        let gate = ApprovalGate::new(
            Arc::clone(&stores.approvals),
            Arc::clone(&stores.tasks),
            Arc::clone(&stores.audit),
            Arc::clone(&clock),
            config.approval.clone(),
        );
        let invoker = ActionInvoker::new(RetryPolicy::from_config(&config.retry), Arc::clone(&clock));
        Self {
            stores,
            lifecycle,
            tracker,
            planner,
            registry,
            gate,
            invoker,
            clock,
            config: config.engine.clone(),
            live_workers: Mutex::new(HashSet::new()),
        }
    }

    /// Keyword planner plus the simulated collaborators under
    /// `<data_dir>/Outbox` (or local-only steps when the outbox is off).
    pub fn from_config(
        stores: Stores,
        clock: Arc<dyn Clock>,
        config: &VaultConfig,
    ) -> Result<Self, EngineError> {
        let planner = Arc::new(KeywordPlanner::new()?);
        let registry = if config.outbox.enabled {
            CapabilityRegistry::with_defaults(&config.outbox_dir())
        } else {
            CapabilityRegistry::new(Arc::new(LocalCapability))
        };
        Ok(Self::new(stores, planner, registry, clock, config))
    }

    pub fn stores(&self) -> &Stores {
        &self.stores
    }

    pub fn tracker(&self) -> &FingerprintTracker {
        &self.tracker
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn operator(&self) -> Operator {
        Operator::new(&self.stores, Arc::clone(&self.clock))
    }

    // -------------------------------------------------------------------------
    // Submission
    // -------------------------------------------------------------------------

    /// Create a task for `content` unless byte-identical content was seen
    /// before. The fingerprint is durable before the task exists, so a crash
    /// in between is repaired by the next submission of the same content.
    pub fn submit(&self, content: &str, source: Option<&str>) -> Result<Submission, EngineError> {
        let fingerprint = FingerprintTracker::fingerprint(content.as_bytes());
        let first = self.tracker.claim(&fingerprint)?;

        if !first {
            if let Some(existing) = self.stores.tasks.find_by_fingerprint(&fingerprint)? {
                return self.suppress(existing.id, fingerprint, source);
            }
            warn!(
                fingerprint = fingerprint.short(),
                "Fingerprint recorded without a task, creating it"
            );
        }

        let task = Task::new(
            fingerprint.clone(),
            content.to_string(),
            source.map(str::to_string),
            self.clock.now(),
        );
        match self.stores.tasks.insert(&task) {
            Ok(()) => {}
            Err(StoreError::DuplicateFingerprint(_)) => {
                let existing = self
                    .stores
                    .tasks
                    .find_by_fingerprint(&fingerprint)?
                    .ok_or_else(|| StoreError::NotFound(fingerprint.to_string()))?;
                return self.suppress(existing.id, fingerprint, source);
            }
            Err(e) => return Err(e.into()),
        }

        self.lifecycle.record(
            Some(task.id),
            AuditEvent::TaskSubmitted,
            format!(
                "fingerprint {} from {}",
                fingerprint.short(),
                source.unwrap_or("cli")
            ),
        )?;
        info!(task_id = %task.id, fingerprint = fingerprint.short(), "Task submitted");
        Ok(Submission::Created(task))
    }

    fn suppress(
        &self,
        task_id: Uuid,
        fingerprint: Fingerprint,
        source: Option<&str>,
    ) -> Result<Submission, EngineError> {
        self.lifecycle.record(
            Some(task_id),
            AuditEvent::DuplicateSuppressed,
            format!(
                "fingerprint {} from {}",
                fingerprint.short(),
                source.unwrap_or("cli")
            ),
        )?;
        info!(%task_id, fingerprint = fingerprint.short(), "Duplicate content suppressed");
        Ok(Submission::Duplicate {
            task_id,
            fingerprint,
        })
    }

    // -------------------------------------------------------------------------
    // Running
    // -------------------------------------------------------------------------

    /// Drive one task until it is terminal, or until it is held by another
    /// live worker or by an unexpired lease from another process.
    pub async fn run_task(&self, task_id: Uuid) -> Result<TaskReport, EngineError> {
        let worker =
            WorkerGuard::register(&self.live_workers, self.stores.tasks.as_ref(), task_id)?;
        debug!(%task_id, worker_id = %worker.id, "Worker started");

        loop {
            let task = self.lifecycle.get(task_id)?;
            if task.lifecycle_state.is_terminal() {
                break;
            }
            match self.advance(task, worker.id).await {
                Ok(Flow::Continue) => {}
                Ok(Flow::Stop) => break,
                Err(EngineError::Task(TaskError::Conflict(_))) => {
                    debug!(%task_id, "Task changed underneath the worker, reloading");
                }
                Err(e) => return Err(e),
            }
        }

        let task = self.lifecycle.get(task_id)?;
        Ok(TaskReport::load(self.stores.approvals.as_ref(), &task)?)
    }

    /// Drive every non-terminal task, at most `worker_concurrency` at a
    /// time. A failing task is logged and left resumable; it does not stop
    /// the others.
    pub async fn run_pending(self: &Arc<Self>) -> Result<Vec<TaskReport>, EngineError> {
        let mut open = Vec::new();
        for state in LifecycleState::ALL.iter().filter(|s| !s.is_terminal()) {
            open.extend(self.stores.tasks.list(Some(*state), RUN_BATCH)?);
        }
        open.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        if open.is_empty() {
            return Ok(Vec::new());
        }
        info!(count = open.len(), "Running open tasks");

        let permits = Arc::new(Semaphore::new(self.config.worker_concurrency.max(1)));
        let mut workers = JoinSet::new();
        for (pos, task) in open.into_iter().enumerate() {
            let this = Arc::clone(self);
            let permits = Arc::clone(&permits);
            workers.spawn(async move {
                let _permit = permits.acquire_owned().await.ok();
                (pos, task.id, this.run_task(task.id).await)
            });
        }

        let mut reports = Vec::new();
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok((pos, _, Ok(report))) => reports.push((pos, report)),
                Ok((_, task_id, Err(e))) => {
                    error!(%task_id, error = %e, "Task run failed, left resumable");
                }
                Err(e) => error!(error = %e, "Worker aborted"),
            }
        }
        reports.sort_by_key(|(pos, _)| *pos);
        Ok(reports.into_iter().map(|(_, r)| r).collect())
    }

    fn is_live(&self, worker_id: Uuid) -> bool {
        self.live_workers
            .lock()
            .map(|live| live.contains(&worker_id))
            .unwrap_or(false)
    }

    async fn advance(&self, task: Task, worker_id: Uuid) -> Result<Flow, EngineError> {
        if task.lifecycle_state == LifecycleState::Pending {
            self.plan(&task, worker_id)?;
            return Ok(Flow::Continue);
        }

        let claim = task.claimed_by;
        let lease_fresh = task.claim_is_fresh(self.clock.now(), self.config.claim_timeout());
        let task = match claim {
            Some(holder) if holder == worker_id => task,
            Some(holder) if self.is_live(holder) || lease_fresh => {
                info!(task_id = %task.id, %holder, claimed_at = ?task.claimed_at, "Task held by another worker");
                return Ok(Flow::Stop);
            }
            previous => self.take_over(&task, previous, worker_id)?,
        };

        match task.lifecycle_state {
            LifecycleState::Planned => {
                self.lifecycle
                    .transition(&task, LifecycleState::Executing, "starting steps", |_| {})?;
                Ok(Flow::Continue)
            }
            LifecycleState::Executing => self.execute_next(task, worker_id).await,
            LifecycleState::AwaitingApproval => self.await_approval(task, worker_id).await,
            _ => Ok(Flow::Stop),
        }
    }

    /// Claim a task whose holder is gone: a finished run, or a crashed one
    /// whose lease has run out.
    fn take_over(
        &self,
        task: &Task,
        previous: Option<Uuid>,
        worker_id: Uuid,
    ) -> Result<Task, EngineError> {
        let mut next = task.clone();
        next.claimed_by = Some(worker_id);
        let stored = self.lifecycle.save(&next)?;
        let detail = match previous {
            Some(old) => format!("worker {} took over from stale worker {}", worker_id, old),
            None => format!("worker {} claimed unowned task", worker_id),
        };
        self.lifecycle
            .record(Some(task.id), AuditEvent::TaskClaimed, detail)?;
        info!(task_id = %task.id, %worker_id, "Resuming task");
        Ok(stored)
    }

    /// Pending -> Planned, or quarantine on a planner defect.
    fn plan(&self, task: &Task, worker_id: Uuid) -> Result<(), EngineError> {
        let built = self
            .planner
            .build_plan(&task.content)
            .and_then(|plan| plan.validate().map(|_| plan).map_err(PlanError::Defect));

        match built {
            Ok(plan) => {
                let detail = format!(
                    "{} plan, {} risk, {} steps",
                    plan.category,
                    plan.risk_tier,
                    plan.steps.len()
                );
                let planned = self
                    .lifecycle
                    .transition(task, LifecycleState::Planned, &detail, |t| {
                        t.plan = Some(plan);
                        t.claimed_by = Some(worker_id);
                    })?;
                self.lifecycle.record(
                    Some(task.id),
                    AuditEvent::TaskClaimed,
                    format!("worker {}", worker_id),
                )?;
                info!(
                    task_id = %task.id,
                    risk = ?planned.risk_tier(),
                    "Task planned"
                );
                Ok(())
            }
            Err(PlanError::Defect(msg)) => {
                error!(task_id = %task.id, "Plan builder defect: {}", msg);
                self.lifecycle
                    .record(Some(task.id), AuditEvent::PlanDefect, msg.clone())?;
                self.lifecycle.fail(
                    task,
                    LifecycleState::Quarantined,
                    FailureInfo {
                        kind: FailureKind::Defect,
                        step_index: None,
                        detail: msg,
                    },
                )?;
                Ok(())
            }
        }
    }

    /// Work on the first step that has not completed.
    async fn execute_next(&self, task: Task, worker_id: Uuid) -> Result<Flow, EngineError> {
        let Some(plan) = task.plan.as_ref() else {
            self.stop_task(
                &task,
                LifecycleState::Quarantined,
                FailureKind::Defect,
                None,
                "executing without a plan".to_string(),
                None,
            )?;
            return Ok(Flow::Continue);
        };

        let Some(step) = plan.next_open_step().cloned() else {
            let detail = format!("{} steps completed", plan.steps.len());
            self.lifecycle
                .transition(&task, LifecycleState::Done, &detail, |_| {})?;
            info!(task_id = %task.id, iterations = task.iteration_count, "Task done");
            return Ok(Flow::Continue);
        };

        match step.status {
            StepStatus::Pending => {
                self.start_step(&task, &step)?;
                Ok(Flow::Continue)
            }
            StepStatus::InProgress => self.run_step(task, step, worker_id).await,
            status => {
                self.stop_task(
                    &task,
                    LifecycleState::Failed,
                    FailureKind::StepError,
                    Some(step.index),
                    format!("step {} is already {}", step.index, status),
                    None,
                )?;
                Ok(Flow::Continue)
            }
        }
    }

    /// Count the iteration and mark the step in progress, or stop the task
    /// at the ceiling.
    fn start_step(&self, task: &Task, step: &Step) -> Result<(), EngineError> {
        let max = self.config.max_iterations;
        if task.iteration_count >= max {
            let detail = format!(
                "iteration ceiling of {} reached before step {}",
                max, step.index
            );
            warn!(task_id = %task.id, step = step.index, max, "Iteration ceiling reached");
            self.lifecycle
                .record(Some(task.id), AuditEvent::IterationCeiling, detail.clone())?;
            self.stop_task(
                task,
                LifecycleState::Failed,
                FailureKind::IterationCeiling,
                Some(step.index),
                detail,
                None,
            )?;
            return Ok(());
        }

        let mut next = task.clone();
        next.iteration_count += 1;
        if let Some(s) = next.plan.as_mut().and_then(|p| p.step_mut(step.index)) {
            s.advance(StepStatus::InProgress);
        }
        let stored = self.lifecycle.save(&next)?;
        self.lifecycle.record(
            Some(task.id),
            AuditEvent::StepStarted,
            format!(
                "step {}: {} (iteration {}/{})",
                step.index, step.description, stored.iteration_count, max
            ),
        )?;
        debug!(task_id = %task.id, step = step.index, "Step started");
        Ok(())
    }

    /// Invoke an in-progress step, first routing risky steps through
    /// approval.
    async fn run_step(&self, task: Task, step: Step, worker_id: Uuid) -> Result<Flow, EngineError> {
        if step.risky {
            let request_id = ApprovalRequest::request_id_for(task.id, step.index);
            let approved = self
                .stores
                .approvals
                .get(&request_id)?
                .map_or(false, |r| r.approved_in_time());
            if !approved {
                let detail = format!("step {} needs approval", step.index);
                self.lifecycle
                    .transition(&task, LifecycleState::AwaitingApproval, &detail, |_| {})?;
                return Ok(Flow::Continue);
            }
        }

        let Some(plan) = task.plan.as_ref() else {
            return Ok(Flow::Continue);
        };
        let ctx = StepContext {
            task_id: task.id,
            step_index: step.index,
            description: step.description.clone(),
            content: task.content.clone(),
            category: plan.category,
            risky: step.risky,
            attempt: step.attempts,
        };
        let capability = self.registry.resolve(&ctx);
        debug!(task_id = %task.id, step = step.index, capability = capability.name(), "Invoking step");

        let mut observer = StepObserver {
            lifecycle: &self.lifecycle,
            task,
            step_index: step.index,
            worker_id,
        };
        let invocation = self
            .invoker
            .invoke(capability.as_ref(), &ctx, step.attempts, &mut observer)
            .await?;
        let task = observer.task;

        match invocation.outcome {
            InvocationOutcome::Succeeded => {
                info!(task_id = %task.id, step = step.index, attempts = invocation.attempts, "Step completed");
            }
            InvocationOutcome::Exhausted | InvocationOutcome::NonRetryable => {
                self.lifecycle.record(
                    Some(task.id),
                    AuditEvent::StepFailed,
                    format!(
                        "step {} after {} attempt(s): {}",
                        step.index, invocation.attempts, invocation.detail
                    ),
                )?;
                self.stop_task(
                    &task,
                    LifecycleState::Failed,
                    FailureKind::StepError,
                    Some(step.index),
                    invocation.detail,
                    Some(StepStatus::Failed),
                )?;
            }
            InvocationOutcome::Cancelled => {
                info!(task_id = %task.id, step = step.index, "Step cancelled");
            }
        }
        Ok(Flow::Continue)
    }

    /// Block on the approval request for the current step.
    async fn await_approval(&self, task: Task, worker_id: Uuid) -> Result<Flow, EngineError> {
        let Some(step) = task.plan.as_ref().and_then(|p| p.next_open_step()).cloned() else {
            self.stop_task(
                &task,
                LifecycleState::Quarantined,
                FailureKind::Defect,
                None,
                "awaiting approval with no open step".to_string(),
                None,
            )?;
            return Ok(Flow::Continue);
        };

        let context = format!("Step {}: {} | {}", step.index, step.description, task.title());
        let request_id = self
            .gate
            .request_approval(task.id, step.index, &context)?;
        let outcome = self
            .gate
            .await_decision(&request_id, self.gate.timeout(), Some(worker_id))
            .await?;

        let kind = match outcome {
            ApprovalOutcome::Approved => {
                let detail = format!("{} approved", request_id);
                self.lifecycle
                    .transition(&task, LifecycleState::Executing, &detail, |_| {})?;
                return Ok(Flow::Continue);
            }
            ApprovalOutcome::Cancelled => return Ok(Flow::Continue),
            ApprovalOutcome::Rejected => FailureKind::ApprovalRejected,
            ApprovalOutcome::TimedOut => FailureKind::ApprovalTimeout,
        };

        let detail = format!("{} {}", request_id, outcome);
        warn!(task_id = %task.id, step = step.index, %outcome, "Risky step not approved, quarantining");
        self.lifecycle
            .record(Some(task.id), AuditEvent::StepSkipped, format!("step {}: {}", step.index, outcome))?;
        self.stop_task(
            &task,
            LifecycleState::Quarantined,
            kind,
            Some(step.index),
            detail,
            Some(StepStatus::Skipped),
        )?;
        Ok(Flow::Continue)
    }

    /// Terminal transition that also settles the step, in one write.
    fn stop_task(
        &self,
        task: &Task,
        to: LifecycleState,
        kind: FailureKind,
        step_index: Option<u32>,
        detail: String,
        step_status: Option<StepStatus>,
    ) -> Result<Task, TaskError> {
        let line = format!("{}: {}", kind, detail);
        let failure = FailureInfo {
            kind,
            step_index,
            detail,
        };
        self.lifecycle.transition(task, to, &line, |t| {
            if let (Some(status), Some(index)) = (step_status, step_index) {
                if let Some(s) = t.plan.as_mut().and_then(|p| p.step_mut(index)) {
                    s.advance(status);
                }
            }
            t.failure = Some(failure);
        })
    }
}

/// Persists each attempt on the step before the invoker moves on. A
/// successful attempt settles the step as completed in the same write.
struct StepObserver<'a> {
    lifecycle: &'a TaskLifecycle,
    task: Task,
    step_index: u32,
    worker_id: Uuid,
}

impl AttemptObserver for StepObserver<'_> {
    fn on_attempt(&mut self, record: &AttemptRecord) -> Result<(), EngineError> {
        let mut next = self.task.clone();
        if let Some(s) = next.plan.as_mut().and_then(|p| p.step_mut(self.step_index)) {
            s.attempts = record.attempt;
            s.detail = Some(record.detail.clone());
            if record.success {
                s.advance(StepStatus::Completed);
            }
        }
        self.task = self.lifecycle.save(&next)?;

        let outcome = if record.success {
            "succeeded".to_string()
        } else {
            match record.class {
                Some(class) => format!("failed ({})", class),
                None => "failed".to_string(),
            }
        };
        self.lifecycle.record(
            Some(self.task.id),
            AuditEvent::AttemptRecorded,
            format!(
                "step {} attempt {} {}: {}",
                self.step_index, record.attempt, outcome, record.detail
            ),
        )?;
        if record.success {
            self.lifecycle.record(
                Some(self.task.id),
                AuditEvent::StepCompleted,
                format!(
                    "step {} after {} attempt(s): {}",
                    self.step_index, record.attempt, record.detail
                ),
            )?;
        }
        Ok(())
    }

    fn is_cancelled(&mut self) -> Result<bool, EngineError> {
        if !self.lifecycle.renew_claim(self.task.id, self.worker_id)? {
            warn!(task_id = %self.task.id, worker_id = %self.worker_id, "Claim lost during retry backoff");
            return Ok(true);
        }
        let current = self.lifecycle.get(self.task.id)?;
        if current.lifecycle_state.is_terminal() {
            return Ok(true);
        }
        self.task = current;
        Ok(false)
    }
}
