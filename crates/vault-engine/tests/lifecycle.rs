//! End-to-end lifecycle scenarios.
//!
//! Every test runs on a `ManualClock`, so approval timeouts and retry
//! backoff take no wall-clock time. Approvers run alongside the worker in
//! the same task via `tokio::join!`.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::Notify;
use uuid::Uuid;

use vault_core::clock::{Clock, ManualClock};
use vault_core::config::VaultConfig;
use vault_core::store::{ApprovalStore, AuditLog, TaskStore};
use vault_core::types::{
    ApprovalRequest, AuditEvent, Decision, FailureKind, LifecycleState, Plan, RiskTier, Step, StepStatus,
    TaskCategory,
};
use vault_engine::{
    ApprovalError, Capability, CapabilityOutcome, CapabilityRegistry, EngineError,
    KeywordPlanner, Operator, Orchestrator, PlanError, Planner, StepContext, Stores,
};
use vault_storage::Database;

// =============================================================================
// Helpers
// =============================================================================

/// Records which steps it ran and always succeeds.
#[derive(Default)]
struct Counting {
    calls: Mutex<Vec<u32>>,
}

impl Counting {
    fn calls(&self) -> Vec<u32> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Capability for Counting {
    fn name(&self) -> &str {
        "counting"
    }

    async fn execute(&self, ctx: &StepContext) -> CapabilityOutcome {
        self.calls.lock().unwrap().push(ctx.step_index);
        CapabilityOutcome::ok("done")
    }
}

/// Fails transiently `failures` times, then succeeds.
struct Flaky {
    failures: u32,
    calls: Mutex<u32>,
}

impl Flaky {
    fn new(failures: u32) -> Self {
        Self {
            failures,
            calls: Mutex::new(0),
        }
    }

    fn calls(&self) -> u32 {
        *self.calls.lock().unwrap()
    }
}

#[async_trait]
impl Capability for Flaky {
    fn name(&self) -> &str {
        "flaky"
    }

    async fn execute(&self, _ctx: &StepContext) -> CapabilityOutcome {
        let mut calls = self.calls.lock().unwrap();
        *calls += 1;
        if *calls <= self.failures {
            CapabilityOutcome::transient("upstream returned 503")
        } else {
            CapabilityOutcome::ok("transaction executed")
        }
    }
}

/// Holds the first step open until released, like a slow upstream call.
#[derive(Default)]
struct Blocking {
    calls: Mutex<Vec<u32>>,
    entered: Notify,
    release: Notify,
}

impl Blocking {
    fn calls(&self) -> Vec<u32> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Capability for Blocking {
    fn name(&self) -> &str {
        "blocking"
    }

    async fn execute(&self, ctx: &StepContext) -> CapabilityOutcome {
        self.calls.lock().unwrap().push(ctx.step_index);
        if ctx.step_index == 1 {
            self.entered.notify_one();
            self.release.notified().await;
        }
        CapabilityOutcome::ok("done")
    }
}

/// Five preparatory steps whatever the content.
struct FiveSteps;

impl Planner for FiveSteps {
    fn build_plan(&self, _content: &str) -> Result<Plan, PlanError> {
        Ok(Plan {
            category: TaskCategory::General,
            risk_tier: RiskTier::Low,
            steps: (1..=5).map(|i| Step::new(i, format!("Prepare part {}", i), false)).collect(),
        })
    }
}

/// A broken planner.
struct EmptyPlanner;

impl Planner for EmptyPlanner {
    fn build_plan(&self, _content: &str) -> Result<Plan, PlanError> {
        Ok(Plan {
            category: TaskCategory::General,
            risk_tier: RiskTier::Low,
            steps: Vec::new(),
        })
    }
}

fn build_with(
    stores: Stores,
    planner: Arc<dyn Planner>,
    registry: CapabilityRegistry,
    config: VaultConfig,
) -> Orchestrator {
    let clock: Arc<dyn Clock> = Arc::new(ManualClock::default());
    Orchestrator::new(stores, planner, registry, clock, &config)
}

fn build(stores: Stores, registry: CapabilityRegistry) -> Orchestrator {
    build_with(
        stores,
        Arc::new(KeywordPlanner::new().unwrap()),
        registry,
        VaultConfig::default(),
    )
}

/// Wait for the first approval request and decide it.
async fn decide_first(op: &Operator, approve: bool) -> String {
    for _ in 0..100_000 {
        if let Some(req) = op.pending_approvals().unwrap().into_iter().next() {
            if approve {
                op.approve(&req.request_id, "tester").unwrap();
            } else {
                op.reject(&req.request_id, "tester").unwrap();
            }
            return req.request_id;
        }
        tokio::task::yield_now().await;
    }
    panic!("no approval request appeared");
}

fn events(stores: &Stores, task_id: Uuid) -> Vec<AuditEvent> {
    stores
        .audit
        .for_task(task_id)
        .unwrap()
        .into_iter()
        .map(|e| e.event_type)
        .collect()
}

// =============================================================================
// Scenarios
// =============================================================================

#[tokio::test]
async fn test_low_risk_plan_runs_to_done() {
    let stores = Stores::in_memory();
    let counter = Arc::new(Counting::default());
    let orch = build(stores.clone(), CapabilityRegistry::new(counter.clone()));

    let id = orch.submit("Review the meeting notes", None).unwrap().task_id();
    let report = orch.run_task(id).await.unwrap();

    assert_eq!(report.state, LifecycleState::Done);
    assert_eq!(report.risk_tier, Some(RiskTier::Low));
    assert_eq!(report.iteration_count, 3);
    assert_eq!(counter.calls(), vec![1, 2, 3]);
    assert!(report.failure.is_none());
}

#[tokio::test]
async fn test_rejected_step_quarantines_and_halts() {
    let stores = Stores::in_memory();
    let counter = Arc::new(Counting::default());
    let orch = build(stores.clone(), CapabilityRegistry::new(counter.clone()));
    let op = orch.operator();

    let id = orch
        .submit("Send an email to bob@example.com about the launch", None)
        .unwrap()
        .task_id();
    let (report, request_id) = tokio::join!(orch.run_task(id), decide_first(&op, false));
    let report = report.unwrap();

    assert_eq!(request_id, format!("{}-step-3", id));
    assert_eq!(report.state, LifecycleState::Quarantined);
    assert_eq!(report.risk_tier, Some(RiskTier::Medium));
    let failure = report.failure.unwrap();
    assert_eq!(failure.kind, FailureKind::ApprovalRejected);
    assert_eq!(failure.step_index, Some(3));

    // Preparation ran; the send and everything after it did not.
    assert_eq!(counter.calls(), vec![1, 2]);
    assert_eq!(report.steps[2].status, StepStatus::Skipped);
    assert_eq!(report.steps[3].status, StepStatus::Pending);
    assert!(events(&stores, id).contains(&AuditEvent::ApprovalDecided));
}

#[tokio::test]
async fn test_duplicate_submission_is_a_no_op() {
    let stores = Stores::in_memory();
    let orch = build(stores.clone(), CapabilityRegistry::new(Arc::new(Counting::default())));

    let first = orch.submit("Archive old receipts", None).unwrap();
    let second = orch.submit("Archive old receipts", None).unwrap();

    assert!(!first.is_duplicate());
    assert!(second.is_duplicate());
    assert_eq!(first.task_id(), second.task_id());
    assert_eq!(stores.tasks.list(None, 100).unwrap().len(), 1);
    assert!(orch
        .tracker()
        .seen(&vault_engine::FingerprintTracker::fingerprint(b"Archive old receipts"))
        .unwrap());
    assert!(events(&stores, first.task_id()).contains(&AuditEvent::DuplicateSuppressed));
}

#[tokio::test]
async fn test_flaky_high_risk_step_succeeds_on_third_attempt() {
    let stores = Stores::in_memory();
    let flaky = Arc::new(Flaky::new(2));
    let mut registry = CapabilityRegistry::new(Arc::new(Counting::default()));
    registry.register(TaskCategory::Financial, flaky.clone());
    let orch = build(stores.clone(), registry);
    let op = orch.operator();

    let id = orch.submit("Pay invoice 42 for $300", None).unwrap().task_id();
    let (report, _) = tokio::join!(orch.run_task(id), decide_first(&op, true));
    let report = report.unwrap();

    assert_eq!(report.state, LifecycleState::Done);
    assert_eq!(report.risk_tier, Some(RiskTier::High));
    let step = &report.steps[2];
    assert!(step.risky);
    assert_eq!(step.status, StepStatus::Completed);
    assert_eq!(step.attempts, 3);
    assert_eq!(flaky.calls(), 3);

    let attempts = events(&stores, id)
        .into_iter()
        .filter(|e| *e == AuditEvent::AttemptRecorded)
        .count();
    // Three on the flaky step, one on each of the four others.
    assert_eq!(attempts, 7);
}

#[tokio::test]
async fn test_iteration_ceiling_fails_task() {
    let stores = Stores::in_memory();
    let counter = Arc::new(Counting::default());
    let mut config = VaultConfig::default();
    config.engine.max_iterations = 2;
    let orch = build_with(
        stores.clone(),
        Arc::new(FiveSteps),
        CapabilityRegistry::new(counter.clone()),
        config,
    );

    let id = orch.submit("Prepare the quarterly pack", None).unwrap().task_id();
    let report = orch.run_task(id).await.unwrap();

    assert_eq!(report.state, LifecycleState::Failed);
    assert_eq!(report.iteration_count, 2);
    assert_eq!(report.failure.unwrap().kind, FailureKind::IterationCeiling);
    assert_eq!(counter.calls(), vec![1, 2]);
    for step in &report.steps[2..] {
        assert_eq!(step.status, StepStatus::Pending);
    }
    assert!(events(&stores, id).contains(&AuditEvent::IterationCeiling));
}

#[tokio::test]
async fn test_unanswered_approval_fails_closed() {
    let stores = Stores::in_memory();
    let counter = Arc::new(Counting::default());
    let mut config = VaultConfig::default();
    config.approval.timeout_secs = 120;
    let orch = build_with(
        stores.clone(),
        Arc::new(KeywordPlanner::new().unwrap()),
        CapabilityRegistry::new(counter.clone()),
        config,
    );

    let id = orch.submit("Publish the launch post on LinkedIn", None).unwrap().task_id();
    let report = orch.run_task(id).await.unwrap();

    assert_eq!(report.state, LifecycleState::Quarantined);
    assert_ne!(report.state, LifecycleState::Done);
    assert_eq!(report.failure.unwrap().kind, FailureKind::ApprovalTimeout);
    // The request itself stays undecided.
    assert!(report.pending_request.is_some());
    let trail = events(&stores, id);
    assert!(trail.contains(&AuditEvent::ApprovalTimeout));
    assert!(!trail.contains(&AuditEvent::ApprovalDecided));
}

#[tokio::test]
async fn test_approval_after_expiry_quarantines() {
    let stores = Stores::in_memory();
    let counter = Arc::new(Counting::default());
    let orch = build(stores.clone(), CapabilityRegistry::new(counter.clone()));

    let id = orch
        .submit("Send an email to bob@example.com about the launch", None)
        .unwrap()
        .task_id();
    let late = async {
        let request = loop {
            let pending = stores.approvals.list_pending().unwrap();
            if let Some(req) = pending.into_iter().next() {
                break req;
            }
            tokio::task::yield_now().await;
        };

        // An operator whose clock is past the deadline is turned away.
        let op = Operator::new(&stores, Arc::new(ManualClock::new(request.expires_at)));
        let err = op.approve(&request.request_id, "tester").unwrap_err();
        assert!(matches!(err, EngineError::Approval(ApprovalError::Expired(_))));
        assert!(err.is_not_found());

        // A decision that lands late anyway is not honoured.
        stores
            .approvals
            .set_decision(
                &request.request_id,
                Decision::Approved,
                "tester",
                request.expires_at,
            )
            .unwrap();
    };
    let (report, _) = tokio::join!(orch.run_task(id), late);
    let report = report.unwrap();

    assert_eq!(report.state, LifecycleState::Quarantined);
    let failure = report.failure.unwrap();
    assert_eq!(failure.kind, FailureKind::ApprovalTimeout);
    assert_eq!(failure.step_index, Some(3));
    assert_eq!(counter.calls(), vec![1, 2]);
    assert_eq!(report.steps[2].status, StepStatus::Skipped);
    assert!(events(&stores, id).contains(&AuditEvent::ApprovalTimeout));
}

#[tokio::test]
async fn test_late_approval_on_resume_quarantines() {
    let stores = Stores::in_memory();
    let clock = Arc::new(ManualClock::default());
    let counter = Arc::new(Counting::default());
    let orch = Orchestrator::new(
        stores.clone(),
        Arc::new(KeywordPlanner::new().unwrap()),
        CapabilityRegistry::new(counter.clone()),
        clock.clone(),
        &VaultConfig::default(),
    );
    let id = orch
        .submit("Send an email to bob@example.com about the launch", None)
        .unwrap()
        .task_id();

    // A previous run stopped while waiting on step 3.
    let mut task = stores.tasks.get(id).unwrap().unwrap();
    let mut plan = KeywordPlanner::new().unwrap().build_plan(&task.content).unwrap();
    for step in &mut plan.steps[..2] {
        step.status = StepStatus::Completed;
        step.attempts = 1;
    }
    plan.steps[2].status = StepStatus::InProgress;
    task.plan = Some(plan);
    task.lifecycle_state = LifecycleState::AwaitingApproval;
    task.iteration_count = 3;
    stores.tasks.compare_and_swap(&task).unwrap();
    let request_id = ApprovalRequest::request_id_for(id, 3);
    stores
        .approvals
        .insert_if_absent(&ApprovalRequest {
            request_id: request_id.clone(),
            task_id: id,
            step_index: 3,
            context: "Send email".into(),
            decision: Decision::Pending,
            decided_by: None,
            decided_at: None,
            created_at: clock.now(),
            expires_at: clock.now().plus(std::time::Duration::from_secs(60)),
        })
        .unwrap();

    clock.advance(std::time::Duration::from_secs(7200));
    let err = orch.operator().approve(&request_id, "tester").unwrap_err();
    assert!(matches!(err, EngineError::Approval(ApprovalError::Expired(_))));
    stores
        .approvals
        .set_decision(&request_id, Decision::Approved, "tester", clock.now())
        .unwrap();

    let report = orch.run_task(id).await.unwrap();
    assert_eq!(report.state, LifecycleState::Quarantined);
    assert_eq!(report.failure.unwrap().kind, FailureKind::ApprovalTimeout);
    assert!(counter.calls().is_empty());
}

#[tokio::test]
async fn test_operator_quarantine_interrupts_approval_wait() {
    let stores = Stores::in_memory();
    let orch = build(stores.clone(), CapabilityRegistry::new(Arc::new(Counting::default())));
    let op = orch.operator();

    let id = orch
        .submit("Delete the staging bucket", None)
        .unwrap()
        .task_id();
    let quarantine = async {
        loop {
            if !op.pending_approvals().unwrap().is_empty() {
                return op.quarantine(id, "wrong bucket").unwrap();
            }
            tokio::task::yield_now().await;
        }
    };
    let (report, _) = tokio::join!(orch.run_task(id), quarantine);
    let report = report.unwrap();

    assert_eq!(report.state, LifecycleState::Quarantined);
    let failure = report.failure.unwrap();
    assert_eq!(failure.kind, FailureKind::OperatorQuarantine);
    assert_eq!(failure.detail, "wrong bucket");
    assert!(events(&stores, id).contains(&AuditEvent::ApprovalCancelled));
}

#[tokio::test]
async fn test_always_failing_step_is_bounded() {
    let stores = Stores::in_memory();
    let flaky = Arc::new(Flaky::new(u32::MAX));
    let orch = build(stores.clone(), CapabilityRegistry::new(flaky.clone()));

    let id = orch.submit("Review the meeting notes", None).unwrap().task_id();
    let report = orch.run_task(id).await.unwrap();

    assert_eq!(report.state, LifecycleState::Failed);
    assert_eq!(flaky.calls(), 3);
    assert_eq!(report.steps[0].status, StepStatus::Failed);
    assert_eq!(report.steps[0].attempts, 3);
    let failure = report.failure.unwrap();
    assert_eq!(failure.kind, FailureKind::StepError);
    assert_eq!(failure.step_index, Some(1));
    assert!(events(&stores, id).contains(&AuditEvent::StepFailed));
}

#[tokio::test]
async fn test_non_retryable_failure_stops_after_one_attempt() {
    let dir = tempfile::tempdir().unwrap();
    let stores = Stores::in_memory();
    let orch = build(stores.clone(), CapabilityRegistry::with_defaults(dir.path()));
    let op = orch.operator();

    // Email without a recipient address.
    let id = orch.submit("Send an email to the team", None).unwrap().task_id();
    let (report, _) = tokio::join!(orch.run_task(id), decide_first(&op, true));
    let report = report.unwrap();

    assert_eq!(report.state, LifecycleState::Failed);
    assert_eq!(report.steps[2].attempts, 1);
    assert_eq!(report.steps[2].status, StepStatus::Failed);
    assert_eq!(report.failure.unwrap().step_index, Some(3));
    assert!(!dir.path().join("email.jsonl").exists());
}

#[tokio::test]
async fn test_email_dispatch_lands_in_outbox() {
    let dir = tempfile::tempdir().unwrap();
    let stores = Stores::in_memory();
    let orch = build(stores.clone(), CapabilityRegistry::with_defaults(dir.path()));
    let op = orch.operator();

    let id = orch
        .submit("Send an email to bob@example.com with the agenda", None)
        .unwrap()
        .task_id();
    let (report, _) = tokio::join!(orch.run_task(id), decide_first(&op, true));

    assert_eq!(report.unwrap().state, LifecycleState::Done);
    let written = std::fs::read_to_string(dir.path().join("email.jsonl")).unwrap();
    assert_eq!(written.lines().count(), 1);
}

#[tokio::test]
async fn test_plan_defect_quarantines() {
    let stores = Stores::in_memory();
    let orch = build_with(
        stores.clone(),
        Arc::new(EmptyPlanner),
        CapabilityRegistry::new(Arc::new(Counting::default())),
        VaultConfig::default(),
    );

    let id = orch.submit("Anything", None).unwrap().task_id();
    let report = orch.run_task(id).await.unwrap();

    assert_eq!(report.state, LifecycleState::Quarantined);
    assert_eq!(report.failure.unwrap().kind, FailureKind::Defect);
    assert!(events(&stores, id).contains(&AuditEvent::PlanDefect));
}

#[tokio::test]
async fn test_restart_resumes_at_next_step() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("vault.db");

    // First process: plan the task and leave it mid-step, as a crash would.
    let id = {
        let stores = Stores::sqlite(Arc::new(Database::new(&db_path).unwrap()));
        let orch = build(stores.clone(), CapabilityRegistry::new(Arc::new(Counting::default())));
        let id = orch.submit("Review the meeting notes", None).unwrap().task_id();

        let mut task = stores.tasks.get(id).unwrap().unwrap();
        let mut plan = KeywordPlanner::new().unwrap().build_plan(&task.content).unwrap();
        plan.steps[0].status = StepStatus::Completed;
        plan.steps[0].attempts = 1;
        plan.steps[1].status = StepStatus::InProgress;
        plan.steps[1].attempts = 1;
        task.plan = Some(plan);
        task.lifecycle_state = LifecycleState::Executing;
        task.iteration_count = 2;
        task.claimed_by = Some(Uuid::new_v4());
        stores.tasks.compare_and_swap(&task).unwrap();
        id
    };

    // Second process.
    let stores = Stores::sqlite(Arc::new(Database::new(&db_path).unwrap()));
    let counter = Arc::new(Counting::default());
    let orch = build(stores.clone(), CapabilityRegistry::new(counter.clone()));
    let report = orch.run_task(id).await.unwrap();

    assert_eq!(report.state, LifecycleState::Done);
    assert_eq!(counter.calls(), vec![2, 3]);
    assert_eq!(report.iteration_count, 3);
    assert_eq!(report.steps[0].attempts, 1);
    assert_eq!(report.steps[1].attempts, 2);
    assert!(events(&stores, id).contains(&AuditEvent::TaskClaimed));
}

#[tokio::test]
async fn test_run_pending_with_sqlite_backend() {
    let dir = tempfile::tempdir().unwrap();
    let db = Arc::new(Database::new(&dir.path().join("vault.db")).unwrap());
    let stores = Stores::sqlite(db);
    let orch = Arc::new(build(
        stores.clone(),
        CapabilityRegistry::new(Arc::new(Counting::default())),
    ));

    orch.submit("Review the meeting notes", None).unwrap();
    orch.submit("Write the weekly report", None).unwrap();

    let reports = orch.run_pending().await.unwrap();
    assert_eq!(reports.len(), 2);
    assert!(reports.iter().all(|r| r.state == LifecycleState::Done));
    assert_eq!(
        stores.tasks.list(Some(LifecycleState::Done), 10).unwrap().len(),
        2
    );
}

#[tokio::test]
async fn test_two_processes_do_not_share_a_task() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("vault.db");
    let clock = Arc::new(ManualClock::default());
    let blocking = Arc::new(Blocking::default());
    let open = |path: &std::path::Path| {
        Orchestrator::new(
            Stores::sqlite(Arc::new(Database::new(path).unwrap())),
            Arc::new(KeywordPlanner::new().unwrap()),
            CapabilityRegistry::new(blocking.clone()),
            clock.clone(),
            &VaultConfig::default(),
        )
    };
    let first = open(&db_path);
    let second = open(&db_path);

    let id = first.submit("Review the meeting notes", None).unwrap().task_id();
    let contend = async {
        blocking.entered.notified().await;
        // The first process is inside step 1 and holds a fresh lease.
        let report = second.run_task(id).await.unwrap();
        blocking.release.notify_one();
        report
    };
    let (done, stopped) = tokio::join!(first.run_task(id), contend);

    assert_eq!(stopped.state, LifecycleState::Executing);
    assert_eq!(done.unwrap().state, LifecycleState::Done);
    assert_eq!(blocking.calls(), vec![1, 2, 3]);
    let claims = events(second.stores(), id)
        .into_iter()
        .filter(|e| *e == AuditEvent::TaskClaimed)
        .count();
    assert_eq!(claims, 1);
}

#[tokio::test]
async fn test_expired_lease_is_taken_over_by_another_process() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("vault.db");
    let clock = Arc::new(ManualClock::default());
    let config = VaultConfig::default();

    // A process that crashed mid-step without releasing its claim.
    let id = {
        let stores = Stores::sqlite(Arc::new(Database::new(&db_path).unwrap()));
        let orch = build(stores.clone(), CapabilityRegistry::new(Arc::new(Counting::default())));
        let id = orch.submit("Review the meeting notes", None).unwrap().task_id();
        let mut task = stores.tasks.get(id).unwrap().unwrap();
        let mut plan = KeywordPlanner::new().unwrap().build_plan(&task.content).unwrap();
        plan.steps[0].status = StepStatus::InProgress;
        task.plan = Some(plan);
        task.lifecycle_state = LifecycleState::Executing;
        task.iteration_count = 1;
        task.claimed_by = Some(Uuid::new_v4());
        task.claimed_at = Some(clock.now());
        stores.tasks.compare_and_swap(&task).unwrap();
        id
    };

    let stores = Stores::sqlite(Arc::new(Database::new(&db_path).unwrap()));
    let counter = Arc::new(Counting::default());
    let orch = Orchestrator::new(
        stores.clone(),
        Arc::new(KeywordPlanner::new().unwrap()),
        CapabilityRegistry::new(counter.clone()),
        clock.clone(),
        &config,
    );

    let report = orch.run_task(id).await.unwrap();
    assert_eq!(report.state, LifecycleState::Executing);
    assert!(counter.calls().is_empty());

    clock.advance(config.engine.claim_timeout());
    let report = orch.run_task(id).await.unwrap();
    assert_eq!(report.state, LifecycleState::Done);
    assert_eq!(counter.calls(), vec![1, 2, 3]);
    assert!(events(&stores, id).contains(&AuditEvent::TaskClaimed));
    assert!(stores.tasks.get(id).unwrap().unwrap().claimed_by.is_none());
}
