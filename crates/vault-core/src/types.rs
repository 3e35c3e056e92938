use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

// =============================================================================
// Enums
// =============================================================================

/// Lifecycle state of a task.
///
/// Exactly one holder of this value exists per task; it only changes through
/// a compare-and-swap on the task record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Pending,
    Planned,
    Executing,
    AwaitingApproval,
    Done,
    Failed,
    Quarantined,
}

impl LifecycleState {
    pub const ALL: [LifecycleState; 7] = [
        LifecycleState::Pending,
        LifecycleState::Planned,
        LifecycleState::Executing,
        LifecycleState::AwaitingApproval,
        LifecycleState::Done,
        LifecycleState::Failed,
        LifecycleState::Quarantined,
    ];

    /// Terminal states accept no further automatic transition.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            LifecycleState::Done | LifecycleState::Failed | LifecycleState::Quarantined
        )
    }

    /// Name of the vault bucket (folder) that holds tasks in this state.
    pub fn bucket(&self) -> &'static str {
        match self {
            LifecycleState::Pending => "Needs_Action",
            LifecycleState::Planned => "Plans",
            LifecycleState::Executing => "In_Progress",
            LifecycleState::AwaitingApproval => "Pending_Approval",
            LifecycleState::Done => "Done",
            LifecycleState::Failed => "Failed",
            LifecycleState::Quarantined => "Quarantine",
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecycleState::Pending => write!(f, "pending"),
            LifecycleState::Planned => write!(f, "planned"),
            LifecycleState::Executing => write!(f, "executing"),
            LifecycleState::AwaitingApproval => write!(f, "awaiting_approval"),
            LifecycleState::Done => write!(f, "done"),
            LifecycleState::Failed => write!(f, "failed"),
            LifecycleState::Quarantined => write!(f, "quarantined"),
        }
    }
}

impl std::str::FromStr for LifecycleState {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(LifecycleState::Pending),
            "planned" => Ok(LifecycleState::Planned),
            "executing" => Ok(LifecycleState::Executing),
            "awaiting_approval" => Ok(LifecycleState::AwaitingApproval),
            "done" => Ok(LifecycleState::Done),
            "failed" => Ok(LifecycleState::Failed),
            "quarantined" => Ok(LifecycleState::Quarantined),
            _ => Err(format!("Unknown lifecycle state: {}", s)),
        }
    }
}

/// Risk tier assigned by the plan builder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskTier {
    Low,
    Medium,
    High,
}

impl fmt::Display for RiskTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RiskTier::Low => write!(f, "low"),
            RiskTier::Medium => write!(f, "medium"),
            RiskTier::High => write!(f, "high"),
        }
    }
}

impl std::str::FromStr for RiskTier {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(RiskTier::Low),
            "medium" => Ok(RiskTier::Medium),
            "high" => Ok(RiskTier::High),
            _ => Err(format!("Unknown risk tier: {}", s)),
        }
    }
}

/// Task category detected from content. Each category maps to one risk tier
/// and one step template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskCategory {
    Financial,
    Destructive,
    Email,
    Social,
    Report,
    General,
}

impl TaskCategory {
    pub fn risk_tier(&self) -> RiskTier {
        match self {
            TaskCategory::Financial | TaskCategory::Destructive => RiskTier::High,
            TaskCategory::Email | TaskCategory::Social => RiskTier::Medium,
            TaskCategory::Report | TaskCategory::General => RiskTier::Low,
        }
    }
}

impl fmt::Display for TaskCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskCategory::Financial => write!(f, "financial"),
            TaskCategory::Destructive => write!(f, "destructive"),
            TaskCategory::Email => write!(f, "email"),
            TaskCategory::Social => write!(f, "social"),
            TaskCategory::Report => write!(f, "report"),
            TaskCategory::General => write!(f, "general"),
        }
    }
}

/// Status of one plan step. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            StepStatus::Completed | StepStatus::Failed | StepStatus::Skipped
        )
    }

    /// Whether `self -> to` is a forward move.
    pub fn can_advance_to(&self, to: StepStatus) -> bool {
        matches!(
            (self, to),
            (StepStatus::Pending, StepStatus::InProgress)
                | (StepStatus::Pending, StepStatus::Skipped)
                | (StepStatus::InProgress, StepStatus::Completed)
                | (StepStatus::InProgress, StepStatus::Failed)
                | (StepStatus::InProgress, StepStatus::Skipped)
        )
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepStatus::Pending => write!(f, "pending"),
            StepStatus::InProgress => write!(f, "in_progress"),
            StepStatus::Completed => write!(f, "completed"),
            StepStatus::Failed => write!(f, "failed"),
            StepStatus::Skipped => write!(f, "skipped"),
        }
    }
}

/// Human decision on an approval request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Pending,
    Approved,
    Rejected,
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Decision::Pending => write!(f, "pending"),
            Decision::Approved => write!(f, "approved"),
            Decision::Rejected => write!(f, "rejected"),
        }
    }
}

impl std::str::FromStr for Decision {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Decision::Pending),
            "approved" => Ok(Decision::Approved),
            "rejected" => Ok(Decision::Rejected),
            _ => Err(format!("Unknown decision: {}", s)),
        }
    }
}

/// Why a task ended in `Failed` or `Quarantined`.
///
/// Each kind is a separate error class so audits can tell "human said no"
/// from "the system broke" from "ran away".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The plan builder produced no valid plan.
    Defect,
    /// A step's capability failed after retries (or non-retryably).
    StepError,
    /// The iteration ceiling was hit.
    IterationCeiling,
    /// A human explicitly rejected a risky step.
    ApprovalRejected,
    /// No decision arrived before the approval request expired.
    ApprovalTimeout,
    /// An operator quarantined the task.
    OperatorQuarantine,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::Defect => write!(f, "defect"),
            FailureKind::StepError => write!(f, "step_error"),
            FailureKind::IterationCeiling => write!(f, "iteration_ceiling"),
            FailureKind::ApprovalRejected => write!(f, "approval_rejected"),
            FailureKind::ApprovalTimeout => write!(f, "approval_timeout"),
            FailureKind::OperatorQuarantine => write!(f, "operator_quarantine"),
        }
    }
}

/// Audit event classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEvent {
    TaskSubmitted,
    DuplicateSuppressed,
    TaskClaimed,
    StateTransition,
    TransitionAborted,
    StepStarted,
    StepCompleted,
    StepFailed,
    StepSkipped,
    AttemptRecorded,
    ApprovalRequested,
    ApprovalDecided,
    ApprovalTimeout,
    ApprovalCancelled,
    IterationCeiling,
    PlanDefect,
    InboxArchived,
}

impl fmt::Display for AuditEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AuditEvent::TaskSubmitted => "task_submitted",
            AuditEvent::DuplicateSuppressed => "duplicate_suppressed",
            AuditEvent::TaskClaimed => "task_claimed",
            AuditEvent::StateTransition => "state_transition",
            AuditEvent::TransitionAborted => "transition_aborted",
            AuditEvent::StepStarted => "step_started",
            AuditEvent::StepCompleted => "step_completed",
            AuditEvent::StepFailed => "step_failed",
            AuditEvent::StepSkipped => "step_skipped",
            AuditEvent::AttemptRecorded => "attempt_recorded",
            AuditEvent::ApprovalRequested => "approval_requested",
            AuditEvent::ApprovalDecided => "approval_decided",
            AuditEvent::ApprovalTimeout => "approval_timeout",
            AuditEvent::ApprovalCancelled => "approval_cancelled",
            AuditEvent::IterationCeiling => "iteration_ceiling",
            AuditEvent::PlanDefect => "plan_defect",
            AuditEvent::InboxArchived => "inbox_archived",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for AuditEvent {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "task_submitted" => Ok(AuditEvent::TaskSubmitted),
            "duplicate_suppressed" => Ok(AuditEvent::DuplicateSuppressed),
            "task_claimed" => Ok(AuditEvent::TaskClaimed),
            "state_transition" => Ok(AuditEvent::StateTransition),
            "transition_aborted" => Ok(AuditEvent::TransitionAborted),
            "step_started" => Ok(AuditEvent::StepStarted),
            "step_completed" => Ok(AuditEvent::StepCompleted),
            "step_failed" => Ok(AuditEvent::StepFailed),
            "step_skipped" => Ok(AuditEvent::StepSkipped),
            "attempt_recorded" => Ok(AuditEvent::AttemptRecorded),
            "approval_requested" => Ok(AuditEvent::ApprovalRequested),
            "approval_decided" => Ok(AuditEvent::ApprovalDecided),
            "approval_timeout" => Ok(AuditEvent::ApprovalTimeout),
            "approval_cancelled" => Ok(AuditEvent::ApprovalCancelled),
            "iteration_ceiling" => Ok(AuditEvent::IterationCeiling),
            "plan_defect" => Ok(AuditEvent::PlanDefect),
            "inbox_archived" => Ok(AuditEvent::InboxArchived),
            _ => Err(format!("Unknown audit event: {}", s)),
        }
    }
}

// =============================================================================
// Newtype Wrappers
// =============================================================================

/// Unix timestamp in milliseconds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(pub i64);

impl Timestamp {
    pub fn now() -> Self {
        Self(Utc::now().timestamp_millis())
    }

    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        Self(dt.timestamp_millis())
    }

    pub fn to_datetime(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.0).unwrap_or_default()
    }

    pub fn plus(&self, d: std::time::Duration) -> Self {
        Self(self.0.saturating_add(d.as_millis() as i64))
    }

    /// Time from `self` until `later`, zero if `later` is not after `self`.
    pub fn until(&self, later: Timestamp) -> std::time::Duration {
        std::time::Duration::from_millis(later.0.saturating_sub(self.0).max(0) as u64)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_datetime().format("%Y-%m-%d %H:%M:%S%.3f"))
    }
}

/// Lower-hex SHA-256 of a task's raw content.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(pub String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 hex chars, for log lines.
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(12)]
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// =============================================================================
// Domain Structs
// =============================================================================

/// One unit inside a plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    /// 1-based, unique within the plan.
    pub index: u32,
    pub description: String,
    pub risky: bool,
    pub status: StepStatus,
    /// Capability invocations recorded so far.
    pub attempts: u32,
    pub detail: Option<String>,
}

impl Step {
    pub fn new(index: u32, description: impl Into<String>, risky: bool) -> Self {
        Self {
            index,
            description: description.into(),
            risky,
            status: StepStatus::Pending,
            attempts: 0,
            detail: None,
        }
    }

    /// Move the step forward. Returns `false` (and leaves the step as is)
    /// when the move would regress it.
    pub fn advance(&mut self, to: StepStatus) -> bool {
        if self.status.can_advance_to(to) {
            self.status = to;
            true
        } else {
            false
        }
    }
}

/// Ordered plan attached to a task once planning completes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    pub category: TaskCategory,
    pub risk_tier: RiskTier,
    pub steps: Vec<Step>,
}

impl Plan {
    /// Check the structural invariants: non-empty, indices 1..=n in order,
    /// every step still pending.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.steps.is_empty() {
            return Err("plan has no steps".to_string());
        }
        for (pos, step) in self.steps.iter().enumerate() {
            let expected = pos as u32 + 1;
            if step.index != expected {
                return Err(format!(
                    "step at position {} has index {}, expected {}",
                    pos, step.index, expected
                ));
            }
            if step.status != StepStatus::Pending {
                return Err(format!("step {} is not pending", step.index));
            }
            if step.description.trim().is_empty() {
                return Err(format!("step {} has no description", step.index));
            }
        }
        Ok(())
    }

    /// First step that has not completed, in index order.
    pub fn next_open_step(&self) -> Option<&Step> {
        self.steps.iter().find(|s| s.status != StepStatus::Completed)
    }

    pub fn step(&self, index: u32) -> Option<&Step> {
        self.steps.iter().find(|s| s.index == index)
    }

    pub fn step_mut(&mut self, index: u32) -> Option<&mut Step> {
        self.steps.iter_mut().find(|s| s.index == index)
    }

    pub fn is_complete(&self) -> bool {
        self.steps.iter().all(|s| s.status == StepStatus::Completed)
    }
}

/// What stopped a task short of `Done`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureInfo {
    pub kind: FailureKind,
    pub step_index: Option<u32>,
    pub detail: String,
}

/// The unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub fingerprint: Fingerprint,
    pub content: String,
    /// Inbox file name the content came from, if any.
    pub source: Option<String>,
    pub lifecycle_state: LifecycleState,
    /// Present exactly once planning has completed.
    pub plan: Option<Plan>,
    pub iteration_count: u32,
    /// Worker currently holding the task.
    pub claimed_by: Option<Uuid>,
    /// Last time the holder renewed its claim.
    #[serde(default)]
    pub claimed_at: Option<Timestamp>,
    pub failure: Option<FailureInfo>,
    /// Bumped by every successful compare-and-swap.
    pub version: u64,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl Task {
    pub fn new(
        fingerprint: Fingerprint,
        content: String,
        source: Option<String>,
        now: Timestamp,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            fingerprint,
            content,
            source,
            lifecycle_state: LifecycleState::Pending,
            plan: None,
            iteration_count: 0,
            claimed_by: None,
            claimed_at: None,
            failure: None,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn risk_tier(&self) -> Option<RiskTier> {
        self.plan.as_ref().map(|p| p.risk_tier)
    }

    /// The claim was renewed less than `ttl` ago.
    pub fn claim_is_fresh(&self, now: Timestamp, ttl: std::time::Duration) -> bool {
        self.claimed_by.is_some() && self.claimed_at.map_or(false, |at| now < at.plus(ttl))
    }

    pub fn bucket(&self) -> &'static str {
        self.lifecycle_state.bucket()
    }

    /// First line of the content, trimmed to 80 chars.
    pub fn title(&self) -> String {
        let line = self
            .content
            .lines()
            .map(|l| l.trim_start_matches('#').trim())
            .find(|l| !l.is_empty())
            .unwrap_or("(empty)");
        line.chars().take(80).collect()
    }

    /// Advance `updated_at`, never backwards.
    pub fn touch(&mut self, now: Timestamp) {
        if now > self.updated_at {
            self.updated_at = now;
        }
    }
}

/// Approval request for one risky step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub request_id: String,
    pub task_id: Uuid,
    pub step_index: u32,
    pub context: String,
    pub decision: Decision,
    pub decided_by: Option<String>,
    pub decided_at: Option<Timestamp>,
    pub created_at: Timestamp,
    pub expires_at: Timestamp,
}

impl ApprovalRequest {
    /// Deterministic id, so a resumed task finds its earlier request.
    pub fn request_id_for(task_id: Uuid, step_index: u32) -> String {
        format!("{}-step-{}", task_id, step_index)
    }

    pub fn is_expired(&self, now: Timestamp) -> bool {
        now >= self.expires_at
    }

    /// Approved, and the decision landed before the request expired. A
    /// late approval counts as no answer.
    pub fn approved_in_time(&self) -> bool {
        self.decision == Decision::Approved
            && self.decided_at.map_or(false, |at| at < self.expires_at)
    }
}

/// A claimed content hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FingerprintRecord {
    pub hash: Fingerprint,
    pub first_seen_at: Timestamp,
}

/// One append-only audit trail entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Assigned by the log on append; 0 before that.
    pub id: i64,
    pub timestamp: Timestamp,
    pub task_id: Option<Uuid>,
    pub event_type: AuditEvent,
    pub detail: String,
}

impl AuditEntry {
    pub fn new(
        timestamp: Timestamp,
        task_id: Option<Uuid>,
        event_type: AuditEvent,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            id: 0,
            timestamp,
            task_id,
            event_type,
            detail: detail.into(),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
