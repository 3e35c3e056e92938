//! Error types for the task engine.

use uuid::Uuid;
use vault_core::error::StoreError;
use vault_core::types::LifecycleState;

/// Errors from task lifecycle management.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("Task not found: {0}")]
    NotFound(Uuid),
    #[error("Invalid state transition: {0} -> {1}")]
    InvalidTransition(LifecycleState, LifecycleState),
    #[error("Task {0} was modified concurrently")]
    Conflict(Uuid),
    #[error("Storage error: {0}")]
    Store(#[from] StoreError),
}

/// Errors from the approval gate and the operator decision path.
#[derive(Debug, thiserror::Error)]
pub enum ApprovalError {
    #[error("Unknown approval request: {0}")]
    UnknownRequest(String),
    #[error("Approval request {0} has already been decided")]
    AlreadyDecided(String),
    #[error("Approval request {0} has expired and can no longer be approved")]
    Expired(String),
    #[error("Storage error: {0}")]
    Store(StoreError),
}

impl From<StoreError> for ApprovalError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => ApprovalError::UnknownRequest(id),
            StoreError::AlreadyDecided(id) => ApprovalError::AlreadyDecided(id),
            other => ApprovalError::Store(other),
        }
    }
}

/// Plan building failed. Always a bug in the planner, never retried.
#[derive(Debug, thiserror::Error)]
pub enum PlanError {
    #[error("Plan builder defect: {0}")]
    Defect(String),
}

/// Top-level error for engine operations.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Task(#[from] TaskError),
    #[error(transparent)]
    Approval(#[from] ApprovalError),
    #[error(transparent)]
    Plan(#[from] PlanError),
    #[error("Storage error: {0}")]
    Store(#[from] StoreError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Caller asked for something that does not exist or cannot be decided:
    /// an unknown task, an unknown request id, or a request that is already
    /// decided or expired.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            EngineError::Task(TaskError::NotFound(_))
                | EngineError::Task(TaskError::InvalidTransition(_, _))
                | EngineError::Approval(ApprovalError::UnknownRequest(_))
                | EngineError::Approval(ApprovalError::AlreadyDecided(_))
                | EngineError::Approval(ApprovalError::Expired(_))
        )
    }
}
