//! Task state machine with validated transitions.
//!
//! Enforces the allowed lifecycle transitions:
//! Pending -> Planned -> Executing -> (AwaitingApproval <-> Executing)
//! -> Done/Failed/Quarantined

use vault_core::types::LifecycleState;

use crate::error::TaskError;

/// Validate that a lifecycle transition is allowed.
///
/// Valid transitions:
/// - Pending -> Planned
/// - Pending -> Quarantined (plan defect, operator)
/// - Planned -> Executing
/// - Planned -> Quarantined (operator)
/// - Executing -> AwaitingApproval
/// - Executing -> Done
/// - Executing -> Failed (step error, iteration ceiling)
/// - Executing -> Quarantined (operator)
/// - AwaitingApproval -> Executing (approved)
/// - AwaitingApproval -> Quarantined (rejected, timed out, operator)
pub fn validate_transition(from: LifecycleState, to: LifecycleState) -> Result<(), TaskError> {
    use LifecycleState::*;

    let valid = matches!(
        (from, to),
        (Pending, Planned)
            | (Pending, Quarantined)
            | (Planned, Executing)
            | (Planned, Quarantined)
            | (Executing, AwaitingApproval)
            | (Executing, Done)
            | (Executing, Failed)
            | (Executing, Quarantined)
            | (AwaitingApproval, Executing)
            | (AwaitingApproval, Quarantined)
    );

    if valid {
        Ok(())
    } else {
        Err(TaskError::InvalidTransition(from, to))
    }
}
