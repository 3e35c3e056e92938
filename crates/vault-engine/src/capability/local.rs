//! Local capability for preparatory, analysis and logging steps.

use async_trait::async_trait;

use crate::capability::{Capability, CapabilityOutcome, StepContext};

/// Runs steps with no external effect. Always succeeds.
pub struct LocalCapability;

#[async_trait]
impl Capability for LocalCapability {
    fn name(&self) -> &str {
        "local"
    }

    async fn execute(&self, ctx: &StepContext) -> CapabilityOutcome {
        tracing::debug!(task_id = %ctx.task_id, step = ctx.step_index, "Local step executed");
        CapabilityOutcome::ok(format!("{}: done", ctx.description))
    }
}
