//! Capability registry and trait definition.
//!
//! A capability performs one step's effect. The engine only sees the
//! [`Capability`] trait; which collaborator runs a step is decided by the
//! [`CapabilityRegistry`] from the task category.

pub mod ledger;
pub mod local;
pub mod outbox;

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use vault_core::types::TaskCategory;

pub use ledger::LedgerCapability;
pub use local::LocalCapability;
pub use outbox::OutboxCapability;

/// Failure classes the retry policy distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// Network blip, 5xx-equivalent, busy resource.
    Transient,
    /// Bad input; retrying cannot help.
    Validation,
    Permission,
    Auth,
    Unknown,
}

impl fmt::Display for FailureClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureClass::Transient => write!(f, "transient"),
            FailureClass::Validation => write!(f, "validation"),
            FailureClass::Permission => write!(f, "permission"),
            FailureClass::Auth => write!(f, "auth"),
            FailureClass::Unknown => write!(f, "unknown"),
        }
    }
}

/// Everything a capability gets to see about the step it runs.
#[derive(Debug, Clone)]
pub struct StepContext {
    pub task_id: Uuid,
    pub step_index: u32,
    pub description: String,
    pub content: String,
    pub category: TaskCategory,
    pub risky: bool,
    /// 1-based attempt number, counted across restarts.
    pub attempt: u32,
}

/// Result of one capability call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapabilityOutcome {
    pub success: bool,
    pub detail: String,
    pub retryable_on_failure: bool,
    pub class: Option<FailureClass>,
}

impl CapabilityOutcome {
    pub fn ok(detail: impl Into<String>) -> Self {
        Self {
            success: true,
            detail: detail.into(),
            retryable_on_failure: false,
            class: None,
        }
    }

    pub fn transient(detail: impl Into<String>) -> Self {
        Self {
            success: false,
            detail: detail.into(),
            retryable_on_failure: true,
            class: Some(FailureClass::Transient),
        }
    }

    /// A failure that no retry can fix.
    pub fn rejected(class: FailureClass, detail: impl Into<String>) -> Self {
        Self {
            success: false,
            detail: detail.into(),
            retryable_on_failure: false,
            class: Some(class),
        }
    }
}

/// An external collaborator that performs step effects.
#[async_trait]
pub trait Capability: Send + Sync {
    fn name(&self) -> &str;

    /// Perform the step. Failures are reported in the outcome, not as an
    /// error, so the invoker can apply the retry policy.
    async fn execute(&self, ctx: &StepContext) -> CapabilityOutcome;
}

/// Maps task categories to the capability that performs their effects.
///
/// Non-risky steps (analysis, preparation, logging) always run on the
/// fallback; risky steps run on the category's capability when one is
/// registered.
pub struct CapabilityRegistry {
    by_category: HashMap<TaskCategory, Arc<dyn Capability>>,
    fallback: Arc<dyn Capability>,
}

impl CapabilityRegistry {
    pub fn new(fallback: Arc<dyn Capability>) -> Self {
        Self {
            by_category: HashMap::new(),
            fallback,
        }
    }

    /// Register the simulated collaborators writing under `outbox_dir`.
    pub fn with_defaults(outbox_dir: &Path) -> Self {
        let mut registry = Self::new(Arc::new(LocalCapability));
        let outbox: Arc<dyn Capability> = Arc::new(OutboxCapability::new(outbox_dir));
        registry.register(TaskCategory::Email, outbox.clone());
        registry.register(TaskCategory::Social, outbox);
        registry.register(
            TaskCategory::Financial,
            Arc::new(LedgerCapability::new(outbox_dir)),
        );
        registry
    }

    pub fn register(&mut self, category: TaskCategory, capability: Arc<dyn Capability>) {
        self.by_category.insert(category, capability);
    }

    pub fn resolve(&self, ctx: &StepContext) -> Arc<dyn Capability> {
        if !ctx.risky {
            return self.fallback.clone();
        }
        self.by_category
            .get(&ctx.category)
            .cloned()
            .unwrap_or_else(|| self.fallback.clone())
    }
}
