//! Plan building.
//!
//! A planner turns task content into a risk tier and an ordered list of
//! steps. [`KeywordPlanner`] is a deterministic table lookup; see
//! [`patterns`] for the tables.

pub mod patterns;

use tracing::debug;
use vault_core::types::{Plan, RiskTier, Step, TaskCategory};

use crate::error::PlanError;
use crate::planner::patterns::{CategoryPattern, EFFECT_VERBS};

/// Builds the plan for a task from its content.
///
/// Must be a pure function of `content`. An `Err` is a planner defect: the
/// task is quarantined, never retried.
pub trait Planner: Send + Sync {
    fn build_plan(&self, content: &str) -> Result<Plan, PlanError>;
}

/// Classifies content by keyword and expands the category's step template.
pub struct KeywordPlanner {
    patterns: Vec<CategoryPattern>,
}

impl KeywordPlanner {
    pub fn new() -> Result<Self, PlanError> {
        Ok(Self {
            patterns: patterns::compile()?,
        })
    }

    /// Highest-tier category whose keywords appear in `content`; ties go to
    /// the earlier table entry. Unclassifiable content is `General`.
    pub fn classify(&self, content: &str) -> TaskCategory {
        let mut best: Option<TaskCategory> = None;
        for pattern in &self.patterns {
            if !pattern.regex.is_match(content) {
                continue;
            }
            let better = match best {
                Some(current) => pattern.category.risk_tier() > current.risk_tier(),
                None => true,
            };
            if better {
                best = Some(pattern.category);
            }
        }
        best.unwrap_or(TaskCategory::General)
    }
}

/// A step is risky when the task tier calls for approval and the step
/// itself performs the outward or irreversible effect.
pub fn is_risky(tier: RiskTier, description: &str) -> bool {
    if tier < RiskTier::Medium {
        return false;
    }
    let first = description
        .split_whitespace()
        .next()
        .unwrap_or("")
        .to_lowercase();
    EFFECT_VERBS.contains(&first.as_str())
}

impl Planner for KeywordPlanner {
    fn build_plan(&self, content: &str) -> Result<Plan, PlanError> {
        let category = self.classify(content);
        let risk_tier = category.risk_tier();
        let steps = patterns::template(category)
            .iter()
            .enumerate()
            .map(|(i, description)| {
                Step::new(i as u32 + 1, *description, is_risky(risk_tier, description))
            })
            .collect();

        let plan = Plan {
            category,
            risk_tier,
            steps,
        };
        plan.validate().map_err(PlanError::Defect)?;

        debug!(%category, %risk_tier, steps = plan.steps.len(), "Plan built");
        Ok(plan)
    }
}
