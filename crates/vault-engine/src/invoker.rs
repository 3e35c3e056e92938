//! Retrying action invoker.
//!
//! Calls a capability until it succeeds, fails non-retryably, or the retry
//! budget runs out. Each attempt is handed to an [`AttemptObserver`] before
//! the next one starts, so a crash mid-retry leaves an accurate count.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};
use vault_core::clock::Clock;
use vault_core::config::RetryConfig;

use crate::capability::{Capability, CapabilityOutcome, FailureClass, StepContext};
use crate::error::EngineError;

/// Retry budget and backoff schedule.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub non_retryable: HashSet<FailureClass>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            non_retryable: [
                FailureClass::Validation,
                FailureClass::Permission,
                FailureClass::Auth,
            ]
            .into_iter()
            .collect(),
        }
    }

    /// Backoff after failed attempt `attempt` (1-based):
    /// `min(base * 2^(attempt-1), max_delay)`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << exp)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    pub fn is_retryable(&self, outcome: &CapabilityOutcome) -> bool {
        if outcome.success || !outcome.retryable_on_failure {
            return false;
        }
        let class = outcome.class.unwrap_or(FailureClass::Unknown);
        !self.non_retryable.contains(&class)
    }
}

/// How an invocation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvocationOutcome {
    Succeeded,
    /// Every allowed attempt failed.
    Exhausted,
    /// The capability reported a failure retrying cannot fix.
    NonRetryable,
    /// The task was quarantined during a backoff sleep.
    Cancelled,
}

/// Result of [`ActionInvoker::invoke`].
#[derive(Debug, Clone)]
pub struct Invocation {
    pub success: bool,
    pub detail: String,
    /// Total attempts for the step, including ones before a restart.
    pub attempts: u32,
    pub outcome: InvocationOutcome,
}

/// One capability call, as reported to the observer.
#[derive(Debug, Clone)]
pub struct AttemptRecord {
    pub attempt: u32,
    pub success: bool,
    pub detail: String,
    pub class: Option<FailureClass>,
    /// Backoff before the next attempt, if there will be one.
    pub next_delay: Option<Duration>,
}

/// Persists attempts and reports cancellation to the invoker.
pub trait AttemptObserver: Send {
    /// Called after every attempt, before the next one begins.
    fn on_attempt(&mut self, record: &AttemptRecord) -> Result<(), EngineError>;

    /// Called after each backoff sleep.
    fn is_cancelled(&mut self) -> Result<bool, EngineError>;
}

pub struct ActionInvoker {
    policy: RetryPolicy,
    clock: Arc<dyn Clock>,
}

impl ActionInvoker {
    pub fn new(policy: RetryPolicy, clock: Arc<dyn Clock>) -> Self {
        Self { policy, clock }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `capability` for the step in `ctx`, continuing from
    /// `prior_attempts` already recorded for it.
    pub async fn invoke(
        &self,
        capability: &dyn Capability,
        ctx: &StepContext,
        prior_attempts: u32,
        observer: &mut dyn AttemptObserver,
    ) -> Result<Invocation, EngineError> {
        let max = self.policy.max_attempts;
        let mut attempt = prior_attempts;

        if attempt >= max {
            return Ok(Invocation {
                success: false,
                detail: format!("retry budget of {} attempts already spent", max),
                attempts: attempt,
                outcome: InvocationOutcome::Exhausted,
            });
        }

        loop {
            attempt += 1;
            let mut step_ctx = ctx.clone();
            step_ctx.attempt = attempt;

            let outcome = capability.execute(&step_ctx).await;
            let retryable = self.policy.is_retryable(&outcome);
            let next_delay = if !outcome.success && retryable && attempt < max {
                Some(self.policy.delay_for(attempt))
            } else {
                None
            };

            observer.on_attempt(&AttemptRecord {
                attempt,
                success: outcome.success,
                detail: outcome.detail.clone(),
                class: outcome.class,
                next_delay,
            })?;

            if outcome.success {
                debug!(task_id = %ctx.task_id, step = ctx.step_index, attempt, "Capability succeeded");
                return Ok(Invocation {
                    success: true,
                    detail: outcome.detail,
                    attempts: attempt,
                    outcome: InvocationOutcome::Succeeded,
                });
            }

            if !retryable {
                warn!(
                    task_id = %ctx.task_id,
                    step = ctx.step_index,
                    attempt,
                    class = ?outcome.class,
                    "Capability failed, not retryable: {}",
                    outcome.detail
                );
                return Ok(Invocation {
                    success: false,
                    detail: outcome.detail,
                    attempts: attempt,
                    outcome: InvocationOutcome::NonRetryable,
                });
            }

            let Some(delay) = next_delay else {
                warn!(
                    task_id = %ctx.task_id,
                    step = ctx.step_index,
                    attempt,
                    "Capability failed, retries exhausted: {}",
                    outcome.detail
                );
                return Ok(Invocation {
                    success: false,
                    detail: format!("{} (after {} attempts)", outcome.detail, attempt),
                    attempts: attempt,
                    outcome: InvocationOutcome::Exhausted,
                });
            };

            warn!(
                task_id = %ctx.task_id,
                step = ctx.step_index,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "Capability failed, retrying: {}",
                outcome.detail
            );
            self.clock.sleep(delay).await;

            if observer.is_cancelled()? {
                return Ok(Invocation {
                    success: false,
                    detail: "cancelled during retry backoff".to_string(),
                    attempts: attempt,
                    outcome: InvocationOutcome::Cancelled,
                });
            }
        }
    }
}
