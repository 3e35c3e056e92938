//! Task lifecycle engine for the vault.
//!
//! Turns submitted content into planned tasks, gates risky steps behind
//! human approval, invokes capabilities with bounded retries, and drives
//! every task to a terminal state or a resumable checkpoint.

pub mod approval;
pub mod capability;
pub mod error;
pub mod fingerprint;
pub mod inbox;
pub mod invoker;
pub mod operator;
pub mod orchestrator;
pub mod planner;
pub mod task;

pub use approval::{ApprovalGate, ApprovalOutcome};
pub use capability::{
    Capability, CapabilityOutcome, CapabilityRegistry, FailureClass, LedgerCapability,
    LocalCapability, OutboxCapability, StepContext,
};
pub use error::{ApprovalError, EngineError, PlanError, TaskError};
pub use fingerprint::FingerprintTracker;
pub use inbox::{InboxScanner, ScanSummary};
pub use invoker::{
    ActionInvoker, AttemptObserver, AttemptRecord, Invocation, InvocationOutcome, RetryPolicy,
};
pub use operator::Operator;
pub use orchestrator::{Orchestrator, Stores, Submission, TaskReport};
pub use planner::{KeywordPlanner, Planner};
pub use task::TaskLifecycle;
