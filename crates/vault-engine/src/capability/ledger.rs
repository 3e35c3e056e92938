//! Simulated ledger writer for financial tasks.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use async_trait::async_trait;
use regex::Regex;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

use crate::capability::{Capability, CapabilityOutcome, FailureClass, StepContext};

fn amount_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| {
            Regex::new(
                r"(?i)(?:[$€£]\s?(?P<a>\d[\d,]*(?:\.\d{1,2})?))|(?:\b(?P<b>\d[\d,]*(?:\.\d{1,2})?)\s?(?:usd|eur|gbp|dollars?|euros?)\b)|(?:\bamount\s*[:=]?\s*(?P<c>\d[\d,]*(?:\.\d{1,2})?))",
            )
            .ok()
        })
        .as_ref()
}

/// First monetary amount in `content`, as written (thousands separators
/// removed).
pub fn find_amount(content: &str) -> Option<String> {
    let caps = amount_pattern()?.captures(content)?;
    ["a", "b", "c"]
        .iter()
        .find_map(|name| caps.name(name))
        .map(|m| m.as_str().replace(',', ""))
}

/// Appends executed transactions to `<outbox>/ledger.jsonl`.
pub struct LedgerCapability {
    path: PathBuf,
}

impl LedgerCapability {
    pub fn new(dir: &Path) -> Self {
        Self {
            path: dir.join("ledger.jsonl"),
        }
    }

    async fn append(&self, record: &serde_json::Value) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        let mut out = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        out.write_all(line.as_bytes()).await?;
        out.flush().await
    }
}

#[async_trait]
impl Capability for LedgerCapability {
    fn name(&self) -> &str {
        "ledger"
    }

    async fn execute(&self, ctx: &StepContext) -> CapabilityOutcome {
        let Some(amount) = find_amount(&ctx.content) else {
            return CapabilityOutcome::rejected(
                FailureClass::Validation,
                "no amount in task content",
            );
        };

        let record = serde_json::json!({
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "task_id": ctx.task_id.to_string(),
            "step": ctx.step_index,
            "amount": amount,
            "description": ctx.description,
        });

        match self.append(&record).await {
            Ok(()) => {
                info!(task_id = %ctx.task_id, %amount, "Ledger entry written");
                CapabilityOutcome::ok(format!("transaction of {} recorded", amount))
            }
            Err(e) => {
                warn!(task_id = %ctx.task_id, error = %e, "Ledger write failed");
                CapabilityOutcome::transient(format!("ledger write failed: {}", e))
            }
        }
    }
}
