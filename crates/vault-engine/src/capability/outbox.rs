//! Simulated outward-communication sender.
//!
//! Email and social dispatches are appended as JSON lines to
//! `<outbox>/email.jsonl` and `<outbox>/social.jsonl` instead of leaving the
//! machine.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use async_trait::async_trait;
use regex::Regex;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};
use vault_core::types::TaskCategory;

use crate::capability::{Capability, CapabilityOutcome, FailureClass, StepContext};

fn recipient_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9-]+(?:\.[A-Za-z0-9-]+)+").ok())
        .as_ref()
}

/// First email address in `content`, if any.
pub fn find_recipient(content: &str) -> Option<String> {
    recipient_pattern()?
        .find(content)
        .map(|m| m.as_str().to_string())
}

/// Appends message dispatches to the outbox folder.
pub struct OutboxCapability {
    dir: PathBuf,
}

impl OutboxCapability {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
        }
    }

    async fn append(&self, file: &str, record: &serde_json::Value) -> std::io::Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        let mut out = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.dir.join(file))
            .await?;
        out.write_all(line.as_bytes()).await?;
        out.flush().await
    }
}

#[async_trait]
impl Capability for OutboxCapability {
    fn name(&self) -> &str {
        "outbox"
    }

    async fn execute(&self, ctx: &StepContext) -> CapabilityOutcome {
        let (file, recipient) = match ctx.category {
            TaskCategory::Email => match find_recipient(&ctx.content) {
                Some(addr) => ("email.jsonl", Some(addr)),
                None => {
                    return CapabilityOutcome::rejected(
                        FailureClass::Validation,
                        "no recipient address in task content",
                    )
                }
            },
            _ => ("social.jsonl", None),
        };

        let summary: String = ctx
            .content
            .lines()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .unwrap_or("")
            .chars()
            .take(120)
            .collect();
        let record = serde_json::json!({
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "task_id": ctx.task_id.to_string(),
            "step": ctx.step_index,
            "channel": ctx.category.to_string(),
            "recipient": recipient,
            "summary": summary,
        });

        match self.append(file, &record).await {
            Ok(()) => {
                info!(task_id = %ctx.task_id, channel = %ctx.category, "Message dispatched to outbox");
                match recipient {
                    Some(addr) => CapabilityOutcome::ok(format!("email queued for {}", addr)),
                    None => CapabilityOutcome::ok(format!("{} post queued", ctx.category)),
                }
            }
            Err(e) => {
                warn!(task_id = %ctx.task_id, error = %e, "Outbox write failed");
                CapabilityOutcome::transient(format!("outbox write failed: {}", e))
            }
        }
    }
}
