//! Keyword and template tables for the keyword planner.
//!
//! Classification is a pure table lookup: each category owns a keyword set
//! and a fixed step template. Table order breaks ties between categories of
//! the same risk tier.

use regex::Regex;
use vault_core::types::TaskCategory;

use crate::error::PlanError;

/// Keyword sets per category, in tie-break order.
pub const CATEGORY_KEYWORDS: &[(TaskCategory, &[&str])] = &[
    (
        TaskCategory::Financial,
        &[
            "payment",
            "invoice",
            "transfer",
            "money",
            "transaction",
            "pay",
            "refund",
            "wire",
        ],
    ),
    (
        TaskCategory::Destructive,
        &["delete", "remove", "destroy", "wipe", "purge"],
    ),
    (
        TaskCategory::Email,
        &["email", "e-mail", "send", "recipient", "reply", "subject"],
    ),
    (
        TaskCategory::Social,
        &[
            "linkedin",
            "post",
            "social",
            "publish",
            "tweet",
            "twitter",
            "facebook",
            "instagram",
        ],
    ),
    (
        TaskCategory::Report,
        &["report", "briefing", "summary", "analysis"],
    ),
];

/// Step templates. No template exceeds five steps, so the default
/// iteration ceiling can complete any of them.
pub fn template(category: TaskCategory) -> &'static [&'static str] {
    match category {
        TaskCategory::Financial => &[
            "Analyze financial transaction",
            "Validate amount and counterparty",
            "Execute transaction",
            "Record ledger entry",
            "Generate receipt",
        ],
        TaskCategory::Destructive => &[
            "Identify affected items",
            "Snapshot items before removal",
            "Execute deletion",
            "Log destructive activity",
        ],
        TaskCategory::Email => &[
            "Analyze email content and recipient",
            "Prepare email draft",
            "Send email",
            "Log email activity",
        ],
        TaskCategory::Social => &[
            "Analyze post content",
            "Check content guidelines",
            "Publish post",
            "Log social media activity",
        ],
        TaskCategory::Report => &[
            "Collect source material",
            "Summarize key findings",
            "Render report",
            "File report in vault",
        ],
        TaskCategory::General => &[
            "Review task content",
            "Decide on required action",
            "Record outcome and mark complete",
        ],
    }
}

/// Leading verbs of steps with an external or irreversible effect.
pub const EFFECT_VERBS: &[&str] = &[
    "send", "publish", "post", "execute", "delete", "transfer", "pay",
];

/// A compiled keyword matcher for one category.
pub struct CategoryPattern {
    pub category: TaskCategory,
    pub regex: Regex,
}

/// Compile the keyword table into word-anchored, case-insensitive
/// patterns. Plural and verb inflections match the same keyword.
pub fn compile() -> Result<Vec<CategoryPattern>, PlanError> {
    CATEGORY_KEYWORDS
        .iter()
        .map(|(category, words)| {
            let mut alternatives = Vec::new();
            for word in words.iter() {
                alternatives.push(format!("{}(?:s|es|d|ed|ing)?", regex::escape(word)));
                // remove -> removing
                if let Some(stem) = word.strip_suffix('e') {
                    alternatives.push(format!("{}ing", regex::escape(stem)));
                }
            }
            let pattern = format!(r"(?i)\b(?:{})\b", alternatives.join("|"));
            let regex = Regex::new(&pattern)
                .map_err(|e| PlanError::Defect(format!("keyword table for {}: {}", category, e)))?;
            Ok(CategoryPattern {
                category: *category,
                regex,
            })
        })
        .collect()
}
