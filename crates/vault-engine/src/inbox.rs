//! Inbox folder scanner.
//!
//! Each file dropped into the inbox becomes one submission. Processed files
//! (duplicates included) move to the archive so the inbox drains; a file
//! that cannot be read stays put and is reported.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};
use uuid::Uuid;
use vault_core::clock::Clock;
use vault_core::config::VaultConfig;
use vault_core::store::AuditLog;
use vault_core::types::{AuditEntry, AuditEvent};

use crate::error::EngineError;
use crate::orchestrator::{Orchestrator, Submission};

/// What one scan did.
#[derive(Debug, Default, Clone)]
pub struct ScanSummary {
    pub created: Vec<Uuid>,
    pub duplicates: Vec<Uuid>,
    pub failed: Vec<(PathBuf, String)>,
}

impl ScanSummary {
    pub fn is_empty(&self) -> bool {
        self.created.is_empty() && self.duplicates.is_empty() && self.failed.is_empty()
    }
}

pub struct InboxScanner {
    inbox_dir: PathBuf,
    archive_dir: PathBuf,
    extensions: Vec<String>,
}

impl InboxScanner {
    pub fn new(inbox_dir: PathBuf, archive_dir: PathBuf, extensions: Vec<String>) -> Self {
        Self {
            inbox_dir,
            archive_dir,
            extensions: extensions
                .into_iter()
                .map(|e| e.trim_start_matches('.').to_lowercase())
                .collect(),
        }
    }

    pub fn from_config(config: &VaultConfig) -> Self {
        Self::new(
            config.inbox_dir(),
            config.archive_dir(),
            config.inbox.extensions.clone(),
        )
    }

    pub fn inbox_dir(&self) -> &Path {
        &self.inbox_dir
    }

    fn accepts(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .map(|e| self.extensions.contains(&e.to_lowercase()))
            .unwrap_or(false)
    }

    /// Inbox files with an accepted extension, sorted by name. A missing
    /// inbox is empty.
    pub fn pending_files(&self) -> std::io::Result<Vec<PathBuf>> {
        if !self.inbox_dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut files = Vec::new();
        for entry in fs::read_dir(&self.inbox_dir)? {
            let path = entry?.path();
            if path.is_file() && self.accepts(&path) {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    /// Submit every pending file and archive it.
    pub fn scan(&self, orchestrator: &Orchestrator) -> Result<ScanSummary, EngineError> {
        let mut summary = ScanSummary::default();
        for path in self.pending_files()? {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();

            let content = match fs::read(&path).map(String::from_utf8) {
                Ok(Ok(text)) => text,
                Ok(Err(_)) => {
                    warn!(file = %name, "Inbox file is not UTF-8, leaving it in place");
                    summary.failed.push((path, "not valid UTF-8".to_string()));
                    continue;
                }
                Err(e) => {
                    warn!(file = %name, error = %e, "Failed to read inbox file");
                    summary.failed.push((path, e.to_string()));
                    continue;
                }
            };

            let submission = match orchestrator.submit(&content, Some(&name)) {
                Ok(s) => s,
                Err(e) => {
                    warn!(file = %name, error = %e, "Failed to submit inbox file");
                    summary.failed.push((path, e.to_string()));
                    continue;
                }
            };
            let task_id = submission.task_id();
            match &submission {
                Submission::Created(_) => summary.created.push(task_id),
                Submission::Duplicate { .. } => summary.duplicates.push(task_id),
            }

            match self.archive(&path) {
                Ok(dest) => {
                    orchestrator.stores().audit.append(AuditEntry::new(
                        orchestrator.clock().now(),
                        Some(task_id),
                        AuditEvent::InboxArchived,
                        format!("{} -> {}", name, dest.display()),
                    ))?;
                    debug!(file = %name, %task_id, "Inbox file archived");
                }
                Err(e) => {
                    // Left in the inbox; the next scan sees a duplicate and retries the move.
                    warn!(file = %name, error = %e, "Failed to archive inbox file");
                    summary.failed.push((path, format!("archive failed: {}", e)));
                }
            }
        }

        if !summary.is_empty() {
            info!(
                created = summary.created.len(),
                duplicates = summary.duplicates.len(),
                failed = summary.failed.len(),
                "Inbox scanned"
            );
        }
        Ok(summary)
    }

    /// Move `path` into the archive, suffixing the name if it is taken.
    fn archive(&self, path: &Path) -> std::io::Result<PathBuf> {
        fs::create_dir_all(&self.archive_dir)?;
        let dest = unique_destination(&self.archive_dir, path);
        if fs::rename(path, &dest).is_err() {
            // Different filesystem.
            fs::copy(path, &dest)?;
            fs::remove_file(path)?;
        }
        Ok(dest)
    }
}

fn unique_destination(dir: &Path, path: &Path) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "item".to_string());
    let ext = path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();

    let mut candidate = dir.join(format!("{}{}", stem, ext));
    let mut n = 1;
    while candidate.exists() {
        candidate = dir.join(format!("{}-{}{}", stem, n, ext));
        n += 1;
    }
    candidate
}
