//! Command execution against an opened vault.

use std::path::PathBuf;
use std::sync::Arc;

use vault_core::clock::SystemClock;
use vault_core::config::VaultConfig;
use vault_core::error::{StoreError, VaultError};
use vault_core::types::{AuditEntry, StepStatus};
use vault_engine::{EngineError, InboxScanner, Orchestrator, ScanSummary, Stores, Submission, TaskReport};
use vault_storage::{Database, QueryService, VaultStats};

use crate::cli::Command;

/// Exit codes reported by the binary.
pub mod exit_codes {
    pub const OK: u8 = 0;
    /// Unknown task, unknown or already-decided request id.
    pub const NOT_FOUND: u8 = 1;
    /// Persistence or other internal failure.
    pub const INTERNAL: u8 = 2;
}

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Config(#[from] VaultError),
    #[error("Cannot read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl AppError {
    pub fn exit_code(&self) -> u8 {
        match self {
            AppError::Engine(e) if e.is_not_found() => exit_codes::NOT_FOUND,
            _ => exit_codes::INTERNAL,
        }
    }
}

/// Database, stores and engine for one invocation.
pub struct App {
    config: VaultConfig,
    db: Arc<Database>,
    orchestrator: Arc<Orchestrator>,
    json: bool,
}

impl App {
    pub fn open(config: VaultConfig, json: bool) -> Result<Self, AppError> {
        std::fs::create_dir_all(config.data_dir())?;
        let db_path = config.database_path();
        let db = Arc::new(Database::new(&db_path)?);
        tracing::debug!(path = %db_path.display(), "SQLite database opened");

        let stores = Stores::sqlite(Arc::clone(&db));
        let orchestrator = Arc::new(Orchestrator::from_config(
            stores,
            Arc::new(SystemClock),
            &config,
        )?);
        Ok(Self {
            config,
            db,
            orchestrator,
            json,
        })
    }

    pub async fn execute(&self, command: Command) -> Result<(), AppError> {
        let operator = self.orchestrator.operator();
        match command {
            Command::Submit { content, file } => {
                let (content, source) = match (content, file) {
                    (_, Some(path)) => {
                        let text = std::fs::read_to_string(&path).map_err(|source| {
                            AppError::Read {
                                path: path.clone(),
                                source,
                            }
                        })?;
                        let name = path
                            .file_name()
                            .map(|n| n.to_string_lossy().into_owned());
                        (text, name)
                    }
                    (Some(text), None) => (text, None),
                    (None, None) => (String::new(), None),
                };
                let submission = self.orchestrator.submit(&content, source.as_deref())?;
                self.print_submission(&submission)?;
            }
            Command::Ingest => {
                let summary = InboxScanner::from_config(&self.config).scan(&self.orchestrator)?;
                self.print_scan(&summary)?;
            }
            Command::Run { watch: false } => {
                let reports = self.orchestrator.run_pending().await?;
                self.print_reports(&reports)?;
            }
            Command::Run { watch: true } => self.watch().await?,
            Command::Approve { request_id, by } => {
                let decided = operator.approve(&request_id, &by)?;
                self.print_line_or_json(
                    &format!("approved {} (task {})", decided.request_id, decided.task_id),
                    &decided,
                )?;
            }
            Command::Reject { request_id, by } => {
                let decided = operator.reject(&request_id, &by)?;
                self.print_line_or_json(
                    &format!("rejected {} (task {})", decided.request_id, decided.task_id),
                    &decided,
                )?;
            }
            Command::Status { task_id } => {
                let report = operator.status(task_id)?;
                if self.json {
                    println!("{}", serde_json::to_string_pretty(&report)?);
                } else {
                    print_report(&report);
                }
            }
            Command::List { state, limit } => {
                let reports = operator.list(state, limit)?;
                if self.json {
                    println!("{}", serde_json::to_string_pretty(&reports)?);
                } else {
                    for r in &reports {
                        println!("{}  {:<18} {:<16} {}", r.task_id, r.state, r.bucket, r.title);
                    }
                }
            }
            Command::Quarantine { task_id, reason } => {
                let task = operator.quarantine(task_id, &reason)?;
                self.print_line_or_json(&format!("quarantined {}", task.id), &task)?;
            }
            Command::Audit { task_id } => {
                let trail = operator.audit_trail(task_id)?;
                if self.json {
                    println!("{}", serde_json::to_string_pretty(&trail)?);
                } else {
                    for entry in &trail {
                        print_audit_entry(entry);
                    }
                }
            }
            Command::Stats => {
                let stats = QueryService::new(Arc::clone(&self.db)).stats()?;
                if self.json {
                    println!("{}", serde_json::to_string_pretty(&stats)?);
                } else {
                    print_stats(&stats);
                }
            }
        }
        Ok(())
    }

    /// Scan the inbox and run open tasks on every tick until Ctrl-C.
    async fn watch(&self) -> Result<(), AppError> {
        let scanner = InboxScanner::from_config(&self.config);
        let interval = self.config.inbox.scan_interval();
        std::fs::create_dir_all(scanner.inbox_dir())?;
        tracing::info!(
            inbox = %scanner.inbox_dir().display(),
            interval_secs = interval.as_secs(),
            "Watching inbox"
        );

        loop {
            let pass = async {
                let summary = scanner.scan(&self.orchestrator)?;
                let reports = self.orchestrator.run_pending().await?;
                Ok::<_, EngineError>((summary, reports))
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => break,
                result = pass => match result {
                    Ok((summary, reports)) => {
                        if !summary.is_empty() {
                            self.print_scan(&summary)?;
                        }
                        if !reports.is_empty() {
                            self.print_reports(&reports)?;
                        }
                    }
                    Err(e) => tracing::error!(error = %e, "Watch pass failed"),
                },
            }
            tokio::select! {
                _ = tokio::signal::ctrl_c() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }
        tracing::info!("Stopped watching; open tasks resume on the next run");
        Ok(())
    }

    fn print_line_or_json<T: serde::Serialize>(&self, line: &str, value: &T) -> Result<(), AppError> {
        if self.json {
            println!("{}", serde_json::to_string_pretty(value)?);
        } else {
            println!("{}", line);
        }
        Ok(())
    }

    fn print_submission(&self, submission: &Submission) -> Result<(), AppError> {
        let (line, duplicate) = match submission {
            Submission::Created(task) => (format!("created {}", task.id), false),
            Submission::Duplicate { task_id, .. } => {
                (format!("duplicate of {}", task_id), true)
            }
        };
        let value = serde_json::json!({
            "task_id": submission.task_id(),
            "duplicate": duplicate,
        });
        self.print_line_or_json(&line, &value)
    }

    fn print_scan(&self, summary: &ScanSummary) -> Result<(), AppError> {
        if self.json {
            let failed: Vec<_> = summary
                .failed
                .iter()
                .map(|(path, reason)| serde_json::json!({ "file": path, "reason": reason }))
                .collect();
            let value = serde_json::json!({
                "created": summary.created,
                "duplicates": summary.duplicates,
                "failed": failed,
            });
            println!("{}", serde_json::to_string_pretty(&value)?);
            return Ok(());
        }
        println!(
            "inbox: {} created, {} duplicate, {} failed",
            summary.created.len(),
            summary.duplicates.len(),
            summary.failed.len()
        );
        for (path, reason) in &summary.failed {
            println!("  {}: {}", path.display(), reason);
        }
        Ok(())
    }

    fn print_reports(&self, reports: &[TaskReport]) -> Result<(), AppError> {
        if self.json {
            println!("{}", serde_json::to_string_pretty(reports)?);
            return Ok(());
        }
        if reports.is_empty() {
            println!("no open tasks");
        }
        for report in reports {
            print_report(report);
        }
        Ok(())
    }
}

fn print_report(report: &TaskReport) {
    println!("Task {}: {}", report.task_id, report.title);
    println!("  state:      {} ({})", report.state, report.bucket);
    if let Some(tier) = report.risk_tier {
        println!("  risk:       {}", tier);
    }
    println!("  iterations: {}", report.iteration_count);
    if let Some(failure) = &report.failure {
        match failure.step_index {
            Some(step) => println!(
                "  failure:    {} at step {}: {}",
                failure.kind, step, failure.detail
            ),
            None => println!("  failure:    {}: {}", failure.kind, failure.detail),
        }
    }
    if let Some(request) = &report.pending_request {
        println!("  awaiting:   {}", request);
    }
    for step in &report.steps {
        let mark = match step.status {
            StepStatus::Completed => "x",
            StepStatus::InProgress => ">",
            StepStatus::Failed => "!",
            StepStatus::Skipped => "-",
            StepStatus::Pending => " ",
        };
        let risky = if step.risky { " [approval]" } else { "" };
        println!(
            "  [{}] {}. {}{} (attempts {})",
            mark, step.index, step.description, risky, step.attempts
        );
    }
}

fn print_audit_entry(entry: &AuditEntry) {
    println!(
        "{}  {:<22} {}",
        entry.timestamp, entry.event_type, entry.detail
    );
}

fn print_stats(stats: &VaultStats) {
    println!("tasks:             {}", stats.total_tasks);
    for (state, count) in &stats.tasks_by_state {
        println!("  {:<17} {}", state.bucket(), count);
    }
    println!("pending approvals: {}", stats.pending_approvals);
    println!("fingerprints:      {}", stats.fingerprints);
    println!("audit entries:     {}", stats.audit_entries);
    println!("database size:     {} bytes", stats.db_size_bytes);
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;
    use vault_engine::{ApprovalError, TaskError};

    fn test_config(dir: &std::path::Path) -> VaultConfig {
        let mut config = VaultConfig::default();
        config.general.data_dir = dir.to_string_lossy().into_owned();
        config
    }

    #[test]
    fn test_exit_code_mapping() {
        let not_found: AppError = EngineError::from(TaskError::NotFound(Uuid::new_v4())).into();
        assert_eq!(not_found.exit_code(), exit_codes::NOT_FOUND);

        let decided: AppError =
            EngineError::from(ApprovalError::AlreadyDecided("x-step-1".into())).into();
        assert_eq!(decided.exit_code(), exit_codes::NOT_FOUND);

        let expired: AppError =
            EngineError::from(ApprovalError::Expired("x-step-1".into())).into();
        assert_eq!(expired.exit_code(), exit_codes::NOT_FOUND);

        let backend: AppError = StoreError::Backend("disk I/O error".into()).into();
        assert_eq!(backend.exit_code(), exit_codes::INTERNAL);
        assert_eq!(exit_codes::OK, 0);
    }

    #[tokio::test]
    async fn test_open_creates_database() {
        let dir = tempfile::tempdir().unwrap();
        let app = App::open(test_config(dir.path()), false).unwrap();
        assert!(dir.path().join("vault.db").exists());

        app.execute(Command::Submit {
            content: Some("Review the notes".into()),
            file: None,
        })
        .await
        .unwrap();
        app.execute(Command::Run { watch: false }).await.unwrap();

        let stats = QueryService::new(Arc::clone(&app.db)).stats().unwrap();
        assert_eq!(stats.total_tasks, 1);
        assert_eq!(stats.count(vault_core::types::LifecycleState::Done), 1);
    }

    #[tokio::test]
    async fn test_unknown_task_maps_to_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let app = App::open(test_config(dir.path()), false).unwrap();
        let err = app
            .execute(Command::Status {
                task_id: Uuid::new_v4(),
            })
            .await
            .unwrap_err();
        assert_eq!(err.exit_code(), exit_codes::NOT_FOUND);

        let err = app
            .execute(Command::Approve {
                request_id: "missing-step-1".into(),
                by: "tester".into(),
            })
            .await
            .unwrap_err();
        assert_eq!(err.exit_code(), exit_codes::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_submit_from_missing_file_is_internal() {
        let dir = tempfile::tempdir().unwrap();
        let app = App::open(test_config(dir.path()), false).unwrap();
        let err = app
            .execute(Command::Submit {
                content: None,
                file: Some(dir.path().join("nope.md")),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Read { .. }));
        assert_eq!(err.exit_code(), exit_codes::INTERNAL);
    }
}
