//! CLI argument definitions for the vault binary.
//!
//! Uses `clap` with derive macros for ergonomic argument parsing.
//! Priority resolution: CLI args > env vars > config file > defaults.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use uuid::Uuid;
use vault_core::types::LifecycleState;

/// Vault: drives submitted tasks through planning, approval and execution.
#[derive(Parser, Debug)]
#[command(name = "vault", version, about)]
pub struct CliArgs {
    /// Path to the configuration file.
    #[arg(short = 'c', long = "config", global = true)]
    pub config: Option<PathBuf>,

    /// Vault root holding the database, inbox, archive and outbox.
    #[arg(short = 'd', long = "data-dir", global = true)]
    pub data_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short = 'l', long = "log-level", global = true)]
    pub log_level: Option<String>,

    /// Print results as JSON.
    #[arg(long = "json", global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create a task from content (suppressed if identical content was seen).
    Submit {
        /// Task content.
        #[arg(required_unless_present = "file", conflicts_with = "file")]
        content: Option<String>,

        /// Read the content from a file instead.
        #[arg(short = 'f', long = "file")]
        file: Option<PathBuf>,
    },

    /// Submit every file waiting in the inbox folder and archive it.
    Ingest,

    /// Drive all open tasks.
    Run {
        /// Keep scanning the inbox and running tasks until Ctrl-C.
        #[arg(short = 'w', long = "watch")]
        watch: bool,
    },

    /// Approve a pending approval request.
    Approve {
        request_id: String,
        /// Name recorded as the decider.
        #[arg(long = "by", default_value = "operator")]
        by: String,
    },

    /// Reject a pending approval request.
    Reject {
        request_id: String,
        #[arg(long = "by", default_value = "operator")]
        by: String,
    },

    /// Show one task.
    Status { task_id: Uuid },

    /// List tasks.
    List {
        /// Only tasks in this state (pending, planned, executing,
        /// awaiting_approval, done, failed, quarantined).
        #[arg(short = 's', long = "state")]
        state: Option<LifecycleState>,

        #[arg(short = 'n', long = "limit", default_value_t = 50)]
        limit: usize,
    },

    /// Stop a task and move it to quarantine.
    Quarantine {
        task_id: Uuid,
        #[arg(short = 'r', long = "reason", default_value = "quarantined by operator")]
        reason: String,
    },

    /// Show the audit trail of one task.
    Audit { task_id: Uuid },

    /// Show counts per state, pending approvals and fingerprints.
    Stats,
}

impl CliArgs {
    /// Resolve the configuration file path.
    ///
    /// Priority: --config flag > VAULT_CONFIG env var > ~/.vault/config.toml.
    pub fn resolve_config_path(&self) -> PathBuf {
        if let Some(ref p) = self.config {
            return p.clone();
        }
        if let Ok(p) = std::env::var("VAULT_CONFIG") {
            return PathBuf::from(p);
        }
        default_config_path()
    }

    /// Priority: --data-dir flag > config file value.
    pub fn resolve_data_dir(&self) -> Option<String> {
        self.data_dir
            .as_ref()
            .map(|p| p.to_string_lossy().to_string())
    }

    /// Priority: --log-level flag > config file value.
    pub fn resolve_log_level(&self) -> Option<String> {
        self.log_level.clone()
    }
}

/// Default config file path for the current platform.
fn default_config_path() -> PathBuf {
    let home = std::env::var("HOME").or_else(|_| std::env::var("USERPROFILE"));
    match home {
        Ok(home) => PathBuf::from(home).join(".vault").join("config.toml"),
        Err(_) => PathBuf::from("config.toml"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> CliArgs {
        CliArgs::try_parse_from(std::iter::once("vault").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_submit_inline_and_file() {
        match parse(&["submit", "Pay invoice $40"]).command {
            Command::Submit { content, file } => {
                assert_eq!(content.as_deref(), Some("Pay invoice $40"));
                assert!(file.is_none());
            }
            other => panic!("unexpected {:?}", other),
        }
        match parse(&["submit", "--file", "task.md"]).command {
            Command::Submit { content, file } => {
                assert!(content.is_none());
                assert_eq!(file, Some(PathBuf::from("task.md")));
            }
            other => panic!("unexpected {:?}", other),
        }
        let both = CliArgs::try_parse_from(["vault", "submit", "x", "--file", "y"]);
        assert!(both.is_err());
        assert!(CliArgs::try_parse_from(["vault", "submit"]).is_err());
    }

    #[test]
    fn test_list_state_parses() {
        match parse(&["list", "--state", "awaiting_approval"]).command {
            Command::List { state, limit } => {
                assert_eq!(state, Some(LifecycleState::AwaitingApproval));
                assert_eq!(limit, 50);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(CliArgs::try_parse_from(["vault", "list", "--state", "archived"]).is_err());
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let args = parse(&["run", "--watch", "--config", "/tmp/v.toml", "--log-level", "debug"]);
        assert!(matches!(args.command, Command::Run { watch: true }));
        assert_eq!(args.resolve_config_path(), PathBuf::from("/tmp/v.toml"));
        assert_eq!(args.resolve_log_level().as_deref(), Some("debug"));
    }

    #[test]
    fn test_approve_defaults_decider() {
        match parse(&["approve", "abc-step-3"]).command {
            Command::Approve { request_id, by } => {
                assert_eq!(request_id, "abc-step-3");
                assert_eq!(by, "operator");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_bad_task_id_rejected() {
        assert!(CliArgs::try_parse_from(["vault", "status", "not-a-uuid"]).is_err());
        let id = Uuid::new_v4().to_string();
        assert!(CliArgs::try_parse_from(["vault", "status", id.as_str()]).is_ok());
    }
}
