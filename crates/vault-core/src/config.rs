use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Result, VaultError};

/// Bounds for the inbox scan interval, in seconds.
pub const MIN_SCAN_INTERVAL_SECS: u64 = 10;
pub const MAX_SCAN_INTERVAL_SECS: u64 = 60;

/// Top-level configuration for the vault.
///
/// Loaded from `~/.vault/config.toml` by default. Each section corresponds
/// to one component of the task pipeline.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VaultConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub approval: ApprovalConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub inbox: InboxConfig,
    #[serde(default)]
    pub outbox: OutboxConfig,
}

impl VaultConfig {
    /// Load configuration from a TOML file.
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: VaultConfig = toml::from_str(&content)?;
        config.validate()?;
        info!("Configuration loaded from {}", path.display());
        Ok(config)
    }

    /// Load configuration from a TOML file, falling back to defaults.
    ///
    /// A missing file is not an error. A file that exists but cannot be read,
    /// parsed or validated yields the defaults together with the load error,
    /// so the caller can report it once logging is up.
    pub fn load_or_default(path: &Path) -> (Self, Option<VaultError>) {
        if !path.exists() {
            return (Self::default(), None);
        }
        match Self::load(path) {
            Ok(config) => (config, None),
            Err(e) => (Self::default(), Some(e)),
        }
    }

    /// Save the current configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| VaultError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        info!("Configuration saved to {}", path.display());
        Ok(())
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.retry.max_attempts == 0 {
            return Err(VaultError::Config(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.approval.min_poll_secs == 0 {
            return Err(VaultError::Config(
                "approval.min_poll_secs must be at least 1".to_string(),
            ));
        }
        if self.approval.min_poll_secs > self.approval.max_poll_secs {
            return Err(VaultError::Config(format!(
                "approval.min_poll_secs ({}) exceeds approval.max_poll_secs ({})",
                self.approval.min_poll_secs, self.approval.max_poll_secs
            )));
        }
        if self.engine.worker_concurrency == 0 {
            return Err(VaultError::Config(
                "engine.worker_concurrency must be at least 1".to_string(),
            ));
        }
        if self.engine.claim_timeout_secs == 0 {
            return Err(VaultError::Config(
                "engine.claim_timeout_secs must be at least 1".to_string(),
            ));
        }
        let longest_sleep = self
            .approval
            .max_poll_secs
            .max(self.retry.max_delay_ms.div_ceil(1000));
        if self.engine.claim_timeout_secs <= longest_sleep {
            return Err(VaultError::Config(format!(
                "engine.claim_timeout_secs ({}) must exceed the longest poll or backoff sleep ({}s)",
                self.engine.claim_timeout_secs, longest_sleep
            )));
        }
        Ok(())
    }

    /// Vault root with a leading `~` expanded.
    pub fn data_dir(&self) -> PathBuf {
        expand_home(&self.general.data_dir)
    }

    /// Inbox folder; defaults to `<data_dir>/Inbox`.
    pub fn inbox_dir(&self) -> PathBuf {
        match &self.inbox.inbox_dir {
            Some(dir) => expand_home(dir),
            None => self.data_dir().join("Inbox"),
        }
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir().join("vault.db")
    }

    /// Processed inbox files end up here.
    pub fn archive_dir(&self) -> PathBuf {
        self.data_dir().join("Archive")
    }

    pub fn outbox_dir(&self) -> PathBuf {
        self.data_dir().join("Outbox")
    }
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME").or_else(|_| std::env::var("USERPROFILE")) {
            return PathBuf::from(home).join(rest);
        }
    }
    PathBuf::from(path)
}

/// General application settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Vault root: database, inbox, archive and outbox live here.
    pub data_dir: String,
    /// Log level: trace, debug, info, warn, error.
    pub log_level: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            data_dir: "~/.vault".to_string(),
            log_level: "info".to_string(),
        }
    }
}

/// Execution loop settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Task-wide ceiling on step attempts.
    pub max_iterations: u32,
    /// Tasks driven concurrently by one `run`.
    pub worker_concurrency: usize,
    /// A claim not renewed for this long belongs to a dead worker and may be
    /// taken over, by this process or another one on the same vault.
    pub claim_timeout_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_iterations: 5,
            worker_concurrency: 4,
            claim_timeout_secs: 300,
        }
    }
}

impl EngineConfig {
    pub fn claim_timeout(&self) -> Duration {
        Duration::from_secs(self.claim_timeout_secs)
    }
}

/// Approval gate settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApprovalConfig {
    /// Seconds before a pending request is treated as rejected.
    pub timeout_secs: u64,
    pub poll_interval_secs: u64,
    pub min_poll_secs: u64,
    pub max_poll_secs: u64,
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 3600,
            poll_interval_secs: 10,
            min_poll_secs: 1,
            max_poll_secs: 60,
        }
    }
}

impl ApprovalConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Poll period clamped into `[min_poll_secs, max_poll_secs]`.
    pub fn poll_interval(&self) -> Duration {
        let lo = self.min_poll_secs.min(self.max_poll_secs);
        Duration::from_secs(self.poll_interval_secs.clamp(lo, self.max_poll_secs))
    }
}

/// Retry settings for capability invocations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 5_000,
            max_delay_ms: 60_000,
        }
    }
}

/// Inbox folder settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InboxConfig {
    /// Overrides `<data_dir>/Inbox`.
    pub inbox_dir: Option<String>,
    /// File extensions picked up by a scan (without the dot).
    pub extensions: Vec<String>,
    pub scan_interval_secs: u64,
}

impl Default for InboxConfig {
    fn default() -> Self {
        Self {
            inbox_dir: None,
            extensions: vec!["md".to_string(), "txt".to_string()],
            scan_interval_secs: 30,
        }
    }
}

impl InboxConfig {
    /// Scan interval clamped to 10..=60 seconds.
    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(
            self.scan_interval_secs
                .clamp(MIN_SCAN_INTERVAL_SECS, MAX_SCAN_INTERVAL_SECS),
        )
    }
}

/// Simulated outbound collaborators.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutboxConfig {
    /// Append dispatched messages and ledger entries under `<data_dir>/Outbox`.
    pub enabled: bool,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}
