//! Vault application binary - composition root.
//!
//! 1. Parse the command line
//! 2. Load configuration from TOML and apply CLI overrides
//! 3. Initialize tracing (stderr, so stdout stays parseable), then report
//!    any config load failure
//! 4. Open the SQLite vault and build the engine
//! 5. Run the command and map its outcome to an exit code

mod cli;
mod commands;

use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;
use vault_core::config::VaultConfig;

use crate::cli::CliArgs;
use crate::commands::{exit_codes, App};

fn init_tracing(level: Option<&str>, config_level: &str) {
    let filter = match level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(config_level)),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = CliArgs::parse();

    let config_file = args.resolve_config_path();
    let (mut config, load_error) = VaultConfig::load_or_default(&config_file);
    if let Some(data_dir) = args.resolve_data_dir() {
        config.general.data_dir = data_dir;
    }
    let log_level = args.resolve_log_level();
    init_tracing(log_level.as_deref(), &config.general.log_level);
    match load_error {
        Some(e) => tracing::warn!(
            path = %config_file.display(),
            error = %e,
            "Failed to load config, using defaults"
        ),
        None => tracing::debug!(path = %config_file.display(), "Configuration loaded"),
    }

    let result = match App::open(config, args.json) {
        Ok(app) => app.execute(args.command).await,
        Err(e) => Err(e),
    };

    match result {
        Ok(()) => ExitCode::from(exit_codes::OK),
        Err(e) => {
            tracing::debug!(error = ?e, "Command failed");
            eprintln!("error: {}", e);
            ExitCode::from(e.exit_code())
        }
    }
}
