//! Vault Storage crate - SQLite persistence and in-memory stores.
//!
//! Provides a WAL-mode SQLite database with migrations, SQLite
//! implementations of every persistence trait in `vault-core`, in-memory
//! implementations of the same traits, and aggregate stats queries.

pub mod db;
pub mod memory;
pub mod migrations;
pub mod queries;
pub mod repository;

pub use db::Database;
pub use memory::{InMemoryApprovalStore, InMemoryAuditLog, InMemoryFingerprintStore, InMemoryTaskStore};
pub use queries::{QueryService, VaultStats};
pub use repository::{SqliteApprovalStore, SqliteAuditLog, SqliteFingerprintStore, SqliteTaskStore};
