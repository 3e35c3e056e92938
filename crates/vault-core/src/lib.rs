pub mod clock;
pub mod config;
pub mod error;
pub mod store;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::VaultConfig;
pub use error::{Result, StoreError, VaultError};
pub use store::{ApprovalStore, AuditLog, FingerprintStore, StoreResult, TaskStore};
pub use types::*;
