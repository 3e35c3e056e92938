//! Content fingerprinting for exact-duplicate suppression.
//!
//! A fingerprint is the lower-hex SHA-256 of the raw bytes. Byte-identical
//! items always collide; items that differ only in whitespace do not.

use std::sync::Arc;

use sha2::{Digest, Sha256};
use tracing::debug;
use vault_core::clock::Clock;
use vault_core::store::{FingerprintStore, StoreResult};
use vault_core::types::{Fingerprint, Timestamp};

/// Tracks which content hashes have already been processed.
#[derive(Clone)]
pub struct FingerprintTracker {
    store: Arc<dyn FingerprintStore>,
    clock: Arc<dyn Clock>,
}

impl FingerprintTracker {
    pub fn new(store: Arc<dyn FingerprintStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    pub fn fingerprint(content: &[u8]) -> Fingerprint {
        let digest = Sha256::digest(content);
        Fingerprint(hex::encode(digest))
    }

    pub fn seen(&self, hash: &Fingerprint) -> StoreResult<bool> {
        self.store.contains(hash)
    }

    /// When `hash` was first recorded, if ever.
    pub fn first_seen(&self, hash: &Fingerprint) -> StoreResult<Option<Timestamp>> {
        self.store.first_seen(hash)
    }

    /// Record `hash` as processed. Marking twice is a no-op.
    pub fn mark_seen(&self, hash: &Fingerprint) -> StoreResult<()> {
        self.claim(hash).map(|_| ())
    }

    /// Atomic check-then-mark. Returns `true` when this caller recorded the
    /// hash first. The record is durable before this returns.
    pub fn claim(&self, hash: &Fingerprint) -> StoreResult<bool> {
        let first = self.store.insert(hash, self.clock.now())?;
        debug!(fingerprint = hash.short(), first, "Fingerprint claimed");
        Ok(first)
    }

    pub fn count(&self) -> StoreResult<u64> {
        self.store.count()
    }
}
