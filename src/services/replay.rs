use std::sync::Arc;
use std::time::Duration;

use crate::error::StoreError;
use crate::models::normalize_tx_hash;
use crate::services::clock::Clock;
use crate::services::store::ReplayStore;

pub const DEFAULT_REPLAY_TTL: Duration = Duration::from_secs(60 * 60);

/// Time-bounded set of consumed payment hashes.
///
/// Eviction is lazy: expired entries are dropped by `evict_expired`, which the
/// facilitator calls at the start of every verify. There is no background sweep.
#[derive(Clone)]
pub struct ReplayGuard {
    store: Arc<dyn ReplayStore>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
}

impl ReplayGuard {
    pub fn new(store: Arc<dyn ReplayStore>, clock: Arc<dyn Clock>, ttl: Duration) -> Self {
        Self { store, clock, ttl }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn store_kind(&self) -> &'static str {
        self.store.kind()
    }

    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    fn ttl_ms(&self) -> u64 {
        self.ttl.as_millis() as u64
    }

    /// Entries first seen at or before this instant have expired. `None` while
    /// less than one TTL has passed since the epoch of the clock.
    fn expired_at(&self, now: u64) -> Option<u64> {
        now.checked_sub(self.ttl_ms())
    }

    pub async fn evict_expired(&self) -> Result<usize, StoreError> {
        let Some(cutoff) = self.expired_at(self.clock.now_ms()) else {
            return Ok(0);
        };
        let evicted = self.store.sweep(cutoff).await?;
        if evicted > 0 {
            tracing::debug!(evicted, "Evicted expired replay entries");
        }
        Ok(evicted)
    }

    /// True while `tx_hash` is consumed and its entry is younger than the TTL.
    pub async fn contains(&self, tx_hash: &str) -> Result<bool, StoreError> {
        let key = normalize_tx_hash(tx_hash);
        let Some(first_seen) = self.store.get(&key).await? else {
            return Ok(false);
        };
        Ok(self.clock.now_ms().saturating_sub(first_seen) < self.ttl_ms())
    }

    /// Marks `tx_hash` consumed. Returns `false` if someone else got there first.
    /// An expired entry that has not been swept yet is replaced by the store in
    /// the same step that checks it.
    pub async fn mark_used(&self, tx_hash: &str) -> Result<bool, StoreError> {
        let key = normalize_tx_hash(tx_hash);
        let now = self.clock.now_ms();
        self.store
            .insert_if_absent(&key, now, self.expired_at(now), self.ttl)
            .await
    }
}
