use async_trait::async_trait;
use redis::AsyncCommands;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use crate::error::StoreError;

/// Backing store for consumed payment hashes: `key -> first_seen_at_ms`.
///
/// `insert_if_absent` is the serialization point for settlement: when two
/// callers race on the same key exactly one of them gets `true`. It must check
/// and write in one step, including when it replaces an expired entry.
#[async_trait]
pub trait ReplayStore: Send + Sync {
    fn kind(&self) -> &'static str;

    async fn get(&self, key: &str) -> Result<Option<u64>, StoreError>;

    /// Records `key` unless a live entry exists. An entry first seen at or
    /// before `expired_at_ms` counts as absent and is overwritten.
    async fn insert_if_absent(
        &self,
        key: &str,
        seen_at_ms: u64,
        expired_at_ms: Option<u64>,
        ttl: Duration,
    ) -> Result<bool, StoreError>;

    async fn remove(&self, key: &str) -> Result<(), StoreError>;

    /// Drops every entry first seen at or before `cutoff_ms`. Returns how many went.
    async fn sweep(&self, cutoff_ms: u64) -> Result<usize, StoreError>;
}

#[derive(Debug, Default)]
pub struct MemoryReplayStore {
    entries: Mutex<HashMap<String, u64>>,
}

impl MemoryReplayStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, u64>> {
        // A panic while holding this lock cannot leave the map half-updated.
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl ReplayStore for MemoryReplayStore {
    fn kind(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<Option<u64>, StoreError> {
        Ok(self.lock().get(key).copied())
    }

    async fn insert_if_absent(
        &self,
        key: &str,
        seen_at_ms: u64,
        expired_at_ms: Option<u64>,
        _ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut entries = self.lock();
        if let Some(&first_seen) = entries.get(key) {
            if expired_at_ms.map_or(true, |cutoff| first_seen > cutoff) {
                return Ok(false);
            }
        }
        entries.insert(key.to_string(), seen_at_ms);
        Ok(true)
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.lock().remove(key);
        Ok(())
    }

    async fn sweep(&self, cutoff_ms: u64) -> Result<usize, StoreError> {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|_, seen_at| *seen_at > cutoff_ms);
        Ok(before - entries.len())
    }
}

/// Set the key unless it holds a first-seen time newer than the cutoff.
/// ARGV: seen_at_ms, cutoff_ms (-1 for none), ttl_ms.
const INSERT_IF_ABSENT_SCRIPT: &str = r"
local current = redis.call('GET', KEYS[1])
if current and tonumber(current) > tonumber(ARGV[2]) then
  return 0
end
redis.call('SET', KEYS[1], ARGV[1], 'PX', ARGV[3])
return 1
";

/// Redis-backed store for running several gate instances against one replay set.
/// Expiry is delegated to Redis, so `sweep` has nothing to do.
pub struct RedisReplayStore {
    redis: redis::aio::ConnectionManager,
    prefix: String,
    insert_script: redis::Script,
}

impl RedisReplayStore {
    pub async fn connect(redis_url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(redis_url)?;
        let redis = client.get_connection_manager().await?;
        tracing::info!("Redis replay store connected");
        Ok(Self {
            redis,
            prefix: "paygate:replay:".to_string(),
            insert_script: redis::Script::new(INSERT_IF_ABSENT_SCRIPT),
        })
    }

    fn key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }
}

#[async_trait]
impl ReplayStore for RedisReplayStore {
    fn kind(&self) -> &'static str {
        "redis"
    }

    async fn get(&self, key: &str) -> Result<Option<u64>, StoreError> {
        let mut redis = self.redis.clone();
        let raw: Option<String> = redis.get(self.key(key)).await?;
        raw.map(|value| {
            value.parse::<u64>().map_err(|_| StoreError::Corrupt {
                key: key.to_string(),
                value,
            })
        })
        .transpose()
    }

    async fn insert_if_absent(
        &self,
        key: &str,
        seen_at_ms: u64,
        expired_at_ms: Option<u64>,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut redis = self.redis.clone();
        let cutoff = expired_at_ms.map_or(-1, |ms| ms as i64);
        let inserted: i64 = self
            .insert_script
            .key(self.key(key))
            .arg(seen_at_ms)
            .arg(cutoff)
            .arg(ttl.as_millis() as u64)
            .invoke_async(&mut redis)
            .await?;
        Ok(inserted == 1)
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        let mut redis = self.redis.clone();
        redis.del::<_, ()>(self.key(key)).await?;
        Ok(())
    }

    async fn sweep(&self, _cutoff_ms: u64) -> Result<usize, StoreError> {
        Ok(0)
    }
}
