pub mod json_store;
pub mod memory_store;
#[cfg(feature = "redis")]
pub mod redis_store;
pub mod schedule_store;

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

pub use schedule_store::ScheduleStore;

/// Flat string-keyed store holding schedules, contexts, step records and continuations.
///
/// Single-key operations must be atomic; nothing is required across keys.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Remove a key. Returns whether it existed.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// All keys starting with `prefix`, sorted.
    async fn keys(&self, prefix: &str) -> Result<Vec<String>>;
}

/// Open a store from a location string:
/// `memory`, `redis://...` (needs the `redis` feature), or a JSON file path
/// (optionally prefixed with `json:`).
pub async fn open_store(location: &str) -> Result<Arc<dyn KeyValueStore>> {
    if location == "memory" {
        return Ok(Arc::new(memory_store::MemoryStore::new()));
    }

    if location.starts_with("redis://") || location.starts_with("rediss://") {
        #[cfg(feature = "redis")]
        {
            let store = redis_store::RedisStore::connect(location).await?;
            return Ok(Arc::new(store));
        }
        #[cfg(not(feature = "redis"))]
        anyhow::bail!("Redis store requested but dynsched was built without the 'redis' feature");
    }

    let path = location.strip_prefix("json:").unwrap_or(location);
    Ok(Arc::new(json_store::JsonFileStore::new(path)))
}
