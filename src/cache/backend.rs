//! Cache backends
//!
//! A narrow string-keyed store with per-entry TTL. Values are JSON payloads
//! produced by the coordinator.

use async_trait::async_trait;
use moka::future::Cache;
use moka::Expiry;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CacheBackendError {
    #[error("cache call timed out after {0:?}")]
    Timeout(Duration),

    #[error("cache unavailable: {0}")]
    Unavailable(String),

    #[error("cache client is closed")]
    Closed,

    #[error("cached payload could not be decoded: {0}")]
    Decode(#[from] serde_json::Error),
}

pub type CacheBackendResult<T> = Result<T, CacheBackendError>;

#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, key: &str) -> CacheBackendResult<Option<String>>;

    async fn set(&self, key: &str, value: String, ttl: Duration) -> CacheBackendResult<()>;

    async fn delete(&self, key: &str) -> CacheBackendResult<()>;

    /// Drop every entry whose key starts with `prefix`
    async fn delete_prefix(&self, prefix: &str) -> CacheBackendResult<()>;

    async fn close(&self) -> CacheBackendResult<()>;
}

#[derive(Clone, Debug)]
struct Entry {
    payload: String,
    ttl: Duration,
}

struct EntryTtl;

impl Expiry<String, Entry> for EntryTtl {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &Entry,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(value.ttl)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &Entry,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

/// In-process cache on moka with a TTL per entry
pub struct MemoryCache {
    inner: Cache<String, Entry>,
    closed: AtomicBool,
}

impl MemoryCache {
    pub fn new(max_capacity: u64) -> Self {
        Self {
            inner: Cache::builder()
                .max_capacity(max_capacity)
                .expire_after(EntryTtl)
                .build(),
            closed: AtomicBool::new(false),
        }
    }

    fn ensure_open(&self) -> CacheBackendResult<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(CacheBackendError::Closed)
        } else {
            Ok(())
        }
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new(10_000)
    }
}

#[async_trait]
impl CacheBackend for MemoryCache {
    async fn get(&self, key: &str) -> CacheBackendResult<Option<String>> {
        self.ensure_open()?;
        Ok(self.inner.get(key).await.map(|entry| entry.payload))
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> CacheBackendResult<()> {
        self.ensure_open()?;
        self.inner
            .insert(key.to_string(), Entry { payload: value, ttl })
            .await;
        Ok(())
    }

    async fn delete(&self, key: &str) -> CacheBackendResult<()> {
        self.ensure_open()?;
        self.inner.invalidate(key).await;
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> CacheBackendResult<()> {
        self.ensure_open()?;
        let doomed: Vec<String> = self
            .inner
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key.to_string())
            .collect();
        for key in doomed {
            self.inner.invalidate(&key).await;
        }
        Ok(())
    }

    async fn close(&self) -> CacheBackendResult<()> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.inner.invalidate_all();
        }
        Ok(())
    }
}

/// Backend that stores nothing; every read is a miss
#[derive(Debug, Default)]
pub struct NoopCache;

#[async_trait]
impl CacheBackend for NoopCache {
    async fn get(&self, _key: &str) -> CacheBackendResult<Option<String>> {
        Ok(None)
    }

    async fn set(&self, _key: &str, _value: String, _ttl: Duration) -> CacheBackendResult<()> {
        Ok(())
    }

    async fn delete(&self, _key: &str) -> CacheBackendResult<()> {
        Ok(())
    }

    async fn delete_prefix(&self, _prefix: &str) -> CacheBackendResult<()> {
        Ok(())
    }

    async fn close(&self) -> CacheBackendResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(60);

    #[tokio::test]
    async fn test_set_get_delete() {
        let cache = MemoryCache::default();
        cache.set("ns:Department:1", "{}".to_string(), TTL).await.unwrap();
        assert_eq!(cache.get("ns:Department:1").await.unwrap().as_deref(), Some("{}"));
        cache.delete("ns:Department:1").await.unwrap();
        assert_eq!(cache.get("ns:Department:1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_delete_prefix_spares_other_kinds() {
        let cache = MemoryCache::default();
        for key in ["ns:Position:1", "ns:Position:2:count", "ns:Employee:1"] {
            cache.set(key, "1".to_string(), TTL).await.unwrap();
        }
        cache.delete_prefix("ns:Position:").await.unwrap();
        assert_eq!(cache.get("ns:Position:1").await.unwrap(), None);
        assert_eq!(cache.get("ns:Position:2:count").await.unwrap(), None);
        assert!(cache.get("ns:Employee:1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_closed_cache_refuses_calls() {
        let cache = MemoryCache::default();
        cache.close().await.unwrap();
        assert!(matches!(cache.get("k").await, Err(CacheBackendError::Closed)));
        assert!(matches!(
            cache.set("k", "v".to_string(), TTL).await,
            Err(CacheBackendError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_noop_always_misses() {
        let cache = NoopCache;
        cache.set("k", "v".to_string(), TTL).await.unwrap();
        assert_eq!(cache.get("k").await.unwrap(), None);
    }
}
