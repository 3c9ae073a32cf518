//! Read-through cache coordinator
//!
//! Wraps a [`CacheBackend`] with key namespacing, per-view TTLs and a bound
//! on every backend call. The cache is never authoritative: any backend
//! failure is logged and treated as a miss, and the loader's value is what
//! the caller gets.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::backend::{CacheBackend, CacheBackendError, CacheBackendResult};
use super::keys::CacheKey;
use crate::config::{CacheConfig, TtlConfig};

pub struct CacheCoordinator {
    backend: Arc<dyn CacheBackend>,
    namespace: String,
    timeout: Duration,
    ttl: TtlConfig,
}

impl CacheCoordinator {
    pub fn new(backend: Arc<dyn CacheBackend>, config: &CacheConfig) -> Self {
        Self {
            backend,
            namespace: config.namespace(),
            timeout: config.timeout(),
            ttl: config.ttl.clone(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Full backend key: `{namespace}:{Kind}:{id}[:{view}]`
    pub fn key(&self, key: &CacheKey) -> String {
        format!("{}:{}", self.namespace, key)
    }

    /// Configured lifetime for the key's view
    pub fn ttl_for(&self, key: &CacheKey) -> Duration {
        self.ttl.for_view(key.view)
    }

    async fn call<T>(
        &self,
        fut: impl Future<Output = CacheBackendResult<T>>,
    ) -> CacheBackendResult<T> {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(CacheBackendError::Timeout(self.timeout)),
        }
    }

    /// Cached value for `key`, or the loader's value written back.
    ///
    /// `force` skips the lookup; the fresh value is still stored. Loader
    /// errors propagate and leave the cache untouched.
    pub async fn fetch<T, E, F, Fut>(
        &self,
        key: &CacheKey,
        ttl: Option<Duration>,
        force: bool,
        loader: F,
    ) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let full_key = self.key(key);
        if !force {
            match self.lookup(&full_key).await {
                Ok(Some(value)) => {
                    debug!("Cache hit: {}", full_key);
                    return Ok(value);
                }
                Ok(None) => debug!("Cache miss: {}", full_key),
                Err(e) => warn!("Cache read failed for {}, loading from store: {}", full_key, e),
            }
        }

        let value = loader().await?;
        self.write(key, &value, ttl).await;
        Ok(value)
    }

    async fn lookup<T: DeserializeOwned>(&self, full_key: &str) -> CacheBackendResult<Option<T>> {
        match self.call(self.backend.get(full_key)).await? {
            Some(payload) => Ok(Some(serde_json::from_str(&payload)?)),
            None => Ok(None),
        }
    }

    /// Store a value; failures are logged and dropped
    pub async fn write<T: Serialize>(&self, key: &CacheKey, value: &T, ttl: Option<Duration>) {
        let full_key = self.key(key);
        let payload = match serde_json::to_string(value) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Cannot encode cache value for {}: {}", full_key, e);
                return;
            }
        };
        let ttl = ttl.unwrap_or_else(|| self.ttl_for(key));
        if let Err(e) = self.call(self.backend.set(&full_key, payload, ttl)).await {
            warn!("Cache write failed for {}: {}", full_key, e);
        }
    }

    pub async fn invalidate(&self, key: &CacheKey) {
        let full_key = self.key(key);
        if let Err(e) = self.call(self.backend.delete(&full_key)).await {
            warn!("Cache invalidation failed for {}: {}", full_key, e);
        }
    }

    /// Drop every key under `{namespace}:{prefix}`
    pub async fn invalidate_by_prefix(&self, prefix: &str) {
        let full_prefix = format!("{}:{}", self.namespace, prefix);
        debug!("Invalidating cache prefix {}", full_prefix);
        if let Err(e) = self.call(self.backend.delete_prefix(&full_prefix)).await {
            warn!("Cache prefix invalidation failed for {}: {}", full_prefix, e);
        }
    }

    pub async fn close(&self) {
        if let Err(e) = self.call(self.backend.close()).await {
            warn!("Cache close failed: {}", e);
        }
    }
}
