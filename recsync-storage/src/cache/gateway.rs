//! Read-through cache decorator for gateways.
//!
//! Reads are served from the cache backend when an entry exists for the
//! query's key, otherwise they go to the wrapped gateway and the result is
//! stored. Writes always go to the wrapped gateway; once one succeeds every
//! read-classified entry is wiped, whatever collection the write touched.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use recsync_core::{
    Params, QueryPayload, StorageError, SyncConfig, SyncResult, TransportError, READ_KEY_PREFIX,
};

use super::key::{is_read_key, read_key};
use super::traits::{CacheBackend, CacheStats};
use crate::gateway::{Gateway, ReadCache, ReadResult, WriteBatch, WriteResponse};

/// Configuration for the cache decorator.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Prefix of read-classified keys.
    pub read_prefix: String,
    /// Maximum age of a cached read. `None` keeps entries until invalidated.
    pub entry_ttl: Option<Duration>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            read_prefix: READ_KEY_PREFIX.to_string(),
            entry_ttl: None,
        }
    }
}

impl From<&SyncConfig> for CacheConfig {
    fn from(config: &SyncConfig) -> Self {
        Self {
            read_prefix: config.read_prefix.clone(),
            entry_ttl: config.entry_ttl,
        }
    }
}

impl CacheConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the entry TTL.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.entry_ttl = Some(ttl);
        self
    }

    /// Set the read key prefix.
    pub fn with_read_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.read_prefix = prefix.into();
        self
    }
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    invalidations: AtomicU64,
}

/// Gateway decorator adding read-through caching and coarse invalidation.
///
/// # Type Parameters
///
/// - `G`: the wrapped gateway
/// - `C`: the cache backend
///
/// Concurrent identical reads are not coalesced: each one that misses issues
/// its own request to `G`.
pub struct CacheGateway<G, C>
where
    G: Gateway,
    C: CacheBackend,
{
    inner: G,
    cache: Arc<C>,
    config: CacheConfig,
    counters: Counters,
}

impl<G, C> CacheGateway<G, C>
where
    G: Gateway,
    C: CacheBackend,
{
    pub fn new(inner: G, cache: Arc<C>, config: CacheConfig) -> Self {
        Self {
            inner,
            cache,
            config,
            counters: Counters::default(),
        }
    }

    /// Create a decorator with default configuration.
    pub fn with_defaults(inner: G, cache: Arc<C>) -> Self {
        Self::new(inner, cache, CacheConfig::default())
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Get a reference to the cache backend.
    pub fn backend(&self) -> &C {
        &self.cache
    }

    /// Get a reference to the wrapped gateway.
    pub fn inner(&self) -> &G {
        &self.inner
    }

    /// Hit/miss/invalidation counters merged with the backend's entry count.
    pub async fn stats(&self) -> SyncResult<CacheStats> {
        let backend = self.cache.stats().await?;
        Ok(CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            entry_count: backend.entry_count,
            invalidations: self.counters.invalidations.load(Ordering::Relaxed),
        })
    }

    fn is_expired(&self, cached_at: chrono::DateTime<Utc>) -> bool {
        match self.config.entry_ttl {
            Some(ttl) => {
                let age = Utc::now()
                    .signed_duration_since(cached_at)
                    .to_std()
                    .unwrap_or(Duration::ZERO);
                age > ttl
            }
            None => false,
        }
    }

    /// Look up a cached read. Backend failures and undecodable entries are
    /// treated as misses.
    async fn lookup(&self, key: &str) -> Option<ReadResult> {
        let (value, cached_at) = match self.cache.get(key).await {
            Ok(Some(entry)) => entry,
            Ok(None) => return None,
            Err(e) => {
                tracing::warn!(key, error = %e, "Cache lookup failed, reading through");
                return None;
            }
        };

        if self.is_expired(cached_at) {
            tracing::debug!(key, %cached_at, "Cached read expired");
            return None;
        }

        match serde_json::from_value(value) {
            Ok(result) => Some(result),
            Err(e) => {
                tracing::warn!(key, error = %e, "Discarding undecodable cache entry");
                None
            }
        }
    }

    async fn store(&self, key: &str, result: &ReadResult) -> SyncResult<()> {
        let value = serde_json::to_value(result).map_err(|e| StorageError::Serialization {
            key: key.to_string(),
            reason: e.to_string(),
        })?;
        self.cache.set(key, value, Utc::now()).await
    }

    /// Remove every read-classified entry from the backend.
    pub async fn clear_read_cache(&self) -> SyncResult<u64> {
        let keys: Vec<String> = self
            .cache
            .keys()
            .await?
            .into_iter()
            .filter(|key| is_read_key(&self.config.read_prefix, key))
            .collect();

        if keys.is_empty() {
            return Ok(0);
        }

        let removed = self.cache.remove_many(&keys).await?;
        self.counters
            .invalidations
            .fetch_add(removed, Ordering::Relaxed);
        tracing::debug!(removed, "Cleared read cache");
        Ok(removed)
    }
}

#[async_trait]
impl<G, C> Gateway for CacheGateway<G, C>
where
    G: Gateway,
    C: CacheBackend,
{
    async fn read(
        &self,
        query: &QueryPayload,
        params: &Params,
    ) -> Result<ReadResult, TransportError> {
        let key = read_key(&self.config.read_prefix, query);

        if let Some(result) = self.lookup(&key).await {
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(key = %key, records = result.len(), "Cache hit");
            return Ok(result);
        }

        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(key = %key, "Cache miss");

        let result = self.inner.read(query, params).await?;
        if let Err(e) = self.store(&key, &result).await {
            tracing::warn!(key = %key, error = %e, "Failed to populate cache");
        }
        Ok(result)
    }

    async fn write(
        &self,
        batch: &WriteBatch,
        params: &Params,
    ) -> Result<WriteResponse, TransportError> {
        let response = self.inner.write(batch, params).await?;

        // The write has been applied remotely; its outcome stands even if
        // the wipe fails.
        if let Err(e) = self.clear_read_cache().await {
            tracing::error!(error = %e, "Read cache invalidation failed after write");
        }
        Ok(response)
    }
}

#[async_trait]
impl<G, C> ReadCache for CacheGateway<G, C>
where
    G: Gateway,
    C: CacheBackend,
{
    async fn clear_read_cache(&self) -> SyncResult<u64> {
        CacheGateway::clear_read_cache(self).await
    }
}
