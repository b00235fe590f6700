//! Cache backend trait and statistics.
//!
//! A backend is a plain key/value surface. It knows nothing about reads,
//! writes or invalidation policy; the [`CacheGateway`](super::CacheGateway)
//! decides which keys to populate and which to wipe.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use recsync_core::SyncResult;
use serde_json::Value;

/// Cache backend trait for pluggable cache implementations.
///
/// Implementations must be safe to share across tasks.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Get a value and the time it was cached, or `None` if absent.
    async fn get(&self, key: &str) -> SyncResult<Option<(Value, DateTime<Utc>)>>;

    /// Store a value under `key`, replacing any previous entry.
    async fn set(&self, key: &str, value: Value, cached_at: DateTime<Utc>) -> SyncResult<()>;

    /// Every key currently held.
    async fn keys(&self) -> SyncResult<Vec<String>>;

    /// Remove the given keys. Returns how many entries were actually removed.
    async fn remove_many(&self, keys: &[String]) -> SyncResult<u64>;

    /// Get cache statistics.
    async fn stats(&self) -> SyncResult<CacheStats>;
}

/// Statistics about cache usage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Number of cache hits.
    pub hits: u64,
    /// Number of cache misses, including expired entries.
    pub misses: u64,
    /// Number of entries currently in cache.
    pub entry_count: u64,
    /// Number of entries removed by invalidation.
    pub invalidations: u64,
}

impl CacheStats {
    /// Calculate the hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hit_rate_empty() {
        assert_eq!(CacheStats::default().hit_rate(), 0.0);
    }

    #[test]
    fn test_hit_rate() {
        let stats = CacheStats {
            hits: 3,
            misses: 1,
            ..Default::default()
        };
        assert!((stats.hit_rate() - 0.75).abs() < f64::EPSILON);
    }
}
