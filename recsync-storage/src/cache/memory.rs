//! In-process cache backend.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use recsync_core::SyncResult;
use serde_json::Value;
use tokio::sync::RwLock;

use super::traits::{CacheBackend, CacheStats};

/// HashMap-backed [`CacheBackend`].
///
/// Uses tokio::sync::RwLock for safe async access.
#[derive(Debug, Default)]
pub struct InMemoryCacheBackend {
    entries: RwLock<HashMap<String, (Value, DateTime<Utc>)>>,
}

impl InMemoryCacheBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl CacheBackend for InMemoryCacheBackend {
    async fn get(&self, key: &str) -> SyncResult<Option<(Value, DateTime<Utc>)>> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: Value, cached_at: DateTime<Utc>) -> SyncResult<()> {
        self.entries
            .write()
            .await
            .insert(key.to_string(), (value, cached_at));
        Ok(())
    }

    async fn keys(&self) -> SyncResult<Vec<String>> {
        Ok(self.entries.read().await.keys().cloned().collect())
    }

    async fn remove_many(&self, keys: &[String]) -> SyncResult<u64> {
        let mut entries = self.entries.write().await;
        let removed = keys.iter().filter(|k| entries.remove(*k).is_some()).count();
        Ok(removed as u64)
    }

    async fn stats(&self) -> SyncResult<CacheStats> {
        Ok(CacheStats {
            entry_count: self.entries.read().await.len() as u64,
            ..Default::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_set_get_remove() {
        let backend = InMemoryCacheBackend::new();
        let now = Utc::now();
        backend.set("read:a", json!([1]), now).await.unwrap();
        backend.set("other", json!(2), now).await.unwrap();

        let (value, cached_at) = backend.get("read:a").await.unwrap().unwrap();
        assert_eq!(value, json!([1]));
        assert_eq!(cached_at, now);

        let removed = backend
            .remove_many(&["read:a".to_string(), "missing".to_string()])
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert!(backend.get("read:a").await.unwrap().is_none());
        assert_eq!(backend.keys().await.unwrap(), vec!["other".to_string()]);
        assert_eq!(backend.stats().await.unwrap().entry_count, 1);
    }
}
