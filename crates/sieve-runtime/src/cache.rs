//! Persistent analysis cache with debounced writes.
//!
//! Entries live in memory and are persisted to a [`Storage`] collaborator
//! as one JSON map (`key -> {data, lastAccess}`) plus a metadata record
//! (`{lastSaved, count}`). Writes are debounced: each `set` restarts a
//! timer and only the last one in a burst persists. `clear` persists
//! immediately, and [`CacheStore::flush`] is the teardown hook hosts call
//! so no mutation is lost.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::storage::{Storage, StorageError};

/// Cache persistence settings.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Quiet period after the last `set` before persisting
    pub debounce: Duration,

    pub storage_key: String,

    pub meta_key: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_secs(2),
            storage_key: "analysis_cache".to_string(),
            meta_key: "analysis_cache_meta".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Entry<V> {
    data: V,
    /// Unix millis
    last_access: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheMeta {
    pub last_saved: DateTime<Utc>,
    pub count: usize,
}

/// Snapshot of cache state for inspection.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub last_saved: Option<DateTime<Utc>>,
    pub dirty: bool,
}

struct State<V> {
    entries: HashMap<String, Entry<V>>,
    /// Bumped on every mutation
    generation: u64,
    /// Generation of the last successful write
    saved_generation: u64,
    last_saved: Option<DateTime<Utc>>,
}

impl<V> State<V> {
    fn is_dirty(&self) -> bool {
        self.generation != self.saved_generation
    }
}

struct Inner<V> {
    storage: Arc<dyn Storage>,
    config: CacheConfig,
    state: Mutex<State<V>>,
    pending: Mutex<Option<JoinHandle<()>>>,
}

/// A persistent string-keyed cache.
///
/// Cloning is cheap and clones share state.
pub struct CacheStore<V> {
    inner: Arc<Inner<V>>,
}

impl<V> Clone for CacheStore<V> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<V> CacheStore<V>
where
    V: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Load persisted entries. Missing or corrupt data yields an empty cache.
    pub async fn load(storage: Arc<dyn Storage>, config: CacheConfig) -> Self {
        let entries = match storage.get(&config.storage_key).await {
            Ok(Some(value)) => match serde_json::from_value::<HashMap<String, Entry<V>>>(value) {
                Ok(entries) => entries,
                Err(e) => {
                    tracing::warn!(error = %e, "Cache data is corrupt, starting empty");
                    HashMap::new()
                }
            },
            Ok(None) => HashMap::new(),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read cache, starting empty");
                HashMap::new()
            }
        };

        let last_saved = match storage.get(&config.meta_key).await {
            Ok(Some(value)) => serde_json::from_value::<CacheMeta>(value)
                .ok()
                .map(|m| m.last_saved),
            _ => None,
        };

        tracing::info!(entries = entries.len(), "Loaded analysis cache");

        Self {
            inner: Arc::new(Inner {
                storage,
                config,
                state: Mutex::new(State {
                    entries,
                    generation: 0,
                    saved_generation: 0,
                    last_saved,
                }),
                pending: Mutex::new(None),
            }),
        }
    }

    /// Read an entry. Does not touch access times or schedule writes.
    pub fn get(&self, key: &str) -> Option<V> {
        self.inner.state.lock().entries.get(key).map(|e| e.data.clone())
    }

    /// Insert or overwrite an entry and schedule a debounced save.
    pub fn set(&self, key: impl Into<String>, value: V) {
        {
            let mut state = self.inner.state.lock();
            state.entries.insert(
                key.into(),
                Entry {
                    data: value,
                    last_access: Utc::now().timestamp_millis(),
                },
            );
            state.generation += 1;
        }
        self.schedule_save();
    }

    /// Remove every entry and persist immediately.
    pub async fn clear(&self) -> Result<(), StorageError> {
        self.cancel_pending();
        let removed = {
            let mut state = self.inner.state.lock();
            let removed = state.entries.len();
            state.entries.clear();
            state.generation += 1;
            removed
        };
        tracing::info!(removed, "Cleared analysis cache");
        self.inner.write().await
    }

    /// Persist if anything changed since the last write.
    pub async fn save(&self) -> Result<(), StorageError> {
        self.inner.save().await
    }

    /// Cancel the debounce timer and persist pending changes now.
    pub async fn force_save(&self) -> Result<(), StorageError> {
        self.cancel_pending();
        self.inner.save().await
    }

    /// Teardown hook; same as [`CacheStore::force_save`].
    pub async fn flush(&self) -> Result<(), StorageError> {
        self.force_save().await
    }

    pub fn len(&self) -> usize {
        self.inner.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.inner.state.lock();
        CacheStats {
            entries: state.entries.len(),
            last_saved: state.last_saved,
            dirty: state.is_dirty(),
        }
    }

    fn cancel_pending(&self) {
        if let Some(handle) = self.inner.pending.lock().take() {
            handle.abort();
        }
    }

    fn schedule_save(&self) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::debug!("No async runtime, cache save deferred to flush");
            return;
        };

        let inner = self.inner.clone();
        let delay = self.inner.config.debounce;
        let mut pending = self.inner.pending.lock();
        if let Some(previous) = pending.take() {
            previous.abort();
        }
        *pending = Some(runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = inner.save().await {
                tracing::warn!(error = %e, "Debounced cache save failed");
            }
        }));
    }
}

impl<V> Inner<V>
where
    V: Clone + Serialize + Send + Sync + 'static,
{
    async fn save(&self) -> Result<(), StorageError> {
        if !self.state.lock().is_dirty() {
            return Ok(());
        }
        self.write().await
    }

    async fn write(&self) -> Result<(), StorageError> {
        let (snapshot, generation) = {
            let state = self.state.lock();
            (state.entries.clone(), state.generation)
        };
        let count = snapshot.len();

        let serialization = |source: serde_json::Error| StorageError::Serialization {
            key: self.config.storage_key.clone(),
            source,
        };
        let value = serde_json::to_value(&snapshot).map_err(serialization)?;
        let now = Utc::now();
        let meta = serde_json::to_value(CacheMeta {
            last_saved: now,
            count,
        })
        .map_err(serialization)?;

        self.storage.set(&self.config.storage_key, value).await?;
        self.storage.set(&self.config.meta_key, meta).await?;

        let mut state = self.state.lock();
        state.saved_generation = state.saved_generation.max(generation);
        state.last_saved = Some(now);
        tracing::debug!(entries = count, "Saved analysis cache");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use serde_json::json;

    const KEY: &str = "analysis_cache";

    async fn store(storage: &Arc<MemoryStorage>) -> CacheStore<String> {
        CacheStore::load(storage.clone(), CacheConfig::default()).await
    }

    #[tokio::test(start_paused = true)]
    async fn test_debounce_coalesces_writes() {
        let storage = Arc::new(MemoryStorage::new());
        let cache = store(&storage).await;

        for i in 0..10 {
            cache.set(format!("k{}", i), format!("v{}", i));
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert_eq!(storage.writes(KEY), 0);

        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert_eq!(storage.writes(KEY), 1);

        let stored = storage.get(KEY).await.unwrap().unwrap();
        assert_eq!(stored["k9"]["data"], "v9");
        assert!(stored["k9"]["lastAccess"].is_i64());
        assert_eq!(storage.get("analysis_cache_meta").await.unwrap().unwrap()["count"], 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_save_when_clean_is_noop() {
        let storage = Arc::new(MemoryStorage::new());
        let cache = store(&storage).await;

        cache.save().await.unwrap();
        assert_eq!(storage.writes(KEY), 0);

        cache.set("a", "1".to_string());
        cache.force_save().await.unwrap();
        cache.save().await.unwrap();
        assert_eq!(storage.writes(KEY), 1);

        // The cancelled timer does not write again.
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(storage.writes(KEY), 1);
        assert!(!cache.stats().dirty);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_always_persists() {
        let storage = Arc::new(MemoryStorage::new());
        let cache = store(&storage).await;

        cache.clear().await.unwrap();
        assert_eq!(storage.writes(KEY), 1);
        assert_eq!(storage.get(KEY).await.unwrap(), Some(json!({})));

        cache.set("a", "1".to_string());
        cache.clear().await.unwrap();
        assert_eq!(cache.get("a"), None);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_get_is_idempotent() {
        let storage = Arc::new(MemoryStorage::new());
        let cache = store(&storage).await;
        cache.set("k", "v".to_string());
        assert_eq!(cache.get("k"), cache.get("k"));
        assert_eq!(cache.get("missing"), None);
        cache.flush().await.unwrap();
    }

    #[tokio::test]
    async fn test_reload_persisted_entries() {
        let storage = Arc::new(MemoryStorage::new());
        let cache = store(&storage).await;
        cache.set("k", "v".to_string());
        cache.flush().await.unwrap();

        let reloaded = store(&storage).await;
        assert_eq!(reloaded.get("k"), Some("v".to_string()));
        assert!(reloaded.stats().last_saved.is_some());
    }

    #[tokio::test]
    async fn test_corrupt_cache_degrades_to_empty() {
        let storage = Arc::new(MemoryStorage::new());
        storage.seed(KEY, json!(["not", "a", "map"]));
        let cache = store(&storage).await;
        assert!(cache.is_empty());
    }
}
