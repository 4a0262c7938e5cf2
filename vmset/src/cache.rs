//! Time-bounded, single-flight resource cache.
//!
//! Each key has its own entry with an async guard. Concurrent misses on one
//! key run the getter once; later callers wait on the guard and then read
//! the stored value. Different keys never block each other.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::future::BoxFuture;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::debug;

use crate::error::{Result, VmSetError};

/// How strictly a read honours the TTL.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CacheReadType {
    /// Refetch when the entry is older than the TTL.
    #[default]
    Default,
    /// Return any stored value, however old. Only fetch when nothing is stored.
    Unsafe,
    /// Always fetch, replacing whatever is stored.
    ForceRefresh,
}

type Getter<V> = Arc<dyn Fn(String) -> BoxFuture<'static, Result<V>> + Send + Sync>;

struct Stored<V> {
    data: Arc<V>,
    fetched_at: Instant,
}

struct CacheEntry<V> {
    stored: RwLock<Option<Stored<V>>>,
    /// Held while the getter runs for this key.
    in_flight: Mutex<()>,
}

impl<V> CacheEntry<V> {
    fn empty() -> Self {
        Self {
            stored: RwLock::new(None),
            in_flight: Mutex::new(()),
        }
    }

    async fn read(&self, ttl: Duration, read_type: CacheReadType) -> Option<Arc<V>> {
        if read_type == CacheReadType::ForceRefresh {
            return None;
        }
        let stored = self.stored.read().await;
        let stored = stored.as_ref()?;
        if read_type == CacheReadType::Unsafe || stored.fetched_at.elapsed() < ttl {
            return Some(stored.data.clone());
        }
        None
    }
}

/// A cache of `V` keyed by string, refreshed through an async getter.
pub struct TimedCache<V> {
    name: &'static str,
    ttl: Duration,
    getter: Getter<V>,
    entries: DashMap<String, Arc<CacheEntry<V>>>,
}

impl<V: Send + Sync + 'static> TimedCache<V> {
    /// Build a cache. A zero TTL is rejected.
    pub fn new<F, Fut>(name: &'static str, ttl: Duration, getter: F) -> Result<Self>
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<V>> + Send + 'static,
    {
        if ttl.is_zero() {
            return Err(VmSetError::InvalidConfig(format!(
                "cache {} needs a non-zero TTL",
                name
            )));
        }
        Ok(Self {
            name,
            ttl,
            getter: Arc::new(move |key| Box::pin(getter(key)) as BoxFuture<'static, Result<V>>),
            entries: DashMap::new(),
        })
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn entry(&self, key: &str) -> Arc<CacheEntry<V>> {
        self.entries
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(CacheEntry::empty()))
            .clone()
    }

    /// Get the value for `key`, fetching it if missing or expired.
    pub async fn get(&self, key: &str, read_type: CacheReadType) -> Result<Arc<V>> {
        let entry = self.entry(key);
        if let Some(data) = entry.read(self.ttl, read_type).await {
            return Ok(data);
        }

        let _guard = entry.in_flight.lock().await;
        // Another caller may have refreshed the entry while we waited.
        if let Some(data) = entry.read(self.ttl, read_type).await {
            return Ok(data);
        }

        debug!(cache = self.name, key, "refreshing cache entry");
        let data = Arc::new((self.getter)(key.to_string()).await?);
        *entry.stored.write().await = Some(Stored {
            data: data.clone(),
            fetched_at: Instant::now(),
        });
        Ok(data)
    }

    /// Drop `key` so the next read refetches.
    pub fn delete(&self, key: &str) {
        self.entries.remove(key);
    }

    /// Store `data` under `key` as freshly fetched.
    pub fn set(&self, key: &str, data: V) {
        let entry = CacheEntry {
            stored: RwLock::new(Some(Stored {
                data: Arc::new(data),
                fetched_at: Instant::now(),
            })),
            in_flight: Mutex::new(()),
        };
        self.entries.insert(key.to_string(), Arc::new(entry));
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn counting_cache(ttl: Duration) -> (Arc<TimedCache<String>>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let cache = TimedCache::new("test", ttl, move |key: String| {
            let counter = counter.clone();
            async move {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok(format!("{}-{}", key, n))
            }
        })
        .unwrap();
        (Arc::new(cache), calls)
    }

    #[test]
    fn test_zero_ttl_rejected() {
        let result = TimedCache::new("zero", Duration::ZERO, |_key: String| async {
            Ok::<_, VmSetError>(1u32)
        });
        assert!(matches!(result, Err(VmSetError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_concurrent_misses_fetch_once() {
        let (cache, calls) = counting_cache(Duration::from_secs(60));

        let handles: Vec<_> = (0..10)
            .map(|_| {
                let cache = cache.clone();
                tokio::spawn(async move { cache.get("vm-0", CacheReadType::Default).await })
            })
            .collect();

        let results = futures::future::join_all(handles).await;
        for result in results {
            assert_eq!(*result.unwrap().unwrap(), "vm-0-1");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_distinct_keys_fetch_independently() {
        let (cache, calls) = counting_cache(Duration::from_secs(60));

        let (a, b) = tokio::join!(
            cache.get("a", CacheReadType::Default),
            cache.get("b", CacheReadType::Default)
        );
        assert_eq!(*a.unwrap(), "a-1");
        assert!(b.unwrap().starts_with("b-"));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_and_unsafe_reads() {
        let (cache, calls) = counting_cache(Duration::from_secs(60));

        assert_eq!(*cache.get("k", CacheReadType::Default).await.unwrap(), "k-1");
        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(*cache.get("k", CacheReadType::Default).await.unwrap(), "k-1");
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_secs(61)).await;
        // stale but allowed
        assert_eq!(*cache.get("k", CacheReadType::Unsafe).await.unwrap(), "k-1");
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        assert_eq!(*cache.get("k", CacheReadType::Default).await.unwrap(), "k-2");
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        assert_eq!(*cache.get("k", CacheReadType::ForceRefresh).await.unwrap(), "k-3");
        assert_eq!(*cache.get("k", CacheReadType::Default).await.unwrap(), "k-3");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_delete_and_set() {
        let (cache, calls) = counting_cache(Duration::from_secs(60));

        cache.set("k", "seeded".to_string());
        assert_eq!(*cache.get("k", CacheReadType::Default).await.unwrap(), "seeded");
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        cache.delete("k");
        assert_eq!(*cache.get("k", CacheReadType::Default).await.unwrap(), "k-1");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_errors_are_not_stored() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let cache = TimedCache::new("flaky", Duration::from_secs(60), move |_key: String| {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(VmSetError::TaskFailed("first call fails".to_string()))
                } else {
                    Ok(7u32)
                }
            }
        })
        .unwrap();

        assert!(cache.get("k", CacheReadType::Default).await.is_err());
        assert_eq!(*cache.get("k", CacheReadType::Default).await.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
