use std::{future::Future, time::Duration};

use anyhow::Result;
use moka::{Expiry, future::Cache, policy::EvictionPolicy};

use crate::error::unshare;

/// What a cache computation yields: the value, how long it stays valid and
/// how much of the capacity it occupies.
pub struct Computed<V> {
    pub value: V,
    pub ttl: Duration,
    pub weight: usize,
}

impl<V> Computed<V> {
    pub fn new(value: V, ttl: Duration, weight: usize) -> Self {
        Self { value, ttl, weight }
    }
}

#[derive(Clone)]
struct Entry<V> {
    value: V,
    ttl: Duration,
    weight: u32,
}

struct PerEntryTtl;

impl<V> Expiry<String, Entry<V>> for PerEntryTtl {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &Entry<V>,
        _created_at: std::time::Instant,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

/// Size bounded read-through cache with per entry TTL, evicting the least
/// recently used entries first.
///
/// Concurrent `get_or_compute` calls for the same key share one computation.
/// Failed computations are handed to every waiter but never stored, so the
/// next call computes again.
#[derive(Clone)]
pub struct MetricCache<V> {
    inner: Cache<String, Entry<V>>,
}

impl<V> MetricCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// `capacity` is the total weight (roughly bytes) the cache may hold.
    pub fn new(capacity: u64) -> Self {
        let inner = Cache::builder()
            .max_capacity(capacity)
            .eviction_policy(EvictionPolicy::lru())
            .weigher(|_key: &String, entry: &Entry<V>| entry.weight)
            .expire_after(PerEntryTtl)
            .build();
        Self { inner }
    }

    pub async fn get_or_compute<F>(&self, key: &str, compute: F) -> Result<V>
    where
        F: Future<Output = Result<Computed<V>>>,
    {
        self.inner
            .try_get_with(key.to_string(), async move {
                compute.await.map(|c| Entry {
                    value: c.value,
                    ttl: c.ttl,
                    weight: u32::try_from(c.weight).unwrap_or(u32::MAX),
                })
            })
            .await
            .map(|e| e.value)
            .map_err(unshare)
    }

    pub async fn get(&self, key: &str) -> Option<V> {
        self.inner.get(key).await.map(|e| e.value)
    }

    pub async fn invalidate(&self, key: &str) {
        self.inner.invalidate(key).await
    }

    pub async fn weighted_size(&self) -> u64 {
        self.inner.run_pending_tasks().await;
        self.inner.weighted_size()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    use super::*;
    use crate::error::MonitorError;
    use tokio::time::sleep;

    #[tokio::test]
    async fn test_single_flight() {
        let cache: MetricCache<u64> = MetricCache::new(1024);
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = vec![];
        for _ in 0..16 {
            let cache = cache.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_compute("key", async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        sleep(Duration::from_millis(50)).await;
                        Ok(Computed::new(42, Duration::from_secs(60), 1))
                    })
                    .await
            }));
        }
        for h in handles {
            assert_eq!(h.await.unwrap().unwrap(), 42);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_recompute_after_ttl() {
        let cache: MetricCache<usize> = MetricCache::new(1024);
        let calls = Arc::new(AtomicUsize::new(0));
        let compute = |calls: Arc<AtomicUsize>| async move {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(Computed::new(n, Duration::from_millis(50), 1))
        };

        assert_eq!(cache.get_or_compute("k", compute(calls.clone())).await.unwrap(), 1);
        assert_eq!(cache.get_or_compute("k", compute(calls.clone())).await.unwrap(), 1);
        sleep(Duration::from_millis(120)).await;
        assert_eq!(cache.get_or_compute("k", compute(calls.clone())).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_errors_are_not_cached() {
        let cache: MetricCache<usize> = MetricCache::new(1024);
        let err = cache
            .get_or_compute("k", async {
                Err(MonitorError::Adapter("backend down".into()).into())
            })
            .await
            .unwrap_err();
        assert!(matches!(MonitorError::of(&err), Some(MonitorError::Adapter(_))));
        assert!(cache.get("k").await.is_none());

        let v = cache
            .get_or_compute("k", async { Ok(Computed::new(7, Duration::from_secs(60), 1)) })
            .await
            .unwrap();
        assert_eq!(v, 7);
    }

    #[tokio::test]
    async fn test_capacity_bounds_weight() {
        let cache: MetricCache<usize> = MetricCache::new(100);
        for i in 0..10 {
            cache
                .get_or_compute(&format!("k{i}"), async move {
                    Ok(Computed::new(i, Duration::from_secs(60), 40))
                })
                .await
                .unwrap();
        }
        assert!(cache.weighted_size().await <= 100);
    }

    #[tokio::test]
    async fn test_new_entry_evicts_least_recently_used() {
        let cache: MetricCache<&'static str> = MetricCache::new(100);
        for _ in 0..5 {
            cache
                .get_or_compute("old", async {
                    Ok(Computed::new("old", Duration::from_secs(60), 60))
                })
                .await
                .unwrap();
        }
        cache
            .get_or_compute("new", async {
                Ok(Computed::new("new", Duration::from_secs(60), 60))
            })
            .await
            .unwrap();

        assert!(cache.weighted_size().await <= 100);
        assert_eq!(cache.get("new").await, Some("new"));
        assert!(cache.get("old").await.is_none());
    }
}
