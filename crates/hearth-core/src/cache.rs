//! Generic in-memory cache with a fixed time-to-live.
//!
//! Expired entries read as absent immediately. A background task also runs
//! the cache's housekeeping on a fixed interval, so expired entries are
//! purged even when nobody reads them.

use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use moka::future::Cache;
use serde::Serialize;
use tokio::task::JoinHandle;

/// Default interval of the background sweep.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CacheStats {
    /// Live entries after the last sweep.
    pub size: u64,
    pub ttl_secs: u64,
}

/// Aborts the sweep task when the last cache handle is dropped.
struct SweepGuard(Option<JoinHandle<()>>);

impl Drop for SweepGuard {
    fn drop(&mut self) {
        if let Some(handle) = self.0.take() {
            handle.abort();
        }
    }
}

/// TTL cache keyed by `K`. Clones share entries.
pub struct TtlCache<K, V>
where
    K: Hash + Eq + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    inner: Cache<K, V>,
    ttl: Duration,
    _sweeper: Arc<SweepGuard>,
}

impl<K, V> Clone for TtlCache<K, V>
where
    K: Hash + Eq + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            ttl: self.ttl,
            _sweeper: Arc::clone(&self._sweeper),
        }
    }
}

impl<K, V> TtlCache<K, V>
where
    K: Hash + Eq + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new(ttl: Duration) -> Self {
        Self::with_sweep_interval(ttl, DEFAULT_SWEEP_INTERVAL)
    }

    /// Build a cache and start its sweep task on the current Tokio runtime.
    ///
    /// Outside a runtime the cache still works; expired entries are then
    /// only dropped lazily.
    pub fn with_sweep_interval(ttl: Duration, sweep_interval: Duration) -> Self {
        let inner = Cache::builder().time_to_live(ttl).build();

        let handle = match tokio::runtime::Handle::try_current() {
            Ok(rt) => {
                let cache = inner.clone();
                Some(rt.spawn(async move {
                    let mut ticker = tokio::time::interval(sweep_interval);
                    // The first tick completes immediately.
                    ticker.tick().await;
                    loop {
                        ticker.tick().await;
                        cache.run_pending_tasks().await;
                        tracing::trace!(entries = cache.entry_count(), "Cache sweep");
                    }
                }))
            }
            Err(_) => {
                tracing::debug!("No Tokio runtime, cache sweep disabled");
                None
            }
        };

        Self {
            inner,
            ttl,
            _sweeper: Arc::new(SweepGuard(handle)),
        }
    }

    pub async fn get(&self, key: &K) -> Option<V> {
        self.inner.get(key).await
    }

    pub async fn set(&self, key: K, value: V) {
        self.inner.insert(key, value).await;
    }

    pub async fn delete(&self, key: &K) {
        self.inner.invalidate(key).await;
    }

    pub async fn clear(&self) {
        self.inner.invalidate_all();
        self.inner.run_pending_tasks().await;
    }

    pub async fn stats(&self) -> CacheStats {
        self.inner.run_pending_tasks().await;
        CacheStats {
            size: self.inner.entry_count(),
            ttl_secs: self.ttl.as_secs(),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }
}
