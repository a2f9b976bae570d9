//! Expiring result cache for query callers.
//!
//! Maps a call signature (e.g. `"most_popular_stations(limit=10)"`) to a
//! result and the instant it was computed. Entries older than the TTL are
//! recomputed on the next lookup. The query catalogue itself never consults
//! the cache.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::error::Result;

pub struct QueryCache<V> {
    ttl: Duration,
    entries: Mutex<HashMap<String, (V, Instant)>>,
}

impl<V: Clone> QueryCache<V> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// A cached value younger than the TTL, if any.
    pub fn get(&self, key: &str) -> Option<V> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries
            .get(key)
            .filter(|(_, at)| at.elapsed() < self.ttl)
            .map(|(value, _)| value.clone())
    }

    pub fn insert(&self, key: impl Into<String>, value: V) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.insert(key.into(), (value, Instant::now()));
    }

    /// Return the cached value for `key`, or evaluate `compute` and cache its
    /// success. Errors are returned and not cached.
    pub async fn get_or_try_insert_with<F, Fut>(&self, key: &str, compute: F) -> Result<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V>>,
    {
        if let Some(value) = self.get(key) {
            tracing::debug!(key, "cache hit");
            return Ok(value);
        }
        let value = compute().await?;
        self.insert(key, value.clone());
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn fresh_entries_are_reused() {
        let cache = QueryCache::new(Duration::from_secs(600));
        let calls = &AtomicUsize::new(0);

        for _ in 0..3 {
            let value = cache
                .get_or_try_insert_with("total_document_count()", move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(42u64)
                })
                .await
                .unwrap();
            assert_eq!(value, 42);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.get("total_document_count()"), Some(42));
        assert!(cache.get("trips_per_month()").is_none());
    }

    #[tokio::test]
    async fn expired_entries_are_recomputed() {
        let cache = QueryCache::new(Duration::ZERO);
        cache.insert("k", 1);
        assert!(cache.get("k").is_none());

        let value = cache
            .get_or_try_insert_with("k", || async { Ok(2) })
            .await
            .unwrap();
        assert_eq!(value, 2);
    }

    #[tokio::test]
    async fn errors_are_not_cached() {
        let cache: QueryCache<u64> = QueryCache::new(Duration::from_secs(60));
        let err = cache
            .get_or_try_insert_with("bad", || async { Err(Error::Query("boom".to_string())) })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Query(_)));
        assert!(cache.get("bad").is_none());

        let value = cache
            .get_or_try_insert_with("bad", || async { Ok(7) })
            .await
            .unwrap();
        assert_eq!(value, 7);
    }
}
