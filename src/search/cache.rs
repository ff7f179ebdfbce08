//! Bounded LRU memo of extracted embeddings, keyed by image locator.

use std::future::Future;
use std::num::NonZeroUsize;

use lru::LruCache;
use tokio::sync::Mutex;

pub struct EmbeddingCache {
    /// `None` when caching is disabled.
    entries: Option<Mutex<LruCache<String, Vec<f32>>>>,
}

impl EmbeddingCache {
    /// A capacity of 0 disables caching.
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: NonZeroUsize::new(capacity).map(|cap| Mutex::new(LruCache::new(cap))),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.entries.is_some()
    }

    pub async fn len(&self) -> usize {
        match &self.entries {
            Some(entries) => entries.lock().await.len(),
            None => 0,
        }
    }

    /// Approximate count for reporting without waiting on the lock.
    pub fn try_len(&self) -> Option<usize> {
        match &self.entries {
            Some(entries) => entries.try_lock().ok().map(|guard| guard.len()),
            None => Some(0),
        }
    }

    pub async fn get(&self, key: &str) -> Option<Vec<f32>> {
        let entries = self.entries.as_ref()?;
        entries.lock().await.get(key).cloned()
    }

    pub async fn evict(&self, key: &str) -> bool {
        match &self.entries {
            Some(entries) => entries.lock().await.pop(key).is_some(),
            None => false,
        }
    }

    /// Return the cached vector for `key`, or run `compute` and remember a
    /// successful result. Errors are never cached.
    ///
    /// The lock is not held while computing, so two concurrent misses for
    /// the same key may both compute; the later result wins.
    pub async fn get_or_compute<F, Fut, E>(&self, key: &str, compute: F) -> Result<Vec<f32>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<f32>, E>>,
    {
        let Some(entries) = &self.entries else {
            return compute().await;
        };

        if let Some(hit) = entries.lock().await.get(key) {
            log::debug!("embedding cache hit for {key}");
            return Ok(hit.clone());
        }

        let vector = compute().await?;
        entries.lock().await.put(key.to_string(), vector.clone());
        Ok(vector)
    }
}
