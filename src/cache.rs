//! In-memory caches owned by the pipeline.
//!
//! Both caches are moka `sync::Cache`s with LRU eviction. The embedding cache
//! memoizes model output per `(model_id, text)`, and the result cache
//! memoizes the final ranked output of a query for a bounded time.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use moka::{policy::EvictionPolicy, sync::Cache};
use serde::Serialize;

use crate::{
    error::Result,
    model::{Cancellation, Embedder, RetryPolicy, retry_with_backoff},
    pipeline::Retrieval,
};

/// Point-in-time counters for one cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub entries: u64,
    pub capacity: u64,
    pub hits: u64,
    pub misses: u64,
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
}

impl Counters {
    fn hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    fn miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self, entries: u64, capacity: u64) -> CacheStats {
        CacheStats {
            entries,
            capacity,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

type EmbeddingKey = (String, String);

/// Memoized embeddings keyed by model and exact text.
pub struct EmbeddingCache {
    cache: Cache<EmbeddingKey, Arc<Vec<f32>>>,
    capacity: u64,
    counters: Counters,
}

impl EmbeddingCache {
    pub fn new(capacity: u64) -> Self {
        let cache = Cache::builder()
            .max_capacity(capacity)
            .eviction_policy(EvictionPolicy::lru())
            .build();
        Self {
            cache,
            capacity,
            counters: Counters::default(),
        }
    }

    fn key(embedder: &dyn Embedder, text: &str) -> EmbeddingKey {
        (embedder.model_id().to_string(), text.to_string())
    }

    /// Embed `text`, consulting the cache before calling the model.
    pub fn get_or_embed(
        &self,
        text: &str,
        embedder: &dyn Embedder,
        retry: &RetryPolicy,
        cancel: &Cancellation,
    ) -> Result<Arc<Vec<f32>>> {
        let key = Self::key(embedder, text);
        if let Some(hit) = self.cache.get(&key) {
            self.counters.hit();
            return Ok(hit);
        }
        self.counters.miss();

        let vector = retry_with_backoff(retry, cancel, "embed", || {
            embedder.embed(text)
        })?;
        let vector = Arc::new(vector);
        self.cache.insert(key, Arc::clone(&vector));
        Ok(vector)
    }

    /// Embed many texts, sending only the cache misses to the model in one
    /// batch. Output order matches `texts`.
    pub fn get_or_embed_batch(
        &self,
        texts: &[String],
        embedder: &dyn Embedder,
        retry: &RetryPolicy,
        cancel: &Cancellation,
    ) -> Result<Vec<Arc<Vec<f32>>>> {
        let mut out: Vec<Option<Arc<Vec<f32>>>> = Vec::with_capacity(texts.len());
        let mut missing = Vec::new();
        let mut missing_at = Vec::new();

        for (i, text) in texts.iter().enumerate() {
            match self.cache.get(&Self::key(embedder, text)) {
                Some(hit) => {
                    self.counters.hit();
                    out.push(Some(hit));
                }
                None => {
                    self.counters.miss();
                    out.push(None);
                    missing.push(text.clone());
                    missing_at.push(i);
                }
            }
        }

        if !missing.is_empty() {
            let vectors = retry_with_backoff(retry, cancel, "embed_batch", || {
                embedder.embed_batch(&missing)
            })?;
            if vectors.len() != missing.len() {
                return Err(crate::model::ModelError::InvalidOutput(format!(
                    "expected {} embeddings, got {}",
                    missing.len(),
                    vectors.len()
                ))
                .into());
            }
            for ((i, text), vector) in
                missing_at.into_iter().zip(missing).zip(vectors)
            {
                let vector = Arc::new(vector);
                self.cache
                    .insert((embedder.model_id().to_string(), text), Arc::clone(&vector));
                out[i] = Some(vector);
            }
        }

        Ok(out.into_iter().flatten().collect())
    }

    pub fn clear(&self) {
        self.cache.invalidate_all();
    }

    pub fn stats(&self) -> CacheStats {
        self.cache.run_pending_tasks();
        self.counters.snapshot(self.cache.entry_count(), self.capacity)
    }
}

/// Memoized retrieval output with a time-to-live.
///
/// Keys carry the index epoch a retrieval started under. Each
/// [`ResultCache::invalidate_all`] advances the epoch, so a retrieval that
/// raced an index write stores its answer under a key no later lookup uses.
pub struct ResultCache {
    cache: Cache<String, Arc<Retrieval>>,
    capacity: u64,
    generation: u64,
    epoch: AtomicU64,
    counters: Counters,
}

impl ResultCache {
    /// `generation` is folded into every key, so caches built from different
    /// settings never share entries.
    pub fn new(capacity: u64, ttl: Duration, generation: u64) -> Self {
        let cache = Cache::builder()
            .max_capacity(capacity)
            .time_to_live(ttl)
            .eviction_policy(EvictionPolicy::lru())
            .build();
        Self {
            cache,
            capacity,
            generation,
            epoch: AtomicU64::new(0),
            counters: Counters::default(),
        }
    }

    /// Read before touching the indexes; pass it to `get` and `insert`.
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    fn key(&self, epoch: u64, normalized_query: &str) -> String {
        format!(
            "{}\u{1f}{epoch}\u{1f}{}",
            self.generation,
            normalized_query.to_lowercase()
        )
    }

    pub fn get(&self, epoch: u64, normalized_query: &str) -> Option<Arc<Retrieval>> {
        let found = self.cache.get(&self.key(epoch, normalized_query));
        match found {
            Some(_) => self.counters.hit(),
            None => self.counters.miss(),
        }
        found
    }

    /// Store a retrieval computed under `epoch`. Results from an epoch that
    /// has since been invalidated are dropped.
    pub fn insert(&self, epoch: u64, normalized_query: &str, retrieval: Arc<Retrieval>) {
        if epoch != self.epoch() {
            tracing::debug!(epoch, "discarding result computed before an index update");
            return;
        }
        self.cache.insert(self.key(epoch, normalized_query), retrieval);
    }

    /// Advance the epoch and drop every entry.
    pub fn invalidate_all(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.cache.invalidate_all();
    }

    pub fn stats(&self) -> CacheStats {
        self.cache.run_pending_tasks();
        self.counters.snapshot(self.cache.entry_count(), self.capacity)
    }
}
