// Driftlab Engine — Embedding Cache
//
// Thin wrapper over the embedding endpoint. Exact text is cached in a
// bounded LRU so repeated canonical summaries and issue templates don't
// re-hit the model. Process-wide: one cache serves every experiment worker,
// so all access goes through an internal lock and misses for the same key
// are idempotent under concurrency.

use crate::atoms::error::EngineResult;
use async_trait::async_trait;
use log::debug;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

// ── Provider seam ──────────────────────────────────────────────────────────

/// Anything that can turn text into a dense vector. The cache wraps a
/// provider; the runner wraps the gateway in one.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, text: &str) -> EngineResult<Vec<f32>>;
}

// ── Cache ──────────────────────────────────────────────────────────────────

struct CacheSlot {
    vector: Arc<Vec<f32>>,
    last_access: u64,
}

struct CacheInner {
    map: HashMap<String, CacheSlot>,
    /// Monotonic access clock for LRU ordering.
    tick: u64,
}

/// Bounded exact-key LRU over an `EmbeddingProvider`.
///
/// Upstream failure returns the empty sentinel vector; sentinels are never
/// cached, so the next call retries the provider.
pub struct EmbeddingCache {
    provider: Arc<dyn EmbeddingProvider>,
    inner: Mutex<CacheInner>,
    enabled: bool,
    max_entries: usize,
    hits: AtomicU64,
    misses: AtomicU64,
}

/// Snapshot of cache counters for inspection.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub enabled: bool,
    pub size: usize,
    pub max_entries: usize,
    pub hits: u64,
    pub misses: u64,
}

impl EmbeddingCache {
    pub fn new(provider: Arc<dyn EmbeddingProvider>, enabled: bool, max_entries: usize) -> Self {
        EmbeddingCache {
            provider,
            inner: Mutex::new(CacheInner {
                map: HashMap::new(),
                tick: 0,
            }),
            enabled,
            max_entries: max_entries.max(1),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Embed `text`, serving from cache on an exact-string hit.
    /// Returns the sentinel empty vector when the provider fails.
    pub async fn embed(&self, text: &str) -> Arc<Vec<f32>> {
        if self.enabled {
            let mut inner = self.inner.lock();
            let tick = {
                inner.tick += 1;
                inner.tick
            };
            if let Some(slot) = inner.map.get_mut(text) {
                slot.last_access = tick;
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Arc::clone(&slot.vector);
            }
        }

        self.misses.fetch_add(1, Ordering::Relaxed);

        // Lock is not held across the await; two concurrent misses for the
        // same key both call the provider and the second insert is a no-op.
        let vector = match self.provider.embed(text).await {
            Ok(v) => Arc::new(v),
            Err(e) => {
                debug!("[cache] embed miss failed upstream: {}", e);
                return Arc::new(Vec::new());
            }
        };

        if vector.is_empty() {
            // Sentinel from a degraded provider, never cached.
            return vector;
        }

        if self.enabled {
            let mut inner = self.inner.lock();
            inner.tick += 1;
            let tick = inner.tick;
            if let Some(existing) = inner.map.get_mut(text) {
                existing.last_access = tick;
                return Arc::clone(&existing.vector);
            }
            if inner.map.len() >= self.max_entries {
                Self::evict_oldest(&mut inner);
            }
            inner.map.insert(
                text.to_string(),
                CacheSlot {
                    vector: Arc::clone(&vector),
                    last_access: tick,
                },
            );
        }

        vector
    }

    fn evict_oldest(inner: &mut CacheInner) {
        if let Some(key) = inner
            .map
            .iter()
            .min_by_key(|(_, slot)| slot.last_access)
            .map(|(k, _)| k.clone())
        {
            inner.map.remove(&key);
        }
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            enabled: self.enabled,
            size: self.inner.lock().map.len(),
            max_entries: self.max_entries,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}
