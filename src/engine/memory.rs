// Driftlab Engine — Experience Memory
//
// Bounded store of past scored episodes with cosine-similarity retrieval.
// Admission dedups on the canonical summary string, scores importance, and
// evicts pure-LRU at capacity (importance is exposed for inspection but
// does not drive eviction). Retrieval is O(n) over stored embeddings,
// fine for a few thousand entries; an ANN index is a drop-in replacement
// beyond that.

use crate::atoms::config::MemoryConfig;
use crate::atoms::types::{Experience, StrategyKind};
use crate::engine::embedding::EmbeddingCache;
use log::{debug, info};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

// ── Vector math ────────────────────────────────────────────────────────────

/// Cosine similarity of two vectors. Defined as 0 when either vector has
/// zero norm (covers the gateway's empty sentinel).
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.is_empty() || b.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += *x as f64 * *y as f64;
        norm_a += (*x as f64) * (*x as f64);
        norm_b += (*y as f64) * (*y as f64);
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

// ── Entries ────────────────────────────────────────────────────────────────

/// One admitted experience with its retrieval metadata.
#[derive(Debug, Clone)]
pub struct MemoryEntry {
    pub id: String,
    pub experience: Experience,
    pub summary: String,
    pub embedding: Arc<Vec<f32>>,
    /// Importance in [0, 1]; recomputed on admit, read-only afterwards.
    pub importance: f64,
    pub access_count: u64,
    /// Monotonic access tick used for LRU ordering.
    last_access: u64,
}

/// A retrieval hit handed to the prompt builder.
#[derive(Debug, Clone, Serialize)]
pub struct RetrievedMemory {
    pub entry_id: String,
    pub summary: String,
    pub similarity: f64,
    pub importance: f64,
    pub strategy: StrategyKind,
    pub reward: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MemoryStats {
    pub size: usize,
    pub max_size: usize,
    pub total_added: u64,
    pub total_evicted: u64,
    pub total_retrievals: u64,
    pub utilization: f64,
    pub average_importance: f64,
}

// ── Memory ─────────────────────────────────────────────────────────────────

struct MemoryInner {
    entries: HashMap<String, MemoryEntry>,
    /// Canonical summary → entry id, for exact-match dedup.
    summary_index: HashMap<String, String>,
    tick: u64,
    total_added: u64,
    total_evicted: u64,
    total_retrievals: u64,
}

/// Per-experiment experience memory. `reset` clears it wholesale.
pub struct ExperienceMemory {
    cache: Arc<EmbeddingCache>,
    config: MemoryConfig,
    inner: Mutex<MemoryInner>,
}

impl ExperienceMemory {
    pub fn new(cache: Arc<EmbeddingCache>, config: MemoryConfig) -> Self {
        info!("[memory] initialized, max_size={}", config.max_size);
        ExperienceMemory {
            cache,
            config,
            inner: Mutex::new(MemoryInner {
                entries: HashMap::new(),
                summary_index: HashMap::new(),
                tick: 0,
                total_added: 0,
                total_evicted: 0,
                total_retrievals: 0,
            }),
        }
    }

    /// Importance: base 0.5, shifted by reward, violation, and success.
    fn importance_of(exp: &Experience) -> f64 {
        let mut score = 0.5 + exp.reward.total / 100.0;
        if exp.is_violation {
            score += 0.3;
        }
        if exp.is_successful() {
            score += 0.1;
        }
        score.clamp(0.0, 1.0)
    }

    /// Admit one experience. Returns the id of the stored entry, which is
    /// the existing one when the canonical summary is already present.
    pub async fn admit(&self, experience: Experience) -> String {
        let summary = experience.canonical_summary();

        // Dedup check before the (expensive) embedding call.
        {
            let inner = self.inner.lock();
            if let Some(existing) = inner.summary_index.get(&summary) {
                debug!("[memory] duplicate summary, skipping admission");
                return existing.clone();
            }
        }

        let embedding = self.cache.embed(&summary).await;
        let importance = Self::importance_of(&experience);
        let id = uuid::Uuid::new_v4().to_string();

        let mut inner = self.inner.lock();
        // Re-check under the lock: a concurrent admit may have won.
        if let Some(existing) = inner.summary_index.get(&summary) {
            return existing.clone();
        }

        if inner.entries.len() >= self.config.max_size {
            Self::evict_lru(&mut inner);
        }

        inner.tick += 1;
        let tick = inner.tick;
        inner.summary_index.insert(summary.clone(), id.clone());
        inner.entries.insert(
            id.clone(),
            MemoryEntry {
                id: id.clone(),
                experience,
                summary,
                embedding,
                importance,
                access_count: 0,
                last_access: tick,
            },
        );
        inner.total_added += 1;

        debug!(
            "[memory] admitted entry importance={:.2}, size={}/{}",
            importance,
            inner.entries.len(),
            self.config.max_size
        );

        id
    }

    /// Evict the least-recently-accessed entry and its reverse index in one
    /// lock scope.
    fn evict_lru(inner: &mut MemoryInner) {
        if let Some(id) = inner
            .entries
            .values()
            .min_by_key(|e| e.last_access)
            .map(|e| e.id.clone())
        {
            if let Some(removed) = inner.entries.remove(&id) {
                inner.summary_index.remove(&removed.summary);
                inner.total_evicted += 1;
                debug!(
                    "[memory] evicted entry (LRU), importance={:.2}",
                    removed.importance
                );
            }
        }
    }

    /// Retrieve up to `k` entries whose embedding similarity to the query
    /// meets the threshold, most similar first. Updates access metadata on
    /// every returned entry.
    pub async fn retrieve_similar(&self, query: &str, k: usize) -> Vec<RetrievedMemory> {
        if k == 0 {
            return Vec::new();
        }

        let query_embedding = self.cache.embed(query).await;

        let mut inner = self.inner.lock();
        inner.total_retrievals += 1;

        let mut scored: Vec<(String, f64)> = inner
            .entries
            .values()
            .map(|e| (e.id.clone(), cosine_similarity(&query_embedding, &e.embedding)))
            .filter(|(_, sim)| *sim >= self.config.similarity_threshold)
            .collect();

        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);

        let mut results = Vec::with_capacity(scored.len());
        for (id, similarity) in scored {
            inner.tick += 1;
            let tick = inner.tick;
            if let Some(entry) = inner.entries.get_mut(&id) {
                entry.access_count += 1;
                entry.last_access = tick;
                results.push(RetrievedMemory {
                    entry_id: entry.id.clone(),
                    summary: entry.summary.clone(),
                    similarity,
                    importance: entry.importance,
                    strategy: entry.experience.strategy,
                    reward: entry.experience.reward.total,
                });
            }
        }

        debug!("[memory] retrieval found {} neighbors", results.len());
        results
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        let before = inner.entries.len();
        inner.entries.clear();
        inner.summary_index.clear();
        inner.tick = 0;
        inner.total_added = 0;
        inner.total_evicted = 0;
        inner.total_retrievals = 0;
        info!("[memory] cleared {} entries", before);
    }

    pub fn stats(&self) -> MemoryStats {
        let inner = self.inner.lock();
        let size = inner.entries.len();
        let avg_importance = if size == 0 {
            0.0
        } else {
            inner.entries.values().map(|e| e.importance).sum::<f64>() / size as f64
        };
        MemoryStats {
            size,
            max_size: self.config.max_size,
            total_added: inner.total_added,
            total_evicted: inner.total_evicted,
            total_retrievals: inner.total_retrievals,
            utilization: size as f64 / self.config.max_size as f64,
            average_importance: avg_importance,
        }
    }
}
