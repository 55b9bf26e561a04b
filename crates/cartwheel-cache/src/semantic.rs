//! Semantic list cache.
//!
//! Search-result lists are keyed by the user's query. Lookups embed the
//! query and accept the closest stored entry at or above the similarity
//! threshold, so reworded near-duplicates ("wireless bluetooth speakers"
//! after "bluetooth speakers") hit without re-running the engine. Backends
//! are pluggable behind [`ListCacheBackend`]; the in-process one lives here,
//! the vector-service one in [`crate::remote`].

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use cartwheel_core::config::CacheConfig;
use cartwheel_core::error::{CartwheelError, Result};
use cartwheel_core::types::SearchResult;
use cartwheel_providers::{Embedder, cosine_similarity};

use crate::single_flight::SingleFlight;

/// Canonical form of a query for cache keying: lower-cased, punctuation
/// stripped, whitespace collapsed.
pub fn normalize_query(query: &str) -> String {
    query
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// One list to store, with its precomputed query embedding.
pub struct ListEntry {
    pub normalized: String,
    pub origin_query: String,
    pub embedding: Vec<f32>,
    pub value: Vec<SearchResult>,
    pub ttl: Duration,
}

/// Storage contract shared by the in-process index and the remote vector
/// service.
#[async_trait]
pub trait ListCacheBackend: Send + Sync {
    async fn add(&self, entry: ListEntry) -> Result<()>;

    /// Best unexpired list for the embedding, if any entry reaches
    /// `threshold`. An exact `normalized` key match wins outright.
    async fn query(
        &self,
        normalized: &str,
        embedding: &[f32],
        threshold: f32,
    ) -> Result<Option<Vec<SearchResult>>>;

    async fn delete(&self, normalized: &str) -> Result<()>;

    /// Drop expired entries, returning how many were removed.
    async fn sweep_expired(&self) -> Result<usize>;
}

// --- In-process backend ---

struct Stored {
    normalized: String,
    origin_query: String,
    embedding: Vec<f32>,
    value: Vec<SearchResult>,
    inserted_at: Instant,
    ttl: Duration,
}

impl Stored {
    fn is_expired(&self) -> bool {
        self.inserted_at.elapsed() >= self.ttl
    }
}

/// Vector index held in memory, evicting oldest-first once `max_entries` is
/// reached.
pub struct MemoryListBackend {
    max_entries: usize,
    entries: RwLock<VecDeque<Stored>>,
}

impl MemoryListBackend {
    pub fn new(max_entries: usize) -> Self {
        Self {
            max_entries,
            entries: RwLock::new(VecDeque::new()),
        }
    }
}

#[async_trait]
impl ListCacheBackend for MemoryListBackend {
    async fn add(&self, entry: ListEntry) -> Result<()> {
        let mut entries = self.entries.write().await;
        if let Some(pos) = entries
            .iter()
            .position(|e| e.normalized == entry.normalized)
        {
            entries.remove(pos);
        }
        entries.push_back(Stored {
            normalized: entry.normalized,
            origin_query: entry.origin_query,
            embedding: entry.embedding,
            value: entry.value,
            inserted_at: Instant::now(),
            ttl: entry.ttl,
        });
        while entries.len() > self.max_entries {
            if let Some(evicted) = entries.pop_front() {
                debug!(query = %evicted.normalized, "List cache full, evicted oldest entry");
            }
        }
        Ok(())
    }

    async fn query(
        &self,
        normalized: &str,
        embedding: &[f32],
        threshold: f32,
    ) -> Result<Option<Vec<SearchResult>>> {
        let entries = self.entries.read().await;
        let mut best: Option<&Stored> = None;
        let mut best_similarity = -1.0f32;
        for stored in entries.iter() {
            if stored.is_expired() {
                continue;
            }
            if stored.normalized == normalized {
                return Ok(Some(stored.value.clone()));
            }
            let similarity = cosine_similarity(embedding, &stored.embedding);
            if similarity >= threshold && similarity > best_similarity {
                best_similarity = similarity;
                best = Some(stored);
            }
        }
        Ok(best.map(|stored| {
            debug!(
                similarity = best_similarity,
                origin = %stored.origin_query,
                "Semantic list cache hit"
            );
            stored.value.clone()
        }))
    }

    async fn delete(&self, normalized: &str) -> Result<()> {
        let mut entries = self.entries.write().await;
        entries.retain(|e| e.normalized != normalized);
        Ok(())
    }

    async fn sweep_expired(&self) -> Result<usize> {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|e| !e.is_expired());
        Ok(before - entries.len())
    }
}

// --- Facade ---

/// List cache as the engine sees it: lookup-or-produce with single-flight on
/// misses. Backend and embedder failures degrade to pass-through.
pub struct SemanticListCache {
    backend: Arc<dyn ListCacheBackend>,
    embedder: Arc<dyn Embedder>,
    threshold: f32,
    ttl: Duration,
    flights: SingleFlight<Vec<SearchResult>>,
}

impl SemanticListCache {
    pub fn new(
        backend: Arc<dyn ListCacheBackend>,
        embedder: Arc<dyn Embedder>,
        config: &CacheConfig,
    ) -> Self {
        Self {
            backend,
            embedder,
            threshold: config.similarity_threshold as f32,
            ttl: config.list_ttl(),
            flights: SingleFlight::new(),
        }
    }

    /// Resolve `query` from the cache, or run `produce` (deduplicated across
    /// concurrent callers) and store its result. `bypass_cache` skips the
    /// lookup but still refreshes the stored entry.
    pub async fn get_or_produce<F, Fut>(
        &self,
        query: &str,
        bypass_cache: bool,
        produce: F,
    ) -> Result<Vec<SearchResult>>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<Vec<SearchResult>>> + Send,
    {
        let normalized = normalize_query(query);
        let embedding = match self.embed(query).await {
            Ok(vector) => Some(vector),
            Err(e) => {
                warn!(error = %e, "Query embedding failed, cache disabled for this call");
                None
            }
        };

        if !bypass_cache {
            if let Some(vector) = embedding.as_deref() {
                match self.backend.query(&normalized, vector, self.threshold).await {
                    Ok(Some(hit)) => {
                        debug!(query, results = hit.len(), "List cache hit");
                        return Ok(hit);
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!(error = %e, "List cache query failed, treating as miss")
                    }
                }
            }
        }

        let flight_key = normalized.clone();
        self.flights
            .run(&flight_key, || async move {
                let produced = produce().await?;
                // Empty lists are not cached; the all-integrations-failed
                // apology must stay retryable.
                if !produced.is_empty() {
                    if let Some(vector) = embedding {
                        let entry = ListEntry {
                            normalized,
                            origin_query: query.to_string(),
                            embedding: vector,
                            value: produced.clone(),
                            ttl: self.ttl,
                        };
                        if let Err(e) = self.backend.add(entry).await {
                            warn!(error = %e, "List cache add failed");
                        }
                    }
                }
                Ok(produced)
            })
            .await
    }

    pub async fn sweep(&self) {
        match self.backend.sweep_expired().await {
            Ok(0) => {}
            Ok(removed) => debug!(removed, "Swept expired list cache entries"),
            Err(e) => warn!(error = %e, "List cache sweep failed"),
        }
    }

    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration) -> tokio::task::JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                cache.sweep().await;
            }
        })
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let texts = [text.to_string()];
        let mut vectors = self.embedder.embed(&texts).await?;
        vectors
            .pop()
            .ok_or_else(|| CartwheelError::Cache("embedder returned no vector".into()))
    }
}
