//! Embedding adapters.
//!
//! The semantic list cache and the reranker both score text through an
//! [`Embedder`]. `HttpEmbedder` talks to an OpenAI-compatible
//! `/v1/embeddings` endpoint; [`HashEmbedder`] is a deterministic local
//! fallback (token-feature hashing) used when no provider is configured and
//! throughout the test suites.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use sha2::{Digest, Sha256};
use tracing::debug;

use cartwheel_core::config::ProviderConfig;
use cartwheel_core::error::{CartwheelError, Result};

/// Cosine similarity between two vectors; 0.0 when either is all-zero.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

#[async_trait]
pub trait Embedder: Send + Sync {
    fn id(&self) -> &str;

    /// Output dimensionality; every returned vector has this length.
    fn dimensions(&self) -> usize;

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

// --- HTTP embedder ---

const DEFAULT_EMBEDDING_MODEL: &str = "text-embedding-3-small";
const DEFAULT_EMBEDDING_DIMS: usize = 1536;

pub struct HttpEmbedder {
    provider_id: String,
    base_url: String,
    api_key: Option<String>,
    model: String,
    dims: usize,
    client: reqwest::Client,
}

impl HttpEmbedder {
    pub fn new(
        id: impl Into<String>,
        base_url: &str,
        api_key: Option<String>,
        model: Option<&str>,
    ) -> Self {
        Self {
            provider_id: id.into(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            model: model.unwrap_or(DEFAULT_EMBEDDING_MODEL).to_string(),
            dims: DEFAULT_EMBEDDING_DIMS,
            client: reqwest::Client::new(),
        }
    }

    pub fn from_config(config: &ProviderConfig) -> Option<Self> {
        let base_url = config.base_url.as_deref()?;
        Some(Self::new(
            config.id.clone(),
            base_url,
            config.resolve_api_key(),
            config.embedding_model.as_deref(),
        ))
    }
}

#[derive(Debug, Deserialize)]
struct EmbeddingsResponse {
    data: Vec<EmbeddingEntry>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingEntry {
    index: usize,
    embedding: Vec<f32>,
}

#[async_trait]
impl Embedder for HttpEmbedder {
    fn id(&self) -> &str {
        &self.provider_id
    }

    fn dimensions(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        debug!(provider = %self.provider_id, count = texts.len(), "Requesting embeddings");

        let mut req = self
            .client
            .post(format!("{}/v1/embeddings", self.base_url))
            .header("content-type", "application/json");
        if let Some(key) = &self.api_key {
            req = req.header("authorization", format!("Bearer {key}"));
        }

        let response = req
            .json(&json!({ "model": self.model, "input": texts }))
            .send()
            .await
            .map_err(|e| CartwheelError::Cache(format!("embedding request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CartwheelError::Cache(format!(
                "embedding endpoint returned {status}: {body}"
            )));
        }

        let parsed: EmbeddingsResponse = response
            .json()
            .await
            .map_err(|e| CartwheelError::Cache(format!("unparseable embeddings body: {e}")))?;

        let mut out = vec![Vec::new(); texts.len()];
        for entry in parsed.data {
            if entry.index < out.len() {
                out[entry.index] = entry.embedding;
            }
        }
        if out.iter().any(|v| v.is_empty()) {
            return Err(CartwheelError::Cache(
                "embedding endpoint returned fewer vectors than inputs".into(),
            ));
        }
        Ok(out)
    }
}

// --- Hashing embedder ---

const HASH_DIMS: usize = 256;
const PREFIX_LEN: usize = 5;
const PREFIX_WEIGHT: f32 = 0.5;

/// Deterministic token-feature hashing into a fixed space. Near-duplicate
/// queries (reordered words, plural forms, small additions) land close in
/// cosine space; unrelated queries stay far apart. No model behind it, so it
/// is the default when no embedding provider is configured.
pub struct HashEmbedder;

impl HashEmbedder {
    fn bucket(feature: &str) -> usize {
        let digest = Sha256::digest(feature.as_bytes());
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&digest[..8]);
        (u64::from_be_bytes(raw) % HASH_DIMS as u64) as usize
    }

    fn embed_one(text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; HASH_DIMS];
        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let token = token.to_lowercase();
            vector[Self::bucket(&token)] += 1.0;
            // A word-prefix feature keeps morphological variants close
            // (speaker / speakers).
            if token.len() > PREFIX_LEN {
                let prefix: String = token.chars().take(PREFIX_LEN).collect();
                vector[Self::bucket(&prefix)] += PREFIX_WEIGHT;
            }
        }
        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }
        vector
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    fn id(&self) -> &str {
        "hashing"
    }

    fn dimensions(&self) -> usize {
        HASH_DIMS
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| Self::embed_one(t)).collect())
    }
}
