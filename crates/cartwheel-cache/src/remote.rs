//! Vector-service backend for the list cache.
//!
//! Speaks a small JSON API: points are upserted with their embedding and a
//! JSON payload, queried by vector with a score threshold, and expired
//! server-side. Every failure surfaces as a cache error, which the facade
//! downgrades to a miss.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use cartwheel_core::config::CacheConfig;
use cartwheel_core::error::{CartwheelError, Result};
use cartwheel_core::types::SearchResult;

use crate::semantic::{ListCacheBackend, ListEntry};

const COLLECTION: &str = "product_lists";

#[derive(Debug)]
pub struct RemoteListBackend {
    base_url: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl RemoteListBackend {
    pub fn from_config(config: &CacheConfig) -> Result<Self> {
        let base_url = config.remote_url.clone().ok_or_else(|| {
            CartwheelError::Config("cache.backend = \"remote\" requires cache.remote_url".into())
        })?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: config.resolve_remote_key(),
            client: reqwest::Client::new(),
        })
    }

    async fn post<B, R>(&self, path: &str, body: &B) -> Result<R>
    where
        B: Serialize + Sync,
        R: for<'de> Deserialize<'de>,
    {
        let mut req = self
            .client
            .post(format!("{}{path}", self.base_url))
            .json(body);
        if let Some(key) = &self.api_key {
            req = req.header("authorization", format!("Bearer {key}"));
        }
        let response = req
            .send()
            .await
            .map_err(|e| CartwheelError::Cache(format!("vector service unreachable: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            return Err(CartwheelError::Cache(format!(
                "vector service returned {status}"
            )));
        }
        response
            .json()
            .await
            .map_err(|e| CartwheelError::Cache(format!("unparseable vector service reply: {e}")))
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct PointPayload {
    origin_query: String,
    results: Vec<SearchResult>,
}

#[derive(Debug, Deserialize)]
struct QueryReply {
    matches: Vec<PointMatch>,
}

#[derive(Debug, Deserialize)]
struct PointMatch {
    key: String,
    score: f32,
    payload: PointPayload,
}

#[derive(Debug, Deserialize)]
struct SweepReply {
    removed: usize,
}

#[derive(Debug, Deserialize)]
struct Ack {}

#[async_trait]
impl ListCacheBackend for RemoteListBackend {
    async fn add(&self, entry: ListEntry) -> Result<()> {
        let _: Ack = self
            .post(
                &format!("/collections/{COLLECTION}/points"),
                &json!({
                    "key": entry.normalized,
                    "vector": entry.embedding,
                    "ttl_secs": entry.ttl.as_secs(),
                    "payload": PointPayload {
                        origin_query: entry.origin_query,
                        results: entry.value,
                    },
                }),
            )
            .await?;
        Ok(())
    }

    async fn query(
        &self,
        normalized: &str,
        embedding: &[f32],
        threshold: f32,
    ) -> Result<Option<Vec<SearchResult>>> {
        let reply: QueryReply = self
            .post(
                &format!("/collections/{COLLECTION}/query"),
                &json!({
                    "key": normalized,
                    "vector": embedding,
                    "threshold": threshold,
                    "limit": 1,
                }),
            )
            .await?;
        Ok(reply.matches.into_iter().next().map(|point| {
            debug!(key = %point.key, score = point.score, "Remote list cache hit");
            point.payload.results
        }))
    }

    async fn delete(&self, normalized: &str) -> Result<()> {
        let _: Ack = self
            .post(
                &format!("/collections/{COLLECTION}/delete"),
                &json!({ "key": normalized }),
            )
            .await?;
        Ok(())
    }

    async fn sweep_expired(&self) -> Result<usize> {
        let reply: SweepReply = self
            .post(&format!("/collections/{COLLECTION}/sweep"), &json!({}))
            .await?;
        Ok(reply.removed)
    }
}
