use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Subscription tier of an authenticated user.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    #[default]
    Free,
    Pro,
}

/// Authenticated identity attached to a connection for its whole life.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Principal {
    pub user_id: String,
    pub email: String,
    #[serde(default)]
    pub tier: Tier,
    #[serde(default)]
    pub credits_balance: i64,
}

/// Reranker / engine effort level, chosen per request by the client.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptimizationMode {
    Fast,
    #[default]
    Balanced,
    Quality,
}

/// Which conversation pipeline a request targets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FocusMode {
    #[default]
    Copilot,
    Web,
    Insights,
}

/// Result ordering requested from an integration's list endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortBy {
    #[default]
    Relevance,
    PriceAsc,
    PriceDesc,
    Rating,
}

/// Sentinel `source` values marking results that must be dropped from a merge.
pub const SOURCE_ERROR: &str = "error";
pub const SOURCE_UNSUPPORTED: &str = "unsupported";
pub const SOURCE_FAILED_EXTRACTION: &str = "failed_extraction";

/// One product as returned by an integration and shipped to the client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResult {
    /// Reversible short code of the canonical product URL.
    pub product_id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub brand: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    pub current_price: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_price: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rating: Option<f64>,
    /// Integration name, or one of the failure sentinels.
    pub source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub relevance_score: Option<f64>,
}

impl SearchResult {
    /// Whether this entry survives the cross-source merge.
    pub fn is_mergeable(&self) -> bool {
        !matches!(
            self.source.as_str(),
            SOURCE_ERROR | SOURCE_UNSUPPORTED | SOURCE_FAILED_EXTRACTION
        )
    }
}

/// Full product record from an integration's detail path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProductDetail {
    pub product_id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub brand: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    pub url: String,
    #[serde(default)]
    pub images: Vec<String>,
    pub current_price: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_price: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rating: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub specifications: BTreeMap<String, String>,
    pub source: String,
    pub fetched_at: DateTime<Utc>,
}
