//! Structured-output contracts for the routing and planning prompts.
//!
//! Each LLM call that must be machine-readable pairs a deserialization type
//! here with a JSON schema handed to the provider. The schemas keep the
//! model honest; the `#[serde(default)]` fields keep us tolerant of models
//! that omit optional keys anyway.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use cartwheel_core::state::Requirements;
use cartwheel_core::types::SortBy;

/// Routing verdicts shared by the triage and followup prompts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RouteAction {
    #[serde(rename = "__user__")]
    AskUser,
    #[serde(rename = "__stop__")]
    Stop,
    #[default]
    #[serde(rename = "pass")]
    Pass,
}

/// Triage output: route plus whatever payload the route needs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetaDecision {
    #[serde(default)]
    pub action: RouteAction,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub requirements: Option<Requirements>,
}

/// Search plan produced from the conversation so far.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannerResult {
    pub product_query: String,
    #[serde(default)]
    pub filter: Option<String>,
    #[serde(default = "default_n_k")]
    pub n_k: usize,
    #[serde(default)]
    pub description: Option<String>,
}

fn default_n_k() -> usize {
    10
}

/// Followup routing over an ongoing results conversation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FollowupDecision {
    #[serde(default)]
    pub action: RouteAction,
    #[serde(default)]
    pub content: Option<String>,
}

/// Web search plan for the web and insights pipelines.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebQueryPlan {
    pub query: String,
    #[serde(default)]
    pub include_images: bool,
}

/// Constraints extracted from a filter request, applied client-side over
/// the products already on screen.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FilterPlan {
    #[serde(default)]
    pub brand: Option<String>,
    #[serde(default)]
    pub min_price: Option<f64>,
    #[serde(default)]
    pub max_price: Option<f64>,
    #[serde(default)]
    pub min_rating: Option<f64>,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub sort: Option<SortBy>,
}

pub fn meta_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "action": { "type": "string", "enum": ["pass", "__user__", "__stop__"] },
            "content": { "type": ["string", "null"] },
            "requirements": {
                "type": ["object", "null"],
                "properties": {
                    "category": { "type": ["string", "null"] },
                    "brand": { "type": ["string", "null"] },
                    "budget": { "type": ["number", "null"] },
                    "features": { "type": "array", "items": { "type": "string" } }
                }
            }
        },
        "required": ["action"]
    })
}

pub fn planner_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "product_query": { "type": "string" },
            "filter": { "type": ["string", "null"] },
            "n_k": { "type": "integer", "minimum": 1, "maximum": 20 },
            "description": { "type": ["string", "null"] }
        },
        "required": ["product_query"]
    })
}

pub fn followup_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "action": { "type": "string", "enum": ["pass", "__user__", "__stop__"] },
            "content": { "type": ["string", "null"] }
        },
        "required": ["action"]
    })
}

pub fn web_query_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "query": { "type": "string" },
            "include_images": { "type": "boolean" }
        },
        "required": ["query"]
    })
}

pub fn filter_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "brand": { "type": ["string", "null"] },
            "min_price": { "type": ["number", "null"] },
            "max_price": { "type": ["number", "null"] },
            "min_rating": { "type": ["number", "null"] },
            "keywords": { "type": "array", "items": { "type": "string" } },
            "sort": {
                "type": ["string", "null"],
                "enum": ["price_asc", "price_desc", "rating", null]
            }
        },
        "required": []
    })
}
