//! Parallel e-commerce search.
//!
//! An engine fans a query out to configured site integrations: api/graphql
//! sites are queried directly, scraping and LLM-extraction sites go through
//! web-search URL discovery first. Results are merged, deduplicated by
//! product code, reranked, and capped. The engine owns the per-call policy
//! (timeouts, transient retries, cancellation) and sits behind the two-tier
//! result cache.

pub mod engine;
pub mod fetch;
pub mod integration;
pub mod rerank;
pub mod retry;
pub mod schema;
pub mod sites;
pub mod websearch;

#[cfg(feature = "browser")]
pub mod browser;

pub use engine::{SearchEngine, SearchRequest};
pub use integration::{Integration, IntegrationKind, ListQuery, SiteRegistry};
pub use rerank::Reranker;
pub use websearch::{WebHit, WebSearchClient};
