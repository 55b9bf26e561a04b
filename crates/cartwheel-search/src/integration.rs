//! Integration contract and site registry.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use url::Url;

use cartwheel_core::error::Result;
use cartwheel_core::types::{ProductDetail, SearchResult, SortBy};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntegrationKind {
    Api,
    Graphql,
    Scraping,
    LlmExtraction,
}

impl IntegrationKind {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "api" => Some(Self::Api),
            "graphql" => Some(Self::Graphql),
            "scraping" => Some(Self::Scraping),
            "llm_extraction" => Some(Self::LlmExtraction),
            _ => None,
        }
    }

    /// Direct integrations answer a typed query themselves; the rest go
    /// through web-search URL discovery.
    pub fn is_direct(&self) -> bool {
        matches!(self, Self::Api | Self::Graphql)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Api => "api",
            Self::Graphql => "graphql",
            Self::Scraping => "scraping",
            Self::LlmExtraction => "llm_extraction",
        }
    }
}

/// Parameters of a product-list call.
#[derive(Debug, Clone)]
pub struct ListQuery {
    pub query: String,
    pub page: u32,
    pub limit: usize,
    pub sort: SortBy,
    pub bypass_cache: bool,
}

impl ListQuery {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            page: 1,
            limit: 20,
            sort: SortBy::default(),
            bypass_cache: false,
        }
    }
}

/// One product source. Implementations live in [`crate::sites`].
#[async_trait]
pub trait Integration: Send + Sync {
    fn name(&self) -> &str;
    fn base_url(&self) -> &str;
    fn kind(&self) -> IntegrationKind;

    /// Whether `url` belongs to this site.
    fn matches_url(&self, url: &str) -> bool;

    async fn product_list(
        &self,
        ctx: &CancellationToken,
        query: &ListQuery,
    ) -> Result<Vec<SearchResult>>;

    async fn product_detail(
        &self,
        ctx: &CancellationToken,
        url: &str,
        product_id: &str,
    ) -> Result<ProductDetail>;
}

/// Host-based URL ownership shared by the site implementations: a URL
/// belongs to a site when its host equals, or is a subdomain of, the site's
/// host (ignoring a `www.` prefix on either side), or when it contains one
/// of the site's extra patterns.
pub fn url_belongs_to(base_url: &str, patterns: &[String], candidate: &str) -> bool {
    if let (Some(site_host), Some(host)) = (host_of(base_url), host_of(candidate)) {
        let site = site_host.trim_start_matches("www.");
        let host = host.trim_start_matches("www.");
        if host == site || host.ends_with(&format!(".{site}")) {
            return true;
        }
    }
    patterns.iter().any(|p| candidate.contains(p.as_str()))
}

pub(crate) fn host_of(url: &str) -> Option<String> {
    Url::parse(url)
        .ok()?
        .host_str()
        .map(|h| h.to_lowercase())
}

/// All configured integrations, in configuration order.
pub struct SiteRegistry {
    integrations: Vec<Arc<dyn Integration>>,
}

impl SiteRegistry {
    pub fn new(integrations: Vec<Arc<dyn Integration>>) -> Self {
        Self { integrations }
    }

    pub fn all(&self) -> &[Arc<dyn Integration>] {
        &self.integrations
    }

    pub fn len(&self) -> usize {
        self.integrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.integrations.is_empty()
    }

    /// Integrations selected by an optional list of site names
    /// (case-insensitive). No filter selects all.
    pub fn filtered(&self, site_filter: Option<&[String]>) -> Vec<Arc<dyn Integration>> {
        match site_filter {
            None => self.integrations.clone(),
            Some(names) => self
                .integrations
                .iter()
                .filter(|i| names.iter().any(|n| n.eq_ignore_ascii_case(i.name())))
                .cloned()
                .collect(),
        }
    }

    /// First integration that claims `url`.
    pub fn route(&self, url: &str) -> Option<Arc<dyn Integration>> {
        self.integrations
            .iter()
            .find(|i| i.matches_url(url))
            .cloned()
    }
}
