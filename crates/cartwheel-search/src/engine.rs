//! The parallel search engine.
//!
//! One search fans out to every selected integration at once, bounded by a
//! global concurrency limit. Direct (api/graphql) sites answer the query
//! themselves; scraping classes go through web-search URL discovery first.
//! Failed integrations are dropped from the merge, never surfaced to the
//! caller: a search only fails as a whole on cancellation.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use cartwheel_cache::{DetailCache, SemanticListCache};
use cartwheel_core::config::{RetryConfig, SearchConfig};
use cartwheel_core::error::{CartwheelError, Result};
use cartwheel_core::product_code::ProductCodec;
use cartwheel_core::types::{OptimizationMode, ProductDetail, SearchResult, SortBy};

use crate::integration::{Integration, ListQuery, SiteRegistry, host_of};
use crate::rerank::Reranker;
use crate::retry::with_retry;
use crate::websearch::WebSearchClient;

/// One search, as requested by an agent or a filter re-run.
#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub query: String,
    pub mode: OptimizationMode,
    /// Restrict the fan-out to these integration names.
    pub site_filter: Option<Vec<String>>,
    pub page: u32,
    pub sort: SortBy,
    pub bypass_cache: bool,
}

impl SearchRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            mode: OptimizationMode::default(),
            site_filter: None,
            page: 1,
            sort: SortBy::default(),
            bypass_cache: false,
        }
    }
}

pub struct SearchEngine {
    registry: SiteRegistry,
    websearch: Option<WebSearchClient>,
    list_cache: Arc<SemanticListCache>,
    detail_cache: Arc<DetailCache>,
    reranker: Reranker,
    codec: Arc<ProductCodec>,
    limiter: Arc<Semaphore>,
    retry: RetryConfig,
    list_timeout: Duration,
    detail_timeout: Duration,
    max_results: usize,
}

impl SearchEngine {
    pub fn new(
        config: &SearchConfig,
        registry: SiteRegistry,
        websearch: Option<WebSearchClient>,
        list_cache: Arc<SemanticListCache>,
        detail_cache: Arc<DetailCache>,
        reranker: Reranker,
        codec: Arc<ProductCodec>,
    ) -> Self {
        Self {
            registry,
            websearch,
            list_cache,
            detail_cache,
            reranker,
            codec,
            limiter: Arc::new(Semaphore::new(config.concurrency.max(1))),
            retry: config.retry.clone().unwrap_or_default(),
            list_timeout: Duration::from_secs(config.list_timeout_secs),
            detail_timeout: Duration::from_secs(config.detail_timeout_secs),
            max_results: config.max_results,
        }
    }

    pub fn registry(&self) -> &SiteRegistry {
        &self.registry
    }

    /// Search all selected integrations, merge, rerank, truncate.
    ///
    /// Only the canonical first page without a site filter goes through the
    /// list cache; filtered and paginated variants always hit the sites.
    pub async fn search(
        &self,
        ctx: &CancellationToken,
        request: &SearchRequest,
    ) -> Result<Vec<SearchResult>> {
        let cacheable = request.page <= 1 && request.site_filter.is_none();
        if !cacheable {
            return self.search_uncached(ctx, request).await;
        }
        self.list_cache
            .get_or_produce(&request.query, request.bypass_cache, || async move {
                self.search_uncached(ctx, request).await
            })
            .await
    }

    async fn search_uncached(
        &self,
        ctx: &CancellationToken,
        request: &SearchRequest,
    ) -> Result<Vec<SearchResult>> {
        if ctx.is_cancelled() {
            return Err(CartwheelError::Cancelled);
        }
        let sites = self.registry.filtered(request.site_filter.as_deref());
        if sites.is_empty() {
            warn!(query = %request.query, "no integrations selected");
            return Ok(Vec::new());
        }
        let (direct, discovered): (Vec<_>, Vec<_>) =
            sites.into_iter().partition(|s| s.kind().is_direct());
        debug!(
            query = %request.query,
            direct = direct.len(),
            discovered = discovered.len(),
            "search fan-out"
        );

        let list_query = ListQuery {
            query: request.query.clone(),
            page: request.page,
            limit: self.max_results,
            sort: request.sort,
            bypass_cache: request.bypass_cache,
        };
        let quota = per_site_quota(self.max_results, discovered.len());

        let list_query = &list_query;
        let direct_calls = join_all(direct.iter().map(|site| async move {
            (
                site.name().to_string(),
                self.call_list(ctx, site, list_query).await,
            )
        }));
        let discovered_calls = join_all(discovered.iter().map(|site| async move {
            (
                site.name().to_string(),
                self.discover_and_fetch(ctx, site, list_query, quota).await,
            )
        }));
        let (direct_outcomes, discovered_outcomes) = tokio::join!(direct_calls, discovered_calls);

        let mut merged: Vec<SearchResult> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        let mut failures = 0usize;
        for (site_name, outcome) in direct_outcomes.into_iter().chain(discovered_outcomes) {
            match outcome {
                Ok(results) => {
                    for r in results {
                        if !r.is_mergeable() {
                            debug!(site = %site_name, source = %r.source, "dropping failure sentinel");
                            continue;
                        }
                        if seen.insert(r.product_id.clone()) {
                            merged.push(r);
                        }
                    }
                }
                Err(CartwheelError::Cancelled) => return Err(CartwheelError::Cancelled),
                Err(e) => {
                    failures += 1;
                    warn!(site = %site_name, error = %e, "integration failed, dropped from merge");
                }
            }
        }

        if merged.is_empty() {
            info!(query = %request.query, failures, "search produced no results");
            return Ok(Vec::new());
        }

        let mut ranked = self.reranker.rank(&request.query, merged, request.mode).await;
        ranked.truncate(self.max_results);
        Ok(ranked)
    }

    /// Detail fetch for one `product_id`, routed to the integration that
    /// owns the decoded URL, through the detail cache.
    pub async fn product_detail(
        &self,
        ctx: &CancellationToken,
        product_id: &str,
        bypass_cache: bool,
    ) -> Result<ProductDetail> {
        let url = self.codec.decode(product_id)?;
        let site = self.registry.route(&url).ok_or_else(|| {
            CartwheelError::Validation(format!("no integration claims url '{url}'"))
        })?;
        self.detail_cache
            .get_or_fetch(product_id, bypass_cache, || async move {
                let _permit = self.acquire_slot().await?;
                let site = &site;
                let url = url.as_str();
                with_retry(ctx, &self.retry, site.name(), || async move {
                    match timeout(self.detail_timeout, site.product_detail(ctx, url, product_id))
                        .await
                    {
                        Ok(result) => result,
                        Err(_) => Err(CartwheelError::IntegrationUnavailable {
                            integration: site.name().to_string(),
                            message: format!("detail call exceeded {:?}", self.detail_timeout),
                        }),
                    }
                })
                .await
            })
            .await
    }

    async fn call_list(
        &self,
        ctx: &CancellationToken,
        site: &Arc<dyn Integration>,
        query: &ListQuery,
    ) -> Result<Vec<SearchResult>> {
        let _permit = self.acquire_slot().await?;
        with_retry(ctx, &self.retry, site.name(), || async move {
            match timeout(self.list_timeout, site.product_list(ctx, query)).await {
                Ok(result) => result,
                Err(_) => Err(CartwheelError::IntegrationUnavailable {
                    integration: site.name().to_string(),
                    message: format!("list call exceeded {:?}", self.list_timeout),
                }),
            }
        })
        .await
    }

    /// Web-search URL discovery for scraping classes: a `site:` query finds
    /// product pages, each claimed page is fetched as a detail and folded
    /// into a listing, up to the per-site quota. Without a discovery backend
    /// the site's own list endpoint is the fallback.
    async fn discover_and_fetch(
        &self,
        ctx: &CancellationToken,
        site: &Arc<dyn Integration>,
        query: &ListQuery,
        quota: usize,
    ) -> Result<Vec<SearchResult>> {
        let Some(websearch) = &self.websearch else {
            return self.call_list(ctx, site, query).await;
        };
        let host = host_of(site.base_url());
        let hits = websearch.search(&query.query, host.as_deref()).await?;
        debug!(site = site.name(), hits = hits.len(), quota, "discovery hits");

        let mut out = Vec::new();
        for hit in hits {
            if out.len() >= quota {
                break;
            }
            if ctx.is_cancelled() {
                return Err(CartwheelError::Cancelled);
            }
            if !site.matches_url(&hit.url) {
                continue;
            }
            match self.fetch_discovered(ctx, site, &hit.url).await {
                Ok(result) => out.push(result),
                Err(e) => {
                    debug!(site = site.name(), url = %hit.url, error = %e, "discovered url failed")
                }
            }
        }
        Ok(out)
    }

    async fn fetch_discovered(
        &self,
        ctx: &CancellationToken,
        site: &Arc<dyn Integration>,
        url: &str,
    ) -> Result<SearchResult> {
        let product_id = self.codec.encode(url)?;
        let _permit = self.acquire_slot().await?;
        let code = product_id.as_str();
        let detail = with_retry(ctx, &self.retry, site.name(), || async move {
            match timeout(self.detail_timeout, site.product_detail(ctx, url, code)).await {
                Ok(result) => result,
                Err(_) => Err(CartwheelError::IntegrationUnavailable {
                    integration: site.name().to_string(),
                    message: format!("detail call exceeded {:?}", self.detail_timeout),
                }),
            }
        })
        .await?;
        Ok(listing_of(detail))
    }

    async fn acquire_slot(&self) -> Result<tokio::sync::SemaphorePermit<'_>> {
        self.limiter
            .acquire()
            .await
            .map_err(|_| CartwheelError::Cancelled)
    }
}

/// Discovery budget per scraping-class site.
fn per_site_quota(max_results: usize, sites: usize) -> usize {
    if sites == 0 {
        return 0;
    }
    (max_results / sites).max(1)
}

/// Fold a detail record into list form; the first image becomes the card
/// image.
fn listing_of(detail: ProductDetail) -> SearchResult {
    SearchResult {
        product_id: detail.product_id,
        name: detail.name,
        brand: detail.brand,
        category: detail.category,
        url: detail.url,
        image: detail.images.into_iter().next(),
        current_price: detail.current_price,
        original_price: detail.original_price,
        rating: detail.rating,
        source: detail.source,
        relevance_score: None,
    }
}
