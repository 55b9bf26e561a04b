//! Scraping integrations: a selector schema applied to server-rendered HTML.
//!
//! Pages that hide products behind client-side rendering or a bot wall are
//! retried through an escalation chain: plain fetch, then a rendered DOM,
//! then the bypass proxy. Each step runs only when the previous one produced
//! nothing extractable.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

use cartwheel_core::config::SiteConfig;
use cartwheel_core::error::{CartwheelError, Result};
use cartwheel_core::product_code::ProductCodec;
use cartwheel_core::types::{ProductDetail, SearchResult};

use crate::fetch::PageFetcher;
use crate::integration::{Integration, IntegrationKind, ListQuery, url_belongs_to};
use crate::schema::{self, RawListing, SelectorSchema, parse_price, urlencode};

pub struct ScrapeSite {
    name: String,
    base_url: String,
    base: Url,
    search_url: Option<String>,
    url_patterns: Vec<String>,
    schema: SelectorSchema,
    fetcher: Arc<PageFetcher>,
    codec: Arc<ProductCodec>,
}

impl ScrapeSite {
    pub fn new(
        site: &SiteConfig,
        schema: SelectorSchema,
        fetcher: Arc<PageFetcher>,
        codec: Arc<ProductCodec>,
    ) -> Result<Self> {
        let base = Url::parse(&site.base_url).map_err(|e| {
            CartwheelError::Config(format!("site '{}': bad base_url: {e}", site.name))
        })?;
        Ok(Self {
            name: site.name.clone(),
            base_url: site.base_url.clone(),
            base,
            search_url: site.search_url.clone(),
            url_patterns: site.url_patterns.clone(),
            schema,
            fetcher,
            codec,
        })
    }

    /// Run the fetch escalation chain until `extract` finds something.
    ///
    /// `Ok(None)` means at least one fetch succeeded but no step matched the
    /// selectors. When every fetch failed the last fetch error is returned,
    /// keeping its transient/permanent classification for the retry layer.
    async fn fetch_chain<T>(
        &self,
        url: &str,
        extract: impl Fn(&str) -> Result<Option<T>>,
    ) -> Result<Option<T>> {
        let mut fetched_any = false;
        let mut last_err: Option<CartwheelError> = None;

        match self.fetcher.fetch_html(&self.name, url).await {
            Ok(html) => {
                fetched_any = true;
                if let Some(found) = extract(&html)? {
                    return Ok(Some(found));
                }
                debug!(site = %self.name, url, "plain fetch matched nothing, rendering");
            }
            Err(e) => {
                debug!(site = %self.name, url, error = %e, "plain fetch failed");
                last_err = Some(e);
            }
        }

        match self.fetcher.fetch_rendered(&self.name, url).await {
            Ok(html) => {
                fetched_any = true;
                if let Some(found) = extract(&html)? {
                    return Ok(Some(found));
                }
            }
            // Renderer errors are not recorded as the chain outcome: a build
            // without the browser feature reports a permanent error here and
            // must not mask a transient network failure from the plain fetch.
            Err(e) => debug!(site = %self.name, url, error = %e, "rendered fetch failed"),
        }

        if self.fetcher.has_proxy() {
            match self.fetcher.fetch_via_proxy(&self.name, url).await {
                Ok(html) => {
                    fetched_any = true;
                    if let Some(found) = extract(&html)? {
                        return Ok(Some(found));
                    }
                }
                Err(e) => {
                    debug!(site = %self.name, url, error = %e, "proxy fetch failed");
                    last_err = Some(e);
                }
            }
        }

        if fetched_any {
            Ok(None)
        } else {
            Err(last_err.unwrap_or_else(|| CartwheelError::Integration {
                integration: self.name.clone(),
                message: "no fetch path available".into(),
            }))
        }
    }

    fn listings_from_html(&self, html: &str, limit: usize) -> Result<Option<Vec<SearchResult>>> {
        let raw = schema::extract_list(html, &self.schema.list, &self.base)?;
        let results: Vec<SearchResult> = raw
            .into_iter()
            .filter_map(|r| self.listing_to_result(r))
            .take(limit)
            .collect();
        Ok((!results.is_empty()).then_some(results))
    }

    fn listing_to_result(&self, raw: RawListing) -> Option<SearchResult> {
        let current_price = parse_price(&raw.price_text)?;
        let product_id = self.codec.encode(&raw.url).ok()?;
        Some(SearchResult {
            product_id,
            name: raw.name,
            brand: raw.brand,
            category: None,
            url: raw.url,
            image: raw.image,
            current_price,
            original_price: raw.original_price_text.as_deref().and_then(parse_price),
            rating: raw.rating_text.as_deref().and_then(parse_price),
            source: self.name.clone(),
            relevance_score: None,
        })
    }
}

#[async_trait]
impl Integration for ScrapeSite {
    fn name(&self) -> &str {
        &self.name
    }

    fn base_url(&self) -> &str {
        &self.base_url
    }

    fn kind(&self) -> IntegrationKind {
        IntegrationKind::Scraping
    }

    fn matches_url(&self, url: &str) -> bool {
        url_belongs_to(&self.base_url, &self.url_patterns, url)
    }

    async fn product_list(
        &self,
        _ctx: &CancellationToken,
        query: &ListQuery,
    ) -> Result<Vec<SearchResult>> {
        let Some(template) = &self.search_url else {
            return Err(CartwheelError::Integration {
                integration: self.name.clone(),
                message: "no search endpoint configured".into(),
            });
        };
        let url = template
            .replace("{query}", &urlencode(&query.query))
            .replace("{page}", &query.page.to_string())
            .replace("{limit}", &query.limit.to_string());

        let found = self
            .fetch_chain(&url, |html| self.listings_from_html(html, query.limit))
            .await?;
        Ok(found.unwrap_or_default())
    }

    async fn product_detail(
        &self,
        _ctx: &CancellationToken,
        url: &str,
        product_id: &str,
    ) -> Result<ProductDetail> {
        let Some(detail_schema) = &self.schema.detail else {
            return Err(CartwheelError::Integration {
                integration: self.name.clone(),
                message: "no detail selectors configured".into(),
            });
        };
        let raw = self
            .fetch_chain(url, |html| schema::extract_detail(html, detail_schema, &self.base))
            .await?
            .ok_or_else(|| CartwheelError::Integration {
                integration: self.name.clone(),
                message: "product page did not match detail selectors".into(),
            })?;
        let current_price =
            parse_price(&raw.price_text).ok_or_else(|| CartwheelError::Integration {
                integration: self.name.clone(),
                message: format!("unparsable price '{}'", raw.price_text),
            })?;
        Ok(ProductDetail {
            product_id: product_id.to_string(),
            name: raw.name,
            brand: raw.brand,
            category: None,
            url: url.to_string(),
            images: raw.images,
            current_price,
            original_price: raw.original_price_text.as_deref().and_then(parse_price),
            rating: None,
            description: raw.description,
            specifications: raw.specs,
            source: self.name.clone(),
            fetched_at: Utc::now(),
        })
    }
}
