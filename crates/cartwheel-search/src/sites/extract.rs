//! LLM-extraction integrations, for shops with no API and no stable markup.
//!
//! The page is flattened to markdown-ish text and a model pulls the offers
//! out against a strict JSON schema. Model output is treated as hostile:
//! only items carrying name, price, image and url are accepted, everything
//! else is dropped rather than patched up.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

use cartwheel_core::config::SiteConfig;
use cartwheel_core::error::{CartwheelError, Result};
use cartwheel_core::product_code::ProductCodec;
use cartwheel_core::types::{ProductDetail, SearchResult};
use cartwheel_providers::{ChatMessage, InvokeRequest, LlmProvider};

use crate::fetch::PageFetcher;
use crate::integration::{Integration, IntegrationKind, ListQuery, url_belongs_to};
use crate::schema::{absolutize, html_to_markdown, parse_price, urlencode};

/// Cap on the flattened page text handed to the model.
const PAGE_TEXT_CAP: usize = 8_000;

const SYSTEM_PROMPT: &str = "You extract product offers from the text of an \
e-commerce page. Reply with JSON only, matching the given schema exactly. \
Copy values from the page; never invent a name, price, image or url. Omit \
any product for which one of those four is not on the page. Prices are \
plain numbers in the page's currency.";

pub struct LlmExtractionSite {
    name: String,
    base_url: String,
    base: Url,
    search_url: Option<String>,
    url_patterns: Vec<String>,
    fetcher: Arc<PageFetcher>,
    provider: Arc<dyn LlmProvider>,
    codec: Arc<ProductCodec>,
}

impl LlmExtractionSite {
    pub fn new(
        site: &SiteConfig,
        fetcher: Arc<PageFetcher>,
        provider: Arc<dyn LlmProvider>,
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
            fetcher,
            provider,
            codec,
        })
    }

    async fn page_text(&self, url: &str) -> Result<String> {
        let html = self.fetcher.fetch_html(&self.name, url).await?;
        let text = html_to_markdown(&html, &self.base, PAGE_TEXT_CAP);
        if text.is_empty() {
            return Err(CartwheelError::Integration {
                integration: self.name.clone(),
                message: "page flattened to nothing".into(),
            });
        }
        Ok(text)
    }

    async fn extract_products(
        &self,
        page_text: &str,
        query: Option<&str>,
    ) -> Result<Vec<ExtractedProduct>> {
        let mut user = format!("Page from {}:\n\n{page_text}", self.base_url);
        if let Some(query) = query {
            user = format!("Shopping query: {query}\n\n{user}");
        }
        let request = InvokeRequest::new(format!("extract:{}", self.name), SYSTEM_PROMPT)
            .with_schema(list_schema())
            .with_messages(vec![ChatMessage::user(user)]);
        let invocation = self.provider.invoke(&request).await?;
        let list: ExtractedList = invocation.parse()?;
        debug!(site = %self.name, raw = list.products.len(), "model extraction parsed");
        Ok(list.products)
    }

    /// The acceptance gate: an item without all of name, price, image and
    /// url is discarded.
    fn accept(&self, product: ExtractedProduct) -> Option<SearchResult> {
        let name = product.name.filter(|s| !s.trim().is_empty())?;
        let current_price = product.current_price.as_ref().and_then(price_of)?;
        let image = product.image.filter(|s| !s.trim().is_empty())?;
        let raw_url = product.url.filter(|s| !s.trim().is_empty())?;
        let url = absolutize(&self.base, &raw_url);
        let product_id = self.codec.encode(&url).ok()?;
        Some(SearchResult {
            product_id,
            name,
            brand: product.brand,
            category: None,
            image: Some(absolutize(&self.base, &image)),
            url,
            current_price,
            original_price: product.original_price.as_ref().and_then(price_of),
            rating: None,
            source: self.name.clone(),
            relevance_score: None,
        })
    }
}

#[async_trait]
impl Integration for LlmExtractionSite {
    fn name(&self) -> &str {
        &self.name
    }

    fn base_url(&self) -> &str {
        &self.base_url
    }

    fn kind(&self) -> IntegrationKind {
        IntegrationKind::LlmExtraction
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

        let text = self.page_text(&url).await?;
        let products = self.extract_products(&text, Some(&query.query)).await?;
        let results: Vec<SearchResult> = products
            .into_iter()
            .filter_map(|p| self.accept(p))
            .take(query.limit)
            .collect();
        debug!(site = %self.name, count = results.len(), "extraction accepted");
        Ok(results)
    }

    async fn product_detail(
        &self,
        _ctx: &CancellationToken,
        url: &str,
        product_id: &str,
    ) -> Result<ProductDetail> {
        let text = self.page_text(url).await?;
        let request = InvokeRequest::new(format!("extract:{}", self.name), SYSTEM_PROMPT)
            .with_schema(detail_schema())
            .with_messages(vec![ChatMessage::user(format!(
                "Product page from {}:\n\n{text}",
                self.base_url
            ))]);
        let invocation = self.provider.invoke(&request).await?;
        let detail: ExtractedDetail = invocation.parse()?;

        let name = detail
            .name
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| extraction_failed(&self.name, "name"))?;
        let current_price = detail
            .current_price
            .as_ref()
            .and_then(price_of)
            .ok_or_else(|| extraction_failed(&self.name, "price"))?;

        Ok(ProductDetail {
            product_id: product_id.to_string(),
            name,
            brand: detail.brand,
            category: None,
            url: url.to_string(),
            images: detail
                .images
                .into_iter()
                .map(|i| absolutize(&self.base, &i))
                .collect(),
            current_price,
            original_price: detail.original_price.as_ref().and_then(price_of),
            rating: None,
            description: detail.description,
            specifications: detail.specifications,
            source: self.name.clone(),
            fetched_at: Utc::now(),
        })
    }
}

fn extraction_failed(site: &str, field: &str) -> CartwheelError {
    CartwheelError::Integration {
        integration: site.to_string(),
        message: format!("extraction did not yield a {field}"),
    }
}

/// Prices come back as numbers or as page-formatted strings.
fn price_of(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => parse_price(s),
        _ => None,
    }
}

#[derive(Debug, Deserialize)]
struct ExtractedList {
    #[serde(default)]
    products: Vec<ExtractedProduct>,
}

#[derive(Debug, Deserialize)]
struct ExtractedProduct {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    current_price: Option<Value>,
    #[serde(default)]
    image: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    brand: Option<String>,
    #[serde(default)]
    original_price: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct ExtractedDetail {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    current_price: Option<Value>,
    #[serde(default)]
    images: Vec<String>,
    #[serde(default)]
    brand: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    original_price: Option<Value>,
    #[serde(default)]
    specifications: BTreeMap<String, String>,
}

fn list_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "products": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "name": { "type": "string" },
                        "current_price": { "type": "number" },
                        "image": { "type": "string" },
                        "url": { "type": "string" },
                        "brand": { "type": "string" },
                        "original_price": { "type": "number" }
                    },
                    "required": ["name", "current_price", "image", "url"]
                }
            }
        },
        "required": ["products"]
    })
}

fn detail_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "name": { "type": "string" },
            "current_price": { "type": "number" },
            "images": { "type": "array", "items": { "type": "string" } },
            "brand": { "type": "string" },
            "description": { "type": "string" },
            "original_price": { "type": "number" },
            "specifications": { "type": "object" }
        },
        "required": ["name", "current_price"]
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use cartwheel_core::config::SearchConfig;
    use cartwheel_providers::{Invocation, Usage};

    struct CannedProvider {
        reply: String,
    }

    #[async_trait]
    impl LlmProvider for CannedProvider {
        fn id(&self) -> &str {
            "canned"
        }
        async fn invoke(&self, _request: &InvokeRequest) -> Result<Invocation> {
            Ok(Invocation {
                text: self.reply.clone(),
                usage: Usage::default(),
            })
        }
    }

    fn site(reply: &str) -> LlmExtractionSite {
        let config = SiteConfig {
            name: "nichewelt".into(),
            kind: "llm_extraction".into(),
            base_url: "https://nichewelt.example".into(),
            search_url: Some("https://nichewelt.example/shop?s={query}".into()),
            detail_url: None,
            graphql_query: None,
            api_key: None,
            api_key_env: None,
            schema_file: None,
            url_patterns: vec![],
            enabled: true,
        };
        let fetcher = Arc::new(PageFetcher::from_config(&SearchConfig::default()).unwrap());
        LlmExtractionSite::new(
            &config,
            fetcher,
            Arc::new(CannedProvider { reply: reply.into() }),
            Arc::new(ProductCodec::new("test-key")),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn items_missing_required_fields_are_dropped() {
        let reply = r#"```json
{
  "products": [
    { "name": "JBL Flip 6", "current_price": 129.99, "image": "/i/jbl.jpg", "url": "/p/jbl" },
    { "name": "No image", "current_price": 79.0, "url": "/p/no-image" },
    { "name": "No price", "image": "/i/x.jpg", "url": "/p/no-price" },
    { "current_price": 12.0, "image": "/i/y.jpg", "url": "/p/no-name" }
  ]
}
```"#;
        let s = site(reply);
        let products = s.extract_products("page text", Some("speaker")).await.unwrap();
        assert_eq!(products.len(), 4);

        let accepted: Vec<SearchResult> = products.into_iter().filter_map(|p| s.accept(p)).collect();
        assert_eq!(accepted.len(), 1);
        assert_eq!(accepted[0].name, "JBL Flip 6");
        assert_eq!(accepted[0].url, "https://nichewelt.example/p/jbl");
        assert_eq!(
            accepted[0].image.as_deref(),
            Some("https://nichewelt.example/i/jbl.jpg")
        );
    }

    #[tokio::test]
    async fn string_prices_are_parsed() {
        let reply = r#"{
  "products": [
    { "name": "Vinyl cleaner", "current_price": "19,90 €", "image": "/i/v.jpg", "url": "/p/v" }
  ]
}"#;
        let s = site(reply);
        let products = s.extract_products("page", None).await.unwrap();
        let accepted: Vec<SearchResult> = products.into_iter().filter_map(|p| s.accept(p)).collect();
        assert_eq!(accepted.len(), 1);
        assert_eq!(accepted[0].current_price, 19.9);
    }

    #[tokio::test]
    async fn free_text_reply_is_a_schema_violation() {
        let s = site("I could not find any products on this page, sorry!");
        let err = s.extract_products("page", None).await.unwrap_err();
        assert!(matches!(err, CartwheelError::Llm(_)));
        assert!(!err.is_transient());
    }
}
