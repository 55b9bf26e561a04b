//! Direct integrations: sites with a JSON search endpoint, plain or GraphQL.
//!
//! Reply shapes differ per shop, so instead of a per-site response model the
//! mapper walks the reply for the first array of product-looking objects and
//! reads fields through a small synonym table.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Map, Value, json};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

use cartwheel_core::config::SiteConfig;
use cartwheel_core::error::{CartwheelError, Result};
use cartwheel_core::product_code::ProductCodec;
use cartwheel_core::types::{ProductDetail, SearchResult};

use crate::integration::{Integration, IntegrationKind, ListQuery, url_belongs_to};
use crate::schema::{absolutize, parse_price, urlencode};

const NAME_KEYS: &[&str] = &["name", "title", "product_name"];
const PRICE_KEYS: &[&str] = &["current_price", "price", "sale_price", "amount"];
const URL_KEYS: &[&str] = &["url", "link", "product_url", "href"];
const IMAGE_KEYS: &[&str] = &["image", "image_url", "thumbnail", "img"];
const BRAND_KEYS: &[&str] = &["brand", "manufacturer", "vendor"];
const RATING_KEYS: &[&str] = &["rating", "stars", "average_rating"];
const ORIGINAL_PRICE_KEYS: &[&str] = &["original_price", "list_price", "rrp", "msrp"];
const CATEGORY_KEYS: &[&str] = &["category", "category_name"];
const DESCRIPTION_KEYS: &[&str] = &["description", "summary"];

pub struct ApiSite {
    name: String,
    kind: IntegrationKind,
    base_url: String,
    base: Url,
    search_url: String,
    detail_url: Option<String>,
    graphql_query: Option<String>,
    api_key: Option<String>,
    url_patterns: Vec<String>,
    codec: Arc<ProductCodec>,
    client: reqwest::Client,
}

impl ApiSite {
    pub fn from_config(
        site: &SiteConfig,
        kind: IntegrationKind,
        codec: Arc<ProductCodec>,
    ) -> Result<Self> {
        let search_url = site.search_url.clone().ok_or_else(|| {
            CartwheelError::Config(format!("site '{}': {} sites need a search_url", site.name, kind.as_str()))
        })?;
        if kind == IntegrationKind::Graphql && site.graphql_query.is_none() {
            return Err(CartwheelError::Config(format!(
                "site '{}': graphql sites need a graphql_query",
                site.name
            )));
        }
        let base = Url::parse(&site.base_url).map_err(|e| {
            CartwheelError::Config(format!("site '{}': bad base_url: {e}", site.name))
        })?;
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| CartwheelError::Config(format!("http client: {e}")))?;
        Ok(Self {
            name: site.name.clone(),
            kind,
            base_url: site.base_url.clone(),
            base,
            search_url,
            detail_url: site.detail_url.clone(),
            graphql_query: site.graphql_query.clone(),
            api_key: site.resolve_api_key(),
            url_patterns: site.url_patterns.clone(),
            codec,
            client,
        })
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<Value> {
        let request = match &self.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        };
        let response = request.send().await.map_err(|e| CartwheelError::IntegrationUnavailable {
            integration: self.name.clone(),
            message: e.to_string(),
        })?;
        let status = response.status();
        if status.as_u16() == 429 || status.is_server_error() {
            return Err(CartwheelError::IntegrationUnavailable {
                integration: self.name.clone(),
                message: format!("status {status}"),
            });
        }
        if !status.is_success() {
            return Err(CartwheelError::Integration {
                integration: self.name.clone(),
                message: format!("status {status}"),
            });
        }
        response.json().await.map_err(|e| CartwheelError::Integration {
            integration: self.name.clone(),
            message: format!("invalid json reply: {e}"),
        })
    }

    fn listing_from_value(&self, value: &Value) -> Option<SearchResult> {
        let obj = value.as_object()?;
        let name = string_field(obj, NAME_KEYS)?;
        let current_price = number_field(obj, PRICE_KEYS)?;
        let url = absolutize(&self.base, &string_field(obj, URL_KEYS)?);
        let product_id = self.codec.encode(&url).ok()?;
        Some(SearchResult {
            product_id,
            name,
            brand: string_field(obj, BRAND_KEYS),
            category: string_field(obj, CATEGORY_KEYS),
            image: string_field(obj, IMAGE_KEYS).map(|i| absolutize(&self.base, &i)),
            url,
            current_price,
            original_price: number_field(obj, ORIGINAL_PRICE_KEYS),
            rating: number_field(obj, RATING_KEYS),
            source: self.name.clone(),
            relevance_score: None,
        })
    }

    fn detail_from_value(&self, value: &Value, url: &str, product_id: &str) -> Option<ProductDetail> {
        let obj = find_product_object(value)?;
        let name = string_field(obj, NAME_KEYS)?;
        let current_price = number_field(obj, PRICE_KEYS)?;

        let mut images: Vec<String> = obj
            .get("images")
            .and_then(Value::as_array)
            .map(|a| {
                a.iter()
                    .filter_map(value_as_string)
                    .map(|i| absolutize(&self.base, &i))
                    .collect()
            })
            .unwrap_or_default();
        if images.is_empty() {
            images.extend(string_field(obj, IMAGE_KEYS).map(|i| absolutize(&self.base, &i)));
        }

        let specifications = ["specs", "specifications"]
            .iter()
            .find_map(|k| obj.get(*k))
            .and_then(Value::as_object)
            .map(|m| {
                m.iter()
                    .filter_map(|(k, v)| value_as_string(v).map(|v| (k.clone(), v)))
                    .collect::<BTreeMap<_, _>>()
            })
            .unwrap_or_default();

        Some(ProductDetail {
            product_id: product_id.to_string(),
            name,
            brand: string_field(obj, BRAND_KEYS),
            category: string_field(obj, CATEGORY_KEYS),
            url: url.to_string(),
            images,
            current_price,
            original_price: number_field(obj, ORIGINAL_PRICE_KEYS),
            rating: number_field(obj, RATING_KEYS),
            description: string_field(obj, DESCRIPTION_KEYS),
            specifications,
            source: self.name.clone(),
            fetched_at: Utc::now(),
        })
    }
}

#[async_trait]
impl Integration for ApiSite {
    fn name(&self) -> &str {
        &self.name
    }

    fn base_url(&self) -> &str {
        &self.base_url
    }

    fn kind(&self) -> IntegrationKind {
        self.kind
    }

    fn matches_url(&self, url: &str) -> bool {
        url_belongs_to(&self.base_url, &self.url_patterns, url)
    }

    async fn product_list(
        &self,
        _ctx: &CancellationToken,
        query: &ListQuery,
    ) -> Result<Vec<SearchResult>> {
        let reply = match self.kind {
            IntegrationKind::Graphql => {
                // graphql_query presence is checked at construction.
                let document = self.graphql_query.as_deref().unwrap_or_default();
                let body = json!({
                    "query": document,
                    "variables": {
                        "query": query.query,
                        "page": query.page,
                        "limit": query.limit,
                    },
                });
                self.send(self.client.post(&self.search_url).json(&body)).await?
            }
            _ => {
                let url = fill_list_template(&self.search_url, query);
                self.send(self.client.get(&url)).await?
            }
        };

        let Some(items) = find_product_array(&reply) else {
            debug!(site = %self.name, "no product array in reply");
            return Ok(Vec::new());
        };
        let results: Vec<SearchResult> = items
            .iter()
            .filter_map(|v| self.listing_from_value(v))
            .take(query.limit)
            .collect();
        debug!(site = %self.name, count = results.len(), "list mapped");
        Ok(results)
    }

    async fn product_detail(
        &self,
        _ctx: &CancellationToken,
        url: &str,
        product_id: &str,
    ) -> Result<ProductDetail> {
        let Some(template) = &self.detail_url else {
            return Err(CartwheelError::Integration {
                integration: self.name.clone(),
                message: "no detail endpoint configured".into(),
            });
        };
        let endpoint = template.replace("{url}", &urlencode(url));
        let reply = self.send(self.client.get(&endpoint)).await?;
        self.detail_from_value(&reply, url, product_id)
            .ok_or_else(|| CartwheelError::Integration {
                integration: self.name.clone(),
                message: "detail reply is missing name or price".into(),
            })
    }
}

fn fill_list_template(template: &str, query: &ListQuery) -> String {
    template
        .replace("{query}", &urlencode(&query.query))
        .replace("{page}", &query.page.to_string())
        .replace("{limit}", &query.limit.to_string())
}

/// Breadth-first search for the first array whose elements look like
/// products (a name-ish and a price-ish key).
fn find_product_array(root: &Value) -> Option<&Vec<Value>> {
    let mut queue = VecDeque::from([root]);
    while let Some(value) = queue.pop_front() {
        match value {
            Value::Array(items) => {
                if items
                    .first()
                    .and_then(Value::as_object)
                    .is_some_and(looks_like_product)
                {
                    return Some(items);
                }
                queue.extend(items.iter());
            }
            Value::Object(map) => queue.extend(map.values()),
            _ => {}
        }
    }
    None
}

fn find_product_object(root: &Value) -> Option<&Map<String, Value>> {
    let mut queue = VecDeque::from([root]);
    while let Some(value) = queue.pop_front() {
        match value {
            Value::Object(map) => {
                if looks_like_product(map) {
                    return Some(map);
                }
                queue.extend(map.values());
            }
            Value::Array(items) => queue.extend(items.iter()),
            _ => {}
        }
    }
    None
}

fn looks_like_product(obj: &Map<String, Value>) -> bool {
    NAME_KEYS.iter().any(|k| obj.contains_key(*k))
        && PRICE_KEYS.iter().any(|k| obj.contains_key(*k))
}

fn string_field(obj: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter().filter_map(|k| obj.get(*k)).find_map(value_as_string)
}

fn number_field(obj: &Map<String, Value>, keys: &[&str]) -> Option<f64> {
    keys.iter().filter_map(|k| obj.get(*k)).find_map(value_as_number)
}

fn value_as_string(v: &Value) -> Option<String> {
    match v {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        _ => None,
    }
}

fn value_as_number(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => parse_price(s),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cartwheel_core::config::SiteConfig;

    fn site() -> ApiSite {
        let config = SiteConfig {
            name: "shopmart".into(),
            kind: "api".into(),
            base_url: "https://shopmart.de".into(),
            search_url: Some("https://api.shopmart.de/v2/search?q={query}&page={page}&per_page={limit}".into()),
            detail_url: Some("https://api.shopmart.de/v2/product?url={url}".into()),
            graphql_query: None,
            api_key: None,
            api_key_env: None,
            schema_file: None,
            url_patterns: vec![],
            enabled: true,
        };
        ApiSite::from_config(&config, IntegrationKind::Api, Arc::new(ProductCodec::new("test-key")))
            .unwrap()
    }

    #[test]
    fn template_fills_and_encodes() {
        let query = ListQuery::new("bluetooth speaker");
        let url = fill_list_template(
            "https://api.shopmart.de/v2/search?q={query}&page={page}&per_page={limit}",
            &query,
        );
        assert_eq!(
            url,
            "https://api.shopmart.de/v2/search?q=bluetooth+speaker&page=1&per_page=20"
        );
    }

    #[test]
    fn product_array_is_found_under_wrappers() {
        let reply = json!({
            "meta": { "took_ms": 12 },
            "data": {
                "hits": [
                    { "title": "JBL Flip 6", "price": "129,99 €", "link": "/p/jbl-flip-6" },
                    { "title": "Anker Soundcore", "price": 59.99, "link": "/p/anker" }
                ]
            }
        });
        let items = find_product_array(&reply).unwrap();
        assert_eq!(items.len(), 2);

        let s = site();
        let mapped: Vec<SearchResult> =
            items.iter().filter_map(|v| s.listing_from_value(v)).collect();
        assert_eq!(mapped.len(), 2);
        assert_eq!(mapped[0].name, "JBL Flip 6");
        assert_eq!(mapped[0].current_price, 129.99);
        assert_eq!(mapped[0].url, "https://shopmart.de/p/jbl-flip-6");
        assert_eq!(mapped[0].source, "shopmart");
        assert!(!mapped[0].product_id.is_empty());
    }

    #[test]
    fn incomplete_items_are_dropped() {
        let s = site();
        assert!(s.listing_from_value(&json!({ "title": "no price", "link": "/p/x" })).is_none());
        assert!(s.listing_from_value(&json!({ "price": 9.99, "link": "/p/x" })).is_none());
        assert!(s.listing_from_value(&json!({ "title": "no url", "price": 9.99 })).is_none());
    }

    #[test]
    fn detail_maps_images_and_specs() {
        let s = site();
        let reply = json!({
            "product": {
                "name": "JBL Flip 6",
                "price": 129.99,
                "brand": "JBL",
                "images": ["/i/1.jpg", "/i/2.jpg"],
                "specifications": { "Battery": "12 h", "Weight": "550 g" },
                "description": "Portable speaker."
            }
        });
        let detail = s
            .detail_from_value(&reply, "https://shopmart.de/p/jbl-flip-6", "code123")
            .unwrap();
        assert_eq!(detail.images.len(), 2);
        assert_eq!(detail.images[0], "https://shopmart.de/i/1.jpg");
        assert_eq!(detail.specifications["Battery"], "12 h");
        assert_eq!(detail.product_id, "code123");
    }

    #[tokio::test]
    async fn detail_without_endpoint_is_non_transient() {
        let config = SiteConfig {
            name: "noapi".into(),
            kind: "api".into(),
            base_url: "https://noapi.example".into(),
            search_url: Some("https://noapi.example/s?q={query}".into()),
            detail_url: None,
            graphql_query: None,
            api_key: None,
            api_key_env: None,
            schema_file: None,
            url_patterns: vec![],
            enabled: true,
        };
        let s = ApiSite::from_config(
            &config,
            IntegrationKind::Api,
            Arc::new(ProductCodec::new("test-key")),
        )
        .unwrap();
        let err = s
            .product_detail(&CancellationToken::new(), "https://noapi.example/p/1", "c1")
            .await
            .unwrap_err();
        assert!(!err.is_transient());
    }
}
