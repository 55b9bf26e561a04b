//! Web-search client for URL discovery (SearXNG-compatible JSON API).
//!
//! Scraping and LLM-extraction sites cannot answer a product query
//! themselves; the engine first asks a metasearch instance for product-page
//! URLs scoped with a `site:` qualifier, then dispatches the URLs to the
//! owning integration. The same client backs the general web pipeline's
//! search and image lookups.

use serde::Deserialize;

use cartwheel_core::config::SearchConfig;
use cartwheel_core::error::{CartwheelError, Result};

pub struct WebSearchClient {
    base_url: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebHit {
    #[serde(default)]
    pub title: String,
    pub url: String,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub img_src: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SearchReply {
    #[serde(default)]
    results: Vec<WebHit>,
}

impl WebSearchClient {
    pub fn new(base_url: &str, api_key: Option<String>) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            client: reqwest::Client::new(),
        }
    }

    /// `None` when no web-search endpoint is configured.
    pub fn from_config(config: &SearchConfig) -> Option<Self> {
        config
            .web_search_url
            .as_deref()
            .map(|base| Self::new(base, config.resolve_web_search_key()))
    }

    /// Web results for `query`, optionally scoped to one site's host.
    pub async fn search(&self, query: &str, site: Option<&str>) -> Result<Vec<WebHit>> {
        let q = match site {
            Some(host) => format!("site:{host} {query}"),
            None => query.to_string(),
        };
        self.request(&q, None).await
    }

    /// Image results for `query`.
    pub async fn images(&self, query: &str) -> Result<Vec<WebHit>> {
        self.request(query, Some("images")).await
    }

    fn build_request(&self, q: &str, categories: Option<&str>) -> Result<reqwest::Request> {
        let mut builder = self
            .client
            .get(format!("{}/search", self.base_url))
            .query(&[("q", q), ("format", "json")]);
        if let Some(categories) = categories {
            builder = builder.query(&[("categories", categories)]);
        }
        if let Some(key) = &self.api_key {
            builder = builder.header("authorization", format!("Bearer {key}"));
        }
        builder
            .build()
            .map_err(|e| CartwheelError::Integration {
                integration: "websearch".into(),
                message: format!("bad request: {e}"),
            })
    }

    async fn request(&self, q: &str, categories: Option<&str>) -> Result<Vec<WebHit>> {
        let request = self.build_request(q, categories)?;
        let response = self.client.execute(request).await.map_err(|e| {
            CartwheelError::IntegrationUnavailable {
                integration: "websearch".into(),
                message: e.to_string(),
            }
        })?;

        let status = response.status();
        if status.as_u16() == 429 || status.is_server_error() {
            return Err(CartwheelError::IntegrationUnavailable {
                integration: "websearch".into(),
                message: format!("status {status}"),
            });
        }
        if !status.is_success() {
            return Err(CartwheelError::Integration {
                integration: "websearch".into(),
                message: format!("status {status}"),
            });
        }

        let reply: SearchReply =
            response
                .json()
                .await
                .map_err(|e| CartwheelError::Integration {
                    integration: "websearch".into(),
                    message: format!("unparseable reply: {e}"),
                })?;
        Ok(reply.results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn search_request_carries_site_qualifier() {
        let client = WebSearchClient::new("http://searx.local:8080/", None);
        let request = client
            .build_request("site:shopmart.de bluetooth speakers", None)
            .unwrap();
        let url = request.url().as_str();
        assert!(url.starts_with("http://searx.local:8080/search?"));
        assert!(url.contains("q=site%3Ashopmart.de+bluetooth+speakers"));
        assert!(url.contains("format=json"));
    }

    #[test]
    fn image_request_sets_category() {
        let client = WebSearchClient::new("http://searx.local:8080", None);
        let request = client.build_request("lenovo laptop", Some("images")).unwrap();
        assert!(request.url().as_str().contains("categories=images"));
    }

    #[test]
    fn reply_parses_hits() {
        let raw = r#"{
            "query": "bluetooth speakers",
            "results": [
                {"title": "JBL Flip 6", "url": "https://shopmart.de/p/jbl-flip-6",
                 "content": "Powerful sound", "img_src": "https://img.shopmart.de/jbl.jpg"},
                {"url": "https://shopmart.de/p/anker"}
            ]
        }"#;
        let reply: SearchReply = serde_json::from_str(raw).unwrap();
        assert_eq!(reply.results.len(), 2);
        assert_eq!(reply.results[0].title, "JBL Flip 6");
        assert!(reply.results[1].img_src.is_none());
    }
}
