//! Page fetching for scraping integrations.
//!
//! Three escalation stages: a plain GET with a browser user agent, a
//! headless render (only in builds with the `browser` feature), and a
//! Cloudflare-bypass proxy when one is configured. The fetcher caps body
//! size so a pathological page cannot balloon memory.

use tracing::debug;

use cartwheel_core::config::SearchConfig;
use cartwheel_core::error::{CartwheelError, Result};

#[cfg(feature = "browser")]
use crate::browser::BrowserRenderer;

const USER_AGENT: &str = "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 \
     (KHTML, like Gecko) Chrome/126.0.0.0 Safari/537.36";
const MAX_BODY_BYTES: usize = 2 * 1024 * 1024;

pub struct PageFetcher {
    client: reqwest::Client,
    proxy_url: Option<String>,
    proxy_key: Option<String>,
    #[cfg(feature = "browser")]
    renderer: tokio::sync::OnceCell<BrowserRenderer>,
}

impl PageFetcher {
    pub fn from_config(config: &SearchConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| CartwheelError::Config(format!("http client: {e}")))?;
        Ok(Self {
            client,
            proxy_url: config.proxy_url.clone(),
            proxy_key: config.resolve_proxy_key(),
            #[cfg(feature = "browser")]
            renderer: tokio::sync::OnceCell::new(),
        })
    }

    /// Plain GET of an HTML page.
    pub async fn fetch_html(&self, site: &str, url: &str) -> Result<String> {
        let response = self.client.get(url).send().await.map_err(|e| {
            CartwheelError::IntegrationUnavailable {
                integration: site.to_string(),
                message: format!("fetch {url}: {e}"),
            }
        })?;
        self.read_capped(site, response).await
    }

    /// Rendered HTML via a headless browser. In builds without the
    /// `browser` feature this always fails, and the caller falls through to
    /// the proxy stage.
    #[cfg(feature = "browser")]
    pub async fn fetch_rendered(&self, site: &str, url: &str) -> Result<String> {
        let renderer = self
            .renderer
            .get_or_try_init(BrowserRenderer::launch)
            .await?;
        debug!(site, url, "Rendering page in headless browser");
        renderer.render(url).await
    }

    #[cfg(not(feature = "browser"))]
    pub async fn fetch_rendered(&self, site: &str, _url: &str) -> Result<String> {
        Err(CartwheelError::Integration {
            integration: site.to_string(),
            message: "browser rendering not built in".into(),
        })
    }

    pub fn has_proxy(&self) -> bool {
        self.proxy_url.is_some()
    }

    /// GET through the configured scraping proxy.
    pub async fn fetch_via_proxy(&self, site: &str, url: &str) -> Result<String> {
        let request = self.build_proxy_request(site, url)?;
        debug!(site, url, "Fetching through proxy");
        let response = self.client.execute(request).await.map_err(|e| {
            CartwheelError::IntegrationUnavailable {
                integration: site.to_string(),
                message: format!("proxy fetch {url}: {e}"),
            }
        })?;
        self.read_capped(site, response).await
    }

    fn build_proxy_request(&self, site: &str, url: &str) -> Result<reqwest::Request> {
        let proxy_url = self.proxy_url.as_deref().ok_or_else(|| {
            CartwheelError::Integration {
                integration: site.to_string(),
                message: "no scraping proxy configured".into(),
            }
        })?;
        let mut builder = self.client.get(proxy_url).query(&[("url", url)]);
        if let Some(key) = &self.proxy_key {
            builder = builder.query(&[("api_key", key.as_str())]);
        }
        builder.build().map_err(|e| CartwheelError::Integration {
            integration: site.to_string(),
            message: format!("bad proxy request: {e}"),
        })
    }

    async fn read_capped(&self, site: &str, response: reqwest::Response) -> Result<String> {
        let status = response.status();
        if status.as_u16() == 429 || status.is_server_error() {
            return Err(CartwheelError::IntegrationUnavailable {
                integration: site.to_string(),
                message: format!("status {status}"),
            });
        }
        if !status.is_success() {
            return Err(CartwheelError::Integration {
                integration: site.to_string(),
                message: format!("status {status}"),
            });
        }

        let mut body: Vec<u8> = Vec::new();
        let mut response = response;
        while let Some(chunk) = response.chunk().await.map_err(|e| {
            CartwheelError::IntegrationUnavailable {
                integration: site.to_string(),
                message: format!("read body: {e}"),
            }
        })? {
            if body.len() + chunk.len() > MAX_BODY_BYTES {
                let room = MAX_BODY_BYTES - body.len();
                body.extend_from_slice(&chunk[..room]);
                debug!(site, cap = MAX_BODY_BYTES, "Body truncated at size cap");
                break;
            }
            body.extend_from_slice(&chunk);
        }
        Ok(String::from_utf8_lossy(&body).into_owned())
    }
}
