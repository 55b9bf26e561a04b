//! Headless-browser rendering, behind the `browser` feature.

use chromiumoxide::browser::{Browser, BrowserConfig};
use futures::StreamExt;
use tracing::debug;

use cartwheel_core::error::{CartwheelError, Result};

/// One headless Chromium instance, launched on first use and shared by all
/// render calls.
pub struct BrowserRenderer {
    browser: Browser,
}

impl BrowserRenderer {
    pub async fn launch() -> Result<Self> {
        let config = BrowserConfig::builder()
            .build()
            .map_err(|message| CartwheelError::Integration {
                integration: "browser".into(),
                message,
            })?;
        let (browser, mut handler) = Browser::launch(config).await.map_err(|e| {
            CartwheelError::IntegrationUnavailable {
                integration: "browser".into(),
                message: format!("launch: {e}"),
            }
        })?;
        // The handler stream must be pumped for the browser to make progress.
        tokio::spawn(async move { while handler.next().await.is_some() {} });
        debug!("Headless browser launched");
        Ok(Self { browser })
    }

    /// Fully rendered HTML of `url`.
    pub async fn render(&self, url: &str) -> Result<String> {
        let page = self.browser.new_page(url).await.map_err(|e| {
            CartwheelError::IntegrationUnavailable {
                integration: "browser".into(),
                message: format!("open {url}: {e}"),
            }
        })?;
        page.wait_for_navigation().await.map_err(|e| {
            CartwheelError::IntegrationUnavailable {
                integration: "browser".into(),
                message: format!("navigate {url}: {e}"),
            }
        })?;
        let html = page
            .content()
            .await
            .map_err(|e| CartwheelError::Integration {
                integration: "browser".into(),
                message: format!("content {url}: {e}"),
            })?;
        let _ = page.close().await;
        Ok(html)
    }
}
