//! Site integrations, one module per behavioral class.
//!
//! * [`ApiSite`]: the site exposes a JSON search endpoint (plain or GraphQL).
//! * [`ScrapeSite`]: results are cut out of server-rendered HTML with a
//!   per-site selector schema.
//! * [`LlmExtractionSite`]: no stable structure at all; the page is flattened
//!   to text and a model extracts the products.

mod api;
mod extract;
mod scrape;

pub use api::ApiSite;
pub use extract::LlmExtractionSite;
pub use scrape::ScrapeSite;

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{info, warn};

use cartwheel_core::config::{SearchConfig, data_dir, expand_path};
use cartwheel_core::error::{CartwheelError, Result};
use cartwheel_core::product_code::ProductCodec;
use cartwheel_providers::LlmProvider;

use crate::fetch::PageFetcher;
use crate::integration::{Integration, IntegrationKind, SiteRegistry};
use crate::schema::SelectorSchema;

/// Instantiate every enabled site from configuration.
///
/// Misconfigured sites are hard errors; an `llm_extraction` site without a
/// configured model provider is skipped with a warning instead, so a missing
/// API key degrades coverage rather than refusing to start.
pub fn build_registry(
    config: &SearchConfig,
    fetcher: Arc<PageFetcher>,
    codec: Arc<ProductCodec>,
    provider: Option<Arc<dyn LlmProvider>>,
) -> Result<SiteRegistry> {
    let schema_dir: PathBuf = match &config.schema_dir {
        Some(dir) => expand_path(dir),
        None => data_dir().join("schemas"),
    };

    let mut integrations: Vec<Arc<dyn Integration>> = Vec::new();
    for site in &config.sites {
        if !site.enabled {
            info!(site = %site.name, "integration disabled, skipping");
            continue;
        }
        let kind = IntegrationKind::from_name(&site.kind).ok_or_else(|| {
            CartwheelError::Config(format!(
                "site '{}': unknown kind '{}'",
                site.name, site.kind
            ))
        })?;
        match kind {
            IntegrationKind::Api | IntegrationKind::Graphql => {
                integrations.push(Arc::new(ApiSite::from_config(site, kind, codec.clone())?));
            }
            IntegrationKind::Scraping => {
                let file = site.schema_file.as_deref().ok_or_else(|| {
                    CartwheelError::Config(format!(
                        "site '{}': scraping sites need a schema_file",
                        site.name
                    ))
                })?;
                let schema = SelectorSchema::load(&schema_dir.join(file))?;
                integrations.push(Arc::new(ScrapeSite::new(
                    site,
                    schema,
                    fetcher.clone(),
                    codec.clone(),
                )?));
            }
            IntegrationKind::LlmExtraction => {
                let Some(provider) = provider.clone() else {
                    warn!(site = %site.name, "no model provider configured, skipping llm_extraction site");
                    continue;
                };
                integrations.push(Arc::new(LlmExtractionSite::new(
                    site,
                    fetcher.clone(),
                    provider,
                    codec.clone(),
                )?));
            }
        }
    }
    info!(count = integrations.len(), "site registry ready");
    Ok(SiteRegistry::new(integrations))
}
