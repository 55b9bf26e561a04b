//! Shared fixtures for node and runtime tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use cartwheel_cache::{DetailCache, MemoryListBackend, SemanticListCache};
use cartwheel_core::config::{CacheConfig, SearchConfig};
use cartwheel_core::error::{CartwheelError, Result};
use cartwheel_core::product_code::ProductCodec;
use cartwheel_core::protocol::{EgressFrame, IngressData, IngressFrame, MessageBody, RequestType};
use cartwheel_core::state::ConversationState;
use cartwheel_core::types::{ProductDetail, SearchResult};
use cartwheel_providers::{HashEmbedder, Invocation, InvokeRequest, LlmProvider, Usage};
use cartwheel_search::integration::{Integration, IntegrationKind, ListQuery};
use cartwheel_search::{Reranker, SearchEngine, SiteRegistry};

use crate::node::{Services, TurnSink};

/// Sink that records frames in order; `stream_text` skips the pacing and
/// pushes the whole message as one chunk.
pub(crate) struct CollectingSink {
    frames: Mutex<Vec<EgressFrame>>,
}

impl CollectingSink {
    pub(crate) fn new() -> Self {
        Self {
            frames: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn frames(&self) -> Vec<EgressFrame> {
        self.frames.lock().unwrap().clone()
    }

    /// Concatenation of every streamed message chunk.
    pub(crate) fn streamed_text(&self) -> String {
        self.frames()
            .into_iter()
            .filter_map(|f| match f {
                EgressFrame::Message { content } => Some(content),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl TurnSink for CollectingSink {
    async fn send(&self, frame: EgressFrame) -> Result<()> {
        self.frames.lock().unwrap().push(frame);
        Ok(())
    }

    async fn stream_text(&self, content: &str) -> Result<()> {
        self.frames.lock().unwrap().push(EgressFrame::Message {
            content: content.to_string(),
        });
        Ok(())
    }

    async fn message_end(&self) -> Result<()> {
        self.frames.lock().unwrap().push(EgressFrame::MessageEnd);
        Ok(())
    }
}

/// Provider replaying canned completions in order.
pub(crate) struct ScriptedProvider {
    replies: Mutex<VecDeque<Result<String>>>,
}

impl ScriptedProvider {
    pub(crate) fn new(replies: Vec<&str>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into_iter().map(|r| Ok(r.to_string())).collect()),
        })
    }

    pub(crate) fn empty() -> Arc<Self> {
        Self::new(Vec::new())
    }

    pub(crate) fn failing(error: CartwheelError) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(VecDeque::from([Err(error)])),
        })
    }
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    fn id(&self) -> &str {
        "scripted"
    }

    async fn invoke(&self, request: &InvokeRequest) -> Result<Invocation> {
        let next = self.replies.lock().unwrap().pop_front();
        match next {
            Some(Ok(text)) => Ok(Invocation {
                text,
                usage: Usage {
                    input_tokens: 10,
                    output_tokens: 5,
                },
            }),
            Some(Err(e)) => Err(e),
            None => Err(CartwheelError::Llm(format!(
                "no scripted reply left for agent '{}'",
                request.agent
            ))),
        }
    }
}

/// Integration stub answering a fixed product list.
pub(crate) struct StaticSite {
    name: String,
    base_url: String,
    results: Vec<SearchResult>,
}

impl StaticSite {
    pub(crate) fn new(name: &str, results: Vec<SearchResult>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            base_url: format!("https://{name}.example"),
            results,
        })
    }
}

#[async_trait]
impl Integration for StaticSite {
    fn name(&self) -> &str {
        &self.name
    }

    fn base_url(&self) -> &str {
        &self.base_url
    }

    fn kind(&self) -> IntegrationKind {
        IntegrationKind::Api
    }

    fn matches_url(&self, url: &str) -> bool {
        url.contains(&self.name)
    }

    async fn product_list(
        &self,
        _ctx: &CancellationToken,
        _query: &ListQuery,
    ) -> Result<Vec<SearchResult>> {
        Ok(self.results.clone())
    }

    async fn product_detail(
        &self,
        _ctx: &CancellationToken,
        _url: &str,
        _product_id: &str,
    ) -> Result<ProductDetail> {
        Err(CartwheelError::Integration {
            integration: self.name.clone(),
            message: "no details in fixture".into(),
        })
    }
}

pub(crate) fn message_frame(content: &str) -> IngressFrame {
    IngressFrame {
        kind: RequestType::Message,
        data: IngressData {
            message: Some(MessageBody {
                content: content.into(),
            }),
            ..Default::default()
        },
    }
}

/// Fresh state with one inbound message stamped as the current turn.
pub(crate) fn state_for(content: &str) -> ConversationState {
    let mut state = ConversationState::new("s-test", "u-test", "c-test");
    state.begin_turn(message_frame(content));
    state
}

pub(crate) fn product(name: &str, price: f64) -> SearchResult {
    let slug = name.replace(' ', "-").to_lowercase();
    SearchResult {
        product_id: format!("pid-{slug}"),
        name: name.into(),
        brand: None,
        category: None,
        url: format!("https://shop.example/p/{slug}"),
        image: Some(format!("https://shop.example/i/{slug}.jpg")),
        current_price: price,
        original_price: None,
        rating: None,
        source: "shop".into(),
        relevance_score: None,
    }
}

pub(crate) async fn services(tmp: &TempDir, provider: Arc<dyn LlmProvider>) -> Services {
    services_with_sites(tmp, provider, Vec::new()).await
}

pub(crate) async fn services_with_sites(
    tmp: &TempDir,
    provider: Arc<dyn LlmProvider>,
    sites: Vec<Arc<dyn Integration>>,
) -> Services {
    let embedder = Arc::new(HashEmbedder);
    let cache_config = CacheConfig::default();
    let list_cache = Arc::new(SemanticListCache::new(
        Arc::new(MemoryListBackend::new(16)),
        embedder.clone(),
        &cache_config,
    ));
    let detail_cache = Arc::new(
        DetailCache::open(tmp.path().join("details"), Duration::from_secs(3600), 16)
            .await
            .unwrap(),
    );
    let engine = SearchEngine::new(
        &SearchConfig::default(),
        SiteRegistry::new(sites),
        None,
        list_cache,
        detail_cache,
        Reranker::new(embedder),
        Arc::new(ProductCodec::new("test-key")),
    );
    Services {
        provider,
        engine: Arc::new(engine),
        websearch: None,
    }
}
