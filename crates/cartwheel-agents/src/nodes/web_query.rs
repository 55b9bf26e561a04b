//! General web search for the web and insights pipelines.

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, warn};

use cartwheel_core::error::{CartwheelError, Result};
use cartwheel_core::protocol::{EgressFrame, ProgressStatus, SourceRef};
use cartwheel_core::state::{AgentName, ConversationState, StateUpdate};
use cartwheel_providers::InvokeRequest;
use cartwheel_search::WebHit;

use crate::node::{AgentNode, NodeContext, NodeOutput};
use crate::prompts;
use crate::schemas::{web_query_schema, WebQueryPlan};

const MAX_HITS: usize = 10;
const MAX_IMAGES: usize = 8;

/// Plans and runs a metasearch query instead of the e-commerce fan-out,
/// then hands the findings to the graph's writing node.
pub struct WebQueryNode {
    on_success: AgentName,
}

impl WebQueryNode {
    pub fn new(on_success: AgentName) -> Self {
        Self { on_success }
    }
}

#[async_trait]
impl AgentNode for WebQueryNode {
    fn name(&self) -> AgentName {
        AgentName::WebQuery
    }

    async fn run(
        &self,
        state: &ConversationState,
        cx: &mut NodeContext<'_>,
    ) -> Result<NodeOutput> {
        let Some(websearch) = cx.services.websearch.as_ref() else {
            return Err(CartwheelError::Config(
                "web search endpoint not configured".into(),
            ));
        };

        cx.sink
            .send(EgressFrame::progress(ProgressStatus::Searching))
            .await?;

        let request = InvokeRequest::new(self.name().as_str(), prompts::WEB_QUERY_SYSTEM)
            .with_schema(web_query_schema())
            .with_messages(prompts::turn_messages(state));
        let invocation = cx.services.provider.invoke(&request).await?;
        let plan: WebQueryPlan = invocation.parse()?;
        let tokens = invocation.usage.total();
        debug!(query = %plan.query, images = plan.include_images, "planned web search");

        cx.sink
            .send(EgressFrame::progress(ProgressStatus::Scraping))
            .await?;

        let mut hits = websearch.search(&plan.query, None).await?;
        hits.truncate(MAX_HITS);
        let images = if plan.include_images {
            match websearch.images(&plan.query).await {
                Ok(image_hits) => image_hits
                    .into_iter()
                    .filter_map(|h| h.img_src)
                    .take(MAX_IMAGES)
                    .collect(),
                Err(e) => {
                    warn!(error = %e, query = %plan.query, "image lookup failed, continuing without");
                    Vec::new()
                }
            }
        } else {
            Vec::new()
        };

        cx.sink.send(EgressFrame::progress_comment("done")).await?;

        let record = serde_json::to_value(&plan).unwrap_or(Value::Null);
        if hits.is_empty() {
            let apology = prompts::apology().to_string();
            return Ok(NodeOutput::goto(AgentName::Human)
                .with_update(StateUpdate {
                    ai_response: Some(apology),
                    next_node: Some(AgentName::WebQuery),
                    ..Default::default()
                })
                .with_record(record)
                .with_tokens(tokens));
        }

        if !images.is_empty() {
            cx.sink
                .send(EgressFrame::Images {
                    content: images.clone(),
                })
                .await?;
        }

        let handoff = json!({ "query": plan.query, "hits": hit_digest(&hits) });
        Ok(NodeOutput::goto(self.on_success)
            .with_update(StateUpdate {
                sources: Some(web_sources(&hits)),
                images: Some(images),
                ..Default::default()
            })
            .with_extra(AgentName::SearchTool, handoff)
            .with_record(record)
            .with_tokens(tokens))
    }
}

fn web_sources(hits: &[WebHit]) -> Vec<SourceRef> {
    hits.iter()
        .map(|h| SourceRef {
            product_url: h.url.clone(),
            image_url: h.img_src.clone(),
        })
        .collect()
}

fn hit_digest(hits: &[WebHit]) -> Vec<Value> {
    hits.iter()
        .map(|h| {
            json!({
                "title": h.title,
                "url": h.url,
                "snippet": h.content,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{services, state_for, CollectingSink, ScriptedProvider};

    fn hit(title: &str, url: &str) -> WebHit {
        WebHit {
            title: title.into(),
            url: url.into(),
            content: Some(format!("{title} in depth")),
            img_src: None,
        }
    }

    #[test]
    fn hits_map_to_sources_and_digest() {
        let hits = vec![
            hit("JBL Flip 6 review", "https://reviews.example/flip-6"),
            hit("Best speakers 2025", "https://mag.example/speakers"),
        ];
        let sources = web_sources(&hits);
        assert_eq!(sources.len(), 2);
        assert_eq!(sources[0].product_url, "https://reviews.example/flip-6");

        let digest = hit_digest(&hits);
        assert_eq!(digest[1]["title"], "Best speakers 2025");
        assert_eq!(digest[0]["snippet"], "JBL Flip 6 review in depth");
    }

    #[tokio::test]
    async fn missing_websearch_backend_is_a_config_error() {
        let tmp = tempfile::tempdir().unwrap();
        // testutil services carry no websearch client.
        let services = services(&tmp, ScriptedProvider::empty()).await;
        let sink = CollectingSink::new();
        let (_tx, mut rx) = tokio::sync::mpsc::channel(1);
        let ctx = tokio_util::sync::CancellationToken::new();
        let mut cx = NodeContext {
            ctx: &ctx,
            sink: &sink,
            services: &services,
            ingress: &mut rx,
        };

        let state = state_for("what do reviewers say about the flip 6");
        let err = WebQueryNode::new(AgentName::Writer)
            .run(&state, &mut cx)
            .await
            .unwrap_err();
        assert!(matches!(err, CartwheelError::Config(_)));
        assert!(sink.frames().is_empty());
    }
}
