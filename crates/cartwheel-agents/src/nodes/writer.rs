//! Final answer composition for the copilot and web pipelines.

use async_trait::async_trait;
use serde_json::{json, Value};

use cartwheel_core::error::Result;
use cartwheel_core::protocol::{EgressFrame, SourceRef};
use cartwheel_core::state::{AgentName, ConversationState, FinalResult, StateUpdate};
use cartwheel_core::types::SearchResult;
use cartwheel_providers::{ChatMessage, InvokeRequest};

use crate::node::{AgentNode, NodeContext, NodeOutput};
use crate::prompts;

/// Streams the answer built from the turn's search results, then closes the
/// conversation turn with `final_result`.
pub struct WriterNode;

#[async_trait]
impl AgentNode for WriterNode {
    fn name(&self) -> AgentName {
        AgentName::Writer
    }

    async fn run(
        &self,
        state: &ConversationState,
        cx: &mut NodeContext<'_>,
    ) -> Result<NodeOutput> {
        let sources = gathered_sources(state);
        let mut messages = prompts::turn_messages(state);
        if let Some(context) = gathered_context(state) {
            let mut briefing = format!("Search results:\n{context}");
            if let Some(instructions) = planner_instructions(state) {
                briefing.push_str("\n\nConstraints to respect: ");
                briefing.push_str(&instructions);
            }
            messages.push(ChatMessage::user(briefing));
        }

        let request = InvokeRequest::new(self.name().as_str(), prompts::WRITER_SYSTEM)
            .with_messages(messages);
        let invocation = cx.services.provider.invoke(&request).await?;
        let answer = invocation.text.trim().to_string();

        cx.sink.stream_text(&answer).await?;
        if !sources.is_empty() {
            cx.sink
                .send(EgressFrame::Sources {
                    content: sources.clone(),
                })
                .await?;
        }
        cx.sink.message_end().await?;

        Ok(NodeOutput::end()
            .with_update(StateUpdate {
                ai_response: Some(answer.clone()),
                sources: Some(sources.clone()),
                final_result: Some(FinalResult {
                    content: answer.clone(),
                    sources,
                }),
                ..Default::default()
            })
            .with_record(json!({ "chars": answer.len() }))
            .with_tokens(invocation.usage.total()))
    }
}

/// Prompt context from the turn's gathered material: ranked products first,
/// otherwise the web hits recorded under `search_tool`.
pub(crate) fn gathered_context(state: &ConversationState) -> Option<String> {
    if !state.products.is_empty() {
        return Some(prompts::products_digest(&state.products, 20));
    }
    let record = state.result_for(AgentName::SearchTool)?;
    if let Some(value) = record.content.get("products") {
        let products: Vec<SearchResult> =
            serde_json::from_value(value.clone()).unwrap_or_default();
        if !products.is_empty() {
            return Some(prompts::products_digest(&products, 20));
        }
    }
    let hits = record.content.get("hits")?.as_array()?;
    if hits.is_empty() {
        return None;
    }
    Some(
        hits.iter()
            .map(Value::to_string)
            .collect::<Vec<_>>()
            .join("\n"),
    )
}

/// Source links for the final answer: whatever the web path already
/// collected, else one link per product.
pub(crate) fn gathered_sources(state: &ConversationState) -> Vec<SourceRef> {
    if !state.sources.is_empty() {
        return state.sources.clone();
    }
    state
        .products
        .iter()
        .map(|p| SourceRef {
            product_url: p.url.clone(),
            image_url: p.image.clone(),
        })
        .collect()
}

fn planner_instructions(state: &ConversationState) -> Option<String> {
    let record = state.result_for(AgentName::Planner)?;
    let filter = record.content.get("filter").and_then(Value::as_str);
    let description = record.content.get("description").and_then(Value::as_str);
    let joined = [filter, description]
        .into_iter()
        .flatten()
        .collect::<Vec<_>>()
        .join("; ");
    (!joined.is_empty()).then_some(joined)
}
