//! Terminal writing nodes that share one shape: reviewer, insights,
//! comparison.

use async_trait::async_trait;
use serde_json::{json, Value};

use cartwheel_core::error::Result;
use cartwheel_core::protocol::{EgressFrame, SourceRef};
use cartwheel_core::state::{AgentName, ConversationState, FinalResult, StateUpdate};
use cartwheel_core::types::SearchResult;
use cartwheel_providers::{ChatMessage, InvokeRequest};

use crate::node::{AgentNode, NodeContext, NodeOutput};
use crate::nodes::writer;
use crate::prompts;

/// A writer variant: same streaming and termination contract, different
/// prompt and context emphasis.
pub struct ComposerNode {
    name: AgentName,
    system: &'static str,
}

impl ComposerNode {
    /// Deep-search report over research notes and ranked products.
    pub fn reviewer() -> Self {
        Self {
            name: AgentName::Reviewer,
            system: prompts::REVIEWER_SYSTEM,
        }
    }

    /// Web-findings distillation for the insights pipeline.
    pub fn insights() -> Self {
        Self {
            name: AgentName::Insights,
            system: prompts::INSIGHTS_SYSTEM,
        }
    }

    /// Side-by-side verdict over the products the client sent along.
    pub fn comparison() -> Self {
        Self {
            name: AgentName::Comparison,
            system: prompts::COMPARISON_SYSTEM,
        }
    }
}

#[async_trait]
impl AgentNode for ComposerNode {
    fn name(&self) -> AgentName {
        self.name
    }

    async fn run(
        &self,
        state: &ConversationState,
        cx: &mut NodeContext<'_>,
    ) -> Result<NodeOutput> {
        let sources = compose_sources(state);
        let mut sections: Vec<String> = Vec::new();

        let current = current_products(state);
        if !current.is_empty() {
            sections.push(format!(
                "Products under discussion:\n{}",
                prompts::products_digest(&current, 20)
            ));
        }
        if let Some(context) = writer::gathered_context(state) {
            sections.push(format!("Search results:\n{context}"));
        }
        if let Some(research) = state.result_for(AgentName::Research) {
            if let Some(notes) = research.content.get("notes").and_then(Value::as_array) {
                if !notes.is_empty() {
                    let lines: Vec<String> = notes.iter().map(Value::to_string).collect();
                    sections.push(format!("Research notes:\n{}", lines.join("\n")));
                }
            }
        }

        let mut messages = prompts::turn_messages(state);
        if !sections.is_empty() {
            messages.push(ChatMessage::user(sections.join("\n\n")));
        }

        let request =
            InvokeRequest::new(self.name.as_str(), self.system).with_messages(messages);
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
            .with_record(json!({ "chars": answer.len(), "sections": sections.len() }))
            .with_tokens(invocation.usage.total()))
    }
}

fn current_products(state: &ConversationState) -> Vec<SearchResult> {
    state
        .ws_message
        .as_ref()
        .map(|m| m.data.current_products.clone())
        .unwrap_or_default()
}

fn compose_sources(state: &ConversationState) -> Vec<SourceRef> {
    let current = current_products(state);
    if !current.is_empty() {
        return current
            .iter()
            .map(|p| SourceRef {
                product_url: p.url.clone(),
                image_url: p.image.clone(),
            })
            .collect();
    }
    writer::gathered_sources(state)
}
