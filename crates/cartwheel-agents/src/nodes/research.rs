//! Deep-search middle step: gather review evidence for the top candidates.

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::warn;

use cartwheel_core::error::{CartwheelError, Result};
use cartwheel_core::protocol::EgressFrame;
use cartwheel_core::state::{AgentName, ConversationState, StateUpdate};
use cartwheel_core::types::OptimizationMode;
use cartwheel_search::SearchRequest;

use crate::node::{AgentNode, NodeContext, NodeOutput};

/// How many of the ranked products get a review lookup.
const RESEARCH_DEPTH: usize = 3;
const FINDINGS_PER_PRODUCT: usize = 3;

/// Enriches the planner's products with web findings before the reviewer
/// writes the report. Works without a web-search backend (the report then
/// leans on product data alone).
pub struct ResearchNode;

#[async_trait]
impl AgentNode for ResearchNode {
    fn name(&self) -> AgentName {
        AgentName::Research
    }

    async fn run(
        &self,
        state: &ConversationState,
        cx: &mut NodeContext<'_>,
    ) -> Result<NodeOutput> {
        cx.sink
            .send(EgressFrame::progress_comment("digging into the top picks"))
            .await?;

        let mut products = state.products.clone();
        let mut update = StateUpdate::default();
        if products.is_empty() {
            if let Some(query) = state.human_response.as_deref() {
                let mut search = SearchRequest::new(query);
                search.mode = OptimizationMode::Quality;
                products = match cx.services.engine.search(cx.ctx, &search).await {
                    Ok(products) => products,
                    Err(CartwheelError::Cancelled) => return Err(CartwheelError::Cancelled),
                    Err(e) => {
                        warn!(error = %e, "research-stage search failed, continuing empty");
                        Vec::new()
                    }
                };
                update.products = Some(products.clone());
            }
        }

        let mut notes: Vec<Value> = Vec::new();
        if let Some(websearch) = cx.services.websearch.as_ref() {
            for product in products.iter().take(RESEARCH_DEPTH) {
                if cx.ctx.is_cancelled() {
                    return Err(CartwheelError::Cancelled);
                }
                let query = format!("{} review", product.name);
                match websearch.search(&query, None).await {
                    Ok(hits) => notes.push(json!({
                        "product": product.name,
                        "findings": hits
                            .iter()
                            .take(FINDINGS_PER_PRODUCT)
                            .map(|h| json!({
                                "title": h.title,
                                "url": h.url,
                                "snippet": h.content,
                            }))
                            .collect::<Vec<_>>(),
                    })),
                    Err(e) => {
                        warn!(product = %product.name, error = %e, "review lookup failed, skipping");
                    }
                }
            }
        }

        let record = json!({
            "products_considered": products.len(),
            "notes": notes,
        });
        Ok(NodeOutput::goto(AgentName::Reviewer)
            .with_update(update)
            .with_record(record))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::Goto;
    use crate::testutil::{product, services, state_for, CollectingSink, ScriptedProvider};

    #[tokio::test]
    async fn routes_to_reviewer_with_a_note_record() {
        let tmp = tempfile::tempdir().unwrap();
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

        let mut state = state_for("research gaming laptops under 800k");
        state.products = vec![
            product("Asus TUF A15", 750000.0),
            product("Lenovo LOQ 15", 780000.0),
        ];

        let output = ResearchNode.run(&state, &mut cx).await.unwrap();

        assert_eq!(output.command.goto, Goto::Node(AgentName::Reviewer));
        // No web-search backend in the fixture: products pass through, notes
        // stay empty.
        assert_eq!(output.record["products_considered"], 2);
        assert_eq!(output.record["notes"].as_array().unwrap().len(), 0);
        assert!(output.command.update.products.is_none());
    }

    #[tokio::test]
    async fn cancellation_short_circuits() {
        let tmp = tempfile::tempdir().unwrap();
        let services = services(&tmp, ScriptedProvider::empty()).await;
        let sink = CollectingSink::new();
        let (_tx, mut rx) = tokio::sync::mpsc::channel(1);
        let ctx = tokio_util::sync::CancellationToken::new();
        ctx.cancel();
        let mut cx = NodeContext {
            ctx: &ctx,
            sink: &sink,
            services: &services,
            ingress: &mut rx,
        };

        // Empty products force the engine path, which observes the token.
        let state = state_for("research gaming laptops");
        let err = ResearchNode.run(&state, &mut cx).await.unwrap_err();
        assert!(matches!(err, CartwheelError::Cancelled));
    }
}
