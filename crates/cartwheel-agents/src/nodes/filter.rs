//! Structured filtering over the products already on the client's screen.

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use cartwheel_core::error::Result;
use cartwheel_core::protocol::EgressFrame;
use cartwheel_core::state::{AgentName, ConversationState, StateUpdate};
use cartwheel_core::types::{SearchResult, SortBy};
use cartwheel_providers::InvokeRequest;

use crate::node::{AgentNode, NodeContext, NodeOutput};
use crate::prompts;
use crate::schemas::{filter_schema, FilterPlan};

const NOTHING_TO_FILTER: &str = "I don't see any products to filter yet. Run a search first and I'll narrow it down.";

/// Serves `FILTER_REQUEST`: extracts constraints from the message and
/// applies them to `currentProducts`, client-side, no new search.
pub struct FilterNode;

#[async_trait]
impl AgentNode for FilterNode {
    fn name(&self) -> AgentName {
        AgentName::Filter
    }

    async fn run(
        &self,
        state: &ConversationState,
        cx: &mut NodeContext<'_>,
    ) -> Result<NodeOutput> {
        let products = state
            .ws_message
            .as_ref()
            .map(|m| m.data.current_products.clone())
            .unwrap_or_default();
        if products.is_empty() {
            cx.sink.stream_text(NOTHING_TO_FILTER).await?;
            cx.sink.message_end().await?;
            return Ok(NodeOutput::end().with_update(StateUpdate {
                ai_response: Some(NOTHING_TO_FILTER.to_string()),
                ..Default::default()
            }));
        }

        let request = InvokeRequest::new(self.name().as_str(), prompts::FILTER_SYSTEM)
            .with_schema(filter_schema())
            .with_messages(prompts::turn_messages(state));
        let invocation = cx.services.provider.invoke(&request).await?;
        let plan: FilterPlan = invocation.parse()?;
        let record = serde_json::to_value(&plan).unwrap_or(Value::Null);

        let filtered = apply_filter(&plan, &products);
        debug!(before = products.len(), after = filtered.len(), "filter applied");

        cx.sink
            .send(EgressFrame::Products {
                content: filtered.clone(),
            })
            .await?;
        let summary = format!(
            "Showing {} of {} products.",
            filtered.len(),
            products.len()
        );
        cx.sink.stream_text(&summary).await?;
        cx.sink.message_end().await?;

        Ok(NodeOutput::end()
            .with_update(StateUpdate {
                ai_response: Some(summary),
                products: Some(filtered),
                ..Default::default()
            })
            .with_record(record)
            .with_tokens(invocation.usage.total()))
    }
}

fn apply_filter(plan: &FilterPlan, products: &[SearchResult]) -> Vec<SearchResult> {
    let mut kept: Vec<SearchResult> = products
        .iter()
        .filter(|p| keeps(plan, p))
        .cloned()
        .collect();
    match plan.sort {
        Some(SortBy::PriceAsc) => {
            kept.sort_by(|a, b| a.current_price.total_cmp(&b.current_price))
        }
        Some(SortBy::PriceDesc) => {
            kept.sort_by(|a, b| b.current_price.total_cmp(&a.current_price))
        }
        Some(SortBy::Rating) => kept.sort_by(|a, b| {
            b.rating
                .unwrap_or(0.0)
                .total_cmp(&a.rating.unwrap_or(0.0))
        }),
        Some(SortBy::Relevance) | None => {}
    }
    kept
}

fn keeps(plan: &FilterPlan, product: &SearchResult) -> bool {
    if let Some(brand) = &plan.brand {
        let matches = product
            .brand
            .as_deref()
            .is_some_and(|b| b.to_lowercase().contains(&brand.to_lowercase()));
        if !matches {
            return false;
        }
    }
    if let Some(min) = plan.min_price {
        if product.current_price < min {
            return false;
        }
    }
    if let Some(max) = plan.max_price {
        if product.current_price > max {
            return false;
        }
    }
    if let Some(min_rating) = plan.min_rating {
        if !product.rating.is_some_and(|r| r >= min_rating) {
            return false;
        }
    }
    if !plan.keywords.is_empty() {
        let haystack = format!(
            "{} {} {}",
            product.name,
            product.brand.as_deref().unwrap_or(""),
            product.category.as_deref().unwrap_or("")
        )
        .to_lowercase();
        if !plan
            .keywords
            .iter()
            .all(|k| haystack.contains(&k.to_lowercase()))
        {
            return false;
        }
    }
    true
}
