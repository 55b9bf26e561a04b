//! Search planning and dispatch into the product engine.

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, warn};

use cartwheel_core::error::{CartwheelError, Result};
use cartwheel_core::protocol::{EgressFrame, ProgressStatus};
use cartwheel_core::state::{AgentName, ConversationState, StateUpdate};
use cartwheel_providers::InvokeRequest;
use cartwheel_search::SearchRequest;

use crate::node::{AgentNode, NodeContext, NodeOutput};
use crate::prompts;
use crate::schemas::{planner_schema, PlannerResult};

/// Turns the conversation into one engine query and routes on the outcome.
///
/// Non-empty results go to `on_success` (the writer in copilot, the research
/// step in deep search); an empty or failed search parks the conversation on
/// the human node with an apology so the user can adjust.
pub struct PlannerNode {
    on_success: AgentName,
}

impl PlannerNode {
    pub fn new(on_success: AgentName) -> Self {
        Self { on_success }
    }
}

#[async_trait]
impl AgentNode for PlannerNode {
    fn name(&self) -> AgentName {
        AgentName::Planner
    }

    async fn run(
        &self,
        state: &ConversationState,
        cx: &mut NodeContext<'_>,
    ) -> Result<NodeOutput> {
        cx.sink
            .send(EgressFrame::progress(ProgressStatus::Searching))
            .await?;

        let mut system = prompts::PLANNER_SYSTEM.to_string();
        if !state.requirements.is_empty() {
            system.push_str("\n\nKnown requirements so far: ");
            system.push_str(
                &serde_json::to_string(&state.requirements).unwrap_or_default(),
            );
        }
        let request = InvokeRequest::new(self.name().as_str(), system)
            .with_schema(planner_schema())
            .with_messages(prompts::turn_messages(state));
        let invocation = cx.services.provider.invoke(&request).await?;
        let plan: PlannerResult = invocation.parse()?;
        let tokens = invocation.usage.total();
        debug!(query = %plan.product_query, n_k = plan.n_k, "planned search");

        cx.sink
            .send(EgressFrame::progress(ProgressStatus::Scraping))
            .await?;

        let mut search = SearchRequest::new(plan.product_query.as_str());
        search.mode = state.optimization_mode();
        let mut products = match cx.services.engine.search(cx.ctx, &search).await {
            Ok(products) => products,
            Err(CartwheelError::Cancelled) => return Err(CartwheelError::Cancelled),
            Err(e) => {
                warn!(error = %e, query = %plan.product_query, "search failed, falling back to a re-query");
                Vec::new()
            }
        };

        let record = serde_json::to_value(&plan).unwrap_or(Value::Null);
        if products.is_empty() {
            let apology = prompts::apology().to_string();
            return Ok(NodeOutput::goto(AgentName::Human)
                .with_update(StateUpdate {
                    ai_response: Some(apology),
                    next_node: Some(AgentName::Planner),
                    ..Default::default()
                })
                .with_record(record)
                .with_tokens(tokens));
        }

        products.truncate(plan.n_k.clamp(1, 20));
        let handoff = json!({
            "query": plan.product_query,
            "filter": plan.filter,
            "products": products,
        });
        Ok(NodeOutput::goto(self.on_success)
            .with_update(StateUpdate {
                products: Some(products),
                ..Default::default()
            })
            .with_extra(AgentName::SearchTool, handoff)
            .with_record(record)
            .with_tokens(tokens))
    }
}
