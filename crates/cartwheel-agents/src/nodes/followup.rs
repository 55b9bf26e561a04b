//! Routing for turns that arrive after results were already shown.

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use cartwheel_core::error::Result;
use cartwheel_core::state::{AgentName, ConversationState, FinalResult, StateUpdate};
use cartwheel_providers::InvokeRequest;

use crate::node::{AgentNode, NodeContext, NodeOutput};
use crate::prompts;
use crate::schemas::{followup_schema, FollowupDecision, RouteAction};

const FALLBACK_QUESTION: &str = "Could you spell out what you'd like me to look into next?";
const FALLBACK_FAREWELL: &str = "Glad that helped. Come back anytime!";

/// Entry node for continuation turns: reformulate into a fresh search,
/// clarify, or wind down.
pub struct FollowupNode {
    on_pass: AgentName,
}

impl FollowupNode {
    pub fn new(on_pass: AgentName) -> Self {
        Self { on_pass }
    }
}

#[async_trait]
impl AgentNode for FollowupNode {
    fn name(&self) -> AgentName {
        AgentName::Followup
    }

    async fn run(
        &self,
        state: &ConversationState,
        cx: &mut NodeContext<'_>,
    ) -> Result<NodeOutput> {
        let request = InvokeRequest::new(self.name().as_str(), prompts::FOLLOWUP_SYSTEM)
            .with_schema(followup_schema())
            .with_messages(prompts::turn_messages(state));
        let invocation = cx.services.provider.invoke(&request).await?;
        let decision: FollowupDecision = invocation.parse()?;
        let record = serde_json::to_value(&decision).unwrap_or(Value::Null);
        let tokens = invocation.usage.total();

        let output = match decision.action {
            RouteAction::Pass => {
                // The reformulated query folds earlier context back in, so
                // downstream nodes see a self-contained request.
                let query = decision
                    .content
                    .or_else(|| state.human_response.clone())
                    .unwrap_or_default();
                debug!(%query, "followup continues with a new search");
                NodeOutput::goto(self.on_pass).with_update(StateUpdate {
                    human_response: Some(query),
                    ..Default::default()
                })
            }
            RouteAction::AskUser => {
                let question = decision
                    .content
                    .unwrap_or_else(|| FALLBACK_QUESTION.to_string());
                NodeOutput::goto(AgentName::Human).with_update(StateUpdate {
                    ai_response: Some(question),
                    next_node: Some(AgentName::Followup),
                    ..Default::default()
                })
            }
            RouteAction::Stop => {
                let farewell = decision
                    .content
                    .unwrap_or_else(|| FALLBACK_FAREWELL.to_string());
                cx.sink.stream_text(&farewell).await?;
                cx.sink.message_end().await?;
                NodeOutput::end().with_update(StateUpdate {
                    ai_response: Some(farewell.clone()),
                    final_result: Some(FinalResult {
                        content: farewell,
                        sources: Vec::new(),
                    }),
                    chat_finished: Some(true),
                    ..Default::default()
                })
            }
        };

        Ok(output.with_record(record).with_tokens(tokens))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::Goto;
    use crate::testutil::{services, state_for, CollectingSink, ScriptedProvider};

    async fn run_followup(reply: &str) -> NodeOutput {
        let tmp = tempfile::tempdir().unwrap();
        let services = services(&tmp, ScriptedProvider::new(vec![reply])).await;
        let sink = CollectingSink::new();
        let (_tx, mut rx) = tokio::sync::mpsc::channel(1);
        let ctx = tokio_util::sync::CancellationToken::new();
        let mut cx = NodeContext {
            ctx: &ctx,
            sink: &sink,
            services: &services,
            ingress: &mut rx,
        };

        let mut state = state_for("what about waterproof ones?");
        state.append_turn_pair("bluetooth speakers", "Here are five options ...");
        FollowupNode::new(AgentName::WebQuery)
            .run(&state, &mut cx)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn pass_overwrites_the_query_and_reenters_search() {
        let reply =
            r#"{"action": "pass", "content": "waterproof bluetooth speakers"}"#;
        let output = run_followup(reply).await;

        assert_eq!(output.command.goto, Goto::Node(AgentName::WebQuery));
        assert_eq!(
            output.command.update.human_response.as_deref(),
            Some("waterproof bluetooth speakers")
        );
    }

    #[tokio::test]
    async fn ask_user_parks_with_followup_as_resume_target() {
        let reply = r#"{"action": "__user__", "content": "Waterproof for the pool or the shower?"}"#;
        let output = run_followup(reply).await;

        assert_eq!(output.command.goto, Goto::Node(AgentName::Human));
        assert_eq!(output.command.update.next_node, Some(AgentName::Followup));
    }

    #[tokio::test]
    async fn stop_finishes_the_conversation() {
        let reply = r#"{"action": "__stop__", "content": "Enjoy the new speakers!"}"#;
        let output = run_followup(reply).await;

        assert_eq!(output.command.goto, Goto::End);
        assert_eq!(output.command.update.chat_finished, Some(true));
    }
}
