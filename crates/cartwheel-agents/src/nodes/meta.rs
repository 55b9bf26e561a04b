//! Triage over the user's latest message.

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use cartwheel_core::error::Result;
use cartwheel_core::state::{AgentName, ConversationState, FinalResult, StateUpdate};
use cartwheel_providers::InvokeRequest;

use crate::node::{AgentNode, NodeContext, NodeOutput};
use crate::prompts;
use crate::schemas::{meta_schema, MetaDecision, RouteAction};

const FALLBACK_QUESTION: &str = "Could you tell me a bit more about what you're looking for?";
const FALLBACK_FAREWELL: &str = "Happy to help anytime. Goodbye!";

/// Entry node of the copilot graph: ask, stop, or hand off to the planner.
pub struct MetaNode;

#[async_trait]
impl AgentNode for MetaNode {
    fn name(&self) -> AgentName {
        AgentName::Meta
    }

    async fn run(
        &self,
        state: &ConversationState,
        cx: &mut NodeContext<'_>,
    ) -> Result<NodeOutput> {
        let request = InvokeRequest::new(self.name().as_str(), prompts::META_SYSTEM)
            .with_schema(meta_schema())
            .with_messages(prompts::turn_messages(state));
        let invocation = cx.services.provider.invoke(&request).await?;
        let decision: MetaDecision = invocation.parse()?;
        let record = serde_json::to_value(&decision).unwrap_or(Value::Null);
        let tokens = invocation.usage.total();

        let output = match decision.action {
            RouteAction::AskUser => {
                let question = decision
                    .content
                    .unwrap_or_else(|| FALLBACK_QUESTION.to_string());
                debug!(%question, "triage asks for clarification");
                NodeOutput::goto(AgentName::Human).with_update(StateUpdate {
                    ai_response: Some(question),
                    next_node: Some(AgentName::Meta),
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
            RouteAction::Pass => {
                let requirements = decision.requirements.unwrap_or_default();
                debug!(?requirements, "triage passes to the planner");
                NodeOutput::goto(AgentName::Planner).with_update(StateUpdate {
                    requirements: Some(requirements),
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
    use cartwheel_core::protocol::EgressFrame;

    async fn run_meta(reply: &str, content: &str) -> (NodeOutput, CollectingSink) {
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
        let state = state_for(content);
        let output = MetaNode.run(&state, &mut cx).await.unwrap();
        (output, sink)
    }

    #[tokio::test]
    async fn pass_routes_to_planner_with_requirements() {
        let reply = r#"{"action": "pass", "requirements": {"category": "laptop", "budget": 300000.0}}"#;
        let (output, sink) = run_meta(reply, "cheap lenovo laptop under 300000").await;

        assert_eq!(output.command.goto, Goto::Node(AgentName::Planner));
        let req = output.command.update.requirements.unwrap();
        assert_eq!(req.category.as_deref(), Some("laptop"));
        assert!(sink.frames().is_empty());
    }

    #[tokio::test]
    async fn ask_user_parks_on_the_human_node() {
        let reply = r#"{"action": "__user__", "content": "What is your budget and preferred OS?"}"#;
        let (output, _sink) = run_meta(reply, "best phone").await;

        assert_eq!(output.command.goto, Goto::Node(AgentName::Human));
        assert_eq!(
            output.command.update.ai_response.as_deref(),
            Some("What is your budget and preferred OS?")
        );
        assert_eq!(output.command.update.next_node, Some(AgentName::Meta));
    }

    #[tokio::test]
    async fn stop_streams_a_farewell_and_finishes() {
        let reply = r#"{"action": "__stop__", "content": "Glad I could help. Bye!"}"#;
        let (output, sink) = run_meta(reply, "thanks, that's all").await;

        assert_eq!(output.command.goto, Goto::End);
        assert_eq!(output.command.update.chat_finished, Some(true));
        let final_result = output.command.update.final_result.unwrap();
        assert_eq!(final_result.content, "Glad I could help. Bye!");
        assert_eq!(sink.streamed_text(), "Glad I could help. Bye!");
        assert!(matches!(
            sink.frames().last(),
            Some(EgressFrame::MessageEnd)
        ));
    }
}
