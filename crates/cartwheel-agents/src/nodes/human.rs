//! The suspension point: hand the floor to the user and wait.

use async_trait::async_trait;
use serde_json::json;
use tracing::debug;

use cartwheel_core::error::Result;
use cartwheel_core::state::{AgentName, ConversationState, HistoryEntry, Role, StateUpdate};

use crate::node::{AgentNode, NodeContext, NodeOutput};

/// Streams the pending question (or apology), records the turn's
/// `{user, assistant}` pair, then parks on the session's ingress channel.
///
/// A new client frame resumes the walk at `state.next_node`; channel close
/// or cancellation rolls the turn to end. The resumed frame travels out in
/// the node output so the runtime can stamp it as the next turn.
pub struct HumanNode;

#[async_trait]
impl AgentNode for HumanNode {
    fn name(&self) -> AgentName {
        AgentName::Human
    }

    async fn run(
        &self,
        state: &ConversationState,
        cx: &mut NodeContext<'_>,
    ) -> Result<NodeOutput> {
        let question = state.ai_response.clone().unwrap_or_default();
        if !question.is_empty() {
            cx.sink.stream_text(&question).await?;
            cx.sink.message_end().await?;
        }

        let mut append = Vec::new();
        if let Some(user) = state.human_response.as_deref() {
            if !question.is_empty() {
                append.push(HistoryEntry::now(Role::User, user));
                append.push(HistoryEntry::now(Role::Assistant, question.as_str()));
            }
        }
        let record = json!({ "question": question });

        debug!(session_id = %state.session_id, "awaiting the user");
        tokio::select! {
            frame = cx.ingress.recv() => match frame {
                Some(frame) => {
                    let next = state.next_node.unwrap_or(AgentName::Meta);
                    debug!(next = %next, "user frame resumes the walk");
                    Ok(NodeOutput::goto(next)
                        .with_update(StateUpdate {
                            append_history: append,
                            ..Default::default()
                        })
                        .with_record(record)
                        .with_resumed_frame(frame))
                }
                None => {
                    debug!("ingress channel closed while suspended");
                    Ok(NodeOutput::end()
                        .with_update(StateUpdate {
                            append_history: append,
                            ..Default::default()
                        })
                        .with_record(record))
                }
            },
            _ = cx.ctx.cancelled() => {
                debug!("session cancelled while suspended");
                Ok(NodeOutput::end()
                    .with_update(StateUpdate {
                        append_history: append,
                        ..Default::default()
                    })
                    .with_record(record))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::Goto;
    use crate::testutil::{message_frame, services, state_for, CollectingSink, ScriptedProvider};
    use cartwheel_core::protocol::EgressFrame;

    fn suspended_state() -> ConversationState {
        let mut state = state_for("best phone");
        state.ai_response = Some("What is your budget and preferred OS?".into());
        state.next_node = Some(AgentName::Meta);
        state
    }

    #[tokio::test]
    async fn a_new_frame_resumes_at_next_node() {
        let tmp = tempfile::tempdir().unwrap();
        let services = services(&tmp, ScriptedProvider::empty()).await;
        let sink = CollectingSink::new();
        let (tx, mut rx) = tokio::sync::mpsc::channel(2);
        tx.send(message_frame("android, under 200000")).await.unwrap();
        let ctx = tokio_util::sync::CancellationToken::new();
        let mut cx = NodeContext {
            ctx: &ctx,
            sink: &sink,
            services: &services,
            ingress: &mut rx,
        };

        let state = suspended_state();
        let output = HumanNode.run(&state, &mut cx).await.unwrap();

        assert_eq!(output.command.goto, Goto::Node(AgentName::Meta));
        let frame = output.resumed_frame.unwrap();
        assert_eq!(frame.content(), Some("android, under 200000"));

        // The pending pair rides along in the update.
        let appended = &output.command.update.append_history;
        assert_eq!(appended.len(), 2);
        assert_eq!(appended[0].role, Role::User);
        assert_eq!(appended[0].content, "best phone");
        assert_eq!(appended[1].role, Role::Assistant);

        assert_eq!(sink.streamed_text(), "What is your budget and preferred OS?");
        assert!(matches!(sink.frames().last(), Some(EgressFrame::MessageEnd)));
    }

    #[tokio::test]
    async fn channel_close_rolls_to_end() {
        let tmp = tempfile::tempdir().unwrap();
        let services = services(&tmp, ScriptedProvider::empty()).await;
        let sink = CollectingSink::new();
        let (tx, mut rx) = tokio::sync::mpsc::channel::<cartwheel_core::protocol::IngressFrame>(1);
        drop(tx);
        let ctx = tokio_util::sync::CancellationToken::new();
        let mut cx = NodeContext {
            ctx: &ctx,
            sink: &sink,
            services: &services,
            ingress: &mut rx,
        };

        let state = suspended_state();
        let output = HumanNode.run(&state, &mut cx).await.unwrap();

        assert_eq!(output.command.goto, Goto::End);
        assert!(output.resumed_frame.is_none());
        assert_eq!(output.command.update.append_history.len(), 2);
    }

    #[tokio::test]
    async fn cancellation_rolls_to_end() {
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

        let state = suspended_state();
        let output = HumanNode.run(&state, &mut cx).await.unwrap();
        assert_eq!(output.command.goto, Goto::End);
        assert!(output.resumed_frame.is_none());
    }
}
