//! The per-session cooperative scheduler.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;

use cartwheel_core::config::RetryConfig;
use cartwheel_core::error::Result;
use cartwheel_core::protocol::IngressFrame;
use cartwheel_core::state::{AgentName, ConversationState};

use crate::checkpoint::CheckpointStore;
use crate::graph::Graph;
use crate::node::{Goto, NodeContext, NodeOutput, Services, TurnSink};
use crate::prompts;
use crate::runner::run_node;

/// Drives one graph walk per turn for a session.
///
/// At most one turn of a session runs at a time; the session task enforces
/// that by awaiting `run_turn` before pulling the next frame. A suspension
/// at the human node keeps the future alive inside `run_turn`, so a resume
/// continues in place rather than re-entering.
pub struct GraphRuntime {
    services: Services,
    checkpoints: Arc<dyn CheckpointStore>,
    retry: RetryConfig,
}

impl GraphRuntime {
    pub fn new(services: Services, checkpoints: Arc<dyn CheckpointStore>) -> Self {
        Self {
            services,
            checkpoints,
            retry: RetryConfig::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn checkpoints(&self) -> &Arc<dyn CheckpointStore> {
        &self.checkpoints
    }

    /// Run the graph for the turn already stamped on `state` (the caller
    /// applied `begin_turn`), until it ends or the session dies.
    pub async fn run_turn(
        &self,
        graph: &Graph,
        state: &mut ConversationState,
        sink: &dyn TurnSink,
        ctx: &CancellationToken,
        ingress: &mut mpsc::Receiver<IngressFrame>,
    ) -> Result<()> {
        let span = tracing::info_span!(
            "turn",
            session_id = %state.session_id,
            graph = graph.name(),
            turn_id = %Uuid::new_v4(),
        );
        self.drive(graph, state, sink, ctx, ingress)
            .instrument(span)
            .await
    }

    async fn drive(
        &self,
        graph: &Graph,
        state: &mut ConversationState,
        sink: &dyn TurnSink,
        ctx: &CancellationToken,
        ingress: &mut mpsc::Receiver<IngressFrame>,
    ) -> Result<()> {
        if state.chat_limit_reached() {
            return self.finish_with_valediction(state, sink).await;
        }

        let mut current = graph.entry_for(state);
        let mut ended_by_human = false;
        loop {
            let Some(node) = graph.node_for(current) else {
                warn!(node = %current, "node not registered in graph, ending turn");
                break;
            };

            let NodeOutput {
                command,
                resumed_frame,
                ..
            } = {
                let mut cx = NodeContext {
                    ctx,
                    sink,
                    services: &self.services,
                    ingress: &mut *ingress,
                };
                run_node(node, state, &mut cx, &self.retry).await
            };

            let resumed = resumed_frame.is_some();
            if let Some(frame) = resumed_frame {
                state.begin_turn(frame);
            }
            state.merge(command.update);
            state.previous_node = Some(current);
            self.checkpoint(state).await;

            if resumed && state.chat_limit_reached() {
                return self.finish_with_valediction(state, sink).await;
            }

            match command.goto {
                Goto::End => {
                    ended_by_human = current == AgentName::Human;
                    break;
                }
                Goto::Node(next) => {
                    if !graph.allows(current, next) {
                        break;
                    }
                    current = next;
                }
            }
        }

        if !ended_by_human {
            if let (Some(user), Some(assistant)) =
                (state.human_response.clone(), closing_text(state))
            {
                state.append_turn_pair(user, assistant);
            }
        }
        state.next_node = None;
        self.checkpoint(state).await;
        debug!(chat_count = state.chat_count, "turn finished");
        Ok(())
    }

    /// The conversation budget is spent: say goodbye and seal the session.
    async fn finish_with_valediction(
        &self,
        state: &mut ConversationState,
        sink: &dyn TurnSink,
    ) -> Result<()> {
        info!(
            session_id = %state.session_id,
            chat_count = state.chat_count,
            "chat limit reached, winding the session down"
        );
        let valediction = prompts::valediction();
        sink.stream_text(valediction).await?;
        sink.message_end().await?;

        state.ai_response = Some(valediction.to_string());
        state.chat_finished = true;
        if let Some(user) = state.human_response.clone() {
            state.append_turn_pair(user, valediction);
        }
        state.next_node = None;
        self.checkpoint(state).await;
        Ok(())
    }

    async fn checkpoint(&self, state: &ConversationState) {
        if let Err(e) = self.checkpoints.save(state).await {
            warn!(session_id = %state.session_id, error = %e, "checkpoint failed");
        }
    }
}

/// What the assistant said this turn, for the history pair.
fn closing_text(state: &ConversationState) -> Option<String> {
    if let Some(final_result) = &state.final_result {
        return Some(final_result.content.clone());
    }
    state.ai_response.clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::MemoryCheckpointStore;
    use crate::testutil::{
        message_frame, product, services, services_with_sites, state_for, CollectingSink,
        ScriptedProvider, StaticSite,
    };
    use cartwheel_core::protocol::{EgressFrame, ProgressStatus};
    use cartwheel_core::state::AgentStatus;

    const META_PASS: &str =
        r#"{"action": "pass", "requirements": {"category": "laptop", "budget": 300000.0}}"#;
    const META_ASK: &str =
        r#"{"action": "__user__", "content": "What is your budget and preferred OS?"}"#;
    const PLAN: &str = r#"{"product_query": "lenovo laptop", "n_k": 2}"#;
    const ANSWER: &str = "Top picks, cheapest first: the V15 and the IdeaPad 3.";

    fn lenovo_site() -> std::sync::Arc<StaticSite> {
        StaticSite::new(
            "shop",
            vec![
                product("Lenovo IdeaPad 3", 250000.0),
                product("Lenovo V15", 199000.0),
                product("HP 15", 210000.0),
            ],
        )
    }

    #[tokio::test]
    async fn copilot_turn_streams_answer_and_checkpoints() {
        let tmp = tempfile::tempdir().unwrap();
        let provider = ScriptedProvider::new(vec![META_PASS, PLAN, ANSWER]);
        let services = services_with_sites(&tmp, provider, vec![lenovo_site()]).await;
        let store = Arc::new(MemoryCheckpointStore::new());
        let runtime = GraphRuntime::new(services, store.clone());
        let graph = Graph::copilot();
        let sink = CollectingSink::new();
        let (_tx, mut rx) = tokio::sync::mpsc::channel(1);
        let ctx = CancellationToken::new();
        let mut state = state_for("cheap lenovo laptop");

        runtime
            .run_turn(&graph, &mut state, &sink, &ctx, &mut rx)
            .await
            .unwrap();

        assert_eq!(state.final_result.as_ref().unwrap().content, ANSWER);
        assert_eq!(state.products.len(), 2);
        assert!(state.result_for(AgentName::SearchTool).is_some());
        assert_eq!(
            state.result_for(AgentName::Writer).unwrap().metrics.status,
            AgentStatus::Completed
        );
        // Exactly one pair for the turn.
        assert_eq!(state.message_history.len(), 2);
        assert_eq!(state.message_history[1].content, ANSWER);
        assert_eq!(store.load("s-test").await.unwrap().unwrap().chat_count, 1);

        let frames = sink.frames();
        assert!(matches!(
            frames[0],
            EgressFrame::Progress { status: ProgressStatus::Searching, .. }
        ));
        assert!(matches!(
            frames[1],
            EgressFrame::Progress { status: ProgressStatus::Scraping, .. }
        ));
        assert!(matches!(&frames[2], EgressFrame::Message { content } if content == ANSWER));
        assert!(matches!(&frames[3], EgressFrame::Sources { content } if content.len() == 2));
        assert!(matches!(frames[4], EgressFrame::MessageEnd));
    }

    #[tokio::test]
    async fn clarification_suspends_until_the_next_frame() {
        let tmp = tempfile::tempdir().unwrap();
        let provider = ScriptedProvider::new(vec![META_ASK, META_PASS, PLAN, ANSWER]);
        let services = services_with_sites(&tmp, provider, vec![lenovo_site()]).await;
        let store = Arc::new(MemoryCheckpointStore::new());
        let runtime = GraphRuntime::new(services, store.clone());
        let graph = Graph::copilot();
        let sink = CollectingSink::new();
        let (tx, mut rx) = tokio::sync::mpsc::channel(2);
        tx.send(message_frame("a lenovo, under 300000"))
            .await
            .unwrap();
        let ctx = CancellationToken::new();
        let mut state = state_for("i need a laptop");

        runtime
            .run_turn(&graph, &mut state, &sink, &ctx, &mut rx)
            .await
            .unwrap();

        // Two user turns passed through the one walk.
        assert_eq!(state.chat_count, 2);
        assert_eq!(state.message_history.len(), 4);
        assert_eq!(state.message_history[0].content, "i need a laptop");
        assert_eq!(
            state.message_history[1].content,
            "What is your budget and preferred OS?"
        );
        assert_eq!(state.message_history[2].content, "a lenovo, under 300000");
        assert_eq!(state.message_history[3].content, ANSWER);
        assert_eq!(state.final_result.as_ref().unwrap().content, ANSWER);

        let frames = sink.frames();
        assert!(
            matches!(&frames[0], EgressFrame::Message { content } if content == "What is your budget and preferred OS?")
        );
        assert!(matches!(frames[1], EgressFrame::MessageEnd));
        assert!(matches!(frames.last(), Some(EgressFrame::MessageEnd)));
    }

    #[tokio::test]
    async fn exhausted_chat_budget_gets_the_valediction() {
        let tmp = tempfile::tempdir().unwrap();
        // An untouched provider proves no node ran.
        let services = services(&tmp, ScriptedProvider::empty()).await;
        let runtime = GraphRuntime::new(services, Arc::new(MemoryCheckpointStore::new()));
        let graph = Graph::copilot();
        let sink = CollectingSink::new();
        let (_tx, mut rx) = tokio::sync::mpsc::channel(1);
        let ctx = CancellationToken::new();
        let mut state = state_for("one more thing");
        state.chat_limit = 0;

        runtime
            .run_turn(&graph, &mut state, &sink, &ctx, &mut rx)
            .await
            .unwrap();

        assert!(state.chat_finished);
        assert!(state.ai_response.is_some());
        assert_eq!(state.message_history.len(), 2);
        let frames = sink.frames();
        assert_eq!(frames.len(), 2);
        assert!(matches!(&frames[0], EgressFrame::Message { .. }));
        assert!(matches!(frames[1], EgressFrame::MessageEnd));
    }

    #[tokio::test]
    async fn cancelled_session_ends_without_frames_or_pairs() {
        let tmp = tempfile::tempdir().unwrap();
        let services = services(&tmp, ScriptedProvider::empty()).await;
        let store = Arc::new(MemoryCheckpointStore::new());
        let runtime = GraphRuntime::new(services, store.clone());
        let graph = Graph::copilot();
        let sink = CollectingSink::new();
        let (_tx, mut rx) = tokio::sync::mpsc::channel(1);
        let ctx = CancellationToken::new();
        ctx.cancel();
        let mut state = state_for("cheap lenovo laptop");

        runtime
            .run_turn(&graph, &mut state, &sink, &ctx, &mut rx)
            .await
            .unwrap();

        assert!(sink.frames().is_empty());
        assert!(state.final_result.is_none());
        assert!(state.message_history.is_empty());
        assert_eq!(
            state.result_for(AgentName::Meta).unwrap().metrics.status,
            AgentStatus::Failed
        );
        // The end-of-turn checkpoint still landed.
        assert!(store.load("s-test").await.unwrap().is_some());
    }
}
