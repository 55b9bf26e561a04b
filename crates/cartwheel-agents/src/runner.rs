//! Node execution wrapper: lifecycle record, transient retries, failure
//! routing.
//!
//! Every node run leaves a trace in `agent_results`: an `in_progress` entry
//! while it executes, then a completed or failed record with wall-clock time
//! and token usage. Transient LLM failures are retried with the engine's
//! backoff; anything else ends the turn with a single error frame.

use std::time::Instant;

use tracing::{debug, error, warn};

use cartwheel_core::config::RetryConfig;
use cartwheel_core::error::{CartwheelError, Result};
use cartwheel_core::protocol::EgressFrame;
use cartwheel_core::state::{AgentMetrics, AgentResult, AgentStatus, ConversationState};
use cartwheel_search::retry::backoff_delay;

use crate::node::{AgentNode, NodeContext, NodeOutput};

/// Run one node through the standard lifecycle.
///
/// Cancellation routes to `End` without frames; a fatal error surfaces one
/// error frame and routes to `End`. The caller merges the returned command.
pub async fn run_node(
    node: &dyn AgentNode,
    state: &mut ConversationState,
    cx: &mut NodeContext<'_>,
    retry: &RetryConfig,
) -> NodeOutput {
    let name = node.name();
    let started = Instant::now();
    state.clear_result(name);
    state.record_result(name, AgentResult::in_progress());
    debug!(node = %name, session_id = %state.session_id, "Node starting");

    match run_with_retries(node, state, cx, retry).await {
        Ok(output) => {
            let metrics = AgentMetrics {
                execution_time: started.elapsed().as_secs_f64(),
                status: AgentStatus::Completed,
                tokens: output.tokens,
            };
            for (extra, value) in &output.extra_records {
                state.record_result(
                    *extra,
                    AgentResult {
                        content: value.clone(),
                        metrics: metrics.clone(),
                    },
                );
            }
            state.record_result(
                name,
                AgentResult {
                    content: output.record.clone(),
                    metrics,
                },
            );
            debug!(node = %name, elapsed_ms = started.elapsed().as_millis() as u64, "Node completed");
            output
        }
        Err(e) => {
            state.record_result(
                name,
                AgentResult {
                    content: serde_json::json!({ "error": e.to_string() }),
                    metrics: AgentMetrics {
                        execution_time: started.elapsed().as_secs_f64(),
                        status: AgentStatus::Failed,
                        tokens: None,
                    },
                },
            );
            if matches!(e, CartwheelError::Cancelled) {
                debug!(node = %name, "Node cancelled, ending turn");
            } else {
                error!(node = %name, error = %e, "Node failed, ending turn");
                if let Err(send_err) = cx.sink.send(EgressFrame::from_error(&e)).await {
                    warn!(error = %send_err, "Could not deliver error frame");
                }
            }
            NodeOutput::end()
        }
    }
}

/// The attempt loop. Only transient failures are retried, and only within
/// the budget; cancellation wins over backoff.
async fn run_with_retries(
    node: &dyn AgentNode,
    state: &ConversationState,
    cx: &mut NodeContext<'_>,
    retry: &RetryConfig,
) -> Result<NodeOutput> {
    let mut round = 0u32;
    loop {
        if round > 0 {
            let delay = backoff_delay(retry, round);
            tokio::select! {
                _ = cx.ctx.cancelled() => return Err(CartwheelError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
        if cx.ctx.is_cancelled() {
            return Err(CartwheelError::Cancelled);
        }
        match node.run(state, cx).await {
            Ok(output) => return Ok(output),
            Err(e) if e.is_transient() && round < retry.max_retries => {
                warn!(node = %node.name(), retry = round + 1, error = %e, "Transient node failure, retrying");
                round += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use tempfile::TempDir;

    use cartwheel_core::state::AgentName;

    use crate::node::Goto;
    use crate::testutil::{CollectingSink, ScriptedProvider, services, state_for};

    struct FlakyNode {
        calls: AtomicU32,
        fail_first: u32,
        error: fn() -> CartwheelError,
    }

    #[async_trait]
    impl AgentNode for FlakyNode {
        fn name(&self) -> AgentName {
            AgentName::Meta
        }

        async fn run(
            &self,
            _state: &ConversationState,
            _cx: &mut NodeContext<'_>,
        ) -> Result<NodeOutput> {
            if self.calls.fetch_add(1, Ordering::SeqCst) < self.fail_first {
                Err((self.error)())
            } else {
                Ok(NodeOutput::goto(AgentName::Planner)
                    .with_record(serde_json::json!({"ok": true}))
                    .with_tokens(17))
            }
        }
    }

    fn fast_retry() -> RetryConfig {
        RetryConfig {
            max_retries: 3,
            base_delay_ms: 5,
            factor: 2.0,
        }
    }

    #[tokio::test]
    async fn transient_failures_are_retried_to_success() {
        let tmp = TempDir::new().unwrap();
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
        let mut state = state_for("find speakers");
        let node = FlakyNode {
            calls: AtomicU32::new(0),
            fail_first: 2,
            error: || CartwheelError::LlmTimeout(Duration::from_secs(10)),
        };

        let output = run_node(&node, &mut state, &mut cx, &fast_retry()).await;
        assert_eq!(output.command.goto, Goto::Node(AgentName::Planner));
        assert_eq!(node.calls.load(Ordering::SeqCst), 3);

        let recorded = state.result_for(AgentName::Meta).unwrap();
        assert_eq!(recorded.metrics.status, AgentStatus::Completed);
        assert_eq!(recorded.metrics.tokens, Some(17));
        assert!(sink.frames().is_empty());
    }

    #[tokio::test]
    async fn fatal_failure_emits_one_error_frame_and_ends() {
        let tmp = TempDir::new().unwrap();
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
        let mut state = state_for("find speakers");
        let node = FlakyNode {
            calls: AtomicU32::new(0),
            fail_first: u32::MAX,
            error: || CartwheelError::Llm("model replied with prose".into()),
        };

        let output = run_node(&node, &mut state, &mut cx, &fast_retry()).await;
        assert_eq!(output.command.goto, Goto::End);
        assert_eq!(node.calls.load(Ordering::SeqCst), 1);

        let recorded = state.result_for(AgentName::Meta).unwrap();
        assert_eq!(recorded.metrics.status, AgentStatus::Failed);

        let frames = sink.frames();
        assert_eq!(frames.len(), 1);
        assert!(matches!(&frames[0], EgressFrame::Error { key, .. } if key == "AGENT_PROCESSING_ERROR"));
    }

    #[tokio::test]
    async fn cancellation_ends_without_frames() {
        let tmp = TempDir::new().unwrap();
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
        let mut state = state_for("find speakers");
        let node = FlakyNode {
            calls: AtomicU32::new(0),
            fail_first: 0,
            error: || CartwheelError::Cancelled,
        };

        let output = run_node(&node, &mut state, &mut cx, &fast_retry()).await;
        assert_eq!(output.command.goto, Goto::End);
        assert_eq!(node.calls.load(Ordering::SeqCst), 0);
        assert!(sink.frames().is_empty());
    }
}
