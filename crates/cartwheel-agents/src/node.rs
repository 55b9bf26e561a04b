//! The node contract: what every agent implements and what it may touch.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use cartwheel_core::error::Result;
use cartwheel_core::protocol::{EgressFrame, IngressFrame};
use cartwheel_core::state::{AgentName, ConversationState, StateUpdate};
use cartwheel_providers::LlmProvider;
use cartwheel_search::{SearchEngine, WebSearchClient};

/// Where the runtime goes after a node returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Goto {
    Node(AgentName),
    End,
}

/// A node's verdict: where to route and what to change.
///
/// The update is a typed delta; the runtime merges it into the state before
/// following `goto`, so a node never mutates shared state directly.
#[derive(Debug, Clone)]
pub struct Command {
    pub goto: Goto,
    pub update: StateUpdate,
}

/// Everything a node hands back from one run.
#[derive(Debug, Clone)]
pub struct NodeOutput {
    pub command: Command,
    /// Structured record kept under `agent_results[node]`.
    pub record: Value,
    /// Entries recorded under other keys, e.g. engine results under
    /// `search_tool`.
    pub extra_records: Vec<(AgentName, Value)>,
    /// LLM tokens spent, when the node invoked one.
    pub tokens: Option<u64>,
    /// Set by the human node when a new client frame resumed the walk; the
    /// runtime stamps it as the current turn before merging.
    pub resumed_frame: Option<IngressFrame>,
}

impl NodeOutput {
    pub fn goto(next: AgentName) -> Self {
        Self::routed(Goto::Node(next))
    }

    pub fn end() -> Self {
        Self::routed(Goto::End)
    }

    fn routed(goto: Goto) -> Self {
        Self {
            command: Command {
                goto,
                update: StateUpdate::default(),
            },
            record: Value::Null,
            extra_records: Vec::new(),
            tokens: None,
            resumed_frame: None,
        }
    }

    pub fn with_update(mut self, update: StateUpdate) -> Self {
        self.command.update = update;
        self
    }

    pub fn with_record(mut self, record: Value) -> Self {
        self.record = record;
        self
    }

    pub fn with_extra(mut self, name: AgentName, value: Value) -> Self {
        self.extra_records.push((name, value));
        self
    }

    pub fn with_tokens(mut self, tokens: u64) -> Self {
        self.tokens = Some(tokens);
        self
    }

    pub fn with_resumed_frame(mut self, frame: IngressFrame) -> Self {
        self.resumed_frame = Some(frame);
        self
    }
}

/// Outbound side of a session as nodes see it.
///
/// The gateway backs this with the paced egress stream; tests collect frames
/// into a vector. `send` is eager (progress, sources, images, products);
/// `stream_text` applies the word-by-word cadence. The message stays open
/// until `message_end`, so auxiliary frames (sources) can land between the
/// last chunk and the terminal frame.
#[async_trait]
pub trait TurnSink: Send + Sync {
    async fn send(&self, frame: EgressFrame) -> Result<()>;
    async fn stream_text(&self, content: &str) -> Result<()>;
    async fn message_end(&self) -> Result<()>;
}

/// Shared backends the nodes call into.
pub struct Services {
    pub provider: Arc<dyn LlmProvider>,
    pub engine: Arc<SearchEngine>,
    pub websearch: Option<Arc<WebSearchClient>>,
}

/// Per-turn execution context handed to every node.
pub struct NodeContext<'a> {
    /// Cancelled on disconnect, idle timeout, or shutdown.
    pub ctx: &'a CancellationToken,
    pub sink: &'a dyn TurnSink,
    pub services: &'a Services,
    /// Inbound frames for the suspended human node. The session task pushes
    /// every client frame here while the walk is parked on it.
    pub ingress: &'a mut mpsc::Receiver<IngressFrame>,
}

/// One agent in the graph.
///
/// `run` sees the state read-only and reports changes through its
/// [`Command`]; the runtime owns the merge. Nodes talk to the client only
/// through the sink.
#[async_trait]
pub trait AgentNode: Send + Sync {
    fn name(&self) -> AgentName;

    async fn run(
        &self,
        state: &ConversationState,
        cx: &mut NodeContext<'_>,
    ) -> Result<NodeOutput>;
}
