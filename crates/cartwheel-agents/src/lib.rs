//! Agent graph runtime.
//!
//! A turn walks a small directed graph of agent nodes over a shared
//! [`ConversationState`](cartwheel_core::state::ConversationState): each node
//! runs, hands back a routing [`Command`], the runtime merges the typed delta,
//! checkpoints, and follows `goto` until `End`. The human node suspends the
//! walk on a per-session channel until the next client frame arrives.
//!
//! Which graph runs is decided per turn from the frame's request type and
//! focus mode; see [`graph`].

pub mod checkpoint;
pub mod graph;
pub mod node;
pub mod nodes;
pub mod prompts;
pub mod runner;
pub mod runtime;
pub mod schemas;

#[cfg(test)]
pub(crate) mod testutil;

pub use checkpoint::{CheckpointStore, MemoryCheckpointStore};
pub use graph::Graph;
pub use node::{AgentNode, Command, Goto, NodeContext, NodeOutput, Services, TurnSink};
pub use runner::run_node;
pub use runtime::GraphRuntime;
