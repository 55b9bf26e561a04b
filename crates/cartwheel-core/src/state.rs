//! Conversation state — the record carried through the agent graph.
//!
//! Exactly one task owns a `ConversationState` at any instant; the graph
//! runtime serializes node execution per session, so none of this needs
//! interior locking. Checkpoints persist the whole record keyed by
//! `session_id` between turns.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::protocol::{IngressFrame, SourceRef};
use crate::types::{OptimizationMode, SearchResult};

/// Default bound on history kept for LLM context, in turns.
pub const DEFAULT_HISTORY_WINDOW: usize = 30;

/// Default conversation budget, in user turns.
pub const DEFAULT_CHAT_LIMIT: u32 = 40;

/// Every node the graphs can route to, plus the fixed key the search engine
/// writes its results under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AgentName {
    #[serde(rename = "meta_agent")]
    Meta,
    #[serde(rename = "planner_agent")]
    Planner,
    #[serde(rename = "web_query_agent")]
    WebQuery,
    #[serde(rename = "followup_agent")]
    Followup,
    #[serde(rename = "writer_agent")]
    Writer,
    #[serde(rename = "reviewer_agent")]
    Reviewer,
    #[serde(rename = "insights_agent")]
    Insights,
    #[serde(rename = "comparison_agent")]
    Comparison,
    #[serde(rename = "research_agent")]
    Research,
    #[serde(rename = "filter_agent")]
    Filter,
    #[serde(rename = "human_node")]
    Human,
    #[serde(rename = "search_tool")]
    SearchTool,
}

impl AgentName {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentName::Meta => "meta_agent",
            AgentName::Planner => "planner_agent",
            AgentName::WebQuery => "web_query_agent",
            AgentName::Followup => "followup_agent",
            AgentName::Writer => "writer_agent",
            AgentName::Reviewer => "reviewer_agent",
            AgentName::Insights => "insights_agent",
            AgentName::Comparison => "comparison_agent",
            AgentName::Research => "research_agent",
            AgentName::Filter => "filter_agent",
            AgentName::Human => "human_node",
            AgentName::SearchTool => "search_tool",
        }
    }
}

impl std::fmt::Display for AgentName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Message role in the conversation history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// One entry of `message_history`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl HistoryEntry {
    pub fn now(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Structured extraction of the user's current goal.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Requirements {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub brand: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub budget: Option<f64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub features: Vec<String>,
}

impl Requirements {
    pub fn is_empty(&self) -> bool {
        self.category.is_none()
            && self.brand.is_none()
            && self.budget.is_none()
            && self.features.is_empty()
    }
}

/// Execution status recorded in a node's metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    InProgress,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentMetrics {
    /// Wall-clock seconds spent in the node.
    pub execution_time: f64,
    pub status: AgentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens: Option<u64>,
}

/// Output of one node run, kept under `agent_results[node]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentResult {
    pub content: serde_json::Value,
    pub metrics: AgentMetrics,
}

impl AgentResult {
    pub fn in_progress() -> Self {
        Self {
            content: serde_json::Value::Null,
            metrics: AgentMetrics {
                execution_time: 0.0,
                status: AgentStatus::InProgress,
                tokens: None,
            },
        }
    }
}

/// The writer's terminal output for a turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalResult {
    pub content: String,
    #[serde(default)]
    pub sources: Vec<SourceRef>,
}

/// The conversation record carried through the graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationState {
    pub session_id: String,
    pub user_id: String,
    pub connection_id: String,

    #[serde(default)]
    pub message_history: Vec<HistoryEntry>,
    #[serde(default = "default_history_window")]
    pub history_window: usize,

    #[serde(default)]
    pub requirements: Requirements,
    #[serde(default)]
    pub agent_results: HashMap<AgentName, AgentResult>,

    /// The inbound frame driving the current turn.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ws_message: Option<IngressFrame>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub human_response: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ai_response: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_node: Option<AgentName>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_node: Option<AgentName>,

    #[serde(default)]
    pub chat_count: u32,
    #[serde(default = "default_chat_limit")]
    pub chat_limit: u32,
    #[serde(default)]
    pub chat_finished: bool,

    #[serde(default)]
    pub sources: Vec<SourceRef>,
    #[serde(default)]
    pub images: Vec<String>,
    #[serde(default)]
    pub products: Vec<SearchResult>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_result: Option<FinalResult>,
}

fn default_history_window() -> usize {
    DEFAULT_HISTORY_WINDOW
}

fn default_chat_limit() -> u32 {
    DEFAULT_CHAT_LIMIT
}

/// Typed delta a node hands back in its `Command`; the runtime merges it
/// atomically between node invocations.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requirements: Option<Requirements>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub human_response: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ai_response: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_node: Option<AgentName>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_node: Option<AgentName>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chat_finished: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sources: Option<Vec<SourceRef>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub images: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub products: Option<Vec<SearchResult>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_result: Option<FinalResult>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub append_history: Vec<HistoryEntry>,
}

impl ConversationState {
    pub fn new(
        session_id: impl Into<String>,
        user_id: impl Into<String>,
        connection_id: impl Into<String>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            user_id: user_id.into(),
            connection_id: connection_id.into(),
            message_history: Vec::new(),
            history_window: DEFAULT_HISTORY_WINDOW,
            requirements: Requirements::default(),
            agent_results: HashMap::new(),
            ws_message: None,
            human_response: None,
            ai_response: None,
            previous_node: None,
            next_node: None,
            chat_count: 0,
            chat_limit: DEFAULT_CHAT_LIMIT,
            chat_finished: false,
            sources: Vec::new(),
            images: Vec::new(),
            products: Vec::new(),
            final_result: None,
        }
    }

    /// Stamp a new inbound frame onto the state at the start of a turn.
    pub fn begin_turn(&mut self, frame: IngressFrame) {
        self.human_response = frame.content().map(str::to_owned);
        self.ws_message = Some(frame);
        self.ai_response = None;
        self.final_result = None;
        self.chat_count += 1;
    }

    /// Optimization mode of the current turn (balanced when unspecified).
    pub fn optimization_mode(&self) -> OptimizationMode {
        self.ws_message
            .as_ref()
            .and_then(|m| m.data.optimization_mode)
            .unwrap_or_default()
    }

    /// True once the current turn exceeds the budget. `begin_turn` counts
    /// the turn before it runs, so turn `chat_limit` itself is still served
    /// and turn `chat_limit + 1` gets the valediction.
    pub fn chat_limit_reached(&self) -> bool {
        self.chat_count > self.chat_limit
    }

    /// Append the turn's `{user, assistant}` pair, trimming to the window.
    pub fn append_turn_pair(&mut self, user: impl Into<String>, assistant: impl Into<String>) {
        self.message_history
            .push(HistoryEntry::now(Role::User, user));
        self.message_history
            .push(HistoryEntry::now(Role::Assistant, assistant));
        self.trim_history();
    }

    fn trim_history(&mut self) {
        let max = self.history_window * 2;
        if self.message_history.len() > max {
            let excess = self.message_history.len() - max;
            self.message_history.drain(..excess);
        }
    }

    pub fn result_for(&self, name: AgentName) -> Option<&AgentResult> {
        self.agent_results.get(&name)
    }

    pub fn record_result(&mut self, name: AgentName, result: AgentResult) {
        self.agent_results.insert(name, result);
    }

    /// Re-entrant nodes clear their own entry before running again.
    pub fn clear_result(&mut self, name: AgentName) {
        self.agent_results.remove(&name);
    }

    /// Apply a node's delta. Field-wise last-writer-wins; history appends
    /// are ordered after existing entries.
    pub fn merge(&mut self, update: StateUpdate) {
        if let Some(r) = update.requirements {
            self.requirements = r;
        }
        if let Some(h) = update.human_response {
            self.human_response = Some(h);
        }
        if let Some(a) = update.ai_response {
            self.ai_response = Some(a);
        }
        if let Some(p) = update.previous_node {
            self.previous_node = Some(p);
        }
        if let Some(n) = update.next_node {
            self.next_node = Some(n);
        }
        if let Some(f) = update.chat_finished {
            self.chat_finished = f;
        }
        if let Some(s) = update.sources {
            self.sources = s;
        }
        if let Some(i) = update.images {
            self.images = i;
        }
        if let Some(p) = update.products {
            self.products = p;
        }
        if let Some(f) = update.final_result {
            self.final_result = Some(f);
        }
        self.message_history.extend(update.append_history);
        self.trim_history();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{IngressData, MessageBody, RequestType};

    fn frame(content: &str) -> IngressFrame {
        IngressFrame {
            kind: RequestType::Message,
            data: IngressData {
                message: Some(MessageBody {
                    content: content.into(),
                }),
                ..Default::default()
            },
        }
    }

    #[test]
    fn begin_turn_stamps_message_and_counts() {
        let mut state = ConversationState::new("s1", "u1", "c1");
        state.begin_turn(frame("find me a laptop"));
        assert_eq!(state.human_response.as_deref(), Some("find me a laptop"));
        assert_eq!(state.chat_count, 1);
        state.begin_turn(frame("under 300k"));
        assert_eq!(state.chat_count, 2);
        assert!(state.final_result.is_none());
    }

    #[test]
    fn history_is_bounded_to_window() {
        let mut state = ConversationState::new("s1", "u1", "c1");
        state.history_window = 3;
        for i in 0..10 {
            state.append_turn_pair(format!("q{i}"), format!("a{i}"));
        }
        assert_eq!(state.message_history.len(), 6);
        assert_eq!(state.message_history[0].content, "q7");
        assert_eq!(state.message_history[5].content, "a9");
    }

    #[test]
    fn merge_applies_delta_fields() {
        let mut state = ConversationState::new("s1", "u1", "c1");
        state.merge(StateUpdate {
            requirements: Some(Requirements {
                category: Some("laptops".into()),
                brand: Some("Lenovo".into()),
                budget: Some(300_000.0),
                features: vec!["16GB RAM".into()],
            }),
            next_node: Some(AgentName::Planner),
            ..Default::default()
        });
        assert_eq!(state.requirements.brand.as_deref(), Some("Lenovo"));
        assert_eq!(state.next_node, Some(AgentName::Planner));
        assert!(state.human_response.is_none());
    }

    #[test]
    fn results_can_be_cleared_for_reentry() {
        let mut state = ConversationState::new("s1", "u1", "c1");
        state.record_result(AgentName::Human, AgentResult::in_progress());
        assert!(state.result_for(AgentName::Human).is_some());
        state.clear_result(AgentName::Human);
        assert!(state.result_for(AgentName::Human).is_none());
    }

    #[test]
    fn agent_names_serialize_to_stable_keys() {
        assert_eq!(
            serde_json::to_string(&AgentName::SearchTool).unwrap(),
            "\"search_tool\""
        );
        assert_eq!(
            serde_json::to_string(&AgentName::Human).unwrap(),
            "\"human_node\""
        );
        assert_eq!(AgentName::Planner.to_string(), "planner_agent");
    }

    #[test]
    fn chat_limit_spares_the_last_budgeted_turn() {
        let mut state = ConversationState::new("s1", "u1", "c1");
        state.chat_limit = 2;
        state.begin_turn(frame("one"));
        assert!(!state.chat_limit_reached());
        state.begin_turn(frame("two"));
        assert!(!state.chat_limit_reached());
        state.begin_turn(frame("three"));
        assert!(state.chat_limit_reached());
    }
}
