//! Declared state machines: which nodes exist and which hops are legal.

use std::collections::HashMap;

use tracing::warn;

use cartwheel_core::protocol::RequestType;
use cartwheel_core::state::{AgentName, ConversationState, Role};
use cartwheel_core::types::FocusMode;

use crate::node::AgentNode;
use crate::nodes::{
    ComposerNode, FilterNode, FollowupNode, HumanNode, MetaNode, PlannerNode, ResearchNode,
    WebQueryNode, WriterNode,
};

/// A directed node set with a declared entry and an implicit `end` sink.
///
/// Transitions are data, not code: a node may only route to a declared
/// successor (or end), which keeps every path enumerable. Graphs are cheap
/// to build, so the gateway constructs one per turn.
pub struct Graph {
    name: &'static str,
    entry: AgentName,
    followup_entry: Option<AgentName>,
    nodes: HashMap<AgentName, Box<dyn AgentNode>>,
    edges: HashMap<AgentName, Vec<AgentName>>,
}

impl Graph {
    fn new(name: &'static str, entry: AgentName) -> Self {
        Self {
            name,
            entry,
            followup_entry: None,
            nodes: HashMap::new(),
            edges: HashMap::new(),
        }
    }

    /// Entry for turns arriving after the assistant has already answered.
    fn with_followup_entry(mut self, entry: AgentName) -> Self {
        self.followup_entry = Some(entry);
        self
    }

    fn node(mut self, node: impl AgentNode + 'static, successors: &[AgentName]) -> Self {
        let name = node.name();
        self.nodes.insert(name, Box::new(node));
        self.edges.insert(name, successors.to_vec());
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Where this turn starts, given what the conversation has seen.
    pub fn entry_for(&self, state: &ConversationState) -> AgentName {
        match self.followup_entry {
            Some(followup)
                if state
                    .message_history
                    .iter()
                    .any(|e| e.role == Role::Assistant) =>
            {
                followup
            }
            _ => self.entry,
        }
    }

    pub fn node_for(&self, name: AgentName) -> Option<&dyn AgentNode> {
        self.nodes.get(&name).map(Box::as_ref)
    }

    /// Whether `from -> to` is a declared transition. Routing to end is
    /// always legal and not checked here.
    pub fn allows(&self, from: AgentName, to: AgentName) -> bool {
        let declared = self
            .edges
            .get(&from)
            .is_some_and(|successors| successors.contains(&to));
        if !declared {
            warn!(graph = self.name, %from, %to, "transition not declared");
        }
        declared
    }

    /// `meta -> {human, planner -> writer} -> end`
    pub fn copilot() -> Self {
        Graph::new("copilot", AgentName::Meta)
            .node(MetaNode, &[AgentName::Human, AgentName::Planner])
            .node(
                PlannerNode::new(AgentName::Writer),
                &[AgentName::Writer, AgentName::Human],
            )
            .node(WriterNode, &[])
            .node(HumanNode, &[AgentName::Meta, AgentName::Planner])
    }

    /// `web_query -> {human, followup, writer} -> end`
    pub fn web() -> Self {
        Graph::new("web", AgentName::WebQuery)
            .with_followup_entry(AgentName::Followup)
            .node(
                WebQueryNode::new(AgentName::Writer),
                &[AgentName::Writer, AgentName::Human],
            )
            .node(
                FollowupNode::new(AgentName::WebQuery),
                &[AgentName::WebQuery, AgentName::Human],
            )
            .node(WriterNode, &[])
            .node(HumanNode, &[AgentName::WebQuery, AgentName::Followup])
    }

    /// The web pipeline with the insights composer writing the answer.
    pub fn insights() -> Self {
        Graph::new("insights", AgentName::WebQuery)
            .with_followup_entry(AgentName::Followup)
            .node(
                WebQueryNode::new(AgentName::Insights),
                &[AgentName::Insights, AgentName::Human],
            )
            .node(
                FollowupNode::new(AgentName::WebQuery),
                &[AgentName::WebQuery, AgentName::Human],
            )
            .node(ComposerNode::insights(), &[])
            .node(HumanNode, &[AgentName::WebQuery, AgentName::Followup])
    }

    /// `planner -> research -> reviewer -> end`
    pub fn deep_search() -> Self {
        Graph::new("deep_search", AgentName::Planner)
            .node(
                PlannerNode::new(AgentName::Research),
                &[AgentName::Research, AgentName::Human],
            )
            .node(ResearchNode, &[AgentName::Reviewer])
            .node(ComposerNode::reviewer(), &[])
            .node(HumanNode, &[AgentName::Planner])
    }

    /// Single-node graph serving `FILTER_REQUEST`.
    pub fn filter() -> Self {
        Graph::new("filter", AgentName::Filter).node(FilterNode, &[])
    }

    /// Single-node graph serving `COMPARE_REQUEST`.
    pub fn compare() -> Self {
        Graph::new("compare", AgentName::Comparison).node(ComposerNode::comparison(), &[])
    }

    /// The graph serving one inbound frame.
    pub fn for_turn(request: RequestType, focus: FocusMode) -> Self {
        match request {
            RequestType::Filter => Graph::filter(),
            RequestType::Compare => Graph::compare(),
            RequestType::Agent => Graph::deep_search(),
            RequestType::Message | RequestType::ProductDetails => match focus {
                FocusMode::Copilot => Graph::copilot(),
                FocusMode::Web => Graph::web(),
                FocusMode::Insights => Graph::insights(),
            },
        }
    }
}
