//! The node catalog.
//!
//! One file per agent. Each node implements [`crate::node::AgentNode`],
//! reports routing through its returned command, and records its structured
//! decision for `agent_results`.

pub mod composer;
pub mod filter;
pub mod followup;
pub mod human;
pub mod meta;
pub mod planner;
pub mod research;
pub mod web_query;
pub mod writer;

pub use composer::ComposerNode;
pub use filter::FilterNode;
pub use followup::FollowupNode;
pub use human::HumanNode;
pub use meta::MetaNode;
pub use planner::PlannerNode;
pub use research::ResearchNode;
pub use web_query::WebQueryNode;
pub use writer::WriterNode;
