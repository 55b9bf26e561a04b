//! System prompts and canned message pools.
//!
//! Prompt text lives here in one place so the node files stay about control
//! flow. Every prompt that expects structured output names the exact fields;
//! the schemas the provider enforces live in [`crate::schemas`].

use rand::seq::IndexedRandom;

use cartwheel_core::state::{ConversationState, Role};
use cartwheel_core::types::SearchResult;
use cartwheel_providers::ChatMessage;

pub const META_SYSTEM: &str = "\
You are the triage agent of a shopping assistant. Decide how to handle the \
user's latest message.

Reply with JSON: {\"action\", \"content\", \"requirements\"}.
- action \"pass\": the request is a product search with enough detail to act \
on. Fill \"requirements\" with everything known so far (category, brand, \
budget as a number, features as a list), carrying forward earlier values.
- action \"__user__\": something essential is missing or ambiguous. Put ONE \
short clarifying question in \"content\".
- action \"__stop__\": the user is saying goodbye or asking to stop. Put a \
brief friendly farewell in \"content\".
Never invent requirements the user did not state.";

pub const PLANNER_SYSTEM: &str = "\
You turn a shopping request into one concrete product search. Reply with \
JSON: {\"product_query\", \"filter\", \"n_k\", \"description\"}.
- product_query: the query a shopping site would understand, specific but \
short (brand, product type, key attribute).
- filter: a one-line constraint the final answer must respect (budget cap, \
must-have feature), or null.
- n_k: how many products the answer should present, between 3 and 20.
- description: one sentence on what the user is trying to buy.";

pub const WEB_QUERY_SYSTEM: &str = "\
You prepare a general web search for a shopping-related question (reviews, \
comparisons, buying advice, news). Reply with JSON: {\"query\", \
\"include_images\"}.
- query: the web search query, plain keywords, no operators.
- include_images: true when pictures would help answer the question.";

pub const FOLLOWUP_SYSTEM: &str = "\
Results were already shown in this conversation. Decide what the user's new \
message asks for. Reply with JSON: {\"action\", \"content\"}.
- action \"pass\": it refines or continues the topic. Put the full \
reformulated search query in \"content\", folding in the earlier context.
- action \"__user__\": it is unclear. Put ONE short clarifying question in \
\"content\".
- action \"__stop__\": the user is done. Put a brief farewell in \"content\".";

pub const WRITER_SYSTEM: &str = "\
You write the final answer of a shopping assistant, in Markdown.
Work only from the search results given; never invent products, prices, or \
ratings. Present the best matches with name, price, and what stands out, \
as a short list ordered by fit. Link each product name to its url. Keep it \
tight; no preamble, no closing boilerplate.";

pub const REVIEWER_SYSTEM: &str = "\
You compose the final report of a deep product research run, in Markdown.
Work only from the research notes and products given. Structure: a short \
verdict first, then the top picks with price and reasoning, then caveats \
found during research. Never invent data.";

pub const INSIGHTS_SYSTEM: &str = "\
You distill shopping insights from web findings, in Markdown. Work only \
from the snippets given. Surface what reviewers agree on, notable \
criticisms, and price context. Cite the source domain in parentheses after \
each claim. No invented facts.";

pub const COMPARISON_SYSTEM: &str = "\
You compare the given products, in Markdown. Build a compact comparison \
(price, rating, standout attributes), then a one-paragraph recommendation \
of which to pick for which kind of buyer. Only use the data given.";

pub const FILTER_SYSTEM: &str = "\
You translate a filtering wish into structured constraints over an existing \
product list. Reply with JSON: {\"brand\", \"min_price\", \"max_price\", \
\"min_rating\", \"keywords\", \"sort\"}. Leave fields null when the user did \
not ask for them; sort is one of \"price_asc\", \"price_desc\", \"rating\".";

const APOLOGIES: [&str; 4] = [
    "I couldn't find anything matching that just now. Could you rephrase it, or should I try a broader search?",
    "Nothing came back for that search, sorry. Want me to loosen the criteria a bit?",
    "I came up empty on that one. A different brand or a wider budget might help; how would you like to adjust?",
    "No luck finding matches right now. Shall I retry with a more general query?",
];

const VALEDICTIONS: [&str; 3] = [
    "We've reached the end of this session's conversation budget. Thanks for shopping with me; start a new session anytime to continue.",
    "That's all the turns this session allows. It was a pleasure helping out; see you in a fresh session.",
    "This conversation has hit its limit for now. Thanks for the chat; open a new session whenever you want to keep going.",
];

/// A no-results apology, varied so repeats do not read canned.
pub fn apology() -> &'static str {
    APOLOGIES.choose(&mut rand::rng()).copied().unwrap_or(APOLOGIES[0])
}

/// The goodbye streamed when the chat budget is exhausted.
pub fn valediction() -> &'static str {
    VALEDICTIONS.choose(&mut rand::rng()).copied().unwrap_or(VALEDICTIONS[0])
}

/// Flatten the state's history window plus the current user message into
/// provider form.
pub fn turn_messages(state: &ConversationState) -> Vec<ChatMessage> {
    let mut messages: Vec<ChatMessage> = state
        .message_history
        .iter()
        .map(|entry| match entry.role {
            Role::User => ChatMessage::user(&entry.content),
            Role::Assistant | Role::Tool => ChatMessage::assistant(&entry.content),
            Role::System => ChatMessage::system(&entry.content),
        })
        .collect();
    if let Some(input) = &state.human_response {
        messages.push(ChatMessage::user(input));
    }
    messages
}

/// Compact JSON-lines digest of products for prompt context.
pub fn products_digest(products: &[SearchResult], cap: usize) -> String {
    products
        .iter()
        .take(cap)
        .map(|p| {
            serde_json::json!({
                "name": p.name,
                "price": p.current_price,
                "brand": p.brand,
                "rating": p.rating,
                "url": p.url,
            })
            .to_string()
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{product, state_for};

    #[test]
    fn turn_messages_end_with_the_current_input() {
        let mut state = state_for("under 100 euros");
        state.append_turn_pair("best speakers?", "What's your budget?");
        // The pair landed in history before this turn's input.
        state.human_response = Some("under 100 euros".into());

        let messages = turn_messages(&state);
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0].role, "user");
        assert_eq!(messages[0].content, "best speakers?");
        assert_eq!(messages[1].role, "assistant");
        assert_eq!(messages[2].content, "under 100 euros");
    }

    #[test]
    fn digest_caps_and_carries_prices() {
        let products: Vec<_> = (0..30)
            .map(|i| product(&format!("Speaker {i}"), 10.0 + i as f64))
            .collect();
        let digest = products_digest(&products, 20);
        assert_eq!(digest.lines().count(), 20);
        assert!(digest.contains("\"Speaker 0\""));
        assert!(digest.contains("10.0"));
        assert!(!digest.contains("Speaker 25"));
    }

    #[test]
    fn pools_return_fixed_members() {
        assert!(APOLOGIES.contains(&apology()));
        assert!(VALEDICTIONS.contains(&valediction()));
    }
}
