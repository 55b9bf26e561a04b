//! LLM and embedding providers.
//!
//! Agent nodes call models through [`LlmProvider::invoke`]: one structured,
//! non-streaming completion per call, with an optional JSON schema the reply
//! must satisfy. Typing cadence towards the client is produced by the egress
//! writer, so providers have no streaming surface.

pub mod embedding;
pub mod failover;
pub mod openai;

pub use embedding::{Embedder, HashEmbedder, HttpEmbedder, cosine_similarity};
pub use failover::FailoverProvider;
pub use openai::OpenAiCompatProvider;

use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use cartwheel_core::error::{CartwheelError, Result};

/// Default per-invocation deadline.
pub const DEFAULT_INVOKE_TIMEOUT: Duration = Duration::from_secs(10);

/// One message of the prompt, already flattened to provider form.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".into(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".into(),
            content: content.into(),
        }
    }
}

/// A structured completion request.
#[derive(Debug, Clone)]
pub struct InvokeRequest {
    /// Calling agent, for logs and metrics only.
    pub agent: String,
    pub system: String,
    pub messages: Vec<ChatMessage>,
    /// JSON schema the reply must conform to; `None` for free-form text.
    pub schema: Option<serde_json::Value>,
    pub max_tokens: u32,
    pub temperature: Option<f64>,
    pub timeout: Duration,
}

impl InvokeRequest {
    pub fn new(agent: impl Into<String>, system: impl Into<String>) -> Self {
        Self {
            agent: agent.into(),
            system: system.into(),
            messages: Vec::new(),
            schema: None,
            max_tokens: 1024,
            temperature: None,
            timeout: DEFAULT_INVOKE_TIMEOUT,
        }
    }

    pub fn with_schema(mut self, schema: serde_json::Value) -> Self {
        self.schema = Some(schema);
        self
    }

    pub fn with_messages(mut self, messages: Vec<ChatMessage>) -> Self {
        self.messages = messages;
        self
    }
}

/// Token accounting for one invocation.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl Usage {
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// A completed invocation.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub text: String,
    pub usage: Usage,
}

impl Invocation {
    /// Parse the reply as `T`, tolerating a code-fenced JSON body. A parse
    /// failure is a non-transient LLM error (the reply violated the schema).
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T> {
        let body = extract_json(&self.text);
        serde_json::from_str(body)
            .map_err(|e| CartwheelError::Llm(format!("reply violates schema: {e}")))
    }
}

/// Strip a Markdown code fence around a JSON body, if present.
pub fn extract_json(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop the info string ("json", "JSON", ...) up to the first newline.
    let rest = match rest.find('\n') {
        Some(idx) => &rest[idx + 1..],
        None => rest,
    };
    rest.strip_suffix("```").map(str::trim).unwrap_or(trimmed)
}

/// A language-model backend.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Stable provider id for logging and failover ordering.
    fn id(&self) -> &str;

    async fn invoke(&self, request: &InvokeRequest) -> Result<Invocation>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Probe {
        action: String,
    }

    #[test]
    fn extract_json_passes_plain_bodies() {
        assert_eq!(extract_json(r#"{"a":1}"#), r#"{"a":1}"#);
        assert_eq!(extract_json("  {\"a\":1}  "), "{\"a\":1}");
    }

    #[test]
    fn extract_json_strips_fences() {
        let fenced = "```json\n{\"action\":\"pass\"}\n```";
        assert_eq!(extract_json(fenced), "{\"action\":\"pass\"}");

        let bare_fence = "```\n{\"action\":\"pass\"}\n```";
        assert_eq!(extract_json(bare_fence), "{\"action\":\"pass\"}");
    }

    #[test]
    fn invocation_parse_applies_repair_pass() {
        let inv = Invocation {
            text: "```json\n{\"action\": \"__user__\"}\n```".into(),
            usage: Usage::default(),
        };
        let probe: Probe = inv.parse().unwrap();
        assert_eq!(probe.action, "__user__");
    }

    #[test]
    fn invocation_parse_flags_schema_violation() {
        let inv = Invocation {
            text: "Sure! Here are some great options.".into(),
            usage: Usage::default(),
        };
        let err = inv.parse::<Probe>().unwrap_err();
        assert!(matches!(err, CartwheelError::Llm(_)));
        assert!(!err.is_transient());
    }
}
