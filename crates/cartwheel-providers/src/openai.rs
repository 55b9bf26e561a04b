//! OpenAI-compatible chat completions client.
//!
//! Speaks `/v1/chat/completions` with `response_format: json_schema` for
//! structured replies. Also the base for any OpenAI-compatible gateway
//! (OpenRouter, vLLM, Ollama's compat endpoint) via `base_url`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use cartwheel_core::config::ProviderConfig;
use cartwheel_core::error::{CartwheelError, Result};

use crate::{Invocation, InvokeRequest, LlmProvider, Usage};

const OPENAI_BASE_URL: &str = "https://api.openai.com";
const DEFAULT_MODEL: &str = "gpt-4o-mini";

pub struct OpenAiCompatProvider {
    provider_id: String,
    base_url: String,
    api_key: Option<String>,
    model: String,
    client: reqwest::Client,
}

impl OpenAiCompatProvider {
    pub fn new(id: impl Into<String>, base_url: Option<&str>, api_key: Option<String>, model: Option<&str>) -> Self {
        Self {
            provider_id: id.into(),
            base_url: base_url
                .unwrap_or(OPENAI_BASE_URL)
                .trim_end_matches('/')
                .to_string(),
            api_key,
            model: model.unwrap_or(DEFAULT_MODEL).to_string(),
            client: reqwest::Client::new(),
        }
    }

    pub fn from_config(config: &ProviderConfig) -> Self {
        Self::new(
            config.id.clone(),
            config.base_url.as_deref(),
            config.resolve_api_key(),
            config.default_model.as_deref(),
        )
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn build_body(&self, request: &InvokeRequest) -> ChatRequest {
        let mut messages = Vec::with_capacity(request.messages.len() + 1);
        if !request.system.is_empty() {
            messages.push(json!({ "role": "system", "content": request.system }));
        }
        for m in &request.messages {
            messages.push(json!({ "role": m.role, "content": m.content }));
        }

        let response_format = request.schema.as_ref().map(|schema| {
            json!({
                "type": "json_schema",
                "json_schema": {
                    "name": request.agent,
                    "schema": schema,
                    "strict": true,
                }
            })
        });

        ChatRequest {
            model: self.model.clone(),
            messages,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            response_format,
        }
    }
}

// --- Wire types ---

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<serde_json::Value>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

#[async_trait]
impl LlmProvider for OpenAiCompatProvider {
    fn id(&self) -> &str {
        &self.provider_id
    }

    async fn invoke(&self, request: &InvokeRequest) -> Result<Invocation> {
        let body = self.build_body(request);

        debug!(
            provider = %self.provider_id,
            agent = %request.agent,
            model = %body.model,
            "Invoking chat completion"
        );

        let mut req_builder = self
            .client
            .post(format!("{}/v1/chat/completions", self.base_url))
            .header("content-type", "application/json");
        if let Some(key) = &self.api_key {
            req_builder = req_builder.header("authorization", format!("Bearer {key}"));
        }

        let send = req_builder.json(&body).send();
        let response = match tokio::time::timeout(request.timeout, send).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) if e.is_timeout() => {
                return Err(CartwheelError::LlmTimeout(request.timeout));
            }
            Ok(Err(e)) => {
                return Err(CartwheelError::LlmUnavailable(format!(
                    "{}: {e}",
                    self.provider_id
                )));
            }
            Err(_) => return Err(CartwheelError::LlmTimeout(request.timeout)),
        };

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            // 429 and 5xx are worth a retry or a failover hop
            if status.as_u16() == 429 || status.is_server_error() {
                return Err(CartwheelError::LlmUnavailable(format!(
                    "{} returned {status}: {text}",
                    self.provider_id
                )));
            }
            return Err(CartwheelError::Llm(format!(
                "{} returned {status}: {text}",
                self.provider_id
            )));
        }

        let parsed: ChatResponse = match tokio::time::timeout(request.timeout, response.json()).await
        {
            Ok(Ok(parsed)) => parsed,
            Ok(Err(e)) => {
                return Err(CartwheelError::Llm(format!(
                    "{} sent an unparseable body: {e}",
                    self.provider_id
                )));
            }
            Err(_) => return Err(CartwheelError::LlmTimeout(request.timeout)),
        };

        let text = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| {
                CartwheelError::Llm(format!("{} returned no content", self.provider_id))
            })?;

        let usage = parsed
            .usage
            .map(|u| Usage {
                input_tokens: u.prompt_tokens,
                output_tokens: u.completion_tokens,
            })
            .unwrap_or_default();

        Ok(Invocation { text, usage })
    }
}
