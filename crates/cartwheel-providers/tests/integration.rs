//! Provider integration tests — real API calls.
//!
//! These tests are skipped when `OPENAI_API_KEY` is not set.
//! Run with: `cargo test -p cartwheel-providers --test integration`

use cartwheel_providers::{
    cosine_similarity, ChatMessage, Embedder, HttpEmbedder, InvokeRequest, LlmProvider,
    OpenAiCompatProvider,
};
use serde::Deserialize;
use serde_json::json;

fn openai_key() -> Option<String> {
    std::env::var("OPENAI_API_KEY")
        .ok()
        .filter(|k| !k.is_empty())
}

fn openai_provider(api_key: String) -> OpenAiCompatProvider {
    OpenAiCompatProvider::new("openai", None, Some(api_key), Some("gpt-4o-mini"))
}

#[tokio::test]
async fn test_openai_invoke() {
    let Some(api_key) = openai_key() else {
        eprintln!("Skipping: OPENAI_API_KEY not set");
        return;
    };

    let provider = openai_provider(api_key);
    let mut request = InvokeRequest::new(
        "writer_agent",
        "You are a helpful assistant. Follow instructions exactly.",
    )
    .with_messages(vec![ChatMessage::user(
        "Reply with exactly the word 'hello'.",
    )]);
    request.max_tokens = 50;
    request.temperature = Some(0.0);

    let invocation = provider.invoke(&request).await;
    assert!(invocation.is_ok(), "Invoke failed: {:?}", invocation.err());

    let invocation = invocation.unwrap();
    assert!(
        invocation.text.to_lowercase().contains("hello"),
        "Expected 'hello' in response, got: {}",
        invocation.text
    );
    assert!(invocation.usage.total() > 0, "No token usage reported");
}

#[tokio::test]
async fn test_openai_schema_invoke() {
    let Some(api_key) = openai_key() else {
        eprintln!("Skipping: OPENAI_API_KEY not set");
        return;
    };

    #[derive(Deserialize)]
    struct Answer {
        word: String,
    }

    let provider = openai_provider(api_key);
    let mut request = InvokeRequest::new(
        "planner_agent",
        "You are a helpful assistant. Reply with JSON only.",
    )
    .with_messages(vec![ChatMessage::user(
        "What is the English greeting? Answer as {\"word\": ...}.",
    )])
    .with_schema(json!({
        "type": "object",
        "properties": { "word": { "type": "string" } },
        "required": ["word"],
        "additionalProperties": false
    }));
    request.max_tokens = 50;
    request.temperature = Some(0.0);

    let invocation = provider.invoke(&request).await;
    assert!(invocation.is_ok(), "Invoke failed: {:?}", invocation.err());

    let answer: Answer = invocation
        .unwrap()
        .parse()
        .expect("Reply did not match the requested schema");
    assert!(!answer.word.is_empty(), "Empty answer field");
}

#[tokio::test]
async fn test_openai_embeddings() {
    let Some(api_key) = openai_key() else {
        eprintln!("Skipping: OPENAI_API_KEY not set");
        return;
    };

    let embedder = HttpEmbedder::new(
        "openai",
        "https://api.openai.com",
        Some(api_key),
        Some("text-embedding-3-small"),
    );

    let texts = vec![
        "wireless noise cancelling headphones".to_string(),
        "over-ear bluetooth headphones".to_string(),
    ];
    let vectors = embedder.embed(&texts).await;
    assert!(vectors.is_ok(), "Embed failed: {:?}", vectors.err());

    let vectors = vectors.unwrap();
    assert_eq!(vectors.len(), texts.len(), "Wrong number of vectors");
    assert!(
        vectors.iter().all(|v| v.len() == embedder.dimensions()),
        "Vector dimensions do not match the embedder"
    );

    // Related product queries should land close together.
    let similarity = cosine_similarity(&vectors[0], &vectors[1]);
    assert!(
        similarity > 0.5,
        "Related queries scored too far apart: {similarity}"
    );
}
