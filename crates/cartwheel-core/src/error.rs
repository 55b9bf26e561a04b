use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CartwheelError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Auth error: {0}")]
    Auth(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("LLM call timed out after {0:?}")]
    LlmTimeout(Duration),

    #[error("LLM unavailable: {0}")]
    LlmUnavailable(String),

    #[error("LLM error: {0}")]
    Llm(String),

    #[error("Integration '{integration}' failed: {message}")]
    Integration { integration: String, message: String },

    /// Network-level integration failure (timeout, connect, 5xx / 429);
    /// worth a retry, unlike [`CartwheelError::Integration`].
    #[error("Integration '{integration}' unavailable: {message}")]
    IntegrationUnavailable { integration: String, message: String },

    #[error("no items found for query '{0}'")]
    NoItemFound(String),

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("queue wait exceeded {0:?}")]
    QueueTimeout(Duration),

    #[error("cancelled")]
    Cancelled,

    #[error("chat limit of {limit} messages reached")]
    ChatLimitExceeded { limit: u32 },

    #[error("Session error: {0}")]
    Session(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, CartwheelError>;

/// WebSocket close code sent when authentication fails.
pub const CLOSE_AUTH_FAILED: u16 = 4001;

impl CartwheelError {
    /// Whether a retry with backoff has any chance of succeeding.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CartwheelError::LlmTimeout(_)
                | CartwheelError::LlmUnavailable(_)
                | CartwheelError::IntegrationUnavailable { .. }
                | CartwheelError::RateLimited { .. }
        )
    }

    /// Error key emitted on the wire for this error, if it surfaces as a frame.
    pub fn wire_key(&self) -> &'static str {
        match self {
            CartwheelError::Validation(_) | CartwheelError::Json(_) => "JSON_DECODE_ERROR",
            CartwheelError::LlmTimeout(_)
            | CartwheelError::LlmUnavailable(_)
            | CartwheelError::Llm(_) => "AGENT_PROCESSING_ERROR",
            CartwheelError::RateLimited { .. } | CartwheelError::QueueTimeout(_) => "RATE_LIMITED",
            _ => "INTERNAL_SERVER_ERROR",
        }
    }

    /// Close code to use when this error terminates the connection.
    /// `None` means the connection survives the error.
    pub fn close_code(&self) -> Option<u16> {
        match self {
            CartwheelError::Auth(_) => Some(CLOSE_AUTH_FAILED),
            CartwheelError::Io(_) | CartwheelError::Other(_) => Some(1011),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(CartwheelError::LlmTimeout(Duration::from_secs(10)).is_transient());
        assert!(CartwheelError::LlmUnavailable("503".into()).is_transient());
        assert!(
            CartwheelError::IntegrationUnavailable {
                integration: "shop".into(),
                message: "connect refused".into()
            }
            .is_transient()
        );
        assert!(!CartwheelError::Llm("schema mismatch".into()).is_transient());
        assert!(
            !CartwheelError::Integration {
                integration: "shop".into(),
                message: "404".into()
            }
            .is_transient()
        );
        assert!(!CartwheelError::Auth("bad token".into()).is_transient());
    }

    #[test]
    fn auth_errors_close_with_4001() {
        assert_eq!(
            CartwheelError::Auth("expired".into()).close_code(),
            Some(4001)
        );
        assert_eq!(CartwheelError::Validation("bad frame".into()).close_code(), None);
    }

    #[test]
    fn wire_keys() {
        assert_eq!(
            CartwheelError::Validation("x".into()).wire_key(),
            "JSON_DECODE_ERROR"
        );
        assert_eq!(
            CartwheelError::Llm("x".into()).wire_key(),
            "AGENT_PROCESSING_ERROR"
        );
        assert_eq!(
            CartwheelError::RateLimited { retry_after_secs: 1 }.wire_key(),
            "RATE_LIMITED"
        );
        assert_eq!(CartwheelError::Session("x".into()).wire_key(), "INTERNAL_SERVER_ERROR");
    }
}
