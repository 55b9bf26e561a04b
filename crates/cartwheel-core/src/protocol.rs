//! Cartwheel gateway wire protocol.
//!
//! All client communication is JSON-over-WebSocket. Inbound frames carry a
//! request `type` plus a `data` envelope; outbound frames are a small tagged
//! taxonomy (content chunks, progress, sources, images, products, errors).

use serde::{Deserialize, Serialize};

use crate::error::{CartwheelError, Result};
use crate::types::{FocusMode, OptimizationMode, SearchResult};

/// Request kind carried in the ingress `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequestType {
    #[serde(rename = "message")]
    Message,
    #[serde(rename = "FILTER_REQUEST")]
    Filter,
    #[serde(rename = "AGENT_REQUEST")]
    Agent,
    #[serde(rename = "PRODUCT_DETAILS_REQUEST")]
    ProductDetails,
    #[serde(rename = "COMPARE_REQUEST")]
    Compare,
}

/// Client -> Server frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngressFrame {
    #[serde(rename = "type")]
    pub kind: RequestType,
    pub data: IngressData,
}

/// Shared `data` envelope of every ingress frame. Which fields are required
/// depends on the request kind; see [`IngressFrame::validate`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IngressData {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<MessageBody>,
    #[serde(rename = "messageId", skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(rename = "chatId", skip_serializing_if = "Option::is_none")]
    pub chat_id: Option<String>,
    #[serde(rename = "focusMode", skip_serializing_if = "Option::is_none")]
    pub focus_mode: Option<FocusMode>,
    #[serde(rename = "optimizationMode", skip_serializing_if = "Option::is_none")]
    pub optimization_mode: Option<OptimizationMode>,
    #[serde(rename = "productId", skip_serializing_if = "Option::is_none")]
    pub product_id: Option<String>,
    #[serde(rename = "currentProducts", default, skip_serializing_if = "Vec::is_empty")]
    pub current_products: Vec<SearchResult>,
    #[serde(rename = "currentFilters", skip_serializing_if = "Option::is_none")]
    pub current_filters: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageBody {
    pub content: String,
}

impl IngressFrame {
    /// Per-type schema check. A failure is a `ValidationError` surfaced as a
    /// `JSON_DECODE_ERROR` frame; the connection stays open.
    pub fn validate(&self) -> Result<()> {
        let text = self
            .data
            .message
            .as_ref()
            .map(|m| m.content.trim())
            .unwrap_or("");
        match self.kind {
            RequestType::Message | RequestType::Agent => {
                if text.is_empty() {
                    return Err(CartwheelError::Validation(
                        "message.content must be non-empty".into(),
                    ));
                }
            }
            RequestType::Filter => {
                if text.is_empty() && self.data.current_filters.is_none() {
                    return Err(CartwheelError::Validation(
                        "FILTER_REQUEST needs message.content or currentFilters".into(),
                    ));
                }
                if self.data.current_products.is_empty() {
                    return Err(CartwheelError::Validation(
                        "FILTER_REQUEST needs currentProducts".into(),
                    ));
                }
            }
            RequestType::ProductDetails => {
                if self.data.product_id.as_deref().unwrap_or("").is_empty() {
                    return Err(CartwheelError::Validation(
                        "PRODUCT_DETAILS_REQUEST needs productId".into(),
                    ));
                }
            }
            RequestType::Compare => {
                if self.data.current_products.len() < 2 {
                    return Err(CartwheelError::Validation(
                        "COMPARE_REQUEST needs at least two currentProducts".into(),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Message text, if the frame carries one.
    pub fn content(&self) -> Option<&str> {
        self.data.message.as_ref().map(|m| m.content.as_str())
    }
}

/// Progress phase reported while a turn is executing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressStatus {
    Searching,
    Scraping,
    Comment,
}

/// One entry of a `sources` frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceRef {
    pub product_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
}

/// Server -> Client frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EgressFrame {
    /// One streamed content chunk.
    #[serde(rename = "message")]
    Message { content: String },

    /// Terminates the current streamed message.
    #[serde(rename = "messageEnd")]
    MessageEnd,

    /// Eager progress signal, never buffered behind content pacing.
    #[serde(rename = "progress")]
    Progress {
        status: ProgressStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        value: Option<serde_json::Value>,
    },

    #[serde(rename = "sources")]
    Sources { content: Vec<SourceRef> },

    #[serde(rename = "images")]
    Images { content: Vec<String> },

    #[serde(rename = "products")]
    Products { content: Vec<SearchResult> },

    #[serde(rename = "error")]
    Error { data: String, key: String },
}

impl EgressFrame {
    pub fn progress(status: ProgressStatus) -> Self {
        EgressFrame::Progress { status, value: None }
    }

    pub fn progress_comment(text: impl Into<String>) -> Self {
        EgressFrame::Progress {
            status: ProgressStatus::Comment,
            value: Some(serde_json::Value::String(text.into())),
        }
    }

    pub fn from_error(err: &CartwheelError) -> Self {
        EgressFrame::Error {
            data: err.to_string(),
            key: err.wire_key().to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message_frame(content: &str) -> IngressFrame {
        IngressFrame {
            kind: RequestType::Message,
            data: IngressData {
                message: Some(MessageBody {
                    content: content.into(),
                }),
                message_id: Some("m1".into()),
                ..Default::default()
            },
        }
    }

    #[test]
    fn ingress_parses_wire_shape() {
        let raw = r#"{
            "type": "message",
            "data": {
                "message": { "content": "cheap lenovo laptop" },
                "messageId": "abc",
                "chatId": "chat-1",
                "focusMode": "copilot",
                "optimizationMode": "fast"
            }
        }"#;
        let frame: IngressFrame = serde_json::from_str(raw).unwrap();
        assert_eq!(frame.kind, RequestType::Message);
        assert_eq!(frame.content(), Some("cheap lenovo laptop"));
        assert_eq!(frame.data.chat_id.as_deref(), Some("chat-1"));
        assert!(frame.validate().is_ok());
    }

    #[test]
    fn upper_case_request_types_round_trip() {
        for (kind, wire) in [
            (RequestType::Filter, "\"FILTER_REQUEST\""),
            (RequestType::Agent, "\"AGENT_REQUEST\""),
            (RequestType::ProductDetails, "\"PRODUCT_DETAILS_REQUEST\""),
            (RequestType::Compare, "\"COMPARE_REQUEST\""),
        ] {
            assert_eq!(serde_json::to_string(&kind).unwrap(), wire);
        }
    }

    #[test]
    fn empty_message_rejected() {
        let frame = message_frame("   ");
        assert!(matches!(
            frame.validate(),
            Err(CartwheelError::Validation(_))
        ));
    }

    #[test]
    fn details_request_needs_product_id() {
        let frame = IngressFrame {
            kind: RequestType::ProductDetails,
            data: IngressData::default(),
        };
        assert!(frame.validate().is_err());
    }

    #[test]
    fn egress_frames_use_wire_tags() {
        let chunk = EgressFrame::Message {
            content: "hello".into(),
        };
        assert_eq!(
            serde_json::to_string(&chunk).unwrap(),
            r#"{"type":"message","content":"hello"}"#
        );

        let end = serde_json::to_string(&EgressFrame::MessageEnd).unwrap();
        assert_eq!(end, r#"{"type":"messageEnd"}"#);

        let progress = serde_json::to_string(&EgressFrame::progress(ProgressStatus::Searching)).unwrap();
        assert_eq!(progress, r#"{"type":"progress","status":"searching"}"#);

        let err = EgressFrame::from_error(&CartwheelError::Llm("boom".into()));
        let text = serde_json::to_string(&err).unwrap();
        assert!(text.contains("\"key\":\"AGENT_PROCESSING_ERROR\""));
    }
}
