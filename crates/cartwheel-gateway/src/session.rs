//! Session registry and the per-session turn driver.
//!
//! One WebSocket connection carries one session. The connection layer feeds
//! validated frames into an mpsc channel; the driver owns the
//! [`ConversationState`] and applies frames strictly in arrival order, one
//! graph turn at a time. Frames that land mid-turn either resume a suspended
//! human node (consumed inside the turn) or wait in the channel for the next
//! loop iteration.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use cartwheel_agents::{Graph, TurnSink};
use cartwheel_core::error::{CartwheelError, Result};
use cartwheel_core::protocol::{EgressFrame, IngressFrame, ProgressStatus, RequestType};
use cartwheel_core::state::{ConversationState, HistoryEntry, Role};
use cartwheel_core::stores::{ChatRecord, ChatStore, MessageStore, StoredMessage};
use cartwheel_core::types::SearchResult;

use crate::egress::EgressStream;
use crate::state::GatewayState;

/// Registration of a live session.
pub struct SessionHandle {
    pub session_id: String,
    /// Which connection currently owns the session.
    pub connection_id: String,
    pub cancel: CancellationToken,
}

/// Live sessions of this process, keyed by session id.
#[derive(Default)]
pub struct SessionManager {
    sessions: DashMap<String, SessionHandle>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Register a session. A reconnect with the same session id displaces
    /// the previous connection, which gets cancelled.
    pub fn insert(&self, handle: SessionHandle) {
        if let Some(previous) = self.sessions.insert(handle.session_id.clone(), handle) {
            info!(
                session_id = %previous.session_id,
                "session taken over by a new connection"
            );
            previous.cancel.cancel();
        }
    }

    /// Drop the registration, but only if `connection_id` still owns it.
    pub fn remove(&self, session_id: &str, connection_id: &str) {
        self.sessions
            .remove_if(session_id, |_, handle| handle.connection_id == connection_id);
    }

    /// Wind down every live session (process shutdown).
    pub fn cancel_all(&self) {
        for entry in self.sessions.iter() {
            entry.cancel.cancel();
        }
    }
}

/// Owns one conversation and turns inbound frames into graph runs.
pub struct SessionDriver {
    gateway: Arc<GatewayState>,
    conversation: ConversationState,
    sink: EgressStream,
    cancel: CancellationToken,
}

impl SessionDriver {
    pub fn new(
        gateway: Arc<GatewayState>,
        conversation: ConversationState,
        sink: EgressStream,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            gateway,
            conversation,
            sink,
            cancel,
        }
    }

    pub async fn run(mut self, mut ingress: mpsc::Receiver<IngressFrame>) {
        loop {
            let frame = tokio::select! {
                _ = self.cancel.cancelled() => break,
                frame = ingress.recv() => match frame {
                    Some(frame) => frame,
                    None => break,
                },
            };

            self.handle_frame(frame, &mut ingress).await;

            if self.conversation.chat_finished {
                info!(
                    session_id = %self.conversation.session_id,
                    chat_count = self.conversation.chat_count,
                    "conversation sealed, closing the session"
                );
                self.cancel.cancel();
                break;
            }
        }

        if self.conversation.chat_finished {
            let checkpoints = self.gateway.runtime.checkpoints();
            if let Err(e) = checkpoints.delete(&self.conversation.session_id).await {
                warn!(
                    session_id = %self.conversation.session_id,
                    error = %e,
                    "failed to delete the finished session's checkpoint"
                );
            }
        }
        self.gateway
            .sessions
            .remove(&self.conversation.session_id, &self.conversation.connection_id);
        debug!(session_id = %self.conversation.session_id, "session driver stopped");
    }

    async fn handle_frame(
        &mut self,
        frame: IngressFrame,
        ingress: &mut mpsc::Receiver<IngressFrame>,
    ) {
        if frame.kind == RequestType::ProductDetails {
            if let Err(e) = self.serve_product_details(&frame).await {
                self.report(e).await;
            }
            return;
        }

        let turn_started = Utc::now();
        let focus = frame.data.focus_mode.unwrap_or_default();
        let graph = Graph::for_turn(frame.kind, focus);
        self.conversation.begin_turn(frame);
        #[cfg(feature = "metrics")]
        let clock = std::time::Instant::now();

        let outcome = self
            .gateway
            .runtime
            .run_turn(
                &graph,
                &mut self.conversation,
                &self.sink,
                &self.cancel,
                ingress,
            )
            .await;
        #[cfg(feature = "metrics")]
        crate::metrics::record_turn(graph.name(), clock.elapsed().as_secs_f64());
        match outcome {
            Ok(()) => self.persist_turn(turn_started),
            Err(CartwheelError::Cancelled) => {}
            Err(e) => self.report(e).await,
        }
    }

    /// Details are a lookup, not a conversation turn: no graph, no history.
    async fn serve_product_details(&self, frame: &IngressFrame) -> Result<()> {
        let Some(product_id) = frame.data.product_id.as_deref() else {
            return Err(CartwheelError::Validation(
                "PRODUCT_DETAILS_REQUEST needs productId".into(),
            ));
        };
        self.sink
            .send(EgressFrame::progress(ProgressStatus::Searching))
            .await?;

        let detail = self
            .gateway
            .engine
            .product_detail(&self.cancel, product_id, false)
            .await?;

        let card = SearchResult {
            product_id: detail.product_id.clone(),
            name: detail.name.clone(),
            brand: detail.brand.clone(),
            category: detail.category.clone(),
            url: detail.url.clone(),
            image: detail.images.first().cloned(),
            current_price: detail.current_price,
            original_price: detail.original_price,
            rating: detail.rating,
            source: detail.source.clone(),
            relevance_score: None,
        };
        self.sink
            .send(EgressFrame::Products {
                content: vec![card],
            })
            .await?;

        let text = match &detail.description {
            Some(description) => description.clone(),
            None => format!(
                "{}: {:.2} ({})",
                detail.name, detail.current_price, detail.source
            ),
        };
        self.sink.stream_text(&text).await?;
        self.sink.message_end().await
    }

    async fn report(&self, error: CartwheelError) {
        warn!(
            session_id = %self.conversation.session_id,
            error = %error,
            "turn failed"
        );
        #[cfg(feature = "metrics")]
        crate::metrics::record_error(error.wire_key());
        if self.sink.send(EgressFrame::from_error(&error)).await.is_err() {
            debug!("egress closed while reporting an error");
        }
    }

    /// Mirror the turn's new history entries into the durable chat record.
    /// Fire-and-forget: persistence never holds up the next frame.
    fn persist_turn(&self, turn_started: DateTime<Utc>) {
        let entries: Vec<HistoryEntry> = self
            .conversation
            .message_history
            .iter()
            .filter(|e| e.timestamp >= turn_started)
            .cloned()
            .collect();
        if entries.is_empty() {
            return;
        }

        let chat_id = self
            .conversation
            .ws_message
            .as_ref()
            .and_then(|m| m.data.chat_id.clone())
            .unwrap_or_else(|| self.conversation.session_id.clone());
        let user_id = self.conversation.user_id.clone();
        let chats = self.gateway.chats.clone();
        let messages = self.gateway.messages.clone();

        tokio::spawn(async move {
            if let Err(e) = record_turn(chats, messages, chat_id, user_id, entries).await {
                warn!(error = %e, "failed to persist turn history");
            }
        });
    }
}

async fn record_turn(
    chats: Arc<dyn ChatStore>,
    messages: Arc<dyn MessageStore>,
    chat_id: String,
    user_id: String,
    entries: Vec<HistoryEntry>,
) -> Result<()> {
    let now = Utc::now();
    let mut record = match chats.get_chat(&chat_id).await? {
        Some(existing) => existing,
        None => ChatRecord {
            id: chat_id.clone(),
            user_id,
            title: entries
                .iter()
                .find(|e| e.role == Role::User)
                .map(|e| chat_title(&e.content)),
            created_at: now,
            updated_at: now,
        },
    };
    record.updated_at = now;
    chats.upsert_chat(record).await?;

    for entry in entries {
        messages
            .append(StoredMessage {
                id: Uuid::new_v4().to_string(),
                chat_id: chat_id.clone(),
                role: entry.role,
                content: entry.content,
                created_at: entry.timestamp,
                metadata: Value::Null,
            })
            .await?;
    }
    Ok(())
}

/// First user line, clipped for the chat list.
fn chat_title(content: &str) -> String {
    const MAX_CHARS: usize = 60;
    if content.chars().count() <= MAX_CHARS {
        return content.to_string();
    }
    let clipped: String = content.chars().take(MAX_CHARS).collect();
    format!("{clipped}...")
}

#[cfg(test)]
mod tests {
    use super::*;

    use cartwheel_core::stores::{MemoryChatStore, MemoryMessageStore};

    #[test]
    fn titles_are_clipped_on_a_char_boundary() {
        assert_eq!(chat_title("cheap laptop"), "cheap laptop");
        let long = "a".repeat(80);
        let title = chat_title(&long);
        assert_eq!(title.chars().count(), 63);
        assert!(title.ends_with("..."));
    }

    #[tokio::test]
    async fn record_turn_creates_then_extends_the_chat() {
        let chats: Arc<dyn ChatStore> = Arc::new(MemoryChatStore::default());
        let messages: Arc<dyn MessageStore> = Arc::new(MemoryMessageStore::default());

        let first = vec![
            HistoryEntry::now(Role::User, "need a cheap lenovo laptop"),
            HistoryEntry::now(Role::Assistant, "Here are two options."),
        ];
        record_turn(
            chats.clone(),
            messages.clone(),
            "chat-1".into(),
            "u1".into(),
            first,
        )
        .await
        .unwrap();

        let record = chats.get_chat("chat-1").await.unwrap().unwrap();
        assert_eq!(record.title.as_deref(), Some("need a cheap lenovo laptop"));
        assert_eq!(record.user_id, "u1");
        let created_at = record.created_at;

        let second = vec![
            HistoryEntry::now(Role::User, "anything under 200000?"),
            HistoryEntry::now(Role::Assistant, "The V15 fits."),
        ];
        record_turn(
            chats.clone(),
            messages.clone(),
            "chat-1".into(),
            "u1".into(),
            second,
        )
        .await
        .unwrap();

        // The original title and creation time survive later turns.
        let record = chats.get_chat("chat-1").await.unwrap().unwrap();
        assert_eq!(record.title.as_deref(), Some("need a cheap lenovo laptop"));
        assert_eq!(record.created_at, created_at);

        let stored = messages.list("chat-1").await.unwrap();
        assert_eq!(stored.len(), 4);
        assert_eq!(stored[0].role, Role::User);
        assert_eq!(stored[3].content, "The V15 fits.");
    }

    #[test]
    fn reconnect_displaces_the_previous_holder() {
        let manager = SessionManager::new();
        let old_cancel = CancellationToken::new();
        manager.insert(SessionHandle {
            session_id: "s1".into(),
            connection_id: "c1".into(),
            cancel: old_cancel.clone(),
        });
        assert_eq!(manager.len(), 1);

        manager.insert(SessionHandle {
            session_id: "s1".into(),
            connection_id: "c2".into(),
            cancel: CancellationToken::new(),
        });
        assert!(old_cancel.is_cancelled());
        assert_eq!(manager.len(), 1);

        // The displaced connection's cleanup must not evict the new holder.
        manager.remove("s1", "c1");
        assert_eq!(manager.len(), 1);
        manager.remove("s1", "c2");
        assert!(manager.is_empty());
    }
}
