//! Turn checkpoints: the state snapshot that lets a suspended conversation
//! survive across user turns (and, with a durable store, restarts).

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use cartwheel_core::error::Result;
use cartwheel_core::state::ConversationState;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub state: ConversationState,
    pub saved_at: DateTime<Utc>,
}

/// Persistence seam for `(session_id -> state)`. The runtime saves after
/// every transition; the gateway loads on reconnect and deletes on session
/// close.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn save(&self, state: &ConversationState) -> Result<()>;
    async fn load(&self, session_id: &str) -> Result<Option<ConversationState>>;
    async fn delete(&self, session_id: &str) -> Result<()>;
}

/// The in-process store: good for one node, gone on restart.
#[derive(Default)]
pub struct MemoryCheckpointStore {
    inner: RwLock<HashMap<String, Checkpoint>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn save(&self, state: &ConversationState) -> Result<()> {
        let checkpoint = Checkpoint {
            state: state.clone(),
            saved_at: Utc::now(),
        };
        self.inner
            .write()
            .await
            .insert(state.session_id.clone(), checkpoint);
        Ok(())
    }

    async fn load(&self, session_id: &str) -> Result<Option<ConversationState>> {
        Ok(self
            .inner
            .read()
            .await
            .get(session_id)
            .map(|c| c.state.clone()))
    }

    async fn delete(&self, session_id: &str) -> Result<()> {
        self.inner.write().await.remove(session_id);
        Ok(())
    }
}
