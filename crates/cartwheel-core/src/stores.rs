//! Downstream-store and auth contracts.
//!
//! These are the core's edges: token verification, chat/message persistence,
//! tracked items, and billing live behind small async traits. None of them
//! sit on the hot path of a turn; persistence calls are fire-and-forget from
//! the session manager. In-memory implementations back tests and
//! single-process deployments.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;

use crate::error::{CartwheelError, Result};
use crate::state::Role;
use crate::types::{Principal, Tier};

/// Verifies a bearer token into a [`Principal`] during the handshake.
#[async_trait]
pub trait TokenAuth: Send + Sync {
    async fn verify(&self, token: &str) -> Result<Principal>;
}

/// Shared-secret verifier. Compares a sha256 digest in constant time and
/// mints a fixed principal, for single-user and test deployments.
pub struct StaticTokenAuth {
    expected: [u8; 32],
    principal: Principal,
}

impl StaticTokenAuth {
    pub fn new(token: &str) -> Self {
        Self::with_principal(
            token,
            Principal {
                user_id: "local".into(),
                email: "local@cartwheel.dev".into(),
                tier: Tier::Pro,
                credits_balance: 0,
            },
        )
    }

    pub fn with_principal(token: &str, principal: Principal) -> Self {
        Self {
            expected: Sha256::digest(token.as_bytes()).into(),
            principal,
        }
    }
}

#[async_trait]
impl TokenAuth for StaticTokenAuth {
    async fn verify(&self, token: &str) -> Result<Principal> {
        let digest: [u8; 32] = Sha256::digest(token.as_bytes()).into();
        if constant_time_eq(&digest, &self.expected) {
            Ok(self.principal.clone())
        } else {
            Err(CartwheelError::Auth("invalid token".into()))
        }
    }
}

/// Rejects every token. Default when no auth is configured, so an
/// unconfigured gateway fails closed.
pub struct DenyAllAuth;

#[async_trait]
impl TokenAuth for DenyAllAuth {
    async fn verify(&self, _token: &str) -> Result<Principal> {
        Err(CartwheelError::Auth("auth is not configured".into()))
    }
}

fn constant_time_eq(a: &[u8; 32], b: &[u8; 32]) -> bool {
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// A conversation as the chat store sees it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRecord {
    pub id: String,
    pub user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Wire format of a persisted chat message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: String,
    pub chat_id: String,
    pub role: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

#[async_trait]
pub trait ChatStore: Send + Sync {
    async fn upsert_chat(&self, chat: ChatRecord) -> Result<()>;
    async fn get_chat(&self, chat_id: &str) -> Result<Option<ChatRecord>>;
    async fn list_chats(&self, user_id: &str) -> Result<Vec<ChatRecord>>;
    async fn delete_chat(&self, chat_id: &str) -> Result<()>;
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn append(&self, message: StoredMessage) -> Result<()>;
    async fn list(&self, chat_id: &str) -> Result<Vec<StoredMessage>>;
}

/// A product a user follows for price movements.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackedItem {
    pub user_id: String,
    pub product_id: String,
    pub url: String,
    pub name: String,
    pub price_at_add: f64,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait TrackedItemStore: Send + Sync {
    async fn add(&self, item: TrackedItem) -> Result<()>;
    async fn remove(&self, user_id: &str, product_id: &str) -> Result<()>;
    async fn list(&self, user_id: &str) -> Result<Vec<TrackedItem>>;
}

#[async_trait]
pub trait BillingStore: Send + Sync {
    /// Deduct credits transactionally; returns the new balance.
    async fn deduct_credits(&self, user_id: &str, amount: i64, reason: &str) -> Result<i64>;
}

// --- In-memory implementations ---

#[derive(Default)]
pub struct MemoryChatStore {
    chats: RwLock<HashMap<String, ChatRecord>>,
}

#[async_trait]
impl ChatStore for MemoryChatStore {
    async fn upsert_chat(&self, chat: ChatRecord) -> Result<()> {
        self.chats.write().await.insert(chat.id.clone(), chat);
        Ok(())
    }

    async fn get_chat(&self, chat_id: &str) -> Result<Option<ChatRecord>> {
        Ok(self.chats.read().await.get(chat_id).cloned())
    }

    async fn list_chats(&self, user_id: &str) -> Result<Vec<ChatRecord>> {
        let mut chats: Vec<ChatRecord> = self
            .chats
            .read()
            .await
            .values()
            .filter(|c| c.user_id == user_id)
            .cloned()
            .collect();
        chats.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(chats)
    }

    async fn delete_chat(&self, chat_id: &str) -> Result<()> {
        self.chats.write().await.remove(chat_id);
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryMessageStore {
    messages: RwLock<HashMap<String, Vec<StoredMessage>>>,
}

#[async_trait]
impl MessageStore for MemoryMessageStore {
    async fn append(&self, message: StoredMessage) -> Result<()> {
        self.messages
            .write()
            .await
            .entry(message.chat_id.clone())
            .or_default()
            .push(message);
        Ok(())
    }

    async fn list(&self, chat_id: &str) -> Result<Vec<StoredMessage>> {
        Ok(self
            .messages
            .read()
            .await
            .get(chat_id)
            .cloned()
            .unwrap_or_default())
    }
}

#[derive(Default)]
pub struct MemoryTrackedItemStore {
    items: RwLock<Vec<TrackedItem>>,
}

#[async_trait]
impl TrackedItemStore for MemoryTrackedItemStore {
    async fn add(&self, item: TrackedItem) -> Result<()> {
        let mut items = self.items.write().await;
        items.retain(|i| !(i.user_id == item.user_id && i.product_id == item.product_id));
        items.push(item);
        Ok(())
    }

    async fn remove(&self, user_id: &str, product_id: &str) -> Result<()> {
        self.items
            .write()
            .await
            .retain(|i| !(i.user_id == user_id && i.product_id == product_id));
        Ok(())
    }

    async fn list(&self, user_id: &str) -> Result<Vec<TrackedItem>> {
        Ok(self
            .items
            .read()
            .await
            .iter()
            .filter(|i| i.user_id == user_id)
            .cloned()
            .collect())
    }
}

pub struct MemoryBillingStore {
    balances: RwLock<HashMap<String, i64>>,
}

impl MemoryBillingStore {
    pub fn new() -> Self {
        Self {
            balances: RwLock::new(HashMap::new()),
        }
    }

    pub async fn set_balance(&self, user_id: &str, balance: i64) {
        self.balances.write().await.insert(user_id.into(), balance);
    }
}

impl Default for MemoryBillingStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BillingStore for MemoryBillingStore {
    async fn deduct_credits(&self, user_id: &str, amount: i64, reason: &str) -> Result<i64> {
        let mut balances = self.balances.write().await;
        let balance = balances.entry(user_id.into()).or_insert(0);
        if *balance < amount {
            return Err(CartwheelError::Store(format!(
                "insufficient credits for '{reason}': balance {balance}, needed {amount}"
            )));
        }
        *balance -= amount;
        Ok(*balance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_auth_accepts_exact_token_only() {
        let auth = StaticTokenAuth::new("hunter2");
        let principal = auth.verify("hunter2").await.unwrap();
        assert_eq!(principal.user_id, "local");
        assert!(matches!(
            auth.verify("hunter3").await,
            Err(CartwheelError::Auth(_))
        ));
        assert!(auth.verify("").await.is_err());
    }

    #[tokio::test]
    async fn deny_all_rejects_everything() {
        assert!(DenyAllAuth.verify("anything").await.is_err());
    }

    #[tokio::test]
    async fn chat_store_round_trip() {
        let store = MemoryChatStore::default();
        let now = Utc::now();
        store
            .upsert_chat(ChatRecord {
                id: "c1".into(),
                user_id: "u1".into(),
                title: Some("laptops".into()),
                created_at: now,
                updated_at: now,
            })
            .await
            .unwrap();

        assert!(store.get_chat("c1").await.unwrap().is_some());
        assert_eq!(store.list_chats("u1").await.unwrap().len(), 1);
        assert!(store.list_chats("u2").await.unwrap().is_empty());

        store.delete_chat("c1").await.unwrap();
        assert!(store.get_chat("c1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn message_store_keeps_order() {
        let store = MemoryMessageStore::default();
        for (i, role) in [(0, Role::User), (1, Role::Assistant)] {
            store
                .append(StoredMessage {
                    id: format!("m{i}"),
                    chat_id: "c1".into(),
                    role,
                    content: format!("msg {i}"),
                    created_at: Utc::now(),
                    metadata: serde_json::Value::Null,
                })
                .await
                .unwrap();
        }
        let messages = store.list("c1").await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].id, "m0");
        assert_eq!(messages[1].role, Role::Assistant);
    }

    #[tokio::test]
    async fn billing_rejects_overdraft() {
        let store = MemoryBillingStore::new();
        store.set_balance("u1", 10).await;
        assert_eq!(store.deduct_credits("u1", 4, "search").await.unwrap(), 6);
        assert!(store.deduct_credits("u1", 100, "search").await.is_err());
        assert_eq!(store.deduct_credits("u1", 6, "search").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn tracked_items_dedupe_on_add() {
        let store = MemoryTrackedItemStore::default();
        let item = TrackedItem {
            user_id: "u1".into(),
            product_id: "p1".into(),
            url: "https://shop.example/p/1".into(),
            name: "Lenovo IdeaPad 3".into(),
            price_at_add: 285_000.0,
            created_at: Utc::now(),
        };
        store.add(item.clone()).await.unwrap();
        store.add(item).await.unwrap();
        assert_eq!(store.list("u1").await.unwrap().len(), 1);
        store.remove("u1", "p1").await.unwrap();
        assert!(store.list("u1").await.unwrap().is_empty());
    }
}
