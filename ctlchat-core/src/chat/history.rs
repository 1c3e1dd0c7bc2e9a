//! Conversation storage.
//!
//! Each conversation is an append-only log ordered by creation time. Role
//! alternation is not enforced.

use crate::provider::{Message, Role};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("Conversation {0} not found")]
    NotFound(u64),

    #[error("Conversation store error: {0}")]
    Backend(String),
}

pub type Result<T> = std::result::Result<T, HistoryError>;

/// A persisted message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub role: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl From<&StoredMessage> for Message {
    fn from(message: &StoredMessage) -> Self {
        Message::new(message.role, message.content.clone())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationInfo {
    pub id: u64,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub message_count: usize,
}

/// Ordered message log per conversation id.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Starts an empty conversation and returns its id.
    async fn create(&self, title: Option<&str>) -> Result<u64>;

    async fn append(&self, conversation_id: u64, role: Role, content: &str) -> Result<StoredMessage>;

    /// Every message, oldest first.
    async fn messages(&self, conversation_id: u64) -> Result<Vec<StoredMessage>>;

    async fn list(&self) -> Result<Vec<ConversationInfo>>;
}

struct Conversation {
    title: String,
    created_at: DateTime<Utc>,
    messages: Vec<StoredMessage>,
}

/// Process-local [`ConversationStore`].
#[derive(Default)]
pub struct InMemoryConversationStore {
    conversations: RwLock<HashMap<u64, Conversation>>,
    next_id: AtomicU64,
}

impl InMemoryConversationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConversationStore for InMemoryConversationStore {
    async fn create(&self, title: Option<&str>) -> Result<u64> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let conversation = Conversation {
            title: title.unwrap_or("New Conversation").to_string(),
            created_at: Utc::now(),
            messages: Vec::new(),
        };
        self.conversations.write().await.insert(id, conversation);
        Ok(id)
    }

    async fn append(&self, conversation_id: u64, role: Role, content: &str) -> Result<StoredMessage> {
        let mut conversations = self.conversations.write().await;
        let conversation = conversations
            .get_mut(&conversation_id)
            .ok_or(HistoryError::NotFound(conversation_id))?;

        // Keep creation times non-decreasing even if the clock steps back.
        let now = Utc::now();
        let created_at = conversation
            .messages
            .last()
            .map_or(now, |last| now.max(last.created_at));

        let message = StoredMessage {
            role,
            content: content.to_string(),
            created_at,
        };
        conversation.messages.push(message.clone());
        Ok(message)
    }

    async fn messages(&self, conversation_id: u64) -> Result<Vec<StoredMessage>> {
        self.conversations
            .read()
            .await
            .get(&conversation_id)
            .map(|c| c.messages.clone())
            .ok_or(HistoryError::NotFound(conversation_id))
    }

    async fn list(&self) -> Result<Vec<ConversationInfo>> {
        let conversations = self.conversations.read().await;
        let mut infos: Vec<ConversationInfo> = conversations
            .iter()
            .map(|(id, c)| ConversationInfo {
                id: *id,
                title: c.title.clone(),
                created_at: c.created_at,
                message_count: c.messages.len(),
            })
            .collect();
        infos.sort_by_key(|info| info.id);
        Ok(infos)
    }
}
