//! Conversation persistence interface
//!
//! Relational storage lives outside the core; the orchestrator only needs
//! create/read/update for conversations and an append-only message log with a
//! store-assigned sequence. `InMemoryConversationStore` backs tests and demos.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;

use crate::types::{Conversation, Message};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("conversation {0} not found")]
    NotFound(String),
    #[error("conversation {0} already exists")]
    Conflict(String),
    #[error("store backend error: {0}")]
    Backend(String),
}

/// A message as persisted, with its position in the conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredMessage {
    /// Strictly increasing per conversation, starting at 1.
    pub seq: u64,
    pub conversation_id: String,
    pub message: Message,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn create(&self, conversation: Conversation) -> Result<(), StoreError>;

    /// Fetch a conversation owned by `owner`; other owners see `None`.
    async fn get(&self, owner: &str, id: &str) -> Result<Option<Conversation>, StoreError>;

    async fn update(&self, conversation: Conversation) -> Result<(), StoreError>;

    /// Append messages atomically, in order.
    async fn append(
        &self,
        conversation_id: &str,
        messages: Vec<Message>,
    ) -> Result<Vec<StoredMessage>, StoreError>;

    /// The last `limit` messages in sequence order, or all of them.
    async fn messages(
        &self,
        conversation_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<StoredMessage>, StoreError>;
}

#[derive(Default)]
struct Entry {
    conversation: Option<Conversation>,
    messages: Vec<StoredMessage>,
}

#[derive(Default)]
pub struct InMemoryConversationStore {
    entries: RwLock<HashMap<String, Entry>>,
}

impl InMemoryConversationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConversationStore for InMemoryConversationStore {
    async fn create(&self, conversation: Conversation) -> Result<(), StoreError> {
        let mut entries = self.entries.write().await;
        let entry = entries.entry(conversation.id.clone()).or_default();
        if entry.conversation.is_some() {
            return Err(StoreError::Conflict(conversation.id));
        }
        entry.conversation = Some(conversation);
        Ok(())
    }

    async fn get(&self, owner: &str, id: &str) -> Result<Option<Conversation>, StoreError> {
        let entries = self.entries.read().await;
        Ok(entries
            .get(id)
            .and_then(|e| e.conversation.as_ref())
            .filter(|c| c.owner == owner)
            .cloned())
    }

    async fn update(&self, conversation: Conversation) -> Result<(), StoreError> {
        let mut entries = self.entries.write().await;
        let entry = entries
            .get_mut(&conversation.id)
            .filter(|e| e.conversation.is_some())
            .ok_or_else(|| StoreError::NotFound(conversation.id.clone()))?;
        entry.conversation = Some(conversation);
        Ok(())
    }

    async fn append(
        &self,
        conversation_id: &str,
        messages: Vec<Message>,
    ) -> Result<Vec<StoredMessage>, StoreError> {
        let mut entries = self.entries.write().await;
        let entry = entries
            .get_mut(conversation_id)
            .filter(|e| e.conversation.is_some())
            .ok_or_else(|| StoreError::NotFound(conversation_id.to_string()))?;
        let mut next = entry.messages.last().map(|m| m.seq).unwrap_or(0);
        let now = Utc::now();
        let stored: Vec<StoredMessage> = messages
            .into_iter()
            .map(|message| {
                next += 1;
                StoredMessage {
                    seq: next,
                    conversation_id: conversation_id.to_string(),
                    message,
                    created_at: now,
                }
            })
            .collect();
        entry.messages.extend(stored.iter().cloned());
        Ok(stored)
    }

    async fn messages(
        &self,
        conversation_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<StoredMessage>, StoreError> {
        let entries = self.entries.read().await;
        let entry = entries
            .get(conversation_id)
            .ok_or_else(|| StoreError::NotFound(conversation_id.to_string()))?;
        let all = &entry.messages;
        let skip = limit.map(|l| all.len().saturating_sub(l)).unwrap_or(0);
        Ok(all[skip..].to_vec())
    }
}
