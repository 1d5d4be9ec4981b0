//! Persistence edge. The engine writes through; it never reads back on the hot path.

use async_trait::async_trait;
use dashmap::DashMap;
use lifeline_core::{Conversation, ConversationId, Message};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("serialization: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[async_trait]
pub trait ConversationStore: Send + Sync + 'static {
    async fn upsert_message(&self, message: &Message) -> Result<(), StoreError>;
    async fn upsert_conversation(&self, conversation: &Conversation) -> Result<(), StoreError>;
    async fn load_conversation(&self, id: &ConversationId) -> Result<Option<Conversation>, StoreError>;
    /// Messages of one conversation, oldest first.
    async fn messages(&self, id: &ConversationId) -> Result<Vec<Message>, StoreError>;
}

/// In-process store.
#[derive(Default)]
pub struct MemoryStore {
    conversations: DashMap<ConversationId, Conversation>,
    messages: DashMap<ConversationId, Vec<Message>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn conversation_count(&self) -> usize {
        self.conversations.len()
    }
}

#[async_trait]
impl ConversationStore for MemoryStore {
    async fn upsert_message(&self, message: &Message) -> Result<(), StoreError> {
        let mut entry = self.messages.entry(message.conversation_id.clone()).or_default();
        match entry.iter_mut().find(|m| m.id == message.id) {
            Some(existing) => *existing = message.clone(),
            None => entry.push(message.clone()),
        }
        Ok(())
    }

    async fn upsert_conversation(&self, conversation: &Conversation) -> Result<(), StoreError> {
        self.conversations.insert(conversation.id.clone(), conversation.clone());
        Ok(())
    }

    async fn load_conversation(&self, id: &ConversationId) -> Result<Option<Conversation>, StoreError> {
        Ok(self.conversations.get(id).map(|c| c.clone()))
    }

    async fn messages(&self, id: &ConversationId) -> Result<Vec<Message>, StoreError> {
        Ok(self.messages.get(id).map(|m| m.clone()).unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use lifeline_core::{RiskAssessment, SenderRole};

    #[tokio::test]
    async fn upsert_is_idempotent_per_message() {
        let store = MemoryStore::new();
        let conv = Conversation::new(None);
        let msg = Message::new(conv.id.clone(), SenderRole::User, "oi", Utc::now(), RiskAssessment::unassessed(), false);
        store.upsert_message(&msg).await.unwrap();
        store.upsert_message(&msg).await.unwrap();
        assert_eq!(store.messages(&conv.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn conversation_round_trips() {
        let store = MemoryStore::new();
        let mut conv = Conversation::new(Some("Chat".into()));
        store.upsert_conversation(&conv).await.unwrap();
        conv.escalations = 1;
        store.upsert_conversation(&conv).await.unwrap();
        let loaded = store.load_conversation(&conv.id).await.unwrap().unwrap();
        assert_eq!(loaded.escalations, 1);
        assert_eq!(store.conversation_count(), 1);
        assert!(store.load_conversation(&ConversationId::new()).await.unwrap().is_none());
    }
}
