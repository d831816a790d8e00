use std::{
    collections::HashMap,
    sync::atomic::{AtomicBool, Ordering},
};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::{
    error::{ChatError, ChatResult},
    types::{ConversationSummary, Message},
};

use super::MessageStore;

/// In-process store for running without Postgres and for tests.
#[derive(Default)]
pub struct MemoryMessageStore {
    messages: RwLock<HashMap<String, Vec<Message>>>,
    conversations: RwLock<HashMap<String, ConversationSummary>>,
    fail_appends: AtomicBool,
    fail_deletes: AtomicBool,
}

impl MemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every following `append_message` fail until switched back.
    pub fn set_fail_appends(&self, fail: bool) {
        self.fail_appends.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_deletes(&self, fail: bool) {
        self.fail_deletes.store(fail, Ordering::SeqCst);
    }

    pub async fn message_count(&self, channel_id: &str) -> usize {
        self.messages
            .read()
            .await
            .get(channel_id)
            .map(Vec::len)
            .unwrap_or(0)
    }

    pub async fn conversation(&self, channel_id: &str) -> Option<ConversationSummary> {
        self.conversations.read().await.get(channel_id).cloned()
    }
}

#[async_trait]
impl MessageStore for MemoryMessageStore {
    async fn fetch_history(&self, channel_id: &str, limit: usize) -> ChatResult<Vec<Message>> {
        let messages = self.messages.read().await;
        let Some(history) = messages.get(channel_id) else {
            return Ok(Vec::new());
        };
        let skip = history.len().saturating_sub(limit);
        Ok(history[skip..].to_vec())
    }

    async fn append_message(&self, message: &Message) -> ChatResult<()> {
        if self.fail_appends.load(Ordering::SeqCst) {
            return Err(ChatError::Persistence("message store unavailable".into()));
        }
        let mut messages = self.messages.write().await;
        let history = messages.entry(message.channel_id.clone()).or_default();
        if !history.iter().any(|stored| stored.id == message.id) {
            history.push(message.clone());
        }
        Ok(())
    }

    async fn delete_conversation(&self, channel_id: &str) -> ChatResult<u64> {
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(ChatError::Persistence("message store unavailable".into()));
        }
        let removed = self
            .messages
            .write()
            .await
            .remove(channel_id)
            .map(|history| history.len() as u64)
            .unwrap_or(0);
        self.conversations.write().await.remove(channel_id);
        Ok(removed)
    }

    async fn load_conversations(&self) -> ChatResult<Vec<ConversationSummary>> {
        Ok(self.conversations.read().await.values().cloned().collect())
    }

    async fn save_conversation(&self, summary: &ConversationSummary) -> ChatResult<()> {
        self.conversations
            .write()
            .await
            .insert(summary.channel_id.clone(), summary.clone());
        Ok(())
    }
}
