//! Persistence collaborator. History and the directory live here; the hub
//! only keeps a working cache.

mod memory;
mod postgres;

pub use memory::MemoryMessageStore;
pub use postgres::PgMessageStore;

use async_trait::async_trait;

use crate::{
    error::ChatResult,
    types::{ConversationSummary, Message},
};

#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Newest `limit` messages of the channel, returned oldest first in
    /// insertion order.
    async fn fetch_history(&self, channel_id: &str, limit: usize) -> ChatResult<Vec<Message>>;

    /// Idempotent on `(channel_id, id)`.
    async fn append_message(&self, message: &Message) -> ChatResult<()>;

    /// Purges every message and the directory row of the channel. Returns
    /// how many messages were removed.
    async fn delete_conversation(&self, channel_id: &str) -> ChatResult<u64>;

    async fn load_conversations(&self) -> ChatResult<Vec<ConversationSummary>>;

    async fn save_conversation(&self, summary: &ConversationSummary) -> ChatResult<()>;
}
