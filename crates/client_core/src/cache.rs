use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use shared::domain::{ConversationId, ConversationSummary, Message, MessageId};
use storage::CacheStore;
use tracing::warn;

#[async_trait]
pub trait LocalCache: Send + Sync {
    async fn put_conversation_messages(
        &self,
        conversation_id: &ConversationId,
        messages: &[Message],
    ) -> Result<()>;
    async fn replace_conversation_messages(
        &self,
        conversation_id: &ConversationId,
        messages: &[Message],
    ) -> Result<()>;
    async fn get_conversation_messages(&self, conversation_id: &ConversationId)
        -> Result<Vec<Message>>;
    async fn append_message(&self, conversation_id: &ConversationId, message: &Message)
        -> Result<()>;
    async fn remove_message(&self, message_id: &MessageId) -> Result<()>;
    async fn replace_conversation_list(&self, conversations: &[ConversationSummary])
        -> Result<()>;
    async fn get_conversation_list(&self) -> Result<Vec<ConversationSummary>>;
    async fn clear_all(&self) -> Result<()>;
}

#[async_trait]
impl LocalCache for CacheStore {
    async fn put_conversation_messages(
        &self,
        conversation_id: &ConversationId,
        messages: &[Message],
    ) -> Result<()> {
        CacheStore::put_conversation_messages(self, conversation_id, messages).await
    }

    async fn replace_conversation_messages(
        &self,
        conversation_id: &ConversationId,
        messages: &[Message],
    ) -> Result<()> {
        CacheStore::replace_conversation_messages(self, conversation_id, messages).await
    }

    async fn get_conversation_messages(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Vec<Message>> {
        CacheStore::get_conversation_messages(self, conversation_id).await
    }

    async fn append_message(
        &self,
        conversation_id: &ConversationId,
        message: &Message,
    ) -> Result<()> {
        CacheStore::append_message(self, conversation_id, message).await
    }

    async fn remove_message(&self, message_id: &MessageId) -> Result<()> {
        CacheStore::remove_message(self, message_id).await
    }

    async fn replace_conversation_list(
        &self,
        conversations: &[ConversationSummary],
    ) -> Result<()> {
        CacheStore::replace_conversation_list(self, conversations).await
    }

    async fn get_conversation_list(&self) -> Result<Vec<ConversationSummary>> {
        CacheStore::get_conversation_list(self).await
    }

    async fn clear_all(&self) -> Result<()> {
        CacheStore::clear_all(self).await
    }
}

/// Stand-in used when the cache database could not be opened. Every call fails,
/// so every read degrades to a miss.
pub struct UnavailableCache {
    reason: String,
}

impl UnavailableCache {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }

    fn error(&self) -> anyhow::Error {
        anyhow!("local cache unavailable: {}", self.reason)
    }
}

#[async_trait]
impl LocalCache for UnavailableCache {
    async fn put_conversation_messages(
        &self,
        _conversation_id: &ConversationId,
        _messages: &[Message],
    ) -> Result<()> {
        Err(self.error())
    }

    async fn replace_conversation_messages(
        &self,
        _conversation_id: &ConversationId,
        _messages: &[Message],
    ) -> Result<()> {
        Err(self.error())
    }

    async fn get_conversation_messages(
        &self,
        _conversation_id: &ConversationId,
    ) -> Result<Vec<Message>> {
        Err(self.error())
    }

    async fn append_message(
        &self,
        _conversation_id: &ConversationId,
        _message: &Message,
    ) -> Result<()> {
        Err(self.error())
    }

    async fn remove_message(&self, _message_id: &MessageId) -> Result<()> {
        Err(self.error())
    }

    async fn replace_conversation_list(
        &self,
        _conversations: &[ConversationSummary],
    ) -> Result<()> {
        Err(self.error())
    }

    async fn get_conversation_list(&self) -> Result<Vec<ConversationSummary>> {
        Err(self.error())
    }

    async fn clear_all(&self) -> Result<()> {
        Err(self.error())
    }
}

/// Wraps a [`LocalCache`] so that no storage failure reaches the caller.
///
/// Reads that fail come back empty (a cache miss); writes that fail are logged
/// and reported as `false`. The network stays the fallback of record.
#[derive(Clone)]
pub struct CacheGuard {
    inner: Arc<dyn LocalCache>,
}

impl CacheGuard {
    pub fn new(inner: Arc<dyn LocalCache>) -> Self {
        Self { inner }
    }

    pub async fn messages(&self, conversation_id: &ConversationId) -> Vec<Message> {
        match self.inner.get_conversation_messages(conversation_id).await {
            Ok(messages) => messages,
            Err(err) => {
                warn!(conversation_id = %conversation_id, error = %err, "cache: message read failed; treating as miss");
                Vec::new()
            }
        }
    }

    pub async fn store_messages(&self, conversation_id: &ConversationId, messages: &[Message]) -> bool {
        self.log_write(
            "store messages",
            self.inner
                .put_conversation_messages(conversation_id, messages)
                .await,
        )
    }

    pub async fn replace_messages(
        &self,
        conversation_id: &ConversationId,
        messages: &[Message],
    ) -> bool {
        self.log_write(
            "replace messages",
            self.inner
                .replace_conversation_messages(conversation_id, messages)
                .await,
        )
    }

    pub async fn append(&self, conversation_id: &ConversationId, message: &Message) -> bool {
        self.log_write(
            "append message",
            self.inner.append_message(conversation_id, message).await,
        )
    }

    pub async fn remove(&self, message_id: &MessageId) -> bool {
        self.log_write("remove message", self.inner.remove_message(message_id).await)
    }

    pub async fn conversations(&self) -> Vec<ConversationSummary> {
        match self.inner.get_conversation_list().await {
            Ok(conversations) => conversations,
            Err(err) => {
                warn!(error = %err, "cache: conversation read failed; treating as miss");
                Vec::new()
            }
        }
    }

    pub async fn replace_conversations(&self, conversations: &[ConversationSummary]) -> bool {
        self.log_write(
            "replace conversations",
            self.inner.replace_conversation_list(conversations).await,
        )
    }

    pub async fn clear(&self) -> bool {
        self.log_write("clear", self.inner.clear_all().await)
    }

    fn log_write(&self, operation: &str, result: Result<()>) -> bool {
        match result {
            Ok(()) => true,
            Err(err) => {
                warn!(operation, error = %err, "cache: write failed; continuing without cache");
                false
            }
        }
    }
}
