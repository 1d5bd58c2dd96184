use std::sync::Arc;

use anyhow::Result;
use shared::domain::{sort_by_recent_activity, ConversationSummary, UserSearchResult};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::{
    api::ChatApi,
    cache::CacheGuard,
    sync::{Notice, NoticeLevel, SyncEvent},
};

/// Read-through view of the conversation list: cached first, then the server's.
pub struct ConversationDirectory {
    api: Arc<dyn ChatApi>,
    cache: CacheGuard,
    events: broadcast::Sender<SyncEvent>,
}

impl ConversationDirectory {
    pub fn new(
        api: Arc<dyn ChatApi>,
        cache: CacheGuard,
        events: broadcast::Sender<SyncEvent>,
    ) -> Self {
        Self { api, cache, events }
    }

    pub async fn cached(&self) -> Vec<ConversationSummary> {
        self.cache.conversations().await
    }

    /// Emits the cached list (when there is one), then the fetched list.
    /// Returns the freshest list available.
    pub async fn refresh(&self) -> Vec<ConversationSummary> {
        let cached = self.cache.conversations().await;
        if !cached.is_empty() {
            debug!(count = cached.len(), "conversations: showing cached list");
            self.emit(SyncEvent::ConversationsUpdated {
                conversations: cached.clone(),
            });
        }

        match self.api.list_conversations().await {
            Ok(mut conversations) => {
                sort_by_recent_activity(&mut conversations);
                self.cache.replace_conversations(&conversations).await;
                self.emit(SyncEvent::ConversationsUpdated {
                    conversations: conversations.clone(),
                });
                conversations
            }
            Err(err) => {
                warn!(error = %err, "conversations: fetch failed");
                self.emit(SyncEvent::Notice(Notice {
                    level: NoticeLevel::Error,
                    message: "Failed to load conversations".into(),
                }));
                cached
            }
        }
    }

    pub async fn search_users(&self, query: &str) -> Result<Vec<UserSearchResult>> {
        let query = query.trim();
        if query.is_empty() {
            return Ok(Vec::new());
        }
        self.api.search_users(query).await
    }

    fn emit(&self, event: SyncEvent) {
        let _ = self.events.send(event);
    }
}
