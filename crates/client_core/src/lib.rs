use std::sync::Arc;

use anyhow::{Context, Result};
use shared::domain::{Presence, UserProfile};
use storage::CacheStore;
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub mod api;
pub mod cache;
pub mod config;
pub mod conversations;
pub mod error;
pub mod feed;
pub mod push;
pub mod session;
pub mod sync;
pub mod typing;

pub use api::{AttachmentUpload, ChatApi, HttpChatApi};
pub use cache::{CacheGuard, LocalCache, UnavailableCache};
pub use config::ClientSettings;
pub use conversations::ConversationDirectory;
pub use error::ClientError;
pub use feed::{DeliveryState, FeedMessage};
pub use push::{DetachedPushOutbox, PushOutbox, PushSignal, ReconnectPolicy, WsPushChannel};
pub use session::{AuthRefresher, HttpAuthRefresher, SessionContext, StaticCredentials};
pub use sync::{FeedSnapshot, LiveSync, Notice, NoticeLevel, SyncEvent, SyncState};

/// Everything a front end needs for one signed-in session, wired from settings.
pub struct ChatClient {
    settings: ClientSettings,
    session: Arc<SessionContext>,
    api: Arc<dyn ChatApi>,
    sync: Arc<LiveSync>,
    conversations: ConversationDirectory,
    push_task: Option<JoinHandle<()>>,
}

impl ChatClient {
    /// Opens the cache (falling back to network-only if it cannot be opened),
    /// builds the REST client and starts the push channel.
    pub async fn connect(settings: ClientSettings, access_token: Option<String>) -> Result<Self> {
        let refresher = HttpAuthRefresher::new(settings.api_base_url.clone())?;
        let session = SessionContext::new(access_token, Arc::new(refresher));

        let cache: Arc<dyn LocalCache> = match CacheStore::new(&settings.cache_database_url).await {
            Ok(store) => Arc::new(store),
            Err(err) => {
                warn!(error = %err, url = %settings.cache_database_url, "client: cache unavailable; continuing network-only");
                Arc::new(UnavailableCache::new(err.to_string()))
            }
        };

        let api: Arc<dyn ChatApi> = Arc::new(
            HttpChatApi::new(&settings.api_base_url, session.clone())
                .context("failed to build api client")?,
        );

        let push_url = settings.resolved_push_url()?;
        let (channel, signals) = WsPushChannel::spawn(
            &push_url,
            session.clone(),
            ReconnectPolicy {
                initial: settings.reconnect_initial(),
                max: settings.reconnect_max(),
            },
        )?;

        let mut client = Self::from_parts(settings, session, api, CacheGuard::new(cache), channel);
        let sync = client.sync.clone();
        client.push_task = Some(tokio::spawn(async move {
            sync.run_push_signals(signals).await;
        }));
        info!(push_url = %push_url, "client: connected");
        Ok(client)
    }

    /// Wires a client from ready-made collaborators. No push signals are
    /// consumed unless the caller feeds them to [`LiveSync::run_push_signals`].
    pub fn from_parts(
        settings: ClientSettings,
        session: Arc<SessionContext>,
        api: Arc<dyn ChatApi>,
        cache: CacheGuard,
        push: Arc<dyn PushOutbox>,
    ) -> Self {
        let sync = LiveSync::new(
            api.clone(),
            cache.clone(),
            session.clone(),
            push,
            settings.clone(),
        );
        let conversations = ConversationDirectory::new(api.clone(), cache, sync.event_sender());
        Self {
            settings,
            session,
            api,
            sync,
            conversations,
            push_task: None,
        }
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    pub fn session(&self) -> &Arc<SessionContext> {
        &self.session
    }

    pub fn sync(&self) -> &Arc<LiveSync> {
        &self.sync
    }

    pub fn conversations(&self) -> &ConversationDirectory {
        &self.conversations
    }

    /// Loads the signed-in user's profile into the session.
    pub async fn load_profile(&self) -> Result<UserProfile> {
        let user = self.api.current_user().await?;
        info!(username = %user.username, "client: profile loaded");
        self.session.set_user(user.clone()).await;
        Ok(user)
    }

    pub async fn presence(&self, username: &str) -> Result<Presence> {
        self.api.presence(username).await
    }

    pub async fn logout(&self) {
        self.sync.logout().await;
    }
}

impl Drop for ChatClient {
    fn drop(&mut self) {
        if let Some(task) = self.push_task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
#[path = "tests/sync_tests.rs"]
mod sync_tests;

#[cfg(test)]
#[path = "tests/api_tests.rs"]
mod api_tests;

#[cfg(test)]
#[path = "tests/feed_tests.rs"]
mod feed_tests;

#[cfg(test)]
#[path = "tests/typing_tests.rs"]
mod typing_tests;

#[cfg(test)]
#[path = "tests/push_tests.rs"]
mod push_tests;
