use std::{
    collections::BTreeSet,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use anyhow::Result;
use chrono::Utc;
use serde::Serialize;
use shared::{
    attachment::{video_call_content, AttachmentRef, MediaKind},
    domain::{ConversationId, ConversationSummary, Message, MessageId, UserId},
    protocol::{PushCommand, PushEvent},
};
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    api::{AttachmentUpload, ChatApi},
    cache::CacheGuard,
    config::ClientSettings,
    error::ClientError,
    feed::{ConversationFeed, DeliveryState, FeedMessage},
    push::{PushOutbox, PushSignal},
    session::SessionContext,
    typing::TypingDebouncer,
};

const EVENT_BUFFER: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    Cold,
    CacheShown,
    AwaitingFetch,
    Live,
    Reconnecting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NoticeLevel {
    Info,
    Success,
    Error,
}

/// A transient, user-facing message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notice {
    pub level: NoticeLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncEvent {
    FeedUpdated {
        conversation_id: ConversationId,
        messages: Vec<FeedMessage>,
        has_more: bool,
    },
    StateChanged {
        conversation_id: ConversationId,
        state: SyncState,
    },
    TypingChanged {
        conversation_id: ConversationId,
        typing_users: Vec<String>,
    },
    ConversationsUpdated {
        conversations: Vec<ConversationSummary>,
    },
    UploadProgress {
        filename: String,
        progress: f64,
    },
    Notice(Notice),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeedSnapshot {
    pub conversation_id: Option<ConversationId>,
    pub state: SyncState,
    pub messages: Vec<FeedMessage>,
    pub has_more: bool,
    pub page: u32,
    pub loading: bool,
    pub typing_users: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkState {
    Pending,
    Up,
    Down,
}

struct ActiveConversation {
    id: ConversationId,
    recipient: String,
    ticket: u64,
    state: SyncState,
    feed: ConversationFeed,
    pending_fetches: usize,
    typing_users: BTreeSet<String>,
    typing: TypingDebouncer,
}

impl ActiveConversation {
    fn set_state(&mut self, state: SyncState, events: &mut Vec<SyncEvent>) {
        if self.state != state {
            info!(conversation_id = %self.id, from = ?self.state, to = ?state, "sync: state changed");
            self.state = state;
            events.push(SyncEvent::StateChanged {
                conversation_id: self.id.clone(),
                state,
            });
        }
    }

    fn feed_event(&self) -> SyncEvent {
        SyncEvent::FeedUpdated {
            conversation_id: self.id.clone(),
            messages: self.feed.entries().to_vec(),
            has_more: self.feed.has_more(),
        }
    }
}

struct SyncInner {
    active: Option<ActiveConversation>,
    link: LinkState,
}

impl SyncInner {
    fn active_for(&mut self, id: &ConversationId, ticket: u64) -> Option<&mut ActiveConversation> {
        self.active
            .as_mut()
            .filter(|active| &active.id == id && active.ticket == ticket)
    }
}

/// Combines the local cache, paged fetches and the push channel into one feed
/// for the open conversation.
pub struct LiveSync {
    api: Arc<dyn ChatApi>,
    cache: CacheGuard,
    session: Arc<SessionContext>,
    push: Arc<dyn PushOutbox>,
    settings: ClientSettings,
    inner: Mutex<SyncInner>,
    tickets: AtomicU64,
    events: broadcast::Sender<SyncEvent>,
}

impl LiveSync {
    pub fn new(
        api: Arc<dyn ChatApi>,
        cache: CacheGuard,
        session: Arc<SessionContext>,
        push: Arc<dyn PushOutbox>,
        settings: ClientSettings,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Arc::new(Self {
            api,
            cache,
            session,
            push,
            settings,
            inner: Mutex::new(SyncInner {
                active: None,
                link: LinkState::Pending,
            }),
            tickets: AtomicU64::new(1),
            events,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub fn event_sender(&self) -> broadcast::Sender<SyncEvent> {
        self.events.clone()
    }

    pub async fn state(&self) -> SyncState {
        self.inner
            .lock()
            .await
            .active
            .as_ref()
            .map(|active| active.state)
            .unwrap_or(SyncState::Cold)
    }

    pub async fn snapshot(&self) -> FeedSnapshot {
        let inner = self.inner.lock().await;
        match &inner.active {
            Some(active) => FeedSnapshot {
                conversation_id: Some(active.id.clone()),
                state: active.state,
                messages: active.feed.entries().to_vec(),
                has_more: active.feed.has_more(),
                page: active.feed.page(),
                loading: active.pending_fetches > 0,
                typing_users: active.typing_users.iter().cloned().collect(),
            },
            None => FeedSnapshot {
                conversation_id: None,
                state: SyncState::Cold,
                messages: Vec::new(),
                has_more: false,
                page: 0,
                loading: false,
                typing_users: Vec::new(),
            },
        }
    }

    /// Switches to `conversation_id`, showing cached messages right away and
    /// then the authoritative first page.
    pub async fn open(
        &self,
        conversation_id: ConversationId,
        recipient_username: impl Into<String>,
    ) -> Result<()> {
        self.close().await;

        let ticket = self.tickets.fetch_add(1, Ordering::Relaxed);
        let typing = self.typing_debouncer(&conversation_id);
        let mut events = Vec::new();
        {
            let mut inner = self.inner.lock().await;
            let active = ActiveConversation {
                id: conversation_id.clone(),
                recipient: recipient_username.into(),
                ticket,
                state: SyncState::Cold,
                feed: ConversationFeed::new(conversation_id.clone()),
                pending_fetches: 0,
                typing_users: BTreeSet::new(),
                typing,
            };
            events.push(SyncEvent::StateChanged {
                conversation_id: conversation_id.clone(),
                state: SyncState::Cold,
            });
            inner.active = Some(active);
        }
        self.emit_all(events);
        info!(conversation_id = %conversation_id, "sync: opening conversation");
        self.push.send(PushCommand::JoinRoom {
            conversation_id: conversation_id.clone(),
        });

        let cached = self.cache.messages(&conversation_id).await;
        let mut events = Vec::new();
        {
            let mut inner = self.inner.lock().await;
            let Some(active) = inner.active_for(&conversation_id, ticket) else {
                debug!(conversation_id = %conversation_id, "sync: conversation closed before cache read finished");
                return Ok(());
            };
            if cached.is_empty() {
                active.set_state(SyncState::AwaitingFetch, &mut events);
            } else {
                debug!(conversation_id = %conversation_id, count = cached.len(), "sync: showing cached messages");
                active.feed.show_cached(cached);
                events.push(active.feed_event());
                active.set_state(SyncState::CacheShown, &mut events);
            }
        }
        self.emit_all(events);

        self.refresh().await
    }

    /// Re-fetches the first page and replaces the feed with it.
    pub async fn refresh(&self) -> Result<()> {
        let (conversation_id, ticket) = {
            let mut inner = self.inner.lock().await;
            let active = inner
                .active
                .as_mut()
                .ok_or(ClientError::NoActiveConversation)?;
            active.pending_fetches += 1;
            (active.id.clone(), active.ticket)
        };
        self.fetch_page(conversation_id, ticket, 1).await;
        Ok(())
    }

    /// Fetches the next older page. A no-op once the server reported the last
    /// page or while another fetch is still in flight.
    pub async fn load_more(&self) -> Result<()> {
        let (conversation_id, ticket, page) = {
            let mut inner = self.inner.lock().await;
            let active = inner
                .active
                .as_mut()
                .ok_or(ClientError::NoActiveConversation)?;
            if !active.feed.has_more() || active.pending_fetches > 0 {
                debug!(
                    conversation_id = %active.id,
                    has_more = active.feed.has_more(),
                    pending = active.pending_fetches,
                    "sync: load more skipped"
                );
                return Ok(());
            }
            active.pending_fetches += 1;
            (active.id.clone(), active.ticket, active.feed.page() + 1)
        };
        self.fetch_page(conversation_id, ticket, page).await;
        Ok(())
    }

    async fn fetch_page(&self, conversation_id: ConversationId, ticket: u64, page: u32) {
        let page_size = self.settings.page_size;
        let result = self
            .api
            .fetch_messages(&conversation_id, page, page_size)
            .await;

        let mut events = Vec::new();
        let persist = {
            let mut inner = self.inner.lock().await;
            let link = inner.link;
            let Some(active) = inner.active_for(&conversation_id, ticket) else {
                debug!(conversation_id = %conversation_id, page, "sync: dropping response for inactive conversation");
                return;
            };
            active.pending_fetches = active.pending_fetches.saturating_sub(1);

            match result {
                Err(err) => {
                    warn!(conversation_id = %conversation_id, page, error = %err, "sync: fetch failed");
                    events.push(notice(NoticeLevel::Error, "Failed to load messages"));
                    None
                }
                Ok(messages) if page <= 1 => {
                    active.feed.apply_first_page(messages, page_size);
                    events.push(active.feed_event());
                    let next = if link == LinkState::Down {
                        SyncState::Reconnecting
                    } else {
                        SyncState::Live
                    };
                    active.set_state(next, &mut events);
                    Some((true, active.feed.messages()))
                }
                Ok(messages) => {
                    debug!(conversation_id = %conversation_id, page, count = messages.len(), "sync: prepending older page");
                    active.feed.prepend_page(page, messages.clone(), page_size);
                    events.push(active.feed_event());
                    Some((false, messages))
                }
            }
        };
        self.emit_all(events);

        match persist {
            Some((true, messages)) => {
                self.cache.replace_messages(&conversation_id, &messages).await;
            }
            Some((false, messages)) => {
                self.cache.store_messages(&conversation_id, &messages).await;
            }
            None => {}
        }
    }

    /// Consumes the push channel until it is dropped.
    pub async fn run_push_signals(&self, mut signals: mpsc::Receiver<PushSignal>) {
        while let Some(signal) = signals.recv().await {
            self.on_push_signal(signal).await;
        }
        debug!("sync: push signal stream ended");
    }

    pub async fn on_push_signal(&self, signal: PushSignal) {
        match signal {
            PushSignal::Connected => {
                let rejoin = {
                    let mut inner = self.inner.lock().await;
                    let previous = std::mem::replace(&mut inner.link, LinkState::Up);
                    inner
                        .active
                        .as_ref()
                        .map(|active| (active.id.clone(), previous == LinkState::Down))
                };
                if let Some((conversation_id, heal)) = rejoin {
                    self.push.send(PushCommand::JoinRoom {
                        conversation_id: conversation_id.clone(),
                    });
                    if heal {
                        info!(conversation_id = %conversation_id, "sync: push link restored; refetching first page");
                        self.ignore_missing(self.refresh().await);
                    }
                }
            }
            PushSignal::Disconnected { reason } => {
                warn!(%reason, "sync: push link down");
                let mut events = Vec::new();
                {
                    let mut inner = self.inner.lock().await;
                    inner.link = LinkState::Down;
                    if let Some(active) = inner.active.as_mut() {
                        // Cold is still reading the cache; the fetch result reads the link.
                        if active.state != SyncState::Cold {
                            active.set_state(SyncState::Reconnecting, &mut events);
                        }
                    }
                }
                self.emit_all(events);
            }
            PushSignal::Event(PushEvent::RefreshMessages) => {
                debug!("sync: refresh requested by push channel");
                self.ignore_missing(self.refresh().await);
            }
            PushSignal::Event(PushEvent::Typing {
                username,
                is_typing,
            }) => {
                if self.session.username().await.as_deref() == Some(username.as_str()) {
                    return;
                }
                let mut events = Vec::new();
                {
                    let mut inner = self.inner.lock().await;
                    if let Some(active) = inner.active.as_mut() {
                        let changed = if is_typing {
                            active.typing_users.insert(username)
                        } else {
                            active.typing_users.remove(&username)
                        };
                        if changed {
                            events.push(SyncEvent::TypingChanged {
                                conversation_id: active.id.clone(),
                                typing_users: active.typing_users.iter().cloned().collect(),
                            });
                        }
                    }
                }
                self.emit_all(events);
            }
        }
    }

    /// Sends `text` optimistically. Blank text is rejected before any request.
    pub async fn send_text(&self, text: &str) -> Result<MessageId> {
        let text = text.trim();
        if text.is_empty() {
            return Err(ClientError::Validation("message cannot be empty".into()).into());
        }
        self.send_content(text.to_string()).await
    }

    /// Uploads the file, then sends a message referencing it. Returns `None`
    /// when the upload failed; the failure is reported as a notice.
    pub async fn send_attachment(&self, upload: AttachmentUpload) -> Result<Option<MessageId>> {
        if upload.size_bytes() > self.settings.max_upload_bytes {
            return Err(ClientError::Validation(format!(
                "'{}' is larger than the {} MB upload limit",
                upload.filename,
                self.settings.max_upload_bytes / (1024 * 1024)
            ))
            .into());
        }
        self.require_active().await?;

        let name = upload.filename.clone();
        let kind = MediaKind::from_mime(upload.mime_or_default());
        let events = self.events.clone();
        let filename = name.clone();
        let progress = move |progress: f64| {
            let _ = events.send(SyncEvent::UploadProgress {
                filename: filename.clone(),
                progress,
            });
        };

        match self.api.upload_file(upload, &progress).await {
            Ok(url) => {
                info!(file = %name, "sync: attachment uploaded");
                let content = AttachmentRef::new(name, kind, url).encode();
                self.send_content(content).await.map(Some)
            }
            Err(err) => {
                warn!(file = %name, error = %err, "sync: attachment upload failed");
                self.emit(notice(NoticeLevel::Error, format!("Failed to upload {name}")));
                Ok(None)
            }
        }
    }

    /// Sends a link to a freshly named call room.
    pub async fn start_video_call(&self) -> Result<MessageId> {
        let call_url = format!(
            "{}?room={}",
            self.settings.call_base_url,
            Uuid::new_v4()
        );
        self.send_content(video_call_content(&call_url)).await
    }

    async fn send_content(&self, content: String) -> Result<MessageId> {
        let (conversation_id, ticket, recipient, typing) = {
            let inner = self.inner.lock().await;
            let active = inner
                .active
                .as_ref()
                .ok_or(ClientError::NoActiveConversation)?;
            (
                active.id.clone(),
                active.ticket,
                active.recipient.clone(),
                active.typing.clone(),
            )
        };
        typing.stop().await;

        let (sender_id, sender_username) = match self.session.user().await {
            Some(user) => (user.id, user.username),
            None => (UserId::new(""), String::new()),
        };
        let message = Message {
            id: MessageId::provisional(),
            conversation_id: conversation_id.clone(),
            content,
            sender_id,
            receiver_id: UserId::new(recipient.clone()),
            sent_at: Utc::now(),
            sender_username,
        };

        self.update_feed(&conversation_id, ticket, |feed| {
            feed.push_provisional(message.clone());
        })
        .await;
        self.cache.append(&conversation_id, &message).await;

        let delivery = match self.api.send_message(&recipient, &message.content).await {
            Ok(()) => {
                debug!(conversation_id = %conversation_id, message_id = %message.id, "sync: message sent");
                DeliveryState::Sent
            }
            Err(err) => {
                warn!(conversation_id = %conversation_id, error = %err, "sync: send failed");
                self.emit(notice(NoticeLevel::Error, "Failed to send message"));
                DeliveryState::Failed
            }
        };
        self.update_feed(&conversation_id, ticket, |feed| {
            feed.mark(&message.id, delivery);
        })
        .await;
        Ok(message.id)
    }

    /// Removes the message right away and restores it if the server refuses.
    pub async fn delete_message(&self, message_id: &MessageId) -> Result<()> {
        let mut events = Vec::new();
        let (conversation_id, ticket, removed) = {
            let mut inner = self.inner.lock().await;
            let active = inner
                .active
                .as_mut()
                .ok_or(ClientError::NoActiveConversation)?;
            let removed = active.feed.remove(message_id);
            if removed.is_some() {
                events.push(active.feed_event());
            }
            (active.id.clone(), active.ticket, removed)
        };
        self.emit_all(events);

        let Some(removed) = removed else {
            debug!(message_id = %message_id, "sync: delete of unknown message ignored");
            return Ok(());
        };
        if message_id.is_provisional() {
            self.cache.remove(message_id).await;
            return Ok(());
        }

        match self.api.delete_message(message_id).await {
            Ok(()) => {
                self.cache.remove(message_id).await;
                self.emit(notice(NoticeLevel::Success, "Message deleted"));
            }
            Err(err) => {
                warn!(message_id = %message_id, error = %err, "sync: delete failed; restoring message");
                self.update_feed(&conversation_id, ticket, |feed| feed.restore(removed))
                    .await;
                self.emit(notice(NoticeLevel::Error, "Failed to delete message"));
            }
        }
        Ok(())
    }

    /// Reports a keystroke in the message input of the open conversation.
    pub async fn keystroke(&self) {
        let typing = {
            let inner = self.inner.lock().await;
            inner.active.as_ref().map(|active| active.typing.clone())
        };
        if let Some(typing) = typing {
            typing.keystroke().await;
        }
    }

    pub async fn close(&self) {
        let previous = self.inner.lock().await.active.take();
        if let Some(active) = previous {
            active.typing.stop().await;
            self.push.send(PushCommand::LeaveRoom {
                conversation_id: active.id.clone(),
            });
            debug!(conversation_id = %active.id, "sync: conversation closed");
        }
    }

    /// Closes the conversation, drops credentials and wipes the cache.
    pub async fn logout(&self) {
        self.close().await;
        self.session.logout().await;
        self.cache.clear().await;
        self.emit(SyncEvent::ConversationsUpdated {
            conversations: Vec::new(),
        });
    }

    async fn require_active(&self) -> Result<ConversationId> {
        self.inner
            .lock()
            .await
            .active
            .as_ref()
            .map(|active| active.id.clone())
            .ok_or_else(|| ClientError::NoActiveConversation.into())
    }

    async fn update_feed(
        &self,
        conversation_id: &ConversationId,
        ticket: u64,
        apply: impl FnOnce(&mut ConversationFeed),
    ) {
        let event = {
            let mut inner = self.inner.lock().await;
            inner.active_for(conversation_id, ticket).map(|active| {
                apply(&mut active.feed);
                active.feed_event()
            })
        };
        if let Some(event) = event {
            self.emit(event);
        }
    }

    fn typing_debouncer(&self, conversation_id: &ConversationId) -> TypingDebouncer {
        let push = self.push.clone();
        let conversation_id = conversation_id.clone();
        TypingDebouncer::new(
            self.settings.typing_idle(),
            Arc::new(move |is_typing| {
                push.send(PushCommand::Typing {
                    conversation_id: conversation_id.clone(),
                    is_typing,
                });
            }),
        )
    }

    fn ignore_missing(&self, result: Result<()>) {
        if let Err(err) = result {
            debug!(error = %err, "sync: push signal ignored");
        }
    }

    fn emit(&self, event: SyncEvent) {
        let _ = self.events.send(event);
    }

    fn emit_all(&self, events: Vec<SyncEvent>) {
        for event in events {
            self.emit(event);
        }
    }
}

fn notice(level: NoticeLevel, message: impl Into<String>) -> SyncEvent {
    SyncEvent::Notice(Notice {
        level,
        message: message.into(),
    })
}
