use super::*;
use std::{
    collections::{HashMap, VecDeque},
    sync::Mutex as StdMutex,
};

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use shared::{
    attachment::{AttachmentRef, MediaKind},
    domain::{
        ConversationId, ConversationSummary, Message, MessageId, UserId, UserSearchResult,
    },
    protocol::{PushCommand, PushEvent},
};
use tokio::sync::{broadcast, oneshot, Notify};

use crate::api::ProgressFn;

const ALICE: &str = "alice";

fn at(second: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap() + Duration::seconds(second)
}

fn message(conversation: &str, id: &str, second: i64, sender: &str, content: &str) -> Message {
    Message {
        id: MessageId::new(id),
        conversation_id: ConversationId::new(conversation),
        content: content.to_string(),
        sender_id: UserId::new(format!("{sender}-id")),
        receiver_id: UserId::new("other-id"),
        sent_at: at(second),
        sender_username: sender.to_string(),
    }
}

fn batch(conversation: &str, prefix: &str, count: usize, start: i64) -> Vec<Message> {
    (0..count)
        .map(|index| {
            message(
                conversation,
                &format!("{prefix}-{index:02}"),
                start + index as i64,
                "bob",
                &format!("{prefix} {index}"),
            )
        })
        .collect()
}

fn conversation(id: &str, second: i64) -> ConversationSummary {
    ConversationSummary {
        id: ConversationId::new(id),
        username: format!("user-{id}"),
        full_name: format!("User {id}"),
        profile_picture: None,
        last_message: "hi".to_string(),
        last_activity: at(second),
        has_seen: true,
    }
}

fn alice() -> shared::domain::UserProfile {
    shared::domain::UserProfile {
        id: UserId::new("alice-id"),
        name: "Alice".into(),
        username: ALICE.into(),
        email: "alice@example.com".into(),
        role: "user".into(),
        image: None,
        bio: None,
    }
}

#[derive(Default)]
struct FakeApi {
    pages: StdMutex<HashMap<(String, u32), VecDeque<Result<Vec<Message>, String>>>>,
    fetch_calls: StdMutex<Vec<(String, u32)>>,
    gates: tokio::sync::Mutex<HashMap<String, oneshot::Receiver<()>>>,
    fetch_started: Notify,
    sent: StdMutex<Vec<(String, String)>>,
    deleted: StdMutex<Vec<MessageId>>,
    uploads: StdMutex<Vec<String>>,
    conversations: StdMutex<VecDeque<Result<Vec<ConversationSummary>, String>>>,
    searches: StdMutex<Vec<String>>,
    fail_send: bool,
    fail_delete: bool,
    fail_upload: bool,
}

impl FakeApi {
    fn queue_page(&self, conversation: &str, page: u32, response: Result<Vec<Message>, &str>) {
        self.pages
            .lock()
            .unwrap()
            .entry((conversation.to_string(), page))
            .or_default()
            .push_back(response.map_err(str::to_string));
    }

    fn fetches(&self) -> Vec<(String, u32)> {
        self.fetch_calls.lock().unwrap().clone()
    }

    async fn hold_fetch(&self, conversation: &str) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        self.gates.lock().await.insert(conversation.to_string(), rx);
        tx
    }
}

#[async_trait]
impl ChatApi for FakeApi {
    async fn list_conversations(&self) -> Result<Vec<ConversationSummary>> {
        match self.conversations.lock().unwrap().pop_front() {
            Some(Ok(list)) => Ok(list),
            Some(Err(err)) => Err(anyhow!(err)),
            None => Ok(Vec::new()),
        }
    }

    async fn fetch_messages(
        &self,
        conversation_id: &ConversationId,
        page: u32,
        limit: u32,
    ) -> Result<Vec<Message>> {
        assert_eq!(limit, 20);
        self.fetch_calls
            .lock()
            .unwrap()
            .push((conversation_id.to_string(), page));
        let gate = self.gates.lock().await.remove(conversation_id.as_str());
        if let Some(gate) = gate {
            self.fetch_started.notify_one();
            let _ = gate.await;
        }
        let response = self
            .pages
            .lock()
            .unwrap()
            .get_mut(&(conversation_id.to_string(), page))
            .and_then(VecDeque::pop_front);
        match response {
            Some(Ok(messages)) => Ok(messages),
            Some(Err(err)) => Err(anyhow!(err)),
            None => Ok(Vec::new()),
        }
    }

    async fn send_message(&self, recipient_username: &str, content: &str) -> Result<()> {
        self.sent
            .lock()
            .unwrap()
            .push((recipient_username.to_string(), content.to_string()));
        if self.fail_send {
            return Err(anyhow!("send refused"));
        }
        Ok(())
    }

    async fn delete_message(&self, message_id: &MessageId) -> Result<()> {
        self.deleted.lock().unwrap().push(message_id.clone());
        if self.fail_delete {
            return Err(anyhow!("delete refused"));
        }
        Ok(())
    }

    async fn search_users(&self, query: &str) -> Result<Vec<UserSearchResult>> {
        self.searches.lock().unwrap().push(query.to_string());
        Ok(vec![UserSearchResult {
            id: UserId::new("carol-id"),
            username: "carol".into(),
            full_name: "Carol".into(),
            profile_picture: None,
        }])
    }

    async fn current_user(&self) -> Result<shared::domain::UserProfile> {
        Ok(alice())
    }

    async fn presence(&self, username: &str) -> Result<shared::domain::Presence> {
        Ok(shared::domain::Presence {
            username: username.to_string(),
            online: true,
            last_seen: None,
        })
    }

    async fn upload_file(&self, upload: AttachmentUpload, progress: &ProgressFn) -> Result<String> {
        self.uploads.lock().unwrap().push(upload.filename.clone());
        progress(40.0);
        if self.fail_upload {
            return Err(anyhow!("storage offline"));
        }
        progress(100.0);
        Ok(format!("https://files.example.com/{}", upload.filename))
    }
}

#[derive(Default)]
struct RecordingOutbox {
    commands: StdMutex<Vec<PushCommand>>,
}

impl RecordingOutbox {
    fn commands(&self) -> Vec<PushCommand> {
        self.commands.lock().unwrap().clone()
    }
}

impl PushOutbox for RecordingOutbox {
    fn send(&self, command: PushCommand) {
        self.commands.lock().unwrap().push(command);
    }
}

struct Harness {
    sync: Arc<LiveSync>,
    api: Arc<FakeApi>,
    outbox: Arc<RecordingOutbox>,
    store: CacheStore,
    events: broadcast::Receiver<SyncEvent>,
}

impl Harness {
    fn drain(&mut self) -> Vec<SyncEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }

    fn states(events: &[SyncEvent]) -> Vec<SyncState> {
        events
            .iter()
            .filter_map(|event| match event {
                SyncEvent::StateChanged { state, .. } => Some(*state),
                _ => None,
            })
            .collect()
    }

    fn notices(events: &[SyncEvent]) -> Vec<Notice> {
        events
            .iter()
            .filter_map(|event| match event {
                SyncEvent::Notice(notice) => Some(notice.clone()),
                _ => None,
            })
            .collect()
    }

    async fn feed_ids(&self) -> Vec<String> {
        self.sync
            .snapshot()
            .await
            .messages
            .iter()
            .map(|entry| entry.message.id.to_string())
            .collect()
    }
}

async fn harness(api: FakeApi) -> Harness {
    let store = CacheStore::new("sqlite::memory:").await.expect("db");
    harness_with_cache(api, store.clone(), Arc::new(store)).await
}

async fn harness_with_cache(
    api: FakeApi,
    store: CacheStore,
    cache: Arc<dyn LocalCache>,
) -> Harness {
    let api = Arc::new(api);
    let outbox = Arc::new(RecordingOutbox::default());
    let session = SessionContext::new(Some("token-1".into()), Arc::new(StaticCredentials));
    session.set_user(alice()).await;
    let sync = LiveSync::new(
        api.clone(),
        CacheGuard::new(cache),
        session,
        outbox.clone(),
        ClientSettings::default(),
    );
    let events = sync.subscribe();
    Harness {
        sync,
        api,
        outbox,
        store,
        events,
    }
}

fn conv(id: &str) -> ConversationId {
    ConversationId::new(id)
}

#[tokio::test]
async fn reset_page_replaces_cached_messages() {
    let api = FakeApi::default();
    let mut h = harness(api).await;
    h.store
        .put_conversation_messages(&conv("42"), &batch("42", "cached", 5, 0))
        .await
        .expect("seed cache");
    let fresh = batch("42", "fresh", 3, 100);
    h.api.queue_page("42", 1, Ok(fresh.clone()));

    h.sync.open(conv("42"), "bob").await.expect("open");

    let events = h.drain();
    assert_eq!(
        Harness::states(&events),
        vec![SyncState::Cold, SyncState::CacheShown, SyncState::Live]
    );
    let first_feed = events
        .iter()
        .find_map(|event| match event {
            SyncEvent::FeedUpdated { messages, .. } => Some(messages.len()),
            _ => None,
        })
        .expect("cached feed shown");
    assert_eq!(first_feed, 5);

    assert_eq!(h.feed_ids().await, vec!["fresh-00", "fresh-01", "fresh-02"]);
    let cached = h
        .store
        .get_conversation_messages(&conv("42"))
        .await
        .expect("cache read");
    assert_eq!(cached, fresh);
    assert_eq!(
        h.outbox.commands(),
        vec![PushCommand::JoinRoom {
            conversation_id: conv("42")
        }]
    );
}

#[tokio::test]
async fn empty_cache_waits_for_first_page() {
    let api = FakeApi::default();
    let mut h = harness(api).await;
    h.api.queue_page("7", 1, Ok(batch("7", "m", 2, 0)));

    h.sync.open(conv("7"), "bob").await.expect("open");

    assert_eq!(
        Harness::states(&h.drain()),
        vec![SyncState::Cold, SyncState::AwaitingFetch, SyncState::Live]
    );
    assert_eq!(h.sync.snapshot().await.messages.len(), 2);
}

#[tokio::test]
async fn short_page_ends_pagination() {
    let api = FakeApi::default();
    let h = harness(api).await;
    h.api.queue_page("42", 1, Ok(batch("42", "new", 20, 1_000)));
    h.api.queue_page("42", 2, Ok(batch("42", "old", 15, 0)));

    h.sync.open(conv("42"), "bob").await.expect("open");
    assert!(h.sync.snapshot().await.has_more);

    h.sync.load_more().await.expect("page 2");
    let snapshot = h.sync.snapshot().await;
    assert!(!snapshot.has_more);
    assert_eq!(snapshot.page, 2);
    assert_eq!(snapshot.messages.len(), 35);
    assert_eq!(snapshot.messages[0].message.id.as_str(), "old-00");
    assert_eq!(snapshot.messages[34].message.id.as_str(), "new-19");

    h.sync.load_more().await.expect("no-op");
    assert_eq!(
        h.api.fetches(),
        vec![("42".to_string(), 1), ("42".to_string(), 2)]
    );
    assert_eq!(
        h.store
            .get_conversation_messages(&conv("42"))
            .await
            .expect("cache")
            .len(),
        35
    );
}

#[tokio::test]
async fn older_page_skips_known_ids() {
    let api = FakeApi::default();
    let h = harness(api).await;
    let first = batch("42", "m", 20, 10);
    let mut second = batch("42", "o", 4, 0);
    second.push(first[0].clone());
    h.api.queue_page("42", 1, Ok(first));
    h.api.queue_page("42", 2, Ok(second));

    h.sync.open(conv("42"), "bob").await.expect("open");
    h.sync.load_more().await.expect("page 2");

    let ids = h.feed_ids().await;
    assert_eq!(ids.len(), 24);
    assert_eq!(ids.iter().filter(|id| id.as_str() == "m-00").count(), 1);
}

#[tokio::test]
async fn load_more_is_ignored_while_fetch_in_flight() {
    let api = FakeApi::default();
    let h = harness(api).await;
    h.api.queue_page("42", 1, Ok(batch("42", "m", 20, 100)));
    h.sync.open(conv("42"), "bob").await.expect("open");

    h.api.queue_page("42", 2, Ok(batch("42", "o", 20, 0)));
    let release = h.api.hold_fetch("42").await;
    let sync = h.sync.clone();
    let pending = tokio::spawn(async move { sync.load_more().await });
    h.api.fetch_started.notified().await;

    assert!(h.sync.snapshot().await.loading);
    h.sync.load_more().await.expect("skipped");

    release.send(()).expect("release");
    pending.await.expect("join").expect("page 2");
    assert_eq!(
        h.api.fetches(),
        vec![("42".to_string(), 1), ("42".to_string(), 2)]
    );
    assert_eq!(h.sync.snapshot().await.messages.len(), 40);
}

#[tokio::test]
async fn push_refresh_replaces_live_feed() {
    let api = FakeApi::default();
    let h = harness(api).await;
    h.api.queue_page("42", 1, Ok(batch("42", "a", 10, 0)));
    h.sync.on_push_signal(PushSignal::Connected).await;
    h.sync.open(conv("42"), "bob").await.expect("open");
    assert_eq!(h.sync.state().await, SyncState::Live);
    assert_eq!(h.sync.snapshot().await.messages.len(), 10);

    h.api.queue_page("42", 1, Ok(batch("42", "b", 12, 50)));
    h.sync
        .on_push_signal(PushSignal::Event(PushEvent::RefreshMessages))
        .await;

    let ids = h.feed_ids().await;
    assert_eq!(ids.len(), 12);
    assert!(ids.iter().all(|id| id.starts_with("b-")));
    assert_eq!(h.sync.state().await, SyncState::Live);
}

#[tokio::test]
async fn disconnect_keeps_feed_and_reconnect_refetches() {
    let api = FakeApi::default();
    let mut h = harness(api).await;
    h.api.queue_page("42", 1, Ok(batch("42", "a", 10, 0)));
    h.sync.on_push_signal(PushSignal::Connected).await;
    h.sync.open(conv("42"), "bob").await.expect("open");
    h.drain();

    h.sync
        .on_push_signal(PushSignal::Disconnected {
            reason: "reset by peer".into(),
        })
        .await;
    assert_eq!(h.sync.state().await, SyncState::Reconnecting);
    assert_eq!(h.sync.snapshot().await.messages.len(), 10);
    assert_eq!(
        Harness::states(&h.drain()),
        vec![SyncState::Reconnecting]
    );

    h.api.queue_page("42", 1, Ok(batch("42", "b", 12, 50)));
    h.sync.on_push_signal(PushSignal::Connected).await;

    assert_eq!(
        h.api.fetches(),
        vec![("42".to_string(), 1), ("42".to_string(), 1)]
    );
    assert_eq!(h.sync.state().await, SyncState::Live);
    assert_eq!(h.sync.snapshot().await.messages.len(), 12);
    let joins = h
        .outbox
        .commands()
        .into_iter()
        .filter(|command| matches!(command, PushCommand::JoinRoom { .. }))
        .count();
    assert_eq!(joins, 2);
}

#[tokio::test]
async fn first_page_while_link_down_enters_reconnecting() {
    let api = FakeApi::default();
    let h = harness(api).await;
    h.api.queue_page("42", 1, Ok(batch("42", "a", 3, 0)));
    h.sync
        .on_push_signal(PushSignal::Disconnected {
            reason: "offline".into(),
        })
        .await;

    h.sync.open(conv("42"), "bob").await.expect("open");

    assert_eq!(h.sync.state().await, SyncState::Reconnecting);
    assert_eq!(h.sync.snapshot().await.messages.len(), 3);
}

#[tokio::test]
async fn disconnect_while_showing_cache_enters_reconnecting() {
    let api = FakeApi::default();
    let mut h = harness(api).await;
    h.store
        .put_conversation_messages(&conv("42"), &batch("42", "cached", 5, 0))
        .await
        .expect("seed cache");
    h.api.queue_page("42", 1, Err("503 unavailable"));
    let release = h.api.hold_fetch("42").await;

    let sync = h.sync.clone();
    let opening = tokio::spawn(async move { sync.open(conv("42"), "bob").await });
    h.api.fetch_started.notified().await;
    assert_eq!(h.sync.state().await, SyncState::CacheShown);

    h.sync
        .on_push_signal(PushSignal::Disconnected {
            reason: "offline".into(),
        })
        .await;
    assert_eq!(h.sync.state().await, SyncState::Reconnecting);

    release.send(()).expect("release");
    opening.await.expect("join").expect("open");

    assert_eq!(h.sync.state().await, SyncState::Reconnecting);
    assert_eq!(h.feed_ids().await.len(), 5);
    assert_eq!(
        Harness::states(&h.drain()),
        vec![
            SyncState::Cold,
            SyncState::CacheShown,
            SyncState::Reconnecting
        ]
    );
}

#[tokio::test]
async fn fetch_failure_keeps_feed_and_reports_notice() {
    let api = FakeApi::default();
    let mut h = harness(api).await;
    h.api.queue_page("42", 1, Ok(batch("42", "a", 10, 0)));
    h.sync.open(conv("42"), "bob").await.expect("open");
    h.drain();

    h.api.queue_page("42", 1, Err("502 bad gateway"));
    h.sync.refresh().await.expect("refresh returns");

    let events = h.drain();
    let notices = Harness::notices(&events);
    assert_eq!(notices.len(), 1);
    assert_eq!(notices[0].level, NoticeLevel::Error);
    assert!(!events
        .iter()
        .any(|event| matches!(event, SyncEvent::FeedUpdated { .. })));
    assert_eq!(h.sync.snapshot().await.messages.len(), 10);
    assert_eq!(h.sync.state().await, SyncState::Live);
}

#[tokio::test]
async fn response_for_abandoned_conversation_is_dropped() {
    let api = FakeApi::default();
    let h = harness(api).await;
    h.api.queue_page("a", 1, Ok(batch("a", "a", 5, 0)));
    h.api.queue_page("b", 1, Ok(batch("b", "b", 2, 0)));
    let release = h.api.hold_fetch("a").await;

    let sync = h.sync.clone();
    let opening_a = tokio::spawn(async move { sync.open(conv("a"), "anna").await });
    h.api.fetch_started.notified().await;

    h.sync.open(conv("b"), "bert").await.expect("open b");
    release.send(()).expect("release");
    opening_a.await.expect("join").expect("open a");

    let snapshot = h.sync.snapshot().await;
    assert_eq!(snapshot.conversation_id, Some(conv("b")));
    assert_eq!(h.feed_ids().await, vec!["b-00", "b-01"]);
    assert!(h
        .store
        .get_conversation_messages(&conv("a"))
        .await
        .expect("cache")
        .is_empty());
    assert!(h.outbox.commands().contains(&PushCommand::LeaveRoom {
        conversation_id: conv("a")
    }));
}

#[tokio::test]
async fn send_appends_provisional_message_before_ack() {
    let api = FakeApi::default();
    let h = harness(api).await;
    h.api.queue_page("42", 1, Ok(batch("42", "a", 2, 0)));
    h.sync.open(conv("42"), "bob").await.expect("open");

    let id = h.sync.send_text("  hello bob  ").await.expect("send");

    assert!(id.is_provisional());
    let snapshot = h.sync.snapshot().await;
    let last = snapshot.messages.last().expect("tail");
    assert_eq!(last.message.id, id);
    assert_eq!(last.message.content, "hello bob");
    assert_eq!(last.message.sender_username, ALICE);
    assert_eq!(last.delivery, DeliveryState::Sent);
    assert_eq!(
        *h.api.sent.lock().unwrap(),
        vec![("bob".to_string(), "hello bob".to_string())]
    );
    let cached = h
        .store
        .get_conversation_messages(&conv("42"))
        .await
        .expect("cache");
    assert!(cached.iter().any(|message| message.id == id));
}

#[tokio::test]
async fn failed_send_stays_visible() {
    let api = FakeApi {
        fail_send: true,
        ..FakeApi::default()
    };
    let mut h = harness(api).await;
    h.sync.open(conv("42"), "bob").await.expect("open");
    h.drain();

    let id = h.sync.send_text("are you there?").await.expect("send returns");

    let snapshot = h.sync.snapshot().await;
    assert_eq!(snapshot.messages.len(), 1);
    assert_eq!(snapshot.messages[0].message.id, id);
    assert_eq!(snapshot.messages[0].delivery, DeliveryState::Failed);
    let notices = Harness::notices(&h.drain());
    assert_eq!(notices[0].message, "Failed to send message");
}

#[tokio::test]
async fn blank_message_is_rejected_without_request() {
    let api = FakeApi::default();
    let h = harness(api).await;
    h.sync.open(conv("42"), "bob").await.expect("open");

    let err = h.sync.send_text("   \n").await.expect_err("blank");

    assert!(ClientError::is_validation(&err));
    assert!(h.api.sent.lock().unwrap().is_empty());
    assert!(h.sync.snapshot().await.messages.is_empty());
}

#[tokio::test]
async fn send_without_open_conversation_fails() {
    let api = FakeApi::default();
    let h = harness(api).await;

    let err = h.sync.send_text("hi").await.expect_err("no conversation");

    assert!(matches!(
        err.downcast_ref::<ClientError>(),
        Some(ClientError::NoActiveConversation)
    ));
}

#[tokio::test]
async fn reset_reconciles_matching_provisional_messages() {
    let api = FakeApi::default();
    let h = harness(api).await;
    h.sync.open(conv("42"), "bob").await.expect("open");
    let echoed = h.sync.send_text("lunch?").await.expect("send");
    let unmatched = h.sync.send_text("still waiting").await.expect("send");

    let mut server_copy = message("42", "srv-1", 0, ALICE, "lunch?");
    server_copy.sent_at = Utc::now();
    h.api.queue_page("42", 1, Ok(vec![server_copy]));
    h.sync.refresh().await.expect("refresh");

    let snapshot = h.sync.snapshot().await;
    let ids: Vec<&MessageId> = snapshot.messages.iter().map(|entry| &entry.message.id).collect();
    assert_eq!(ids, vec![&MessageId::new("srv-1"), &unmatched]);
    assert!(!ids.contains(&&echoed));
    assert_eq!(snapshot.messages[0].delivery, DeliveryState::Confirmed);
    assert_eq!(snapshot.messages[1].delivery, DeliveryState::Sent);
}

#[tokio::test]
async fn delete_removes_message_everywhere() {
    let api = FakeApi::default();
    let mut h = harness(api).await;
    h.api.queue_page("42", 1, Ok(batch("42", "a", 3, 0)));
    h.sync.open(conv("42"), "bob").await.expect("open");
    h.drain();

    h.sync
        .delete_message(&MessageId::new("a-01"))
        .await
        .expect("delete");

    assert_eq!(h.feed_ids().await, vec!["a-00", "a-02"]);
    let cached: Vec<String> = h
        .store
        .get_conversation_messages(&conv("42"))
        .await
        .expect("cache")
        .into_iter()
        .map(|message| message.id.to_string())
        .collect();
    assert_eq!(cached, vec!["a-00", "a-02"]);
    let notices = Harness::notices(&h.drain());
    assert_eq!(notices[0].level, NoticeLevel::Success);
}

#[tokio::test]
async fn failed_delete_restores_message_in_place() {
    let api = FakeApi {
        fail_delete: true,
        ..FakeApi::default()
    };
    let mut h = harness(api).await;
    h.api.queue_page("42", 1, Ok(batch("42", "a", 3, 0)));
    h.sync.open(conv("42"), "bob").await.expect("open");
    h.drain();

    h.sync
        .delete_message(&MessageId::new("a-01"))
        .await
        .expect("delete returns");

    assert_eq!(h.feed_ids().await, vec!["a-00", "a-01", "a-02"]);
    assert_eq!(
        h.store
            .get_conversation_messages(&conv("42"))
            .await
            .expect("cache")
            .len(),
        3
    );
    let notices = Harness::notices(&h.drain());
    assert_eq!(notices.last().map(|n| n.level), Some(NoticeLevel::Error));
}

#[tokio::test]
async fn deleting_provisional_message_stays_local() {
    let api = FakeApi {
        fail_send: true,
        ..FakeApi::default()
    };
    let h = harness(api).await;
    h.sync.open(conv("42"), "bob").await.expect("open");
    let id = h.sync.send_text("oops").await.expect("send");

    h.sync.delete_message(&id).await.expect("delete");

    assert!(h.sync.snapshot().await.messages.is_empty());
    assert!(h.api.deleted.lock().unwrap().is_empty());
}

#[tokio::test]
async fn oversized_attachment_is_rejected_before_upload() {
    let api = FakeApi::default();
    let h = harness(api).await;
    h.sync.open(conv("42"), "bob").await.expect("open");

    let err = h
        .sync
        .send_attachment(AttachmentUpload {
            filename: "huge.mov".into(),
            mime_type: Some("video/quicktime".into()),
            bytes: vec![0; 10 * 1024 * 1024 + 1],
        })
        .await
        .expect_err("too large");

    assert!(ClientError::is_validation(&err));
    assert!(h.api.uploads.lock().unwrap().is_empty());
    assert!(h.api.sent.lock().unwrap().is_empty());
}

#[tokio::test]
async fn attachment_upload_sends_file_reference() {
    let api = FakeApi::default();
    let mut h = harness(api).await;
    h.sync.open(conv("42"), "bob").await.expect("open");
    h.drain();

    let id = h
        .sync
        .send_attachment(AttachmentUpload {
            filename: "cat.png".into(),
            mime_type: Some("image/png".into()),
            bytes: vec![1, 2, 3],
        })
        .await
        .expect("upload")
        .expect("message id");

    let events = h.drain();
    let progress: Vec<f64> = events
        .iter()
        .filter_map(|event| match event {
            SyncEvent::UploadProgress { progress, .. } => Some(*progress),
            _ => None,
        })
        .collect();
    assert_eq!(progress, vec![40.0, 100.0]);

    let sent = h.api.sent.lock().unwrap().clone();
    assert_eq!(sent.len(), 1);
    let reference = AttachmentRef::parse(&sent[0].1).expect("attachment content");
    assert_eq!(reference.name, "cat.png");
    assert_eq!(reference.kind, MediaKind::Image);
    assert_eq!(reference.url, "https://files.example.com/cat.png");
    assert_eq!(
        h.sync.snapshot().await.messages.last().map(|e| e.message.id.clone()),
        Some(id)
    );
}

#[tokio::test]
async fn failed_upload_sends_nothing() {
    let api = FakeApi {
        fail_upload: true,
        ..FakeApi::default()
    };
    let mut h = harness(api).await;
    h.sync.open(conv("42"), "bob").await.expect("open");
    h.drain();

    let sent = h
        .sync
        .send_attachment(AttachmentUpload {
            filename: "notes.txt".into(),
            mime_type: None,
            bytes: b"notes".to_vec(),
        })
        .await
        .expect("returns");

    assert!(sent.is_none());
    assert!(h.api.sent.lock().unwrap().is_empty());
    assert_eq!(Harness::notices(&h.drain())[0].level, NoticeLevel::Error);
}

#[tokio::test]
async fn video_call_sends_room_link() {
    let api = FakeApi::default();
    let h = harness(api).await;
    h.sync.open(conv("42"), "bob").await.expect("open");

    h.sync.start_video_call().await.expect("call");

    let sent = h.api.sent.lock().unwrap().clone();
    assert!(sent[0]
        .1
        .starts_with("Video call: https://call.example.com/index.html?room="));
}

#[tokio::test]
async fn counterpart_typing_is_tracked() {
    let api = FakeApi::default();
    let mut h = harness(api).await;
    h.sync.open(conv("42"), "bob").await.expect("open");
    h.drain();

    h.sync
        .on_push_signal(PushSignal::Event(PushEvent::Typing {
            username: "bob".into(),
            is_typing: true,
        }))
        .await;
    h.sync
        .on_push_signal(PushSignal::Event(PushEvent::Typing {
            username: ALICE.into(),
            is_typing: true,
        }))
        .await;
    assert_eq!(h.sync.snapshot().await.typing_users, vec!["bob".to_string()]);

    h.sync
        .on_push_signal(PushSignal::Event(PushEvent::Typing {
            username: "bob".into(),
            is_typing: false,
        }))
        .await;

    let typing_events: Vec<Vec<String>> = h
        .drain()
        .into_iter()
        .filter_map(|event| match event {
            SyncEvent::TypingChanged { typing_users, .. } => Some(typing_users),
            _ => None,
        })
        .collect();
    assert_eq!(typing_events, vec![vec!["bob".to_string()], Vec::new()]);
}

#[tokio::test]
async fn keystroke_then_send_reports_typing_stop() {
    let api = FakeApi::default();
    let h = harness(api).await;
    h.sync.open(conv("42"), "bob").await.expect("open");

    h.sync.keystroke().await;
    h.sync.keystroke().await;
    h.sync.send_text("done typing").await.expect("send");

    let typing: Vec<bool> = h
        .outbox
        .commands()
        .into_iter()
        .filter_map(|command| match command {
            PushCommand::Typing { is_typing, .. } => Some(is_typing),
            _ => None,
        })
        .collect();
    assert_eq!(typing, vec![true, false]);
}

#[tokio::test]
async fn unavailable_cache_falls_back_to_network() {
    let api = FakeApi::default();
    let store = CacheStore::new("sqlite::memory:").await.expect("db");
    let h = harness_with_cache(
        api,
        store,
        Arc::new(UnavailableCache::new("disk full")),
    )
    .await;
    h.api.queue_page("42", 1, Ok(batch("42", "a", 4, 0)));

    h.sync.open(conv("42"), "bob").await.expect("open");
    h.sync.send_text("still works").await.expect("send");

    assert_eq!(h.sync.state().await, SyncState::Live);
    assert_eq!(h.sync.snapshot().await.messages.len(), 5);
}

#[tokio::test]
async fn logout_leaves_room_and_clears_cache() {
    let api = FakeApi::default();
    let h = harness(api).await;
    h.api.queue_page("42", 1, Ok(batch("42", "a", 4, 0)));
    h.store
        .replace_conversation_list(&[conversation("42", 0)])
        .await
        .expect("seed");
    h.sync.open(conv("42"), "bob").await.expect("open");

    h.sync.logout().await;

    assert_eq!(h.sync.snapshot().await.conversation_id, None);
    assert!(h
        .store
        .get_conversation_messages(&conv("42"))
        .await
        .expect("cache")
        .is_empty());
    assert!(h.store.get_conversation_list().await.expect("list").is_empty());
    assert_eq!(
        h.outbox.commands().last(),
        Some(&PushCommand::LeaveRoom {
            conversation_id: conv("42")
        })
    );
}

#[tokio::test]
async fn conversation_list_is_read_through() {
    let api = FakeApi::default();
    api.conversations
        .lock()
        .unwrap()
        .push_back(Ok(vec![conversation("old", 10), conversation("new", 20)]));
    let mut h = harness(api).await;
    h.store
        .replace_conversation_list(&[conversation("stale", 5)])
        .await
        .expect("seed");
    let directory = ConversationDirectory::new(
        h.api.clone(),
        CacheGuard::new(Arc::new(h.store.clone())),
        h.sync.event_sender(),
    );

    let list = directory.refresh().await;

    let ids: Vec<&str> = list.iter().map(|c| c.id.as_str()).collect();
    assert_eq!(ids, vec!["new", "old"]);
    let updates: Vec<usize> = h
        .drain()
        .into_iter()
        .filter_map(|event| match event {
            SyncEvent::ConversationsUpdated { conversations } => Some(conversations.len()),
            _ => None,
        })
        .collect();
    assert_eq!(updates, vec![1, 2]);
    assert_eq!(directory.cached().await.len(), 2);
}

#[tokio::test]
async fn conversation_fetch_failure_keeps_cached_list() {
    let api = FakeApi::default();
    api.conversations
        .lock()
        .unwrap()
        .push_back(Err("timeout".to_string()));
    let mut h = harness(api).await;
    h.store
        .replace_conversation_list(&[conversation("42", 5)])
        .await
        .expect("seed");
    let directory = ConversationDirectory::new(
        h.api.clone(),
        CacheGuard::new(Arc::new(h.store.clone())),
        h.sync.event_sender(),
    );

    let list = directory.refresh().await;

    assert_eq!(list.len(), 1);
    assert_eq!(Harness::notices(&h.drain()).len(), 1);
}

#[tokio::test]
async fn blank_search_makes_no_request() {
    let api = FakeApi::default();
    let h = harness(api).await;
    let directory = ConversationDirectory::new(
        h.api.clone(),
        CacheGuard::new(Arc::new(h.store.clone())),
        h.sync.event_sender(),
    );

    assert!(directory.search_users("  ").await.expect("blank").is_empty());
    let found = directory.search_users(" car ").await.expect("search");

    assert_eq!(found[0].username, "carol");
    assert_eq!(*h.api.searches.lock().unwrap(), vec!["car".to_string()]);
}
