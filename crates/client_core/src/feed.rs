use std::{cmp::Ordering, collections::HashSet, time::Duration};

use serde::Serialize;
use shared::domain::{sort_for_display, ConversationId, Message, MessageId};

/// A provisional message is matched against an authoritative one sent by the
/// same user with the same content within this distance of its timestamp.
pub const RECONCILE_WINDOW: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    /// Returned by the server.
    Confirmed,
    Sending,
    Sent,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FeedMessage {
    pub message: Message,
    pub delivery: DeliveryState,
}

impl FeedMessage {
    pub fn confirmed(message: Message) -> Self {
        Self {
            message,
            delivery: DeliveryState::Confirmed,
        }
    }

    pub fn is_provisional(&self) -> bool {
        self.delivery != DeliveryState::Confirmed
    }
}

/// The ordered message list of one open conversation plus its paging cursor.
#[derive(Debug, Clone)]
pub struct ConversationFeed {
    conversation_id: ConversationId,
    entries: Vec<FeedMessage>,
    page: u32,
    has_more: bool,
}

impl ConversationFeed {
    pub fn new(conversation_id: ConversationId) -> Self {
        Self {
            conversation_id,
            entries: Vec::new(),
            page: 0,
            has_more: true,
        }
    }

    pub fn conversation_id(&self) -> &ConversationId {
        &self.conversation_id
    }

    pub fn entries(&self) -> &[FeedMessage] {
        &self.entries
    }

    pub fn messages(&self) -> Vec<Message> {
        self.entries.iter().map(|entry| entry.message.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Last page applied; 0 until the first authoritative page arrives.
    pub fn page(&self) -> u32 {
        self.page
    }

    pub fn has_more(&self) -> bool {
        self.has_more
    }

    pub fn show_cached(&mut self, mut messages: Vec<Message>) {
        sort_for_display(&mut messages);
        self.entries = messages.into_iter().map(FeedMessage::confirmed).collect();
    }

    /// Replaces the feed with an authoritative first page. Provisional entries
    /// the page does not account for stay at the tail.
    pub fn apply_first_page(&mut self, mut messages: Vec<Message>, page_size: u32) {
        self.has_more = messages.len() >= page_size as usize;
        self.page = 1;
        sort_for_display(&mut messages);

        let mut claimed = vec![false; messages.len()];
        let pending: Vec<FeedMessage> = std::mem::take(&mut self.entries)
            .into_iter()
            .filter(|entry| entry.is_provisional())
            .filter(|entry| {
                let matched = messages
                    .iter()
                    .enumerate()
                    .find(|(index, candidate)| {
                        !claimed[*index] && reconciles(&entry.message, candidate)
                    })
                    .map(|(index, _)| index);
                if let Some(index) = matched {
                    claimed[index] = true;
                }
                matched.is_none()
            })
            .collect();

        self.entries = messages.into_iter().map(FeedMessage::confirmed).collect();
        self.entries.extend(pending);
    }

    /// Prepends an older page, skipping identifiers already present.
    pub fn prepend_page(&mut self, page: u32, mut messages: Vec<Message>, page_size: u32) {
        self.has_more = messages.len() >= page_size as usize;
        self.page = self.page.max(page);

        let known: HashSet<&MessageId> = self.entries.iter().map(|entry| &entry.message.id).collect();
        messages.retain(|message| !known.contains(&message.id));
        sort_for_display(&mut messages);

        let mut merged: Vec<FeedMessage> = messages.into_iter().map(FeedMessage::confirmed).collect();
        merged.append(&mut self.entries);
        self.entries = merged;
    }

    pub fn push_provisional(&mut self, message: Message) {
        self.entries.push(FeedMessage {
            message,
            delivery: DeliveryState::Sending,
        });
    }

    pub fn mark(&mut self, message_id: &MessageId, delivery: DeliveryState) -> bool {
        match self
            .entries
            .iter_mut()
            .find(|entry| &entry.message.id == message_id)
        {
            Some(entry) => {
                entry.delivery = delivery;
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, message_id: &MessageId) -> Option<FeedMessage> {
        let index = self
            .entries
            .iter()
            .position(|entry| &entry.message.id == message_id)?;
        Some(self.entries.remove(index))
    }

    /// Puts a removed entry back at its display position.
    pub fn restore(&mut self, entry: FeedMessage) {
        if self
            .entries
            .iter()
            .any(|existing| existing.message.id == entry.message.id)
        {
            return;
        }
        let index = self
            .entries
            .iter()
            .position(|existing| {
                Message::display_order(&existing.message, &entry.message) == Ordering::Greater
            })
            .unwrap_or(self.entries.len());
        self.entries.insert(index, entry);
    }
}

fn reconciles(provisional: &Message, authoritative: &Message) -> bool {
    provisional.sender_id == authoritative.sender_id
        && provisional.content == authoritative.content
        && (authoritative.sent_at - provisional.sent_at).num_seconds().abs()
            <= RECONCILE_WINDOW.as_secs() as i64
}
