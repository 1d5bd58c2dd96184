use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{ConversationId, ConversationSummary, Message, MessageId, UserId};

/// Message as returned by `GET /messaging/messages/{conversation}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePayload {
    pub id: MessageId,
    pub content: String,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub username: String,
}

impl MessagePayload {
    pub fn into_message(self, conversation_id: &ConversationId) -> Message {
        Message {
            id: self.id,
            conversation_id: conversation_id.clone(),
            content: self.content,
            sender_id: self.sender_id,
            receiver_id: self.receiver_id,
            sent_at: self.timestamp,
            sender_username: self.username,
        }
    }
}

impl From<&Message> for MessagePayload {
    fn from(message: &Message) -> Self {
        Self {
            id: message.id.clone(),
            content: message.content.clone(),
            sender_id: message.sender_id.clone(),
            receiver_id: message.receiver_id.clone(),
            timestamp: message.sent_at,
            username: message.sender_username.clone(),
        }
    }
}

/// Entry of `GET /messaging/conversations`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationPayload {
    pub id: ConversationId,
    pub username: String,
    #[serde(default)]
    pub full_name: String,
    #[serde(default)]
    pub profile_picture: Option<String>,
    #[serde(default)]
    pub last_message: String,
    pub last_chat: DateTime<Utc>,
    #[serde(default)]
    pub has_seen: bool,
}

impl From<ConversationPayload> for ConversationSummary {
    fn from(value: ConversationPayload) -> Self {
        Self {
            id: value.id,
            username: value.username,
            full_name: value.full_name,
            profile_picture: value.profile_picture.filter(|url| !url.is_empty()),
            last_message: value.last_message,
            last_activity: value.last_chat,
            has_seen: value.has_seen,
        }
    }
}

impl From<&ConversationSummary> for ConversationPayload {
    fn from(value: &ConversationSummary) -> Self {
        Self {
            id: value.id.clone(),
            username: value.username.clone(),
            full_name: value.full_name.clone(),
            profile_picture: value.profile_picture.clone(),
            last_message: value.last_message.clone(),
            last_chat: value.last_activity,
            has_seen: value.has_seen,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendMessageRequest {
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthRefreshResponse {
    pub access_token: String,
}

/// One `data:` block of the upload response stream.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UploadStreamEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Frames pushed by the server on the realtime channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum PushEvent {
    /// Something changed in the joined room; re-fetch the first page.
    RefreshMessages,
    Typing { username: String, is_typing: bool },
}

/// Frames the client sends on the realtime channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum PushCommand {
    JoinRoom {
        conversation_id: ConversationId,
    },
    LeaveRoom {
        conversation_id: ConversationId,
    },
    Typing {
        conversation_id: ConversationId,
        is_typing: bool,
    },
}
