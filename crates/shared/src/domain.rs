use std::{cmp::Ordering, fmt};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }
    };
}

id_newtype!(UserId);
id_newtype!(ConversationId);
id_newtype!(MessageId);

impl MessageId {
    /// Client-side identifier for a message that has not been acknowledged yet.
    pub fn provisional() -> Self {
        Self(format!("local-{}", uuid::Uuid::new_v4()))
    }

    pub fn is_provisional(&self) -> bool {
        self.0.starts_with("local-")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub content: String,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub sent_at: DateTime<Utc>,
    pub sender_username: String,
}

impl Message {
    /// Display order: oldest first, identifier as tie breaker so the order is total.
    pub fn display_order(a: &Message, b: &Message) -> Ordering {
        a.sent_at.cmp(&b.sent_at).then_with(|| a.id.cmp(&b.id))
    }
}

pub fn sort_for_display(messages: &mut [Message]) {
    messages.sort_by(Message::display_order);
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub id: ConversationId,
    pub username: String,
    pub full_name: String,
    pub profile_picture: Option<String>,
    pub last_message: String,
    pub last_activity: DateTime<Utc>,
    pub has_seen: bool,
}

/// Most recent activity first.
pub fn sort_by_recent_activity(conversations: &mut [ConversationSummary]) {
    conversations.sort_by(|a, b| {
        b.last_activity
            .cmp(&a.last_activity)
            .then_with(|| a.id.cmp(&b.id))
    });
}

/// The signed-in user.
///
/// `image` and `bio` are optional on the wire and default to `None`; everything
/// else is always present in the auth info response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: UserId,
    pub name: String,
    pub username: String,
    pub email: String,
    pub role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bio: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserSearchResult {
    pub id: UserId,
    pub username: String,
    #[serde(default)]
    pub full_name: String,
    #[serde(default)]
    pub profile_picture: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Presence {
    pub username: String,
    pub online: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<DateTime<Utc>>,
}
