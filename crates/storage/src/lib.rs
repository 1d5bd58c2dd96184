//! Local cache of conversations and messages.
//!
//! The cache only ever mirrors what the messaging API already returned (plus
//! optimistic local sends). It is never synchronised back; the server stays the
//! source of truth.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Pool, Row, Sqlite, Transaction,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};
use tracing::debug;

use shared::domain::{
    sort_by_recent_activity, sort_for_display, ConversationId, ConversationSummary, Message,
    MessageId, UserId,
};

const UPSERT_MESSAGE_SQL: &str = "INSERT INTO cached_messages
        (id, conversation_id, content, sender_id, receiver_id, sender_username, sent_at, sent_at_ms)
     VALUES (?, ?, ?, ?, ?, ?, ?, ?)
     ON CONFLICT(id) DO UPDATE SET
        conversation_id = excluded.conversation_id,
        content = excluded.content,
        sender_id = excluded.sender_id,
        receiver_id = excluded.receiver_id,
        sender_username = excluded.sender_username,
        sent_at = excluded.sent_at,
        sent_at_ms = excluded.sent_at_ms";

#[derive(Clone)]
pub struct CacheStore {
    pool: Pool<Sqlite>,
}

impl CacheStore {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)
            .with_context(|| format!("invalid cache database url '{database_url}'"))?
            .create_if_missing(true);

        // Every connection to `sqlite::memory:` is a separate database, so an
        // in-memory cache must live on exactly one connection that never expires.
        let pool_options = if is_in_memory(database_url) {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };
        let pool = pool_options
            .connect_with(connect_options)
            .await
            .with_context(|| format!("failed to open cache database '{database_url}'"))?;
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context("failed to migrate cache schema")?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    /// Upserts every message keyed by its identifier, stamping `conversation_id`
    /// on each row. Messages of other conversations are left alone.
    pub async fn put_conversation_messages(
        &self,
        conversation_id: &ConversationId,
        messages: &[Message],
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for message in messages {
            upsert_message(&mut tx, conversation_id, message).await?;
        }
        tx.commit()
            .await
            .context("failed to commit cached messages")?;
        debug!(
            conversation_id = %conversation_id,
            count = messages.len(),
            "cache: stored conversation messages"
        );
        Ok(())
    }

    /// Drops every cached message of the conversation, then stores `messages`.
    pub async fn replace_conversation_messages(
        &self,
        conversation_id: &ConversationId,
        messages: &[Message],
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM cached_messages WHERE conversation_id = ?")
            .bind(conversation_id.as_str())
            .execute(&mut *tx)
            .await?;
        for message in messages {
            upsert_message(&mut tx, conversation_id, message).await?;
        }
        tx.commit()
            .await
            .context("failed to commit conversation message replacement")?;
        debug!(
            conversation_id = %conversation_id,
            count = messages.len(),
            "cache: replaced conversation messages"
        );
        Ok(())
    }

    /// Oldest first. An uncached conversation yields an empty list.
    pub async fn get_conversation_messages(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Vec<Message>> {
        let rows = sqlx::query(
            "SELECT id, conversation_id, content, sender_id, receiver_id, sender_username, sent_at
             FROM cached_messages
             WHERE conversation_id = ?
             ORDER BY sent_at_ms ASC, id ASC",
        )
        .bind(conversation_id.as_str())
        .fetch_all(&self.pool)
        .await?;

        let mut messages = rows
            .iter()
            .map(message_from_row)
            .collect::<Result<Vec<_>>>()?;
        sort_for_display(&mut messages);
        Ok(messages)
    }

    pub async fn append_message(
        &self,
        conversation_id: &ConversationId,
        message: &Message,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        upsert_message(&mut tx, conversation_id, message).await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn remove_message(&self, message_id: &MessageId) -> Result<()> {
        sqlx::query("DELETE FROM cached_messages WHERE id = ?")
            .bind(message_id.as_str())
            .execute(&self.pool)
            .await
            .with_context(|| format!("failed to remove cached message {message_id}"))?;
        Ok(())
    }

    /// Clear-then-rewrite: the cached list becomes exactly `conversations`.
    pub async fn replace_conversation_list(
        &self,
        conversations: &[ConversationSummary],
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM cached_conversations")
            .execute(&mut *tx)
            .await?;
        for conversation in conversations {
            sqlx::query(
                "INSERT INTO cached_conversations
                    (id, username, full_name, profile_picture, last_message, last_activity, last_activity_ms, has_seen)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT(id) DO UPDATE SET
                    username = excluded.username,
                    full_name = excluded.full_name,
                    profile_picture = excluded.profile_picture,
                    last_message = excluded.last_message,
                    last_activity = excluded.last_activity,
                    last_activity_ms = excluded.last_activity_ms,
                    has_seen = excluded.has_seen",
            )
            .bind(conversation.id.as_str())
            .bind(&conversation.username)
            .bind(&conversation.full_name)
            .bind(conversation.profile_picture.as_deref())
            .bind(&conversation.last_message)
            .bind(conversation.last_activity)
            .bind(conversation.last_activity.timestamp_millis())
            .bind(conversation.has_seen)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit()
            .await
            .context("failed to commit conversation list")?;
        debug!(count = conversations.len(), "cache: replaced conversation list");
        Ok(())
    }

    /// Most recent activity first.
    pub async fn get_conversation_list(&self) -> Result<Vec<ConversationSummary>> {
        let rows = sqlx::query(
            "SELECT id, username, full_name, profile_picture, last_message, last_activity, has_seen
             FROM cached_conversations
             ORDER BY last_activity_ms DESC, id ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut conversations = rows
            .iter()
            .map(conversation_from_row)
            .collect::<Result<Vec<_>>>()?;
        sort_by_recent_activity(&mut conversations);
        Ok(conversations)
    }

    /// Wipes both collections; used on logout.
    pub async fn clear_all(&self) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM cached_messages")
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM cached_conversations")
            .execute(&mut *tx)
            .await?;
        tx.commit().await.context("failed to clear local cache")?;
        debug!("cache: cleared");
        Ok(())
    }
}

async fn upsert_message(
    tx: &mut Transaction<'_, Sqlite>,
    conversation_id: &ConversationId,
    message: &Message,
) -> Result<()> {
    sqlx::query(UPSERT_MESSAGE_SQL)
        .bind(message.id.as_str())
        .bind(conversation_id.as_str())
        .bind(&message.content)
        .bind(message.sender_id.as_str())
        .bind(message.receiver_id.as_str())
        .bind(&message.sender_username)
        .bind(message.sent_at)
        .bind(message.sent_at.timestamp_millis())
        .execute(&mut **tx)
        .await
        .with_context(|| format!("failed to upsert cached message {}", message.id))?;
    Ok(())
}

fn message_from_row(row: &SqliteRow) -> Result<Message> {
    Ok(Message {
        id: MessageId(row.try_get("id")?),
        conversation_id: ConversationId(row.try_get("conversation_id")?),
        content: row.try_get("content")?,
        sender_id: UserId(row.try_get("sender_id")?),
        receiver_id: UserId(row.try_get("receiver_id")?),
        sender_username: row.try_get("sender_username")?,
        sent_at: row.try_get::<DateTime<Utc>, _>("sent_at")?,
    })
}

fn conversation_from_row(row: &SqliteRow) -> Result<ConversationSummary> {
    Ok(ConversationSummary {
        id: ConversationId(row.try_get("id")?),
        username: row.try_get("username")?,
        full_name: row.try_get("full_name")?,
        profile_picture: row.try_get("profile_picture")?,
        last_message: row.try_get("last_message")?,
        last_activity: row.try_get::<DateTime<Utc>, _>("last_activity")?,
        has_seen: row.try_get("has_seen")?,
    })
}

fn is_in_memory(database_url: &str) -> bool {
    database_url.contains(":memory:") || database_url.contains("mode=memory")
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };
    let Some(parent) = path.parent() else {
        return Ok(());
    };
    if parent.as_os_str().is_empty() {
        return Ok(());
    }
    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for cache database '{database_url}'",
            parent.display()
        )
    })?;
    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if is_in_memory(database_url) || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
