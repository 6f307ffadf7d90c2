use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Pool, Row, Sqlite,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
    sync::Arc,
};
use tokio::sync::{broadcast, Mutex};
use tracing::warn;

use shared::{
    domain::{
        Attachment, AttachmentKind, AttachmentState, BlobKey, EditRecord, Message, MessageId,
        NewMessage, RecentRoom, Room, RoomId, UserId,
    },
    protocol::{FeedEvent, RoomSnapshot},
};

pub mod blob;
pub use blob::{BlobStore, FsBlobStore};

const FEED_CAPACITY: usize = 256;

const MESSAGE_COLUMNS: &str = "id, room_id, author_id, author_name, created_at, display_time, text,
     attachment_kind, attachment_blob_key, attachment_state, attachment_url,
     correction_original, correction_text, correction_edited_at";

/// Result of trying to attach a correction to a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CorrectionWrite {
    Committed(EditRecord),
    AlreadyEdited,
    Missing,
}

/// Keyed persistence of rooms, messages and the per-user recent-room index,
/// plus the push feed announcing room changes.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn insert_message(&self, message: NewMessage) -> Result<Message>;
    async fn load_message(&self, message_id: MessageId) -> Result<Option<Message>>;
    /// Single consistent read of every message in a room, oldest first.
    async fn load_room_messages(&self, room_id: RoomId) -> Result<Vec<Message>>;
    /// Field-level write of a pending attachment's settled state; leaves text
    /// and correction alone. `false` when the message is gone or the
    /// attachment already settled.
    async fn update_attachment_state(
        &self,
        message_id: MessageId,
        state: AttachmentState,
        url: Option<&str>,
    ) -> Result<bool>;
    async fn commit_correction(
        &self,
        message_id: MessageId,
        corrected_text: &str,
        edited_at: DateTime<Utc>,
    ) -> Result<CorrectionWrite>;
    async fn delete_message(&self, message_id: MessageId) -> Result<bool>;
    async fn create_room(&self, display_name: &str, photo_ref: Option<&str>) -> Result<Room>;
    async fn load_room(&self, room_id: RoomId) -> Result<Option<Room>>;
    async fn delete_room(&self, room_id: RoomId) -> Result<bool>;
    async fn upsert_recent_room(&self, entry: &RecentRoom) -> Result<()>;
    async fn delete_recent_room(&self, user_id: UserId, room_id: RoomId) -> Result<bool>;
    async fn list_recent_rooms(&self, user_id: UserId) -> Result<Vec<RecentRoom>>;
    /// Attachments of messages created before `cutoff` that are still pending.
    async fn stale_pending_attachments(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<(MessageId, Attachment)>>;
    fn subscribe(&self) -> broadcast::Receiver<FeedEvent>;
}

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
    feed: broadcast::Sender<FeedEvent>,
    // Held across each feed-visible write and its snapshot publish so
    // deliveries leave in commit order.
    publish_lock: Arc<Mutex<()>>,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        // Every connection to `sqlite::memory:` is its own database, so pin one.
        let pool_options = if is_memory_url(database_url) {
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
            .with_context(|| format!("failed to open sqlite database '{database_url}'"))?;
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context("failed to run chat migrations")?;
        let (feed, _) = broadcast::channel(FEED_CAPACITY);
        Ok(Self {
            pool,
            feed,
            publish_lock: Arc::new(Mutex::new(())),
        })
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    async fn publish_room(&self, room_id: RoomId) {
        if self.feed.receiver_count() == 0 {
            return;
        }
        match self.load_room_messages(room_id).await {
            Ok(messages) => {
                let _ = self.feed.send(FeedEvent::RoomChanged {
                    snapshot: RoomSnapshot { room_id, messages },
                });
            }
            Err(error) => {
                warn!(room_id = room_id.0, %error, "failed to build room snapshot for feed");
            }
        }
    }

    async fn room_of_message(&self, message_id: MessageId) -> Result<Option<RoomId>> {
        let row = sqlx::query("SELECT room_id FROM messages WHERE id = ?")
            .bind(message_id.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| RoomId(r.get::<i64, _>(0))))
    }
}

#[async_trait]
impl DocumentStore for Storage {
    async fn insert_message(&self, message: NewMessage) -> Result<Message> {
        if message.text.is_empty() && message.attachment.is_none() {
            return Err(anyhow!("message needs text or an attachment"));
        }

        let _publishing = self.publish_lock.lock().await;
        let created_at = Utc::now();
        let attachment = message.attachment.as_ref();
        let row = sqlx::query(&format!(
            "INSERT INTO messages (room_id, author_id, author_name, created_at, display_time, text,
                                   attachment_kind, attachment_blob_key, attachment_state, attachment_url)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             RETURNING {MESSAGE_COLUMNS}"
        ))
        .bind(message.room_id.0)
        .bind(message.author_id.0)
        .bind(message.author_name.as_deref())
        .bind(created_at)
        .bind(&message.display_time)
        .bind(&message.text)
        .bind(attachment.map(|a| a.kind.as_str()))
        .bind(attachment.map(|a| a.blob_key.as_str()))
        .bind(attachment.map(|a| a.state.as_str()))
        .bind(attachment.and_then(|a| a.url.as_deref()))
        .fetch_one(&self.pool)
        .await
        .with_context(|| format!("failed to insert message into room {}", message.room_id))?;

        let stored = message_from_row(&row)?;
        self.publish_room(stored.room_id).await;
        Ok(stored)
    }

    async fn load_message(&self, message_id: MessageId) -> Result<Option<Message>> {
        let row = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?"
        ))
        .bind(message_id.0)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(message_from_row).transpose()
    }

    async fn load_room_messages(&self, room_id: RoomId) -> Result<Vec<Message>> {
        let rows = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS}
             FROM messages
             WHERE room_id = ?
             ORDER BY created_at ASC, id ASC"
        ))
        .bind(room_id.0)
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("failed to load messages for room {room_id}"))?;
        rows.iter().map(message_from_row).collect()
    }

    async fn update_attachment_state(
        &self,
        message_id: MessageId,
        state: AttachmentState,
        url: Option<&str>,
    ) -> Result<bool> {
        if !state.is_settled() {
            return Err(anyhow!(
                "attachment of message {message_id} can only move to a settled state"
            ));
        }
        let _publishing = self.publish_lock.lock().await;
        let row = sqlx::query(
            "UPDATE messages
             SET attachment_state = ?, attachment_url = ?
             WHERE id = ? AND attachment_blob_key IS NOT NULL AND attachment_state = 'pending'
             RETURNING room_id",
        )
        .bind(state.as_str())
        .bind(url)
        .bind(message_id.0)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("failed to update attachment of message {message_id}"))?;

        let Some(row) = row else {
            return Ok(false);
        };
        self.publish_room(RoomId(row.get::<i64, _>(0))).await;
        Ok(true)
    }

    async fn commit_correction(
        &self,
        message_id: MessageId,
        corrected_text: &str,
        edited_at: DateTime<Utc>,
    ) -> Result<CorrectionWrite> {
        let _publishing = self.publish_lock.lock().await;
        // Original text is copied inside the same statement as the write.
        let row = sqlx::query(
            "UPDATE messages
             SET correction_original = text, correction_text = ?, correction_edited_at = ?
             WHERE id = ? AND correction_text IS NULL
             RETURNING room_id, correction_original",
        )
        .bind(corrected_text)
        .bind(edited_at)
        .bind(message_id.0)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("failed to commit correction for message {message_id}"))?;

        match row {
            Some(row) => {
                let record = EditRecord {
                    original_text: row.get::<String, _>(1),
                    corrected_text: corrected_text.to_string(),
                    edited_at,
                };
                self.publish_room(RoomId(row.get::<i64, _>(0))).await;
                Ok(CorrectionWrite::Committed(record))
            }
            None => match self.room_of_message(message_id).await? {
                Some(_) => Ok(CorrectionWrite::AlreadyEdited),
                None => Ok(CorrectionWrite::Missing),
            },
        }
    }

    async fn delete_message(&self, message_id: MessageId) -> Result<bool> {
        let _publishing = self.publish_lock.lock().await;
        let row = sqlx::query("DELETE FROM messages WHERE id = ? RETURNING room_id")
            .bind(message_id.0)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("failed to delete message {message_id}"))?;

        let Some(row) = row else {
            return Ok(false);
        };
        self.publish_room(RoomId(row.get::<i64, _>(0))).await;
        Ok(true)
    }

    async fn create_room(&self, display_name: &str, photo_ref: Option<&str>) -> Result<Room> {
        let rec = sqlx::query(
            "INSERT INTO rooms (display_name, photo_ref, created_at) VALUES (?, ?, ?) RETURNING id",
        )
        .bind(display_name)
        .bind(photo_ref)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await
        .context("failed to create room")?;
        Ok(Room {
            id: RoomId(rec.get::<i64, _>(0)),
            display_name: display_name.to_string(),
            photo_ref: photo_ref.map(str::to_string),
        })
    }

    async fn load_room(&self, room_id: RoomId) -> Result<Option<Room>> {
        let row = sqlx::query("SELECT id, display_name, photo_ref FROM rooms WHERE id = ?")
            .bind(room_id.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| Room {
            id: RoomId(r.get::<i64, _>(0)),
            display_name: r.get::<String, _>(1),
            photo_ref: r.get::<Option<String>, _>(2),
        }))
    }

    async fn delete_room(&self, room_id: RoomId) -> Result<bool> {
        let _publishing = self.publish_lock.lock().await;
        let result = sqlx::query("DELETE FROM rooms WHERE id = ?")
            .bind(room_id.0)
            .execute(&self.pool)
            .await
            .with_context(|| format!("failed to delete room {room_id}"))?;
        let _ = self.feed.send(FeedEvent::RoomDeleted { room_id });
        Ok(result.rows_affected() > 0)
    }

    async fn upsert_recent_room(&self, entry: &RecentRoom) -> Result<()> {
        sqlx::query(
            "INSERT INTO recent_rooms (user_id, room_id, display_name, photo_ref, last_activity)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(user_id, room_id) DO UPDATE SET
                display_name = excluded.display_name,
                photo_ref = excluded.photo_ref,
                last_activity = excluded.last_activity",
        )
        .bind(entry.user_id.0)
        .bind(entry.room_id.0)
        .bind(&entry.display_name)
        .bind(entry.photo_ref.as_deref())
        .bind(entry.last_activity)
        .execute(&self.pool)
        .await
        .with_context(|| {
            format!(
                "failed to upsert recent room {} for user {}",
                entry.room_id, entry.user_id
            )
        })?;
        Ok(())
    }

    async fn delete_recent_room(&self, user_id: UserId, room_id: RoomId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM recent_rooms WHERE user_id = ? AND room_id = ?")
            .bind(user_id.0)
            .bind(room_id.0)
            .execute(&self.pool)
            .await
            .with_context(|| format!("failed to delete recent room {room_id} for user {user_id}"))?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_recent_rooms(&self, user_id: UserId) -> Result<Vec<RecentRoom>> {
        let rows = sqlx::query(
            "SELECT user_id, room_id, display_name, photo_ref, last_activity
             FROM recent_rooms
             WHERE user_id = ?
             ORDER BY last_activity DESC, room_id DESC",
        )
        .bind(user_id.0)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| RecentRoom {
                user_id: UserId(r.get::<i64, _>(0)),
                room_id: RoomId(r.get::<i64, _>(1)),
                display_name: r.get::<String, _>(2),
                photo_ref: r.get::<Option<String>, _>(3),
                last_activity: r.get::<DateTime<Utc>, _>(4),
            })
            .collect())
    }

    async fn stale_pending_attachments(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<(MessageId, Attachment)>> {
        let rows = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS}
             FROM messages
             WHERE attachment_state = 'pending' AND created_at < ?
             ORDER BY created_at ASC, id ASC"
        ))
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await
        .context("failed to list stale pending attachments")?;

        let mut stale = Vec::with_capacity(rows.len());
        for row in &rows {
            let message = message_from_row(row)?;
            if let Some(attachment) = message.attachment {
                stale.push((message.id, attachment));
            }
        }
        Ok(stale)
    }

    fn subscribe(&self) -> broadcast::Receiver<FeedEvent> {
        self.feed.subscribe()
    }
}

fn message_from_row(r: &SqliteRow) -> Result<Message> {
    let attachment = match (
        r.get::<Option<String>, _>("attachment_kind"),
        r.get::<Option<String>, _>("attachment_blob_key"),
    ) {
        (Some(kind), Some(blob_key)) => {
            let kind = AttachmentKind::parse(&kind)
                .ok_or_else(|| anyhow!("unknown attachment kind '{kind}'"))?;
            let raw_state = r
                .get::<Option<String>, _>("attachment_state")
                .unwrap_or_else(|| "pending".to_string());
            let state = AttachmentState::parse(&raw_state)
                .ok_or_else(|| anyhow!("unknown attachment state '{raw_state}'"))?;
            Some(Attachment {
                kind,
                blob_key: BlobKey(blob_key),
                state,
                url: r.get::<Option<String>, _>("attachment_url"),
            })
        }
        _ => None,
    };

    let correction = match (
        r.get::<Option<String>, _>("correction_original"),
        r.get::<Option<String>, _>("correction_text"),
        r.get::<Option<DateTime<Utc>>, _>("correction_edited_at"),
    ) {
        (Some(original_text), Some(corrected_text), Some(edited_at)) => Some(EditRecord {
            original_text,
            corrected_text,
            edited_at,
        }),
        _ => None,
    };

    Ok(Message {
        id: MessageId(r.get::<i64, _>("id")),
        room_id: RoomId(r.get::<i64, _>("room_id")),
        author_id: UserId(r.get::<i64, _>("author_id")),
        author_name: r.get::<Option<String>, _>("author_name"),
        created_at: r.get::<DateTime<Utc>, _>("created_at"),
        display_time: r.get::<String, _>("display_time"),
        text: r.get::<String, _>("text"),
        attachment,
        correction,
    })
}

fn is_memory_url(database_url: &str) -> bool {
    database_url.starts_with("sqlite::memory:") || database_url.contains("mode=memory")
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if is_memory_url(database_url) || !database_url.starts_with("sqlite:") {
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
