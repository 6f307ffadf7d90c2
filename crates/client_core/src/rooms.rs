use std::{
    fmt,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use futures::future::join_all;
use serde::Serialize;
use shared::domain::{AttachmentKind, BlobKey, MessageId, RecentRoom, Room, RoomId, UserId};
use storage::DocumentStore;
use tokio::sync::watch;
use tracing::{error, info};

use crate::{attachments::AttachmentPipeline, error::CoreError};

const PLACEHOLDER_AVATAR_BASE: &str = "https://api.dicebear.com/9.x/identicon/svg?seed=";

/// Room metadata as the sidebar and header show it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoomProfile {
    pub id: RoomId,
    pub display_name: String,
    pub photo_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CascadeTarget {
    MessageSnapshot,
    RecentIndex,
    RoomRecord,
    Message(MessageId),
    Blob { kind: AttachmentKind, key: BlobKey },
}

impl fmt::Display for CascadeTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CascadeTarget::MessageSnapshot => f.write_str("message snapshot"),
            CascadeTarget::RecentIndex => f.write_str("recent-room index entry"),
            CascadeTarget::RoomRecord => f.write_str("room record"),
            CascadeTarget::Message(id) => write!(f, "message {id}"),
            CascadeTarget::Blob { kind, key } => write!(f, "{}/{key}", kind.namespace()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CascadeFailure {
    pub target: CascadeTarget,
    pub error: String,
}

/// Outcome of a room cascade. Failures are listed, never rolled back.
#[derive(Debug, Clone)]
pub struct CascadeReport {
    pub room_id: RoomId,
    pub messages_deleted: usize,
    pub blobs_deleted: usize,
    pub failures: Vec<CascadeFailure>,
}

impl CascadeReport {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Coordinates room records, the per-user recent index, and the room
/// cascade delete.
pub struct RoomLifecycle {
    docs: Arc<dyn DocumentStore>,
    pipeline: AttachmentPipeline,
    in_flight_deletes: AtomicUsize,
    deleting: watch::Sender<bool>,
}

/// Holds the deleting flag up; dropping it lowers the flag on every exit path.
struct DeletingGuard<'a> {
    rooms: &'a RoomLifecycle,
}

impl<'a> DeletingGuard<'a> {
    fn raise(rooms: &'a RoomLifecycle) -> Self {
        rooms.in_flight_deletes.fetch_add(1, Ordering::SeqCst);
        rooms.deleting.send_replace(true);
        Self { rooms }
    }
}

impl Drop for DeletingGuard<'_> {
    fn drop(&mut self) {
        let remaining = self.rooms.in_flight_deletes.fetch_sub(1, Ordering::SeqCst) - 1;
        self.rooms.deleting.send_replace(remaining > 0);
    }
}

impl RoomLifecycle {
    pub fn new(docs: Arc<dyn DocumentStore>, pipeline: AttachmentPipeline) -> Self {
        let (deleting, _) = watch::channel(false);
        Self {
            docs,
            pipeline,
            in_flight_deletes: AtomicUsize::new(0),
            deleting,
        }
    }

    pub async fn create_room(
        &self,
        display_name: &str,
        photo_ref: Option<&str>,
    ) -> Result<Room, CoreError> {
        if display_name.trim().is_empty() {
            return Err(CoreError::Validation("room name is empty".into()));
        }
        let room = self.docs.create_room(display_name.trim(), photo_ref).await?;
        info!(room_id = room.id.0, "room created");
        Ok(room)
    }

    pub async fn room_profile(&self, room_id: RoomId) -> Result<RoomProfile, CoreError> {
        let room = self
            .docs
            .load_room(room_id)
            .await?
            .ok_or(CoreError::RoomNotFound(room_id))?;
        Ok(RoomProfile {
            id: room.id,
            photo_url: photo_url_or_placeholder(room.id, room.photo_ref.as_deref()),
            display_name: room.display_name,
        })
    }

    pub async fn recent_rooms(&self, user_id: UserId) -> Result<Vec<RecentRoom>, CoreError> {
        Ok(self.docs.list_recent_rooms(user_id).await?)
    }

    pub fn is_deleting(&self) -> bool {
        *self.deleting.borrow()
    }

    pub fn subscribe_deleting(&self) -> watch::Receiver<bool> {
        self.deleting.subscribe()
    }

    /// Best-effort cascade: the requester's index entry, the room record,
    /// every message record and every attachment blob, all issued
    /// concurrently. Individual failures are logged and reported; the rest
    /// still runs.
    pub async fn delete_room(&self, room_id: RoomId, requesting_user: UserId) -> CascadeReport {
        let _guard = DeletingGuard::raise(self);
        let mut failures = Vec::new();

        let messages = match self.docs.load_room_messages(room_id).await {
            Ok(messages) => messages,
            Err(error) => {
                failures.push(CascadeFailure {
                    target: CascadeTarget::MessageSnapshot,
                    error: format!("{error:#}"),
                });
                Vec::new()
            }
        };

        let message_ids: Vec<MessageId> = messages.iter().map(|m| m.id).collect();
        let mut image_keys = Vec::new();
        let mut audio_keys = Vec::new();
        for attachment in messages.into_iter().filter_map(|m| m.attachment) {
            match attachment.kind {
                AttachmentKind::Image => image_keys.push(attachment.blob_key),
                AttachmentKind::Audio => audio_keys.push(attachment.blob_key),
            }
        }
        let blobs: Vec<(AttachmentKind, BlobKey)> = image_keys
            .into_iter()
            .map(|key| (AttachmentKind::Image, key))
            .chain(audio_keys.into_iter().map(|key| (AttachmentKind::Audio, key)))
            .collect();

        let index = async {
            self.docs
                .delete_recent_room(requesting_user, room_id)
                .await
                .map_err(|err| (CascadeTarget::RecentIndex, err))
        };
        let record = async {
            self.docs
                .delete_room(room_id)
                .await
                .map_err(|err| (CascadeTarget::RoomRecord, err))
        };
        let message_deletes = join_all(message_ids.iter().map(|&id| async move {
            self.docs
                .delete_message(id)
                .await
                .map_err(|err| (CascadeTarget::Message(id), err))
        }));
        let blob_deletes = join_all(blobs.iter().map(|(kind, key)| async move {
            self.pipeline
                .delete_attachment(*kind, key)
                .await
                .map_err(|err| {
                    (
                        CascadeTarget::Blob {
                            kind: *kind,
                            key: key.clone(),
                        },
                        err,
                    )
                })
        }));

        let (index, record, message_results, blob_results) =
            tokio::join!(index, record, message_deletes, blob_deletes);

        let mut messages_deleted = 0;
        let mut blobs_deleted = 0;
        let mut record_failure = |(target, err): (CascadeTarget, anyhow::Error)| {
            failures.push(CascadeFailure {
                target,
                error: format!("{err:#}"),
            });
        };
        if let Err(failure) = index {
            record_failure(failure);
        }
        if let Err(failure) = record {
            record_failure(failure);
        }
        for result in message_results {
            match result {
                Ok(_) => messages_deleted += 1,
                Err(failure) => record_failure(failure),
            }
        }
        for result in blob_results {
            match result {
                Ok(()) => blobs_deleted += 1,
                Err(failure) => record_failure(failure),
            }
        }

        for failure in &failures {
            error!(
                room_id = room_id.0,
                target = %failure.target,
                error = %failure.error,
                "room cascade step failed"
            );
        }
        info!(
            room_id = room_id.0,
            messages_deleted,
            blobs_deleted,
            failures = failures.len(),
            "room deleted"
        );

        CascadeReport {
            room_id,
            messages_deleted,
            blobs_deleted,
            failures,
        }
    }
}

pub fn photo_url_or_placeholder(room_id: RoomId, photo_ref: Option<&str>) -> String {
    match photo_ref.map(str::trim).filter(|p| !p.is_empty()) {
        Some(photo) => photo.to_string(),
        None => format!("{PLACEHOLDER_AVATAR_BASE}{room_id}"),
    }
}

#[cfg(test)]
#[path = "tests/rooms_tests.rs"]
mod tests;
