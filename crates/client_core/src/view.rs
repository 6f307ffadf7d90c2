use serde::Serialize;
use shared::{
    domain::{AttachmentKind, AttachmentState, Message, MessageId, RoomId, UserId},
    protocol::FeedEvent,
};
use tokio::{
    sync::{broadcast, watch},
    task::JoinHandle,
};
use tokio_stream::{
    wrappers::{errors::BroadcastStreamRecvError, BroadcastStream},
    StreamExt,
};
use tracing::{debug, warn};

use crate::{messages::MessageStore, overlay::EditOverlay};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AttachmentDisplay {
    Uploading { kind: AttachmentKind },
    Ready { kind: AttachmentKind, url: String },
    Failed { kind: AttachmentKind },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MessageDisplay {
    pub id: MessageId,
    pub author_id: UserId,
    pub author_name: Option<String>,
    pub is_own: bool,
    pub display_time: String,
    pub text: String,
    pub overlay: Option<EditOverlay>,
    pub attachment: Option<AttachmentDisplay>,
    pub translation: Option<String>,
    pub transcript: Option<String>,
}

pub fn attachment_display(message: &Message) -> Option<AttachmentDisplay> {
    let attachment = message.attachment.as_ref()?;
    let kind = attachment.kind;
    Some(match (attachment.state, attachment.url.as_ref()) {
        (AttachmentState::Pending, _) => AttachmentDisplay::Uploading { kind },
        (AttachmentState::Resolved, Some(url)) => AttachmentDisplay::Ready {
            kind,
            url: url.clone(),
        },
        (AttachmentState::Resolved, None) | (AttachmentState::Failed, _) => {
            AttachmentDisplay::Failed { kind }
        }
    })
}

/// Client-side view of one room, rebuilt wholesale from every feed delivery.
#[derive(Debug, Clone)]
pub struct RoomView {
    room_id: RoomId,
    viewer: UserId,
    messages: Vec<Message>,
    deleted: bool,
}

impl RoomView {
    pub fn new(room_id: RoomId, viewer: UserId) -> Self {
        Self {
            room_id,
            viewer,
            messages: Vec::new(),
            deleted: false,
        }
    }

    pub fn room_id(&self) -> RoomId {
        self.room_id
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    /// Returns whether the event concerned this room.
    pub fn apply(&mut self, event: &FeedEvent) -> bool {
        if event.room_id() != self.room_id {
            return false;
        }
        match event {
            FeedEvent::RoomChanged { snapshot } => {
                self.messages = snapshot.messages.clone();
            }
            FeedEvent::RoomDeleted { .. } => {
                self.messages.clear();
                self.deleted = true;
            }
        }
        true
    }

    pub async fn render(&self, store: &MessageStore, translation_lang: &str) -> Vec<MessageDisplay> {
        let mut rows = Vec::with_capacity(self.messages.len());
        for message in &self.messages {
            rows.push(MessageDisplay {
                id: message.id,
                author_id: message.author_id,
                author_name: message.author_name.clone(),
                is_own: message.author_id == self.viewer,
                display_time: message.display_time.clone(),
                text: message.text.clone(),
                overlay: EditOverlay::for_message(message),
                attachment: attachment_display(message),
                translation: store.cached_translation(message.id, translation_lang).await,
                transcript: store.cached_transcript(message.id).await,
            });
        }
        rows
    }

    /// Consumes the push feed on a background task and republishes the
    /// updated view after every delivery for this room.
    pub fn spawn_listener(self, feed: broadcast::Receiver<FeedEvent>) -> RoomViewHandle {
        let room_id = self.room_id;
        let (updates_tx, updates) = watch::channel(self);
        let task = tokio::spawn(async move {
            let mut stream = BroadcastStream::new(feed);
            while let Some(item) = stream.next().await {
                match item {
                    Ok(event) => {
                        let mut changed = false;
                        updates_tx.send_if_modified(|view| {
                            changed = view.apply(&event);
                            changed
                        });
                        if changed && updates_tx.borrow().is_deleted() {
                            debug!(room_id = room_id.0, "room deleted; feed listener stopping");
                            break;
                        }
                    }
                    Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                        // The next snapshot replaces everything anyway.
                        warn!(room_id = room_id.0, skipped, "room feed lagged");
                    }
                }
                if updates_tx.is_closed() {
                    break;
                }
            }
        });
        RoomViewHandle { updates, task }
    }
}

pub struct RoomViewHandle {
    pub updates: watch::Receiver<RoomView>,
    task: JoinHandle<()>,
}

impl RoomViewHandle {
    pub fn current(&self) -> RoomView {
        self.updates.borrow().clone()
    }

    pub fn stop(self) {
        self.task.abort();
    }
}

#[cfg(test)]
#[path = "tests/view_tests.rs"]
mod tests;
