use std::sync::Arc;

use anyhow::{Context, Result};
use shared::domain::{RoomId, UserId};
use storage::{BlobStore, DocumentStore, FsBlobStore, Storage};
use tracing::info;

pub mod attachments;
pub mod config;
pub mod error;
pub mod messages;
pub mod overlay;
pub mod rooms;
pub mod services;
pub mod view;

pub use attachments::{AttachmentDraft, AttachmentPipeline, UploadOutcome};
pub use config::{load_config, CoreConfig};
pub use error::{AttachmentFailure, CoreError, ServiceError};
pub use messages::{Author, MessageStore, SendReceipt};
pub use overlay::{diff, DiffToken, EditOverlay};
pub use rooms::{CascadeReport, RoomLifecycle, RoomProfile};
pub use view::{MessageDisplay, RoomView, RoomViewHandle};

use services::{
    HttpSpeechToText, HttpTranslator, MissingSpeechToText, MissingTranslator, SpeechToText,
    Translator,
};

/// Collaborators the core is assembled from. Everything is explicit; there
/// are no process-wide handles.
pub struct CoreParts {
    pub docs: Arc<dyn DocumentStore>,
    pub blobs: Arc<dyn BlobStore>,
    pub translator: Arc<dyn Translator>,
    pub speech: Arc<dyn SpeechToText>,
}

pub struct ChatCore {
    config: CoreConfig,
    docs: Arc<dyn DocumentStore>,
    pub messages: Arc<MessageStore>,
    pub rooms: Arc<RoomLifecycle>,
}

impl ChatCore {
    /// Opens the SQLite document store and filesystem blob store named in
    /// `config` and wires the HTTP services when credentials are present.
    pub async fn open(config: CoreConfig) -> Result<Self> {
        let database_url = config::normalize_database_url(&config.database_url);
        let storage = Storage::new(&database_url)
            .await
            .with_context(|| format!("failed to open document store at '{database_url}'"))?;
        let blobs = FsBlobStore::new(
            &config.blob_root,
            config.blob_public_base_url.as_deref(),
            config.blob_max_bytes,
        )
        .await?;

        let translator: Arc<dyn Translator> = match &config.translation_api_key {
            Some(key) => Arc::new(HttpTranslator::new(&config.translation_endpoint, key)),
            None => Arc::new(MissingTranslator),
        };
        let speech: Arc<dyn SpeechToText> = match &config.speech_api_key {
            Some(key) => Arc::new(HttpSpeechToText::new(&config.speech_endpoint, key)),
            None => Arc::new(MissingSpeechToText),
        };

        info!(%database_url, blob_root = %blobs.root().display(), "chat core opened");
        Ok(Self::with_parts(
            config,
            CoreParts {
                docs: Arc::new(storage),
                blobs: Arc::new(blobs),
                translator,
                speech,
            },
        ))
    }

    pub fn with_parts(config: CoreConfig, parts: CoreParts) -> Self {
        let pipeline = AttachmentPipeline::new(
            parts.blobs,
            config.image_settings(),
            config.upload_timeout(),
        );
        let messages = MessageStore::new(
            Arc::clone(&parts.docs),
            pipeline.clone(),
            parts.translator,
            parts.speech,
            config.speech(),
            config.upload_timeout(),
        );
        let rooms = RoomLifecycle::new(Arc::clone(&parts.docs), pipeline);
        Self {
            config,
            docs: parts.docs,
            messages: Arc::new(messages),
            rooms: Arc::new(rooms),
        }
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    /// Starts a feed-driven view of `room_id`, seeded with the current
    /// messages so it is usable before the first push arrives.
    pub async fn watch_room(&self, room_id: RoomId, viewer: UserId) -> Result<RoomViewHandle, CoreError> {
        let feed = self.docs.subscribe();
        let snapshot = self.messages.snapshot(room_id).await?;
        let mut view = RoomView::new(room_id, viewer);
        view.apply(&shared::protocol::FeedEvent::RoomChanged { snapshot });
        Ok(view.spawn_listener(feed))
    }
}

#[cfg(test)]
#[path = "tests/support.rs"]
pub(crate) mod test_support;

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
