use std::{collections::HashMap, sync::Arc, time::Duration};

use chrono::Utc;
use shared::{
    domain::{
        Attachment, AttachmentKind, AttachmentState, BlobKey, EditRecord, Message, MessageId, NewMessage,
        RecentRoom, RoomId, UserId,
    },
    protocol::RoomSnapshot,
};
use storage::{CorrectionWrite, DocumentStore};
use tokio::{sync::RwLock, task::JoinHandle};
use tracing::{debug, error, info, warn};

use crate::{
    attachments::{AttachmentDraft, AttachmentPipeline},
    config::SpeechConfig,
    error::{CoreError, ServiceError},
    services::{SpeechToText, Translator},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Author {
    pub id: UserId,
    pub display_name: Option<String>,
}

impl Author {
    pub fn new(id: UserId, display_name: impl Into<String>) -> Self {
        Self {
            id,
            display_name: Some(display_name.into()),
        }
    }
}

impl From<UserId> for Author {
    fn from(id: UserId) -> Self {
        Self {
            id,
            display_name: None,
        }
    }
}

/// What `send` hands back: the message as first written, plus the follow-up
/// that flips its attachment once the upload settles.
pub struct SendReceipt {
    pub message: Message,
    follow_up: Option<JoinHandle<AttachmentState>>,
}

impl SendReceipt {
    pub fn message_id(&self) -> MessageId {
        self.message.id
    }

    /// Waits for the attachment follow-up write. `None` for text-only sends.
    pub async fn attachment_settled(self) -> Option<AttachmentState> {
        let follow_up = self.follow_up?;
        match follow_up.await {
            Ok(state) => Some(state),
            Err(err) => {
                error!(message_id = self.message.id.0, error = %err, "attachment follow-up task died");
                Some(AttachmentState::Failed)
            }
        }
    }
}

/// Sole writer of message records: sends, corrections, deletions and the
/// attachment state flip. Also keeps the per-session translation and
/// transcription caches.
pub struct MessageStore {
    docs: Arc<dyn DocumentStore>,
    pipeline: AttachmentPipeline,
    translator: Arc<dyn Translator>,
    speech: Arc<dyn SpeechToText>,
    speech_config: SpeechConfig,
    upload_timeout: Duration,
    translations: RwLock<HashMap<(MessageId, String), String>>,
    transcripts: RwLock<HashMap<MessageId, String>>,
}

impl MessageStore {
    pub fn new(
        docs: Arc<dyn DocumentStore>,
        pipeline: AttachmentPipeline,
        translator: Arc<dyn Translator>,
        speech: Arc<dyn SpeechToText>,
        speech_config: SpeechConfig,
        upload_timeout: Duration,
    ) -> Self {
        Self {
            docs,
            pipeline,
            translator,
            speech,
            speech_config,
            upload_timeout,
            translations: RwLock::new(HashMap::new()),
            transcripts: RwLock::new(HashMap::new()),
        }
    }

    pub async fn send(
        &self,
        room_id: RoomId,
        author: &Author,
        text: &str,
        draft: Option<AttachmentDraft>,
    ) -> Result<SendReceipt, CoreError> {
        let text = if text.trim().is_empty() { "" } else { text };
        if let Some(draft) = &draft {
            if draft.bytes.is_empty() {
                return Err(CoreError::Validation("attachment has no content".into()));
            }
        }
        if text.is_empty() && draft.is_none() {
            return Err(CoreError::Validation(
                "message needs text or an attachment".into(),
            ));
        }

        let room = self
            .docs
            .load_room(room_id)
            .await?
            .ok_or(CoreError::RoomNotFound(room_id))?;

        let recent = RecentRoom {
            user_id: author.id,
            room_id,
            display_name: room.display_name.clone(),
            photo_ref: room.photo_ref.clone(),
            last_activity: Utc::now(),
        };
        if let Err(error) = self.docs.upsert_recent_room(&recent).await {
            warn!(room_id = room_id.0, user_id = author.id.0, %error, "failed to refresh recent room entry");
        }

        let blob_key = draft.as_ref().map(|_| BlobKey::generate());
        let attachment = draft
            .as_ref()
            .zip(blob_key.clone())
            .map(|(draft, key)| Attachment::pending(draft.kind, key));

        let message = self
            .docs
            .insert_message(NewMessage {
                room_id,
                author_id: author.id,
                author_name: author.display_name.clone(),
                display_time: Utc::now().to_rfc2822(),
                text: text.to_string(),
                attachment,
            })
            .await?;
        info!(message_id = message.id.0, room_id = room_id.0, "message sent");

        let follow_up = match (draft, blob_key) {
            (Some(draft), Some(key)) => Some(self.spawn_attachment_follow_up(message.id, draft, key)),
            _ => None,
        };

        Ok(SendReceipt { message, follow_up })
    }

    fn spawn_attachment_follow_up(
        &self,
        message_id: MessageId,
        draft: AttachmentDraft,
        key: BlobKey,
    ) -> JoinHandle<AttachmentState> {
        let kind = draft.kind;
        let pending = self.pipeline.begin_upload(kind, draft.bytes, key.clone());
        let docs = Arc::clone(&self.docs);
        let pipeline = self.pipeline.clone();

        tokio::spawn(async move {
            let outcome = pending.settle().await;
            let state = outcome.state();
            match docs
                .update_attachment_state(message_id, state, outcome.url())
                .await
            {
                Ok(true) => {
                    debug!(message_id = message_id.0, state = state.as_str(), "attachment settled");
                    state
                }
                Ok(false) => {
                    settle_after_lost_write(docs.as_ref(), &pipeline, message_id, kind, &key, state)
                        .await
                }
                Err(error) => {
                    error!(message_id = message_id.0, %error, "failed to record attachment state");
                    state
                }
            }
        })
    }

    /// One correction per message. The stored `text` stays the original.
    pub async fn edit_commit(
        &self,
        message_id: MessageId,
        new_text: &str,
    ) -> Result<EditRecord, CoreError> {
        if new_text.trim().is_empty() {
            return Err(CoreError::Validation("correction text is empty".into()));
        }

        match self
            .docs
            .commit_correction(message_id, new_text, Utc::now())
            .await?
        {
            CorrectionWrite::Committed(record) => {
                info!(message_id = message_id.0, "correction committed");
                self.forget_translations(message_id).await;
                Ok(record)
            }
            CorrectionWrite::AlreadyEdited => Err(CoreError::AlreadyEdited { message_id }),
            CorrectionWrite::Missing => Err(CoreError::MessageNotFound(message_id)),
        }
    }

    /// Removes the attachment blob (best effort) and then the message record.
    pub async fn delete_message(&self, message_id: MessageId) -> Result<(), CoreError> {
        let Some(message) = self.docs.load_message(message_id).await? else {
            debug!(message_id = message_id.0, "message already deleted");
            return Ok(());
        };

        if let Some(attachment) = &message.attachment {
            if let Err(error) = self
                .pipeline
                .delete_attachment(attachment.kind, &attachment.blob_key)
                .await
            {
                error!(
                    message_id = message_id.0,
                    blob_key = %attachment.blob_key,
                    %error,
                    "failed to delete attachment blob; deleting message anyway"
                );
            }
        }

        self.docs.delete_message(message_id).await?;
        self.forget_translations(message_id).await;
        self.clear_transcription(message_id).await;
        info!(message_id = message_id.0, "message deleted");
        Ok(())
    }

    pub async fn snapshot(&self, room_id: RoomId) -> Result<RoomSnapshot, CoreError> {
        let messages = self.docs.load_room_messages(room_id).await?;
        Ok(RoomSnapshot { room_id, messages })
    }

    /// Settles attachments left pending past the upload timeout: resolved
    /// when the blob reached the store, failed otherwise. A blob lookup error
    /// leaves the attachment pending for the next pass.
    pub async fn reconcile_stale_uploads(
        &self,
    ) -> Result<Vec<(MessageId, AttachmentState)>, CoreError> {
        let window = chrono::Duration::from_std(self.upload_timeout)
            .unwrap_or_else(|_| chrono::Duration::days(3650));
        let stale = self
            .docs
            .stale_pending_attachments(Utc::now() - window)
            .await?;

        let mut settled = Vec::new();
        for (message_id, attachment) in stale {
            let url = match self
                .pipeline
                .blobs()
                .url(attachment.kind, &attachment.blob_key)
                .await
            {
                Ok(url) => url,
                Err(error) => {
                    warn!(
                        message_id = message_id.0,
                        blob_key = %attachment.blob_key,
                        %error,
                        "failed to look up stale attachment blob"
                    );
                    continue;
                }
            };
            let state = if url.is_some() {
                AttachmentState::Resolved
            } else {
                AttachmentState::Failed
            };
            if self
                .docs
                .update_attachment_state(message_id, state, url.as_deref())
                .await?
            {
                settled.push((message_id, state));
            }
        }
        if !settled.is_empty() {
            warn!(count = settled.len(), "settled stale pending attachments");
        }
        Ok(settled)
    }

    /// Translates through the external service and caches the result for
    /// this session. Any service failure yields `None`.
    pub async fn request_translation(
        &self,
        message_id: MessageId,
        text: &str,
        target_lang: &str,
    ) -> Option<String> {
        let key = (message_id, target_lang.to_string());
        if let Some(hit) = self.translations.read().await.get(&key) {
            return Some(hit.clone());
        }

        match self.translator.translate(text, target_lang).await {
            Ok(translated) => {
                self.translations
                    .write()
                    .await
                    .insert(key, translated.clone());
                Some(translated)
            }
            Err(error) => {
                warn!(message_id = message_id.0, target_lang, %error, "translation failed");
                None
            }
        }
    }

    pub async fn cached_translation(&self, message_id: MessageId, lang: &str) -> Option<String> {
        self.translations
            .read()
            .await
            .get(&(message_id, lang.to_string()))
            .cloned()
    }

    /// Local only; the stored message is not touched.
    pub async fn clear_translation(&self, message_id: MessageId, lang: &str) {
        self.translations
            .write()
            .await
            .remove(&(message_id, lang.to_string()));
    }

    /// Transcribes the message's resolved audio attachment. Cached per
    /// message; failures and empty recognitions yield `None`.
    pub async fn request_transcription(&self, message_id: MessageId) -> Option<String> {
        if let Some(hit) = self.transcripts.read().await.get(&message_id) {
            return Some(hit.clone());
        }

        let result = match self.load_audio(message_id).await {
            Ok(audio) => self.speech.transcribe(&audio, &self.speech_config).await,
            Err(err) => Err(err),
        };

        match result {
            Ok(Some(transcript)) => {
                self.transcripts
                    .write()
                    .await
                    .insert(message_id, transcript.clone());
                Some(transcript)
            }
            Ok(None) => {
                debug!(message_id = message_id.0, "no transcription result");
                None
            }
            Err(error) => {
                warn!(message_id = message_id.0, %error, "transcription failed");
                None
            }
        }
    }

    async fn forget_translations(&self, message_id: MessageId) {
        self.translations
            .write()
            .await
            .retain(|(id, _), _| *id != message_id);
    }

    pub async fn cached_transcript(&self, message_id: MessageId) -> Option<String> {
        self.transcripts.read().await.get(&message_id).cloned()
    }

    pub async fn clear_transcription(&self, message_id: MessageId) {
        self.transcripts.write().await.remove(&message_id);
    }

    async fn load_audio(&self, message_id: MessageId) -> Result<Vec<u8>, ServiceError> {
        let message = self
            .docs
            .load_message(message_id)
            .await
            .map_err(|err| ServiceError::AudioUnavailable(format!("{err:#}")))?
            .ok_or_else(|| ServiceError::AudioUnavailable(format!("message {message_id} not found")))?;

        let attachment = message
            .attachment
            .filter(|a| a.kind == AttachmentKind::Audio)
            .ok_or_else(|| {
                ServiceError::AudioUnavailable(format!("message {message_id} has no audio"))
            })?;
        if attachment.state != AttachmentState::Resolved {
            return Err(ServiceError::AudioUnavailable(format!(
                "audio of message {message_id} is {}",
                attachment.state.as_str()
            )));
        }

        self.pipeline
            .blobs()
            .read(attachment.kind, &attachment.blob_key)
            .await
            .map_err(|err| ServiceError::AudioUnavailable(format!("{err:#}")))
    }
}

/// The follow-up write found the attachment already settled (a reconcile
/// pass got there first) or the message gone. The uploaded blob is kept only
/// if the stored attachment resolved.
async fn settle_after_lost_write(
    docs: &dyn DocumentStore,
    pipeline: &AttachmentPipeline,
    message_id: MessageId,
    kind: AttachmentKind,
    key: &BlobKey,
    uploaded: AttachmentState,
) -> AttachmentState {
    let stored = match docs.load_message(message_id).await {
        Ok(message) => message.and_then(|m| m.attachment).map(|a| a.state),
        Err(error) => {
            warn!(message_id = message_id.0, %error, "failed to read back settled attachment");
            return uploaded;
        }
    };
    if uploaded == AttachmentState::Resolved && stored != Some(AttachmentState::Resolved) {
        if let Err(error) = pipeline.delete_attachment(kind, key).await {
            warn!(%key, %error, "failed to remove orphaned attachment blob");
        }
    }
    stored.unwrap_or(uploaded)
}

#[cfg(test)]
#[path = "tests/messages_tests.rs"]
mod tests;
