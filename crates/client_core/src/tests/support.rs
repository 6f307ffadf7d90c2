use std::{
    collections::{HashMap, HashSet},
    io::Cursor,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shared::{
    domain::{
        Attachment, AttachmentKind, AttachmentState, BlobKey, Message, MessageId, NewMessage,
        RecentRoom, Room, RoomId, UserId,
    },
    protocol::FeedEvent,
};
use storage::{BlobStore, CorrectionWrite, DocumentStore, Storage};
use tokio::sync::{broadcast, Mutex, Notify};

use crate::{
    config::{CoreConfig, SpeechConfig},
    error::ServiceError,
    services::{SpeechToText, Translator},
    ChatCore, CoreParts,
};

pub fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    let img = image::RgbImage::from_pixel(width, height, image::Rgb([200, 40, 90]));
    let mut out = Cursor::new(Vec::new());
    img.write_to(&mut out, image::ImageFormat::Png)
        .expect("encode png");
    out.into_inner()
}

/// In-memory blob store that records every call and can be told to fail or
/// to hold uploads until released.
#[derive(Default)]
pub struct RecordingBlobStore {
    blobs: Mutex<HashMap<(AttachmentKind, BlobKey), Vec<u8>>>,
    pub puts: Mutex<Vec<(AttachmentKind, BlobKey)>>,
    pub deletes: Mutex<Vec<(AttachmentKind, BlobKey)>>,
    fail_put: Option<String>,
    fail_delete: Option<String>,
    gate: Option<Arc<Notify>>,
}

impl RecordingBlobStore {
    pub fn failing_puts(reason: &str) -> Self {
        Self {
            fail_put: Some(reason.to_string()),
            ..Self::default()
        }
    }

    pub fn failing_deletes(reason: &str) -> Self {
        Self {
            fail_delete: Some(reason.to_string()),
            ..Self::default()
        }
    }

    /// Uploads block until `gate.notify_one()` is called once per upload.
    pub fn gated() -> (Self, Arc<Notify>) {
        let gate = Arc::new(Notify::new());
        (
            Self {
                gate: Some(Arc::clone(&gate)),
                ..Self::default()
            },
            gate,
        )
    }

    pub async fn stored(&self, kind: AttachmentKind, key: &BlobKey) -> Option<Vec<u8>> {
        self.blobs.lock().await.get(&(kind, key.clone())).cloned()
    }

    pub async fn seed(&self, kind: AttachmentKind, key: &BlobKey, bytes: Vec<u8>) {
        self.blobs.lock().await.insert((kind, key.clone()), bytes);
    }
}

#[async_trait]
impl BlobStore for RecordingBlobStore {
    async fn put(&self, kind: AttachmentKind, key: &BlobKey, bytes: Vec<u8>) -> Result<String> {
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        self.puts.lock().await.push((kind, key.clone()));
        if let Some(reason) = &self.fail_put {
            return Err(anyhow!(reason.clone()));
        }
        self.blobs.lock().await.insert((kind, key.clone()), bytes);
        Ok(format!("https://blobs.test/{}/{key}", kind.namespace()))
    }

    async fn url(&self, kind: AttachmentKind, key: &BlobKey) -> Result<Option<String>> {
        Ok(self
            .blobs
            .lock()
            .await
            .contains_key(&(kind, key.clone()))
            .then(|| format!("https://blobs.test/{}/{key}", kind.namespace())))
    }

    async fn read(&self, kind: AttachmentKind, key: &BlobKey) -> Result<Vec<u8>> {
        self.stored(kind, key)
            .await
            .ok_or_else(|| anyhow!("blob {key} missing"))
    }

    async fn delete(&self, kind: AttachmentKind, key: &BlobKey) -> Result<()> {
        self.deletes.lock().await.push((kind, key.clone()));
        if let Some(reason) = &self.fail_delete {
            return Err(anyhow!(reason.clone()));
        }
        self.blobs.lock().await.remove(&(kind, key.clone()));
        Ok(())
    }
}

/// Delegates to a real `Storage` while counting deletions and optionally
/// failing chosen ones.
pub struct RecordingDocs {
    pub inner: Storage,
    pub recent_deletes: AtomicUsize,
    pub room_deletes: AtomicUsize,
    pub message_deletes: AtomicUsize,
    pub fail_message_deletes: HashSet<MessageId>,
    pub fail_room_delete: bool,
    pub fail_room_load: bool,
}

impl RecordingDocs {
    pub fn new(inner: Storage) -> Self {
        Self {
            inner,
            recent_deletes: AtomicUsize::new(0),
            room_deletes: AtomicUsize::new(0),
            message_deletes: AtomicUsize::new(0),
            fail_message_deletes: HashSet::new(),
            fail_room_delete: false,
            fail_room_load: false,
        }
    }

    pub fn counts(&self) -> (usize, usize, usize) {
        (
            self.recent_deletes.load(Ordering::SeqCst),
            self.room_deletes.load(Ordering::SeqCst),
            self.message_deletes.load(Ordering::SeqCst),
        )
    }
}

#[async_trait]
impl DocumentStore for RecordingDocs {
    async fn insert_message(&self, message: NewMessage) -> Result<Message> {
        self.inner.insert_message(message).await
    }

    async fn load_message(&self, message_id: MessageId) -> Result<Option<Message>> {
        self.inner.load_message(message_id).await
    }

    async fn load_room_messages(&self, room_id: RoomId) -> Result<Vec<Message>> {
        if self.fail_room_load {
            return Err(anyhow!("snapshot read unavailable"));
        }
        self.inner.load_room_messages(room_id).await
    }

    async fn update_attachment_state(
        &self,
        message_id: MessageId,
        state: AttachmentState,
        url: Option<&str>,
    ) -> Result<bool> {
        self.inner
            .update_attachment_state(message_id, state, url)
            .await
    }

    async fn commit_correction(
        &self,
        message_id: MessageId,
        corrected_text: &str,
        edited_at: DateTime<Utc>,
    ) -> Result<CorrectionWrite> {
        self.inner
            .commit_correction(message_id, corrected_text, edited_at)
            .await
    }

    async fn delete_message(&self, message_id: MessageId) -> Result<bool> {
        self.message_deletes.fetch_add(1, Ordering::SeqCst);
        if self.fail_message_deletes.contains(&message_id) {
            return Err(anyhow!("message {message_id} is locked"));
        }
        self.inner.delete_message(message_id).await
    }

    async fn create_room(&self, display_name: &str, photo_ref: Option<&str>) -> Result<Room> {
        self.inner.create_room(display_name, photo_ref).await
    }

    async fn load_room(&self, room_id: RoomId) -> Result<Option<Room>> {
        self.inner.load_room(room_id).await
    }

    async fn delete_room(&self, room_id: RoomId) -> Result<bool> {
        self.room_deletes.fetch_add(1, Ordering::SeqCst);
        if self.fail_room_delete {
            return Err(anyhow!("room record is locked"));
        }
        self.inner.delete_room(room_id).await
    }

    async fn upsert_recent_room(&self, entry: &RecentRoom) -> Result<()> {
        self.inner.upsert_recent_room(entry).await
    }

    async fn delete_recent_room(&self, user_id: UserId, room_id: RoomId) -> Result<bool> {
        self.recent_deletes.fetch_add(1, Ordering::SeqCst);
        self.inner.delete_recent_room(user_id, room_id).await
    }

    async fn list_recent_rooms(&self, user_id: UserId) -> Result<Vec<RecentRoom>> {
        self.inner.list_recent_rooms(user_id).await
    }

    async fn stale_pending_attachments(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<(MessageId, Attachment)>> {
        self.inner.stale_pending_attachments(cutoff).await
    }

    fn subscribe(&self) -> broadcast::Receiver<FeedEvent> {
        self.inner.subscribe()
    }
}

#[derive(Default)]
pub struct FakeTranslator {
    pub calls: AtomicUsize,
    pub fail: bool,
}

#[async_trait]
impl Translator for FakeTranslator {
    async fn translate(&self, text: &str, target_lang: &str) -> Result<String, ServiceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(ServiceError::Status {
                service: "translation service",
                status: 503,
            });
        }
        Ok(format!("[{target_lang}] {text}"))
    }
}

#[derive(Default)]
pub struct FakeSpeech {
    pub calls: AtomicUsize,
    pub transcript: Option<String>,
    pub seen: Mutex<Vec<(usize, SpeechConfig)>>,
}

#[async_trait]
impl SpeechToText for FakeSpeech {
    async fn transcribe(
        &self,
        audio: &[u8],
        config: &SpeechConfig,
    ) -> Result<Option<String>, ServiceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().await.push((audio.len(), config.clone()));
        Ok(self.transcript.clone())
    }
}

pub struct Harness {
    pub core: ChatCore,
    pub docs: Arc<RecordingDocs>,
    pub blobs: Arc<RecordingBlobStore>,
    pub translator: Arc<FakeTranslator>,
    pub speech: Arc<FakeSpeech>,
}

pub struct HarnessBuilder {
    config: CoreConfig,
    blobs: RecordingBlobStore,
    translator: FakeTranslator,
    speech: FakeSpeech,
    tune_docs: Box<dyn FnOnce(&mut RecordingDocs) + Send>,
}

impl Harness {
    pub fn builder() -> HarnessBuilder {
        HarnessBuilder {
            config: CoreConfig::default(),
            blobs: RecordingBlobStore::default(),
            translator: FakeTranslator::default(),
            speech: FakeSpeech::default(),
            tune_docs: Box::new(|_| {}),
        }
    }

    pub async fn new() -> Self {
        Self::builder().build().await
    }

    pub async fn room(&self, name: &str) -> Room {
        self.core
            .rooms
            .create_room(name, None)
            .await
            .expect("room")
    }
}

impl HarnessBuilder {
    pub fn config(mut self, config: CoreConfig) -> Self {
        self.config = config;
        self
    }

    pub fn blobs(mut self, blobs: RecordingBlobStore) -> Self {
        self.blobs = blobs;
        self
    }

    pub fn translator(mut self, translator: FakeTranslator) -> Self {
        self.translator = translator;
        self
    }

    pub fn speech(mut self, speech: FakeSpeech) -> Self {
        self.speech = speech;
        self
    }

    pub fn docs(mut self, tune: impl FnOnce(&mut RecordingDocs) + Send + 'static) -> Self {
        self.tune_docs = Box::new(tune);
        self
    }

    pub async fn build(self) -> Harness {
        let storage = Storage::new("sqlite::memory:").await.expect("db");
        let mut docs = RecordingDocs::new(storage);
        (self.tune_docs)(&mut docs);
        let docs = Arc::new(docs);
        let blobs = Arc::new(self.blobs);
        let translator = Arc::new(self.translator);
        let speech = Arc::new(self.speech);

        let core = ChatCore::with_parts(
            self.config,
            CoreParts {
                docs: docs.clone(),
                blobs: blobs.clone(),
                translator: translator.clone(),
                speech: speech.clone(),
            },
        );
        Harness {
            core,
            docs,
            blobs,
            translator,
            speech,
        }
    }
}
