use std::{io::Cursor, sync::Arc, time::Duration};

use image::{codecs::jpeg::JpegEncoder, imageops::FilterType};
use shared::domain::{Attachment, AttachmentKind, AttachmentState, BlobKey};
use storage::BlobStore;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::{config::ImageSettings, error::AttachmentFailure};

/// Raw capture handed to `send` before any processing.
#[derive(Debug, Clone)]
pub struct AttachmentDraft {
    pub kind: AttachmentKind,
    pub bytes: Vec<u8>,
}

impl AttachmentDraft {
    pub fn image(bytes: Vec<u8>) -> Self {
        Self {
            kind: AttachmentKind::Image,
            bytes,
        }
    }

    pub fn audio(bytes: Vec<u8>) -> Self {
        Self {
            kind: AttachmentKind::Audio,
            bytes,
        }
    }
}

#[derive(Debug)]
pub enum UploadOutcome {
    Resolved { url: String },
    Failed(AttachmentFailure),
}

impl UploadOutcome {
    pub fn state(&self) -> AttachmentState {
        match self {
            UploadOutcome::Resolved { .. } => AttachmentState::Resolved,
            UploadOutcome::Failed(_) => AttachmentState::Failed,
        }
    }

    pub fn url(&self) -> Option<&str> {
        match self {
            UploadOutcome::Resolved { url } => Some(url),
            UploadOutcome::Failed(_) => None,
        }
    }
}

/// An upload that has been started. Dropping it does not stop the upload.
pub struct PendingUpload {
    pub attachment: Attachment,
    task: JoinHandle<UploadOutcome>,
}

impl PendingUpload {
    pub async fn settle(self) -> UploadOutcome {
        match self.task.await {
            Ok(outcome) => outcome,
            Err(err) => UploadOutcome::Failed(AttachmentFailure::Aborted(err.to_string())),
        }
    }
}

/// Moves attachment bytes from local capture to a durable URL.
#[derive(Clone)]
pub struct AttachmentPipeline {
    blobs: Arc<dyn BlobStore>,
    image: ImageSettings,
    timeout: Duration,
}

impl AttachmentPipeline {
    pub fn new(blobs: Arc<dyn BlobStore>, image: ImageSettings, timeout: Duration) -> Self {
        Self {
            blobs,
            image,
            timeout,
        }
    }

    pub fn blobs(&self) -> &Arc<dyn BlobStore> {
        &self.blobs
    }

    /// Returns at once with a pending attachment under `target_key`; the
    /// compression and upload run on a background task that always settles
    /// as resolved or failed within the configured timeout.
    pub fn begin_upload(
        &self,
        kind: AttachmentKind,
        raw: Vec<u8>,
        target_key: BlobKey,
    ) -> PendingUpload {
        let attachment = Attachment::pending(kind, target_key.clone());
        let pipeline = self.clone();
        let task = tokio::spawn(async move { pipeline.run(kind, raw, target_key).await });
        PendingUpload { attachment, task }
    }

    async fn run(&self, kind: AttachmentKind, raw: Vec<u8>, key: BlobKey) -> UploadOutcome {
        match tokio::time::timeout(self.timeout, self.upload(kind, raw, &key)).await {
            Ok(Ok(url)) => {
                debug!(%key, kind = kind.as_str(), "attachment uploaded");
                UploadOutcome::Resolved { url }
            }
            Ok(Err(failure)) => {
                warn!(%key, kind = kind.as_str(), error = %failure, "attachment upload failed");
                UploadOutcome::Failed(failure)
            }
            Err(_) => {
                let failure = AttachmentFailure::TimedOut {
                    secs: self.timeout.as_secs(),
                };
                warn!(%key, kind = kind.as_str(), error = %failure, "attachment upload failed");
                UploadOutcome::Failed(failure)
            }
        }
    }

    async fn upload(
        &self,
        kind: AttachmentKind,
        raw: Vec<u8>,
        key: &BlobKey,
    ) -> Result<String, AttachmentFailure> {
        let bytes = match kind {
            AttachmentKind::Image => compress_image(raw, self.image).await?,
            AttachmentKind::Audio => raw,
        };
        self.blobs
            .put(kind, key, bytes)
            .await
            .map_err(|err| AttachmentFailure::Upload(format!("{err:#}")))
    }

    /// Idempotent: a blob that is already gone is not an error.
    pub async fn delete_attachment(
        &self,
        kind: AttachmentKind,
        key: &BlobKey,
    ) -> anyhow::Result<()> {
        self.blobs.delete(kind, key).await
    }
}

pub async fn compress_image(
    raw: Vec<u8>,
    settings: ImageSettings,
) -> Result<Vec<u8>, AttachmentFailure> {
    tokio::task::spawn_blocking(move || recompress_jpeg(&raw, settings))
        .await
        .map_err(|err| AttachmentFailure::Aborted(err.to_string()))?
}

/// Decodes any supported image, shrinks it to fit within
/// `max_dimension` on both sides, and re-encodes it as JPEG.
pub fn recompress_jpeg(raw: &[u8], settings: ImageSettings) -> Result<Vec<u8>, AttachmentFailure> {
    let img = image::load_from_memory(raw)
        .map_err(|err| AttachmentFailure::Encode(format!("decode: {err}")))?;

    let max = settings.max_dimension.max(1);
    let img = if img.width() > max || img.height() > max {
        img.resize(max, max, FilterType::Lanczos3)
    } else {
        img
    };

    let rgb = img.to_rgb8();
    let mut out = Cursor::new(Vec::new());
    let mut encoder = JpegEncoder::new_with_quality(&mut out, settings.jpeg_quality);
    encoder
        .encode_image(&rgb)
        .map_err(|err| AttachmentFailure::Encode(format!("encode: {err}")))?;
    Ok(out.into_inner())
}

#[cfg(test)]
#[path = "tests/attachments_tests.rs"]
mod tests;
