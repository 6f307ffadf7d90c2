use shared::{
    domain::{MessageId, RoomId},
    error::{ApiError, ErrorCode},
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid intent: {0}")]
    Validation(String),
    #[error("message {message_id} already carries a correction")]
    AlreadyEdited { message_id: MessageId },
    #[error("message {0} not found")]
    MessageNotFound(MessageId),
    #[error("room {0} not found")]
    RoomNotFound(RoomId),
    #[error(transparent)]
    ExternalService(#[from] ServiceError),
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

impl CoreError {
    pub fn code(&self) -> ErrorCode {
        match self {
            CoreError::Validation(_) => ErrorCode::Validation,
            CoreError::AlreadyEdited { .. } => ErrorCode::AlreadyEdited,
            CoreError::MessageNotFound(_) | CoreError::RoomNotFound(_) => ErrorCode::NotFound,
            CoreError::ExternalService(_) => ErrorCode::ExternalService,
            CoreError::Store(_) => ErrorCode::Internal,
        }
    }
}

impl From<&CoreError> for ApiError {
    fn from(value: &CoreError) -> Self {
        ApiError::new(value.code(), value.to_string())
    }
}

/// Why an attachment ended up `failed`.
#[derive(Debug, Error)]
pub enum AttachmentFailure {
    #[error("image could not be re-encoded: {0}")]
    Encode(String),
    #[error("blob upload failed: {0}")]
    Upload(String),
    #[error("upload did not settle within {secs}s")]
    TimedOut { secs: u64 },
    #[error("upload task aborted: {0}")]
    Aborted(String),
}

/// Translation and speech-to-text call failures. Surfaced to callers as
/// "no result".
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("{service} is not configured with an api key")]
    MissingCredential { service: &'static str },
    #[error("{service} request failed: {source}")]
    Transport {
        service: &'static str,
        #[source]
        source: reqwest::Error,
    },
    #[error("{service} returned HTTP {status}")]
    Status {
        service: &'static str,
        status: u16,
    },
    #[error("{service} returned a malformed body: {detail}")]
    Malformed {
        service: &'static str,
        detail: String,
    },
    #[error("audio for transcription unavailable: {0}")]
    AudioUnavailable(String),
}
