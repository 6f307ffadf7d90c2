use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::{config::SpeechConfig, error::ServiceError};

const TRANSLATION: &str = "translation service";
const SPEECH: &str = "speech-to-text service";

#[async_trait]
pub trait Translator: Send + Sync {
    async fn translate(&self, text: &str, target_lang: &str) -> Result<String, ServiceError>;
}

#[async_trait]
pub trait SpeechToText: Send + Sync {
    /// `Ok(None)` when the service recognised nothing.
    async fn transcribe(
        &self,
        audio: &[u8],
        config: &SpeechConfig,
    ) -> Result<Option<String>, ServiceError>;
}

pub struct MissingTranslator;

#[async_trait]
impl Translator for MissingTranslator {
    async fn translate(&self, _text: &str, _target_lang: &str) -> Result<String, ServiceError> {
        Err(ServiceError::MissingCredential {
            service: TRANSLATION,
        })
    }
}

pub struct MissingSpeechToText;

#[async_trait]
impl SpeechToText for MissingSpeechToText {
    async fn transcribe(
        &self,
        _audio: &[u8],
        _config: &SpeechConfig,
    ) -> Result<Option<String>, ServiceError> {
        Err(ServiceError::MissingCredential { service: SPEECH })
    }
}

#[derive(Serialize)]
struct TranslateRequest<'a> {
    q: &'a str,
    target: &'a str,
}

#[derive(Deserialize)]
struct TranslateResponse {
    data: TranslateData,
}

#[derive(Deserialize)]
struct TranslateData {
    translations: Vec<Translation>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Translation {
    translated_text: String,
}

/// Google Cloud Translation v2 over its REST endpoint.
pub struct HttpTranslator {
    http: Client,
    endpoint: String,
    api_key: String,
}

impl HttpTranslator {
    pub fn new(endpoint: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            endpoint: endpoint.into(),
            api_key: api_key.into(),
        }
    }
}

#[async_trait]
impl Translator for HttpTranslator {
    async fn translate(&self, text: &str, target_lang: &str) -> Result<String, ServiceError> {
        let response = self
            .http
            .post(&self.endpoint)
            .query(&[("key", self.api_key.as_str())])
            .json(&TranslateRequest {
                q: text,
                target: target_lang,
            })
            .send()
            .await
            .map_err(|source| ServiceError::Transport {
                service: TRANSLATION,
                source,
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(ServiceError::Status {
                service: TRANSLATION,
                status: status.as_u16(),
            });
        }

        let body: TranslateResponse =
            response.json().await.map_err(|err| ServiceError::Malformed {
                service: TRANSLATION,
                detail: err.to_string(),
            })?;
        body.data
            .translations
            .into_iter()
            .next()
            .map(|t| t.translated_text)
            .ok_or_else(|| ServiceError::Malformed {
                service: TRANSLATION,
                detail: "no translations in response".into(),
            })
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RecognitionConfig<'a> {
    encoding: &'a str,
    sample_rate_hertz: u32,
    language_code: &'a str,
}

#[derive(Serialize)]
struct RecognitionAudio {
    content: String,
}

#[derive(Serialize)]
struct RecognizeRequest<'a> {
    config: RecognitionConfig<'a>,
    audio: RecognitionAudio,
}

#[derive(Deserialize)]
struct RecognizeResponse {
    #[serde(default)]
    results: Vec<RecognitionResult>,
}

#[derive(Deserialize)]
struct RecognitionResult {
    #[serde(default)]
    alternatives: Vec<RecognitionAlternative>,
}

#[derive(Deserialize)]
struct RecognitionAlternative {
    #[serde(default)]
    transcript: String,
}

/// Google Cloud Speech-to-Text v1 `speech:recognize`.
pub struct HttpSpeechToText {
    http: Client,
    endpoint: String,
    api_key: String,
}

impl HttpSpeechToText {
    pub fn new(endpoint: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            endpoint: endpoint.into(),
            api_key: api_key.into(),
        }
    }
}

#[async_trait]
impl SpeechToText for HttpSpeechToText {
    async fn transcribe(
        &self,
        audio: &[u8],
        config: &SpeechConfig,
    ) -> Result<Option<String>, ServiceError> {
        let request = RecognizeRequest {
            config: RecognitionConfig {
                encoding: &config.encoding,
                sample_rate_hertz: config.sample_rate_hertz,
                language_code: &config.language_code,
            },
            audio: RecognitionAudio {
                content: STANDARD.encode(audio),
            },
        };

        let response = self
            .http
            .post(&self.endpoint)
            .query(&[("key", self.api_key.as_str())])
            .json(&request)
            .send()
            .await
            .map_err(|source| ServiceError::Transport {
                service: SPEECH,
                source,
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(ServiceError::Status {
                service: SPEECH,
                status: status.as_u16(),
            });
        }

        let body: RecognizeResponse =
            response.json().await.map_err(|err| ServiceError::Malformed {
                service: SPEECH,
                detail: err.to_string(),
            })?;
        Ok(join_transcripts(body))
    }
}

/// Longer clips come back as several results; their top alternatives are
/// concatenated in order.
fn join_transcripts(body: RecognizeResponse) -> Option<String> {
    let parts: Vec<String> = body
        .results
        .into_iter()
        .filter_map(|r| r.alternatives.into_iter().next())
        .map(|a| a.transcript.trim().to_string())
        .filter(|t| !t.is_empty())
        .collect();
    (!parts.is_empty()).then(|| parts.join(" "))
}

#[cfg(test)]
#[path = "tests/services_tests.rs"]
mod tests;
