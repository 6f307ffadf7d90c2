use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use serde::Deserialize;

pub const DEFAULT_CONFIG_FILE: &str = "chat.toml";

/// Everything the core needs at construction: store locations, upload
/// tuning and external service credentials.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub database_url: String,
    pub blob_root: PathBuf,
    pub blob_public_base_url: Option<String>,
    pub blob_max_bytes: usize,
    pub image_max_dimension: u32,
    pub image_jpeg_quality: u8,
    pub upload_timeout_secs: u64,
    pub translation_api_key: Option<String>,
    pub translation_endpoint: String,
    pub default_target_language: String,
    pub speech_api_key: Option<String>,
    pub speech_endpoint: String,
    pub speech_encoding: String,
    pub speech_sample_rate_hertz: u32,
    pub speech_language_code: String,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://./data/chat.db".into(),
            blob_root: PathBuf::from("./data/blobs"),
            blob_public_base_url: None,
            blob_max_bytes: 16 * 1024 * 1024,
            image_max_dimension: 1920,
            image_jpeg_quality: 80,
            upload_timeout_secs: 120,
            translation_api_key: None,
            translation_endpoint: "https://translation.googleapis.com/language/translate/v2".into(),
            default_target_language: "es".into(),
            speech_api_key: None,
            speech_endpoint: "https://speech.googleapis.com/v1/speech:recognize".into(),
            speech_encoding: "WEBM_OPUS".into(),
            speech_sample_rate_hertz: 48_000,
            speech_language_code: "en-US".into(),
        }
    }
}

impl CoreConfig {
    pub fn upload_timeout(&self) -> Duration {
        Duration::from_secs(self.upload_timeout_secs)
    }

    pub fn speech(&self) -> SpeechConfig {
        SpeechConfig {
            encoding: self.speech_encoding.clone(),
            sample_rate_hertz: self.speech_sample_rate_hertz,
            language_code: self.speech_language_code.clone(),
        }
    }

    pub fn image_settings(&self) -> ImageSettings {
        ImageSettings {
            max_dimension: self.image_max_dimension,
            jpeg_quality: self.image_jpeg_quality.clamp(1, 100),
        }
    }

    fn apply(&mut self, key: &str, raw: &str) {
        match key {
            "database_url" => self.database_url = raw.to_string(),
            "blob_root" => self.blob_root = PathBuf::from(raw),
            "blob_public_base_url" => self.blob_public_base_url = non_empty(raw),
            "blob_max_bytes" => set_parsed(&mut self.blob_max_bytes, raw),
            "image_max_dimension" => set_parsed(&mut self.image_max_dimension, raw),
            "image_jpeg_quality" => set_parsed(&mut self.image_jpeg_quality, raw),
            "upload_timeout_secs" => set_parsed(&mut self.upload_timeout_secs, raw),
            "translation_api_key" => self.translation_api_key = non_empty(raw),
            "translation_endpoint" => self.translation_endpoint = raw.to_string(),
            "default_target_language" => self.default_target_language = raw.to_string(),
            "speech_api_key" => self.speech_api_key = non_empty(raw),
            "speech_endpoint" => self.speech_endpoint = raw.to_string(),
            "speech_encoding" => self.speech_encoding = raw.to_string(),
            "speech_sample_rate_hertz" => set_parsed(&mut self.speech_sample_rate_hertz, raw),
            "speech_language_code" => self.speech_language_code = raw.to_string(),
            _ => {}
        }
    }
}

/// Fixed recognition parameters sent with every transcription request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpeechConfig {
    pub encoding: String,
    pub sample_rate_hertz: u32,
    pub language_code: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageSettings {
    pub max_dimension: u32,
    pub jpeg_quality: u8,
}

impl Default for ImageSettings {
    fn default() -> Self {
        CoreConfig::default().image_settings()
    }
}

const ENV_KEYS: &[&str] = &[
    "database_url",
    "blob_root",
    "blob_public_base_url",
    "blob_max_bytes",
    "image_max_dimension",
    "image_jpeg_quality",
    "upload_timeout_secs",
    "translation_api_key",
    "translation_endpoint",
    "default_target_language",
    "speech_api_key",
    "speech_endpoint",
    "speech_encoding",
    "speech_sample_rate_hertz",
    "speech_language_code",
];

/// Defaults, then `chat.toml` (or `path`), then `APP__*` environment variables.
pub fn load_config(path: Option<&Path>) -> anyhow::Result<CoreConfig> {
    let mut config = CoreConfig::default();

    let file = path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_FILE));
    match fs::read_to_string(file) {
        Ok(raw) => {
            config = toml::from_str::<CoreConfig>(&raw)
                .with_context(|| format!("failed to parse config file '{}'", file.display()))?;
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound && path.is_none() => {}
        Err(err) => {
            return Err(err)
                .with_context(|| format!("failed to read config file '{}'", file.display()));
        }
    }

    for key in ENV_KEYS {
        if let Ok(v) = std::env::var(format!("APP__{}", key.to_ascii_uppercase())) {
            config.apply(key, &v);
        }
    }

    Ok(config)
}

/// Turns a bare path into a sqlite url; storage creates the parent directory.
pub fn normalize_database_url(raw_database_url: &str) -> String {
    let raw_database_url = raw_database_url.trim();

    if raw_database_url.is_empty() {
        return CoreConfig::default().database_url;
    }

    if raw_database_url.starts_with("sqlite::memory:")
        || raw_database_url.starts_with("sqlite://")
        || raw_database_url.contains("://")
    {
        return raw_database_url.to_string();
    }

    if let Some(path) = raw_database_url.strip_prefix("sqlite:") {
        let path = path.replace('\\', "/");
        return format!("sqlite://{path}");
    }

    format!("sqlite://{}", raw_database_url.replace('\\', "/"))
}

fn non_empty(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

fn set_parsed<T: std::str::FromStr>(slot: &mut T, raw: &str) {
    if let Ok(parsed) = raw.trim().parse::<T>() {
        *slot = parsed;
    }
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
