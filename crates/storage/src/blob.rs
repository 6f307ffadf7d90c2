use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use tokio::fs;
use tracing::debug;
use url::Url;

use shared::domain::{AttachmentKind, BlobKey};

/// Attachment bytes addressed by kind namespace (`images/`, `audio/`) and key.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Stores the bytes and returns a durable fetch URL.
    async fn put(&self, kind: AttachmentKind, key: &BlobKey, bytes: Vec<u8>) -> Result<String>;
    async fn url(&self, kind: AttachmentKind, key: &BlobKey) -> Result<Option<String>>;
    async fn read(&self, kind: AttachmentKind, key: &BlobKey) -> Result<Vec<u8>>;
    /// Removing a key that is already gone succeeds.
    async fn delete(&self, kind: AttachmentKind, key: &BlobKey) -> Result<()>;
}

/// Blob store on the local filesystem, one directory per namespace.
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
    public_base_url: Option<Url>,
    max_size: usize,
}

impl FsBlobStore {
    pub async fn new(
        root: impl AsRef<Path>,
        public_base_url: Option<&str>,
        max_size: usize,
    ) -> Result<Self> {
        let root = root.as_ref();
        for kind in [AttachmentKind::Image, AttachmentKind::Audio] {
            let dir = root.join(kind.namespace());
            fs::create_dir_all(&dir)
                .await
                .with_context(|| format!("failed to create blob directory '{}'", dir.display()))?;
        }
        let root = root
            .canonicalize()
            .with_context(|| format!("failed to resolve blob root '{}'", root.display()))?;

        let public_base_url = public_base_url
            .map(|raw| {
                let normalized = if raw.ends_with('/') {
                    raw.to_string()
                } else {
                    format!("{raw}/")
                };
                Url::parse(&normalized)
                    .with_context(|| format!("invalid blob public base url '{raw}'"))
            })
            .transpose()?;

        debug!(root = %root.display(), "blob store ready");
        Ok(Self {
            root,
            public_base_url,
            max_size,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn blob_path(&self, kind: AttachmentKind, key: &BlobKey) -> Result<PathBuf> {
        validate_key(key)?;
        Ok(self.root.join(kind.namespace()).join(key.as_str()))
    }

    fn blob_url(&self, kind: AttachmentKind, key: &BlobKey) -> Result<String> {
        match &self.public_base_url {
            Some(base) => Ok(base
                .join(&format!("{}/{}", kind.namespace(), key.as_str()))
                .context("failed to build blob url")?
                .to_string()),
            None => {
                let path = self.blob_path(kind, key)?;
                Url::from_file_path(&path)
                    .map(|url| url.to_string())
                    .map_err(|_| anyhow!("blob path '{}' is not absolute", path.display()))
            }
        }
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(&self, kind: AttachmentKind, key: &BlobKey, bytes: Vec<u8>) -> Result<String> {
        if bytes.is_empty() {
            bail!("refusing to store empty blob {key}");
        }
        if bytes.len() > self.max_size {
            bail!(
                "blob {key} is {} bytes, over the {} byte limit",
                bytes.len(),
                self.max_size
            );
        }

        let path = self.blob_path(kind, key)?;
        let size = bytes.len();
        fs::write(&path, bytes)
            .await
            .with_context(|| format!("failed to write blob '{}'", path.display()))?;
        debug!(%key, kind = kind.as_str(), size, "stored blob");
        self.blob_url(kind, key)
    }

    async fn url(&self, kind: AttachmentKind, key: &BlobKey) -> Result<Option<String>> {
        let path = self.blob_path(kind, key)?;
        if fs::try_exists(&path).await.unwrap_or(false) {
            self.blob_url(kind, key).map(Some)
        } else {
            Ok(None)
        }
    }

    async fn read(&self, kind: AttachmentKind, key: &BlobKey) -> Result<Vec<u8>> {
        let path = self.blob_path(kind, key)?;
        fs::read(&path)
            .await
            .with_context(|| format!("failed to read blob '{}'", path.display()))
    }

    async fn delete(&self, kind: AttachmentKind, key: &BlobKey) -> Result<()> {
        let path = self.blob_path(kind, key)?;
        match fs::remove_file(&path).await {
            Ok(()) => {
                debug!(%key, kind = kind.as_str(), "deleted blob");
                Ok(())
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err)
                .with_context(|| format!("failed to delete blob '{}'", path.display())),
        }
    }
}

/// Keys are generated ids; anything that could escape the namespace
/// directory is rejected.
fn validate_key(key: &BlobKey) -> Result<()> {
    let raw = key.as_str();
    if raw.is_empty()
        || !raw
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        bail!("invalid blob key '{raw}'");
    }
    Ok(())
}

#[cfg(test)]
#[path = "tests/blob_tests.rs"]
mod tests;
