//! Preview image cache.
//!
//! Previews are stored flat as `<identity><ext>` in one directory, so each
//! identity is downloaded at most once no matter how many files share it.

use crate::config::ThumbnailConfig;
use crate::error::{KikoError, Result};
use crate::models::PreviewAsset;
use futures::StreamExt;
use reqwest::{header, Client};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

/// Downloads and stores preview images keyed by content identity.
pub struct ThumbnailCache {
    dir: PathBuf,
    client: Client,
    timeout: Duration,
}

impl ThumbnailCache {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        Self::with_timeout(dir, ThumbnailConfig::DOWNLOAD_TIMEOUT)
    }

    pub fn with_timeout(dir: impl Into<PathBuf>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(crate::config::RegistryConfig::USER_AGENT)
            .build()
            .map_err(|e| KikoError::Network {
                message: format!("Failed to create HTTP client: {}", e),
                source: Some(e),
            })?;

        Ok(Self {
            dir: dir.into(),
            client,
            timeout,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Where the preview for `hash` fetched from `source_url` lives.
    pub fn cache_path(&self, hash: &str, source_url: &str) -> Result<PathBuf> {
        let url = Url::parse(source_url).map_err(|e| KikoError::DownloadFailed {
            url: source_url.to_string(),
            message: format!("invalid URL: {}", e),
        })?;
        let ext = Path::new(url.path())
            .extension()
            .and_then(|e| e.to_str())
            .filter(|e| !e.is_empty())
            .map(|e| format!(".{}", e.to_lowercase()))
            .unwrap_or_else(|| ThumbnailConfig::DEFAULT_EXTENSION.to_string());
        Ok(self.dir.join(format!("{}{}", hash, ext)))
    }

    /// Return the cached preview, downloading it first if needed.
    pub async fn try_resolve(&self, hash: &str, source_url: &str) -> Result<PreviewAsset> {
        let local_path = self.cache_path(hash, source_url)?;

        if local_path.is_file() {
            debug!("Preview already cached: {}", local_path.display());
            return Ok(PreviewAsset {
                hash: hash.to_string(),
                content_type: guess_content_type(&local_path).map(str::to_string),
                local_path,
                source_url: source_url.to_string(),
            });
        }

        std::fs::create_dir_all(&self.dir).map_err(|e| KikoError::io_with_path(e, &self.dir))?;

        let file_name = local_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| hash.to_string());
        let temp_path = self.dir.join(format!(
            "{}.{}{}",
            file_name,
            Uuid::new_v4().simple(),
            ThumbnailConfig::TEMP_SUFFIX
        ));

        match self.download(source_url, &temp_path).await {
            Ok(content_type) => {
                std::fs::rename(&temp_path, &local_path)
                    .map_err(|e| KikoError::io_with_path(e, &local_path))?;
                info!("Cached preview {}", local_path.display());
                Ok(PreviewAsset {
                    hash: hash.to_string(),
                    content_type: content_type
                        .or_else(|| guess_content_type(&local_path).map(str::to_string)),
                    local_path,
                    source_url: source_url.to_string(),
                })
            }
            Err(e) => {
                let _ = std::fs::remove_file(&temp_path);
                Err(e)
            }
        }
    }

    /// Best-effort variant of [`try_resolve`](Self::try_resolve).
    pub async fn resolve(&self, hash: &str, source_url: &str) -> Option<PreviewAsset> {
        match self.try_resolve(hash, source_url).await {
            Ok(asset) => Some(asset),
            Err(e) => {
                warn!("Failed to cache preview for {}: {}", hash, e);
                None
            }
        }
    }

    /// Stream `url` into `temp_path`, returning the response content type.
    async fn download(&self, url: &str, temp_path: &Path) -> Result<Option<String>> {
        let response = self.client.get(url).send().await.map_err(|e| {
            if e.is_timeout() {
                KikoError::Timeout(self.timeout)
            } else {
                KikoError::DownloadFailed {
                    url: url.to_string(),
                    message: e.to_string(),
                }
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(KikoError::DownloadFailed {
                url: url.to_string(),
                message: format!("Download failed with status {}", status),
            });
        }

        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let mut file = std::fs::File::create(temp_path).map_err(|e| KikoError::Io {
            message: format!("Failed to create temp file: {}", e),
            path: Some(temp_path.to_path_buf()),
            source: Some(e),
        })?;

        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| {
                if e.is_timeout() {
                    KikoError::Timeout(self.timeout)
                } else {
                    KikoError::DownloadFailed {
                        url: url.to_string(),
                        message: format!("Error reading download stream: {}", e),
                    }
                }
            })?;
            file.write_all(&chunk)
                .map_err(|e| KikoError::io_with_path(e, temp_path))?;
        }

        // Ensure data is flushed to disk
        file.flush()
            .map_err(|e| KikoError::io_with_path(e, temp_path))?;

        Ok(content_type)
    }
}

fn guess_content_type(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?.to_lowercase();
    match ext.as_str() {
        "jpg" | "jpeg" => Some("image/jpeg"),
        "png" => Some("image/png"),
        "webp" => Some("image/webp"),
        "gif" => Some("image/gif"),
        "mp4" => Some("video/mp4"),
        "webm" => Some("video/webm"),
        _ => None,
    }
}
