//! CivitAI by-hash lookup.

use super::client::RegistryClient;
use crate::config::RegistryConfig;
use crate::error::{KikoError, Result};
use crate::models::{format_timestamp, EnrichmentRecord, PreviewImage, UsageStats};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::{header, Client, StatusCode};
use serde::Deserialize;
use std::collections::HashSet;
use std::time::Duration;
use tracing::{debug, info};

/// Client for `GET {base}/model-versions/by-hash/{hash}`.
pub struct CivitaiClient {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    timeout: Duration,
}

impl CivitaiClient {
    /// Create a client against the public API.
    pub fn new(api_key: Option<String>) -> Result<Self> {
        Self::with_base_url(RegistryConfig::CIVITAI_API_BASE, api_key)
    }

    /// Create a client against a different API root (mirrors, test servers).
    pub fn with_base_url(base_url: impl Into<String>, api_key: Option<String>) -> Result<Self> {
        Self::with_timeout(base_url, api_key, RegistryConfig::REQUEST_TIMEOUT)
    }

    pub fn with_timeout(
        base_url: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(RegistryConfig::USER_AGENT)
            .build()
            .map_err(|e| KikoError::Network {
                message: format!("Failed to create HTTP client: {}", e),
                source: Some(e),
            })?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.filter(|k| !k.trim().is_empty()),
            timeout,
        })
    }

    fn lookup_url(&self, hash: &str) -> String {
        format!("{}/model-versions/by-hash/{}", self.base_url, hash)
    }
}

#[async_trait]
impl RegistryClient for CivitaiClient {
    async fn lookup_by_hash(&self, hash: &str) -> Result<Option<EnrichmentRecord>> {
        let url = self.lookup_url(hash);
        let mut request = self.client.get(&url);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                KikoError::Timeout(self.timeout)
            } else {
                KikoError::Network {
                    message: format!("GET {} failed: {}", url, e),
                    source: Some(e),
                }
            }
        })?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            info!("Model not found on CivitAI: {}", hash);
            return Ok(None);
        }
        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after_secs = response
                .headers()
                .get(header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok());
            return Err(KikoError::RateLimited {
                service: "CivitAI".into(),
                retry_after_secs,
            });
        }
        if !status.is_success() {
            return Err(KikoError::RegistryStatus {
                url,
                status: status.as_u16(),
            });
        }

        let body = response.text().await.map_err(|e| {
            if e.is_timeout() {
                KikoError::Timeout(self.timeout)
            } else {
                KikoError::Network {
                    message: format!("Failed to read response from {}: {}", url, e),
                    source: Some(e),
                }
            }
        })?;

        let record = parse_version(hash, &body)?;
        debug!(
            "Fetched CivitAI metadata for {}: {}",
            hash,
            record.model_name.as_deref().unwrap_or("Unknown")
        );
        Ok(Some(record))
    }

    fn name(&self) -> &str {
        "CivitAI"
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VersionResponse {
    id: i64,
    #[serde(default)]
    model_id: Option<i64>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    base_model: Option<String>,
    #[serde(default)]
    trained_words: Option<Vec<Option<String>>>,
    #[serde(default)]
    images: Option<Vec<ImageResponse>>,
    #[serde(default)]
    stats: Option<StatsResponse>,
    #[serde(default)]
    download_url: Option<String>,
    #[serde(default)]
    model: Option<ModelResponse>,
}

#[derive(Debug, Deserialize)]
struct ImageResponse {
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    width: Option<u32>,
    #[serde(default)]
    height: Option<u32>,
    #[serde(default)]
    nsfw: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatsResponse {
    #[serde(default)]
    download_count: Option<u64>,
    #[serde(default)]
    rating: Option<f64>,
    #[serde(default)]
    rating_count: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ModelResponse {
    #[serde(default)]
    name: Option<String>,
}

/// Map a by-hash response body onto an enrichment record.
fn parse_version(hash: &str, body: &str) -> Result<EnrichmentRecord> {
    let version: VersionResponse =
        serde_json::from_str(body).map_err(|e| KikoError::MalformedResponse {
            message: format!("by-hash response for {}: {}", hash, e),
        })?;

    let images = version
        .images
        .unwrap_or_default()
        .into_iter()
        .filter_map(|img| {
            Some(PreviewImage {
                url: img.url.filter(|u| !u.is_empty())?,
                width: img.width,
                height: img.height,
                nsfw: img.nsfw,
            })
        })
        .collect();

    let stats = version
        .stats
        .map(|s| UsageStats {
            download_count: s.download_count.unwrap_or(0),
            rating: s.rating.unwrap_or(0.0),
            rating_count: s.rating_count.unwrap_or(0),
        })
        .unwrap_or_default();

    let mut seen = HashSet::new();
    let trained_words: Vec<String> = version
        .trained_words
        .unwrap_or_default()
        .into_iter()
        .flatten()
        .map(|word| word.trim().to_string())
        .filter(|word| !word.is_empty() && seen.insert(word.clone()))
        .collect();

    Ok(EnrichmentRecord {
        hash: hash.to_string(),
        remote_id: version.id,
        remote_model_id: version.model_id,
        name: version.name,
        model_name: version.model.and_then(|m| m.name),
        description: version.description,
        base_model: version.base_model,
        trained_words,
        images,
        stats,
        download_url: version.download_url,
        fetched_at: format_timestamp(&Utc::now()),
        preview_path: None,
    })
}
