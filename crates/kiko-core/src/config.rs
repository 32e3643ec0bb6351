//! Centralized configuration for the catalog engine.
//!
//! Fixed tunables live as associated constants, in the same style for every
//! subsystem. Per-run knobs (`ScanOptions`, `FetcherConfig`) are plain structs
//! with defaults so callers can override them from the CLI.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Application-level configuration.
pub struct AppConfig;

impl AppConfig {
    pub const APP_NAME: &'static str = "Kiko Creator";
    pub const DATA_DIR_NAME: &'static str = "kiko";
    pub const DB_FILENAME: &'static str = "models.db";
    pub const THUMBNAILS_DIR_NAME: &'static str = "thumbnails";
}

/// Remote registry settings.
pub struct RegistryConfig;

impl RegistryConfig {
    pub const CIVITAI_API_BASE: &'static str = "https://civitai.com/api/v1";
    pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
    pub const USER_AGENT: &'static str = "Kiko-Creator/1.0";
    pub const DEFAULT_WORKERS: usize = 3;
    pub const DEFAULT_REQUEST_DELAY: Duration = Duration::from_millis(500);
    pub const API_KEY_ENV: &'static str = "CIVITAI_API_KEY";
}

/// Preview-asset cache settings.
pub struct ThumbnailConfig;

impl ThumbnailConfig {
    pub const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(15);
    pub const DEFAULT_EXTENSION: &'static str = ".jpg";
    pub const TEMP_SUFFIX: &'static str = ".part";
}

/// Directory walk, hashing and header parsing settings.
pub struct ScanConfig;

impl ScanConfig {
    /// Read size for streaming hashes (8MB, optimal for SSDs).
    pub const HASH_CHUNK_SIZE: usize = 8 * 1024 * 1024;
    /// Header lengths above this are treated as corrupt before allocating.
    pub const MAX_HEADER_BYTES: u64 = 100 * 1024 * 1024;
    pub const CONTAINER_EXTENSION: &'static str = "safetensors";
    pub const SIDECAR_SUFFIX: &'static str = ".metadata.json";
    pub const CONFIG_FILENAME: &'static str = "extra_model_paths.yaml";
}

/// Progress channel settings.
pub struct ProgressConfig;

impl ProgressConfig {
    pub const CHANNEL_CAPACITY: usize = 256;
    pub const COMPLETED_RETENTION: Duration = Duration::from_secs(5);
    pub const ERROR_RETENTION: Duration = Duration::from_secs(10);
}

/// Sizing of the enrichment worker pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct FetcherConfig {
    /// Number of long-lived workers pulling identities.
    pub workers: usize,
    /// Minimum pause each worker takes after a lookup.
    pub request_delay: Duration,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            workers: RegistryConfig::DEFAULT_WORKERS,
            request_delay: RegistryConfig::DEFAULT_REQUEST_DELAY,
        }
    }
}

impl FetcherConfig {
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_request_delay(mut self, delay: Duration) -> Self {
        self.request_delay = delay;
        self
    }

    /// Approximate upper bound on outbound lookups per second.
    pub fn max_requests_per_sec(&self) -> f64 {
        let delay = self.request_delay.as_secs_f64();
        if delay <= 0.0 {
            f64::INFINITY
        } else {
            self.workers as f64 / delay
        }
    }
}

/// Behaviour switches for a single scan run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ScanOptions {
    /// Compute content identities for stale files.
    pub compute_hashes: bool,
    /// Look identities up on the remote registry. Only effective when the
    /// orchestrator was built with a fetcher.
    pub enrichment: bool,
    /// Re-queue fresh files that have an identity but no stored enrichment.
    pub retry_unenriched: bool,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            compute_hashes: true,
            enrichment: true,
            retry_unenriched: false,
        }
    }
}
