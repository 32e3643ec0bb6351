//! Bounded worker pool for registry lookups.
//!
//! A batch of identities is pushed into one channel and drained by a fixed
//! number of workers. Each worker pauses for the configured delay after every
//! lookup, so the aggregate rate stays near `workers / delay`.

use super::client::RegistryClient;
use crate::cancel::CancellationToken;
use crate::config::FetcherConfig;
use crate::error::{IssueKind, ScanIssue};
use crate::models::{EnrichmentRecord, PreviewAsset};
use crate::thumbnails::ThumbnailCache;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

/// Result of looking up one identity.
#[derive(Debug, Clone)]
pub enum FetchOutcome {
    /// The registry knows the identity.
    Enriched {
        record: EnrichmentRecord,
        preview: Option<PreviewAsset>,
        /// Set when a preview URL existed but could not be cached.
        preview_error: Option<String>,
    },
    /// The registry answered that the identity is unknown.
    NotFound,
    /// The lookup failed; the identity stays un-enriched for this run.
    Failed(String),
}

/// Outcomes of one batch, keyed by identity.
#[derive(Debug, Default)]
pub struct FetchBatch {
    pub outcomes: HashMap<String, FetchOutcome>,
    /// Lookups actually sent to the registry.
    pub remote_calls: usize,
}

impl FetchBatch {
    pub fn enriched_count(&self) -> usize {
        self.outcomes
            .values()
            .filter(|o| matches!(o, FetchOutcome::Enriched { .. }))
            .count()
    }

    pub fn preview_count(&self) -> usize {
        self.outcomes
            .values()
            .filter(|o| matches!(o, FetchOutcome::Enriched { preview: Some(_), .. }))
            .count()
    }

    /// Per-identity failures, for the run's error list.
    pub fn issues(&self) -> Vec<ScanIssue> {
        let mut issues: Vec<ScanIssue> = self
            .outcomes
            .iter()
            .filter_map(|(hash, outcome)| match outcome {
                FetchOutcome::Failed(message) => {
                    Some(ScanIssue::new(IssueKind::RemoteFetch, hash, message))
                }
                FetchOutcome::Enriched {
                    preview_error: Some(message),
                    ..
                } => Some(ScanIssue::new(IssueKind::PreviewDownload, hash, message)),
                _ => None,
            })
            .collect();
        issues.sort_by(|a, b| a.subject.cmp(&b.subject));
        issues
    }
}

/// Fetch-through enrichment for batches of identities.
pub struct MetadataFetcher {
    client: Arc<dyn RegistryClient>,
    thumbnails: Option<Arc<ThumbnailCache>>,
    config: FetcherConfig,
}

impl MetadataFetcher {
    pub fn new(
        client: Arc<dyn RegistryClient>,
        thumbnails: Option<Arc<ThumbnailCache>>,
        config: FetcherConfig,
    ) -> Self {
        Self {
            client,
            thumbnails,
            config,
        }
    }

    pub fn config(&self) -> &FetcherConfig {
        &self.config
    }

    /// Look up every identity in `identities` with the worker pool.
    ///
    /// Callers are expected to pass identities that are not already stored.
    /// Workers stop taking items once `cancel` fires; identities never taken
    /// are absent from the returned outcomes.
    pub async fn fetch_batch(&self, identities: Vec<String>, cancel: &CancellationToken) -> FetchBatch {
        if identities.is_empty() {
            return FetchBatch::default();
        }

        let worker_count = self.config.workers.max(1).min(identities.len());
        info!(
            "Fetching {} metadata for {} identities with {} workers",
            self.client.name(),
            identities.len(),
            worker_count
        );

        let (tx, rx) = mpsc::channel(identities.len());
        for hash in identities {
            // Capacity equals the batch size, so this never waits.
            if tx.send(hash).await.is_err() {
                break;
            }
        }
        drop(tx);
        let rx = Arc::new(Mutex::new(rx));

        let workers = (0..worker_count).map(|id| self.worker(id, Arc::clone(&rx), cancel));
        let results = futures::future::join_all(workers).await;

        let mut batch = FetchBatch::default();
        for (outcomes, calls) in results {
            batch.remote_calls += calls;
            batch.outcomes.extend(outcomes);
        }
        debug!(
            "Fetch batch finished: {} calls, {} enriched, {} previews",
            batch.remote_calls,
            batch.enriched_count(),
            batch.preview_count()
        );
        batch
    }

    async fn worker(
        &self,
        id: usize,
        rx: Arc<Mutex<mpsc::Receiver<String>>>,
        cancel: &CancellationToken,
    ) -> (Vec<(String, FetchOutcome)>, usize) {
        let mut outcomes = Vec::new();
        let mut calls = 0;

        loop {
            if cancel.is_cancelled() {
                break;
            }
            let next = rx.lock().await.recv().await;
            let Some(hash) = next else {
                break;
            };

            calls += 1;
            let result = tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.client.lookup_by_hash(&hash) => result,
            };

            let outcome = match result {
                Ok(Some(record)) => self.with_preview(record).await,
                Ok(None) => FetchOutcome::NotFound,
                Err(e) => {
                    let retry = if e.is_retryable() { " (retryable)" } else { "" };
                    warn!(
                        "Worker {}: {} lookup failed for {}{}: {}",
                        id,
                        self.client.name(),
                        hash,
                        retry,
                        e
                    );
                    FetchOutcome::Failed(e.to_string())
                }
            };
            outcomes.push((hash, outcome));

            if rx.lock().await.is_empty() {
                break;
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.config.request_delay) => {}
            }
        }

        (outcomes, calls)
    }

    async fn with_preview(&self, mut record: EnrichmentRecord) -> FetchOutcome {
        let url = record.first_preview_url().map(str::to_string);
        let (Some(thumbnails), Some(url)) = (&self.thumbnails, url) else {
            return FetchOutcome::Enriched {
                record,
                preview: None,
                preview_error: None,
            };
        };

        match thumbnails.try_resolve(&record.hash, &url).await {
            Ok(asset) => {
                record.preview_path = Some(asset.local_path.to_string_lossy().into_owned());
                FetchOutcome::Enriched {
                    record,
                    preview: Some(asset),
                    preview_error: None,
                }
            }
            Err(e) => {
                warn!("Failed to cache preview for {}: {}", record.hash, e);
                FetchOutcome::Enriched {
                    record,
                    preview: None,
                    preview_error: Some(e.to_string()),
                }
            }
        }
    }
}
