//! Scan orchestration.
//!
//! One run walks the phases `Initializing → ParsingConfig → Counting →
//! Scanning(checkpoint) → Scanning(lora) → Scanning(embedding) → Completed`.
//! Per-file problems are collected as [`ScanIssue`]s and never stop the run;
//! run-level failures finalize the scan record as failed and are returned.

use crate::cancel::CancellationToken;
use crate::config::ScanOptions;
use crate::error::{IssueKind, KikoError, Result, ScanIssue};
use crate::header;
use crate::hashing;
use crate::models::{
    format_timestamp, DiscoveredFile, HeaderSummary, ModelClass, ModelRecord, ScanRun, ScanStats,
    ScanStatus,
};
use crate::progress::{ProgressReporter, ScanPhase};
use crate::registry::{FetchOutcome, MetadataFetcher};
use crate::roots::{ModelRoots, RootSource};
use crate::scanner;
use crate::store::CatalogStore;
use chrono::Utc;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// What a finished run produced.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanReport {
    pub run_id: String,
    pub stats: ScanStats,
    pub issues: Vec<ScanIssue>,
}

/// Accumulated state of a run in progress.
#[derive(Default)]
struct RunState {
    stats: ScanStats,
    issues: Vec<ScanIssue>,
    /// Every path seen this run; the sweep keeps exactly these.
    observed: HashSet<String>,
    /// Identities already handed to the fetcher this run.
    requested: HashSet<String>,
}

impl RunState {
    fn new() -> Self {
        let mut state = Self::default();
        for class in ModelClass::ALL {
            state.stats.class_counts.insert(class, 0);
        }
        state
    }

    fn issue(&mut self, kind: IssueKind, subject: impl Into<String>, message: impl Into<String>) {
        self.issues.push(ScanIssue::new(kind, subject, message));
    }
}

/// Result of cataloging one file.
struct ProcessedFile {
    record: ModelRecord,
    /// The stored record was still current and was reused as is.
    fresh: bool,
}

/// Coordinates the scanner, identity resolution, header extraction,
/// enrichment and persistence for scan runs.
pub struct ScanOrchestrator {
    store: Arc<dyn CatalogStore>,
    reporter: Arc<ProgressReporter>,
    fetcher: Option<Arc<MetadataFetcher>>,
    run_lock: tokio::sync::Mutex<()>,
}

impl ScanOrchestrator {
    pub fn new(store: Arc<dyn CatalogStore>, reporter: Arc<ProgressReporter>) -> Self {
        Self {
            store,
            reporter,
            fetcher: None,
            run_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Enable remote enrichment.
    pub fn with_fetcher(mut self, fetcher: Arc<MetadataFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    pub fn reporter(&self) -> &Arc<ProgressReporter> {
        &self.reporter
    }

    pub fn store(&self) -> &Arc<dyn CatalogStore> {
        &self.store
    }

    /// Most recent scan runs, newest first.
    pub fn history(&self, limit: usize) -> Result<Vec<ScanRun>> {
        self.store.recent_scan_runs(limit)
    }

    /// Run a full scan.
    ///
    /// Only one run executes at a time per orchestrator; a second concurrent
    /// call fails immediately.
    pub async fn run(
        &self,
        source: &RootSource,
        options: &ScanOptions,
        cancel: &CancellationToken,
    ) -> Result<ScanReport> {
        let _guard = self
            .run_lock
            .try_lock()
            .map_err(|_| KikoError::Other("A scan is already running".into()))?;

        let started = Instant::now();
        self.reporter.start_run();

        let enrichment_enabled =
            options.enrichment && options.compute_hashes && self.fetcher.is_some();
        let mut run = ScanRun {
            id: Uuid::new_v4().to_string(),
            started_at: format_timestamp(&Utc::now()),
            completed_at: None,
            config_ref: source.describe(),
            class_counts: Default::default(),
            errors: Vec::new(),
            enrichment_enabled,
            duration_secs: None,
            status: ScanStatus::Running,
        };
        if let Err(e) = self.store.create_scan_run(&run) {
            error!("Failed to record scan run: {}", e);
            self.reporter.fail(e.to_string());
            return Err(e);
        }
        info!("Scan {} started ({})", run.id, run.config_ref);

        let mut state = RunState::new();
        let outcome = match self
            .execute(source, options, enrichment_enabled, cancel, &mut state)
            .await
        {
            Ok(()) => self.sweep(&mut state),
            Err(e) => Err(e),
        };

        let duration = started.elapsed().as_secs_f64();
        state.stats.duration_secs = duration;
        state.stats.errors = state.issues.len();
        run.completed_at = Some(format_timestamp(&Utc::now()));
        run.duration_secs = Some(duration);
        run.class_counts = state.stats.class_counts.clone();
        run.errors = state.issues.clone();

        match outcome {
            Ok(()) => {
                run.status = ScanStatus::Completed;
                if let Err(e) = self.store.finalize_scan_run(&run) {
                    error!("Failed to finalize scan run {}: {}", run.id, e);
                    self.reporter.fail(e.to_string());
                    return Err(e);
                }
                info!(
                    "Scan {} complete: {} models ({} cached, {} indexed, {} hashed, {} enriched, {} removed, {} issues) in {:.2}s",
                    run.id,
                    state.stats.total,
                    state.stats.cached,
                    state.stats.indexed,
                    state.stats.hashed,
                    state.stats.enriched,
                    state.stats.removed,
                    state.stats.errors,
                    duration
                );
                self.reporter.complete(state.stats.clone());
                Ok(ScanReport {
                    run_id: run.id,
                    stats: state.stats,
                    issues: state.issues,
                })
            }
            Err(e) => {
                run.status = ScanStatus::Failed;
                run.errors
                    .push(ScanIssue::new(IssueKind::Configuration, "run", e.to_string()));
                if let Err(finalize_err) = self.store.finalize_scan_run(&run) {
                    error!("Failed to finalize scan run {}: {}", run.id, finalize_err);
                }
                error!("Scan {} failed: {}", run.id, e);
                self.reporter.fail(e.to_string());
                Err(e)
            }
        }
    }

    async fn execute(
        &self,
        source: &RootSource,
        options: &ScanOptions,
        enrichment_enabled: bool,
        cancel: &CancellationToken,
        state: &mut RunState,
    ) -> Result<()> {
        self.reporter.set_phase(
            ScanPhase::ParsingConfig,
            format!("Resolving model roots from {}", source.describe()),
        );
        let roots = source.resolve()?;
        if roots.existing_count() == 0 {
            warn!("None of the {} configured model roots exist", roots.len());
            return Err(KikoError::NoResolvableRoots);
        }
        let roots = Arc::new(roots);

        self.reporter
            .set_phase(ScanPhase::Counting, "Counting model files");
        let total = {
            let roots = Arc::clone(&roots);
            let cancel = cancel.clone();
            blocking(move || scanner::count_candidates(&roots, &cancel)).await?
        };
        info!("Found {} candidate model files", total);
        self.reporter.set_total(total);

        for class in ModelClass::ALL {
            cancel.check()?;
            self.scan_class(&roots, class, options, enrichment_enabled, cancel, state)
                .await?;
        }

        Ok(())
    }

    async fn scan_class(
        &self,
        roots: &Arc<ModelRoots>,
        class: ModelClass,
        options: &ScanOptions,
        enrichment_enabled: bool,
        cancel: &CancellationToken,
        state: &mut RunState,
    ) -> Result<()> {
        self.reporter.set_phase(
            ScanPhase::Scanning(class),
            format!("Scanning {}", class.plural()),
        );

        let listing = {
            let roots = Arc::clone(roots);
            let cancel = cancel.clone();
            blocking(move || scanner::scan_class(&roots, class, &cancel)).await?
        };
        state.issues.extend(listing.issues);
        state.stats.class_counts.insert(class, listing.files.len());
        state.stats.total += listing.files.len();
        info!("Scanning {} {}", listing.files.len(), class.plural());

        let mut pending: Vec<String> = Vec::new();
        for file in &listing.files {
            cancel.check()?;

            let processed = match self.process_file(file, options, cancel, state).await {
                Ok(processed) => processed,
                Err(e) if e.is_run_fatal() => return Err(e),
                Err(e) => {
                    warn!("Failed to catalog {}: {}", file.path.display(), e);
                    state.issue(
                        IssueKind::Persistence,
                        file.path.to_string_lossy(),
                        e.to_string(),
                    );
                    self.reporter.item_processed(&file.file_name(), "Failed");
                    continue;
                }
            };
            let action = if processed.fresh { "Cached" } else { "Indexed" };
            self.reporter.item_processed(&processed.record.name, action);

            if !enrichment_enabled {
                continue;
            }
            let Some(hash) = processed.record.hash.as_deref() else {
                continue;
            };
            match self.store.get_enrichment(hash) {
                Ok(Some(_)) => {
                    debug!("Enrichment for {} already stored", hash);
                    continue;
                }
                Ok(None) => {}
                Err(e) => {
                    warn!("Failed to look up stored enrichment for {}: {}", hash, e);
                    state.issue(IssueKind::Persistence, hash, e.to_string());
                    continue;
                }
            }
            if (!processed.fresh || options.retry_unenriched)
                && state.requested.insert(hash.to_string())
            {
                pending.push(hash.to_string());
            }
        }

        if !pending.is_empty() {
            if let Some(fetcher) = &self.fetcher {
                self.reporter.set_phase(
                    ScanPhase::Scanning(class),
                    format!("Fetching metadata for {} {}", pending.len(), class.plural()),
                );
                self.enrich(fetcher, pending, cancel, state).await;
            }
        }

        cancel.check()
    }

    /// Catalog one file: reuse or recompute its identity and persist it.
    async fn process_file(
        &self,
        file: &DiscoveredFile,
        options: &ScanOptions,
        cancel: &CancellationToken,
        state: &mut RunState,
    ) -> Result<ProcessedFile> {
        let path = file.path.to_string_lossy().into_owned();
        let modified_at = format_timestamp(&file.modified_at);
        let scanned_at = format_timestamp(&Utc::now());
        state.observed.insert(path.clone());

        let existing = self
            .store
            .get_by_path(&path)?
            .filter(|record| record.modified_at == modified_at);

        // A fresh record keeps its identity unless it never got one and
        // hashing is now enabled.
        if let Some(existing) = existing.filter(|r| r.hash.is_some() || !options.compute_hashes) {
            debug!("Cache hit: {}", path);
            state.stats.cached += 1;
            let record = ModelRecord {
                name: file.file_name(),
                folder: file.folder.clone(),
                class: file.class,
                size: file.size,
                scanned_at,
                ..existing
            };
            self.store.upsert_model(&record)?;
            return Ok(ProcessedFile {
                record,
                fresh: true,
            });
        }

        debug!("Cache miss: {}", path);
        let hash = if options.compute_hashes {
            match hashing::compute_identity(&file.path, cancel).await {
                Ok(hash) => {
                    state.stats.hashed += 1;
                    Some(hash)
                }
                Err(KikoError::Cancelled) => return Err(KikoError::Cancelled),
                Err(e) => {
                    warn!("Failed to hash {}: {}", path, e);
                    state.issue(IssueKind::IdentityComputation, &path, e.to_string());
                    None
                }
            }
        } else {
            None
        };

        let header = if file.is_container() {
            self.read_header(file, state).await?
        } else {
            None
        };

        let record = ModelRecord {
            path,
            name: file.file_name(),
            folder: file.folder.clone(),
            class: file.class,
            size: file.size,
            modified_at,
            hash,
            scanned_at,
            header,
        };
        self.store.upsert_model(&record)?;
        state.stats.indexed += 1;
        Ok(ProcessedFile {
            record,
            fresh: false,
        })
    }

    async fn read_header(
        &self,
        file: &DiscoveredFile,
        state: &mut RunState,
    ) -> Result<Option<HeaderSummary>> {
        let path = file.path.clone();
        let (summary, failure) = blocking(move || {
            let (metadata, failure) = match header::try_read_container_metadata(&path) {
                Ok(metadata) => (metadata, None),
                Err(e) => (None, Some(e.to_string())),
            };
            Ok((header::summarize(metadata.as_ref(), &path), failure))
        })
        .await?;

        if let Some(message) = failure {
            warn!("Unreadable header in {}: {}", file.path.display(), message);
            state.issue(
                IssueKind::HeaderParse,
                file.path.to_string_lossy(),
                message,
            );
        }
        Ok(summary)
    }

    /// Fetch enrichment for a class's pending identities and persist it.
    async fn enrich(
        &self,
        fetcher: &MetadataFetcher,
        pending: Vec<String>,
        cancel: &CancellationToken,
        state: &mut RunState,
    ) {
        let batch = fetcher.fetch_batch(pending, cancel).await;
        state.stats.remote_calls += batch.remote_calls;
        state.issues.extend(batch.issues());

        for (hash, outcome) in &batch.outcomes {
            match outcome {
                FetchOutcome::Enriched {
                    record, preview, ..
                } => {
                    if let Err(e) = self.store.upsert_enrichment(record) {
                        warn!("Failed to store enrichment for {}: {}", hash, e);
                        state.issue(IssueKind::Persistence, hash, e.to_string());
                        continue;
                    }
                    state.stats.enriched += 1;
                    if preview.is_some() {
                        state.stats.previews += 1;
                    }
                }
                FetchOutcome::NotFound => debug!("No registry entry for {}", hash),
                FetchOutcome::Failed(_) => {}
            }
        }
    }

    fn sweep(&self, state: &mut RunState) -> Result<()> {
        let removed = self.store.delete_all_except(&state.observed)?;
        if removed > 0 {
            info!("Removed {} models no longer on disk", removed);
        }
        state.stats.removed = removed;
        Ok(())
    }
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| KikoError::Other(format!("Blocking task failed: {}", e)))?
}
