//! Kiko Core - model discovery and metadata caching for Kiko Creator.
//!
//! Walks the model folders of a ComfyUI-style install, fingerprints every
//! model file by content, reads embedded safetensors metadata, enriches
//! identities from the CivitAI registry and keeps the result in a local
//! SQLite catalog. Scans are incremental: unchanged files are never re-hashed
//! and already-known identities are never re-fetched.
//!
//! # Example
//!
//! ```rust,ignore
//! use kiko_core::{
//!     CancellationToken, CivitaiClient, FetcherConfig, MetadataFetcher, ProgressReporter,
//!     RootSource, ScanOptions, ScanOrchestrator, SqliteCatalog, ThumbnailCache,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> kiko_core::Result<()> {
//!     let store = Arc::new(SqliteCatalog::open("/data/kiko/models.db")?);
//!     let thumbnails = Arc::new(ThumbnailCache::new("/data/kiko/thumbnails")?);
//!     let fetcher = MetadataFetcher::new(
//!         Arc::new(CivitaiClient::new(None)?),
//!         Some(thumbnails),
//!         FetcherConfig::default(),
//!     );
//!
//!     let orchestrator = ScanOrchestrator::new(store, Arc::new(ProgressReporter::new()))
//!         .with_fetcher(Arc::new(fetcher));
//!
//!     let source = RootSource::ExtraModelPaths("/opt/ComfyUI/extra_model_paths.yaml".into());
//!     let report = orchestrator
//!         .run(&source, &ScanOptions::default(), &CancellationToken::new())
//!         .await?;
//!     println!("Cataloged {} models", report.stats.total);
//!     Ok(())
//! }
//! ```

pub mod cancel;
pub mod config;
pub mod error;
pub mod hashing;
pub mod header;
pub mod models;
pub mod orchestrator;
pub mod progress;
pub mod registry;
pub mod roots;
pub mod scanner;
pub mod store;
pub mod thumbnails;

// Re-export commonly used types
pub use cancel::CancellationToken;
pub use config::{FetcherConfig, ScanOptions};
pub use error::{IssueKind, KikoError, Result, ScanIssue};
pub use models::{
    DiscoveredFile, EnrichmentRecord, HeaderSummary, ModelClass, ModelRecord, PreviewAsset,
    PreviewImage, ScanRun, ScanStats, ScanStatus, UsageStats,
};
pub use orchestrator::{ScanOrchestrator, ScanReport};
pub use progress::{ProgressReporter, ScanPhase, ScanSnapshot};
pub use registry::{CivitaiClient, FetchBatch, FetchOutcome, MetadataFetcher, RegistryClient};
pub use roots::{ModelRoots, RootSource};
pub use store::{CatalogStore, SqliteCatalog};
pub use thumbnails::ThumbnailCache;
