//! Kiko Scan - catalog the models of a ComfyUI install from the command line.
//!
//! Resolves model roots from an `extra_model_paths.yaml` or explicit folders,
//! runs one incremental scan into the local catalog and prints the report as
//! JSON on stdout. Progress and diagnostics go to the log on stderr.

use anyhow::{bail, Context, Result};
use clap::Parser;
use kiko_core::config::{AppConfig, RegistryConfig};
use kiko_core::{
    CancellationToken, CatalogStore, CivitaiClient, FetcherConfig, MetadataFetcher, ModelClass,
    ModelRoots, ProgressReporter, RootSource, ScanOptions, ScanOrchestrator, ScanPhase,
    SqliteCatalog, ThumbnailCache,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "kiko-scan")]
#[command(about = "Scan model folders into the Kiko Creator catalog")]
struct Args {
    /// Path to ComfyUI's extra_model_paths.yaml
    #[arg(short, long, value_name = "YAML")]
    config: Option<PathBuf>,

    /// Checkpoint folder (repeatable, used when no YAML is given)
    #[arg(long, value_name = "DIR")]
    checkpoints: Vec<PathBuf>,

    /// LoRA folder (repeatable)
    #[arg(long, value_name = "DIR")]
    loras: Vec<PathBuf>,

    /// Embedding folder (repeatable)
    #[arg(long, value_name = "DIR")]
    embeddings: Vec<PathBuf>,

    /// Directory holding the catalog database and thumbnails
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// CivitAI API key (defaults to $CIVITAI_API_KEY)
    #[arg(long)]
    api_key: Option<String>,

    /// Registry API root
    #[arg(long, default_value = RegistryConfig::CIVITAI_API_BASE)]
    registry_url: String,

    /// Concurrent registry lookups
    #[arg(long, default_value_t = RegistryConfig::DEFAULT_WORKERS)]
    workers: usize,

    /// Pause each worker takes after a lookup, in milliseconds
    #[arg(long, default_value_t = 500)]
    delay_ms: u64,

    /// Do not compute content hashes (disables enrichment)
    #[arg(long)]
    no_hash: bool,

    /// Do not fetch registry metadata or previews
    #[arg(long)]
    no_metadata: bool,

    /// Re-query identities that have no stored metadata yet
    #[arg(long)]
    retry_unenriched: bool,

    /// Print the N most recent scan runs and exit
    #[arg(long, value_name = "N")]
    history: Option<usize>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,
}

impl Args {
    fn root_source(&self) -> Result<RootSource> {
        if let Some(config) = &self.config {
            return Ok(RootSource::ExtraModelPaths(config.clone()));
        }

        let mut roots = ModelRoots::new();
        for (class, dirs) in [
            (ModelClass::Checkpoint, &self.checkpoints),
            (ModelClass::Lora, &self.loras),
            (ModelClass::Embedding, &self.embeddings),
        ] {
            for dir in dirs {
                roots.add_root(class, dir);
            }
        }
        if roots.is_empty() {
            bail!("No model roots given: pass --config or at least one of --checkpoints/--loras/--embeddings");
        }
        Ok(RootSource::Explicit(roots))
    }

    fn scan_options(&self) -> ScanOptions {
        ScanOptions {
            compute_hashes: !self.no_hash,
            enrichment: !self.no_metadata,
            retry_unenriched: self.retry_unenriched,
        }
    }

    fn fetcher_config(&self) -> FetcherConfig {
        FetcherConfig::default()
            .with_workers(self.workers)
            .with_request_delay(Duration::from_millis(self.delay_ms))
    }

    fn data_dir(&self) -> Result<PathBuf> {
        match &self.data_dir {
            Some(dir) => Ok(dir.clone()),
            None => dirs::data_dir()
                .map(|dir| dir.join(AppConfig::DATA_DIR_NAME))
                .context("Could not determine a data directory; pass --data-dir"),
        }
    }

    fn api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .or_else(|| std::env::var(RegistryConfig::API_KEY_ENV).ok())
    }
}

fn init_logging(args: &Args) {
    let default_level = if args.debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);
    if args.json_logs {
        builder.json().init();
    } else {
        builder.compact().init();
    }
}

/// Log phase changes and per-file steps from the progress channel.
fn spawn_progress_logger(reporter: &ProgressReporter) -> tokio::task::JoinHandle<()> {
    let mut rx = reporter.subscribe();
    tokio::spawn(async move {
        let mut last_phase = ScanPhase::Idle;
        loop {
            match rx.recv().await {
                Ok(snapshot) => {
                    if snapshot.phase != last_phase {
                        info!("[{}] {}", snapshot.phase, snapshot.message);
                        last_phase = snapshot.phase;
                    } else {
                        debug!(
                            "[{}] {}/{} ({}%) {}",
                            snapshot.phase,
                            snapshot.current,
                            snapshot.total,
                            snapshot.progress,
                            snapshot.message
                        );
                    }
                    if snapshot.phase.is_terminal() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    debug!("Progress logger skipped {} updates", skipped);
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args);

    let data_dir = args.data_dir()?;
    let store = Arc::new(
        SqliteCatalog::open(data_dir.join(AppConfig::DB_FILENAME))
            .context("Failed to open the model catalog")?,
    );

    if let Some(limit) = args.history {
        let runs = store.recent_scan_runs(limit)?;
        println!("{}", serde_json::to_string_pretty(&runs)?);
        return Ok(());
    }

    let source = args.root_source()?;
    let options = args.scan_options();
    info!("Starting {} model scan", AppConfig::APP_NAME);
    info!("Data directory: {}", data_dir.display());

    let reporter = Arc::new(ProgressReporter::new());
    let mut orchestrator = ScanOrchestrator::new(store, reporter.clone());
    if options.enrichment && options.compute_hashes {
        let client = CivitaiClient::with_base_url(&args.registry_url, args.api_key())?;
        let thumbnails =
            ThumbnailCache::new(data_dir.join(AppConfig::THUMBNAILS_DIR_NAME))?;
        let fetcher = MetadataFetcher::new(
            Arc::new(client),
            Some(Arc::new(thumbnails)),
            args.fetcher_config(),
        );
        orchestrator = orchestrator.with_fetcher(Arc::new(fetcher));
    }

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received, cancelling scan");
                cancel.cancel();
            }
        });
    }

    let logger = spawn_progress_logger(&reporter);
    let result = orchestrator.run(&source, &options, &cancel).await;
    let _ = logger.await;

    let report = result.context("Scan failed")?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explicit_roots_from_flags() {
        let args = Args::try_parse_from([
            "kiko-scan",
            "--loras",
            "/m/loras",
            "--loras",
            "/m/more-loras",
            "--checkpoints",
            "/m/ckpt",
        ])
        .unwrap();
        match args.root_source().unwrap() {
            RootSource::Explicit(roots) => {
                assert_eq!(roots.roots_for(ModelClass::Lora).len(), 2);
                assert_eq!(roots.roots_for(ModelClass::Checkpoint).len(), 1);
            }
            other => panic!("unexpected source {:?}", other),
        }
    }

    #[test]
    fn test_yaml_takes_precedence() {
        let args =
            Args::try_parse_from(["kiko-scan", "-c", "/opt/comfy/extra_model_paths.yaml", "--loras", "/x"])
                .unwrap();
        assert!(matches!(args.root_source().unwrap(), RootSource::ExtraModelPaths(_)));
    }

    #[test]
    fn test_no_roots_is_an_error() {
        let args = Args::try_parse_from(["kiko-scan"]).unwrap();
        assert!(args.root_source().is_err());
    }

    #[test]
    fn test_option_flags() {
        let args = Args::try_parse_from([
            "kiko-scan",
            "--no-metadata",
            "--retry-unenriched",
            "--workers",
            "0",
            "--delay-ms",
            "250",
        ])
        .unwrap();
        let options = args.scan_options();
        assert!(options.compute_hashes);
        assert!(!options.enrichment);
        assert!(options.retry_unenriched);

        let fetcher = args.fetcher_config();
        assert_eq!(fetcher.workers, 1);
        assert_eq!(fetcher.request_delay, Duration::from_millis(250));
        assert_eq!(args.registry_url, RegistryConfig::CIVITAI_API_BASE);
    }
}
