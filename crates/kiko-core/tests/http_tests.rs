//! Registry client and preview cache against a local HTTP server.

use axum::{
    extract::{Path as UrlPath, State},
    http::{header, HeaderMap, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use kiko_core::hashing::compute_sha256;
use kiko_core::{
    CancellationToken, CatalogStore, CivitaiClient, FetcherConfig, KikoError, MetadataFetcher,
    ModelClass, ModelRoots, ProgressReporter, RegistryClient, RootSource, ScanOptions,
    ScanOrchestrator, SqliteCatalog, ThumbnailCache,
};
use serde_json::json;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

#[derive(Default)]
struct ServerState {
    base_url: Mutex<String>,
    known: Mutex<HashSet<String>>,
    lookups: AtomicUsize,
    image_hits: AtomicUsize,
    last_auth: Mutex<Option<String>>,
}

async fn by_hash(
    State(state): State<Arc<ServerState>>,
    UrlPath(hash): UrlPath<String>,
    headers: HeaderMap,
) -> axum::response::Response {
    state.lookups.fetch_add(1, Ordering::SeqCst);
    *state.last_auth.lock().unwrap() = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let known = state.known.lock().unwrap().contains(&hash);
    match hash.as_str() {
        "LIMITED" => (StatusCode::TOO_MANY_REQUESTS, [(header::RETRY_AFTER, "30")], "slow down")
            .into_response(),
        "BROKEN" => (StatusCode::OK, "<html>not json</html>").into_response(),
        "ERROR" => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
        "SLOW" => {
            tokio::time::sleep(Duration::from_secs(2)).await;
            StatusCode::NOT_FOUND.into_response()
        }
        h if known => {
            let base = state.base_url.lock().unwrap().clone();
            Json(json!({
                "id": 1,
                "modelId": 55,
                "name": "X",
                "baseModel": "SDXL 1.0",
                "trainedWords": ["glow"],
                "images": [{"url": format!("{}/images/{}.png", base, h), "width": 64, "height": 64}],
                "stats": {"downloadCount": 3, "rating": 5.0, "ratingCount": 1},
                "model": {"name": "Glow Style"}
            }))
            .into_response()
        }
        _ => (StatusCode::NOT_FOUND, Json(json!({"error": "Model not found"}))).into_response(),
    }
}

async fn image(
    State(state): State<Arc<ServerState>>,
    UrlPath(name): UrlPath<String>,
) -> axum::response::Response {
    state.image_hits.fetch_add(1, Ordering::SeqCst);
    if name.starts_with("missing") {
        return StatusCode::NOT_FOUND.into_response();
    }
    ([(header::CONTENT_TYPE, "image/png")], vec![0x89u8, b'P', b'N', b'G']).into_response()
}

/// Start the fake registry and return its API base URL.
async fn start_server(state: Arc<ServerState>) -> String {
    let app = Router::new()
        .route("/api/v1/model-versions/by-hash/:hash", get(by_hash))
        .route("/images/:name", get(image))
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let base = format!("http://{}", addr);
    *state.base_url.lock().unwrap() = base.clone();
    format!("{}/api/v1", base)
}

#[tokio::test]
async fn test_lookup_found_and_not_found() {
    let state = Arc::new(ServerState::default());
    state.known.lock().unwrap().insert("ABC".into());
    let api = start_server(state.clone()).await;
    let client = CivitaiClient::with_base_url(&api, Some("secret".into())).unwrap();

    let record = client.lookup_by_hash("ABC").await.unwrap().unwrap();
    assert_eq!(record.remote_id, 1);
    assert_eq!(record.model_name.as_deref(), Some("Glow Style"));
    assert_eq!(record.trained_words, vec!["glow"]);
    assert_eq!(
        state.last_auth.lock().unwrap().as_deref(),
        Some("Bearer secret")
    );

    assert!(client.lookup_by_hash("DEF").await.unwrap().is_none());
}

#[tokio::test]
async fn test_lookup_failures_are_distinct_from_not_found() {
    let state = Arc::new(ServerState::default());
    let api = start_server(state.clone()).await;
    let client = CivitaiClient::with_base_url(&api, None).unwrap();

    match client.lookup_by_hash("LIMITED").await {
        Err(KikoError::RateLimited {
            retry_after_secs, ..
        }) => assert_eq!(retry_after_secs, Some(30)),
        other => panic!("expected rate limit, got {:?}", other),
    }
    assert!(matches!(
        client.lookup_by_hash("BROKEN").await,
        Err(KikoError::MalformedResponse { .. })
    ));
    assert!(matches!(
        client.lookup_by_hash("ERROR").await,
        Err(KikoError::RegistryStatus { status: 500, .. })
    ));
    assert!(state.last_auth.lock().unwrap().is_none());
}

#[tokio::test]
async fn test_lookup_timeout() {
    let state = Arc::new(ServerState::default());
    let api = start_server(state).await;
    let client =
        CivitaiClient::with_timeout(&api, None, Duration::from_millis(200)).unwrap();

    assert!(matches!(
        client.lookup_by_hash("SLOW").await,
        Err(KikoError::Timeout(_))
    ));
}

#[tokio::test]
async fn test_preview_downloaded_once_per_identity() {
    let state = Arc::new(ServerState::default());
    let api = start_server(state.clone()).await;
    let base = api.trim_end_matches("/api/v1").to_string();
    let temp = TempDir::new().unwrap();
    let cache = ThumbnailCache::new(temp.path().join("thumbnails")).unwrap();

    let url = format!("{}/images/AB12.png", base);
    let first = cache.try_resolve("AB12", &url).await.unwrap();
    assert_eq!(first.local_path, temp.path().join("thumbnails/AB12.png"));
    assert_eq!(first.content_type.as_deref(), Some("image/png"));
    assert_eq!(std::fs::read(&first.local_path).unwrap(), b"\x89PNG");

    let second = cache.try_resolve("AB12", &url).await.unwrap();
    assert_eq!(second.local_path, first.local_path);
    assert_eq!(state.image_hits.load(Ordering::SeqCst), 1);

    let missing = format!("{}/images/missing.png", base);
    assert!(cache.resolve("CD34", &missing).await.is_none());
    assert!(!temp.path().join("thumbnails/CD34.png").exists());
}

#[tokio::test]
async fn test_full_scan_fetches_and_caches_once() {
    let state = Arc::new(ServerState::default());
    let api = start_server(state.clone()).await;
    let temp = TempDir::new().unwrap();

    let loras = temp.path().join("loras");
    std::fs::create_dir_all(loras.join("copies")).unwrap();
    std::fs::write(loras.join("glow.pt"), b"glow weights").unwrap();
    std::fs::write(loras.join("copies/glow-copy.pt"), b"glow weights").unwrap();
    std::fs::write(loras.join("unknown.pt"), b"nobody knows").unwrap();

    let hash = compute_sha256(loras.join("glow.pt"), &CancellationToken::new()).unwrap();
    state.known.lock().unwrap().insert(hash.clone());

    let store = Arc::new(SqliteCatalog::open_in_memory().unwrap());
    let thumbnails = Arc::new(ThumbnailCache::new(temp.path().join("thumbnails")).unwrap());
    let fetcher = MetadataFetcher::new(
        Arc::new(CivitaiClient::with_base_url(&api, None).unwrap()),
        Some(thumbnails),
        FetcherConfig::default().with_request_delay(Duration::from_millis(1)),
    );
    let orchestrator = ScanOrchestrator::new(store.clone(), Arc::new(ProgressReporter::new()))
        .with_fetcher(Arc::new(fetcher));
    let source = RootSource::Explicit(ModelRoots::new().with_root(ModelClass::Lora, &loras));

    let report = orchestrator
        .run(&source, &ScanOptions::default(), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.stats.total, 3);
    assert_eq!(report.stats.remote_calls, 2);
    assert_eq!(report.stats.enriched, 1);
    assert_eq!(report.stats.previews, 1);
    assert!(report.issues.is_empty());
    assert_eq!(state.lookups.load(Ordering::SeqCst), 2);
    assert_eq!(state.image_hits.load(Ordering::SeqCst), 1);

    let enrichment = store.get_enrichment(&hash).unwrap().unwrap();
    let preview = enrichment.preview_path.expect("preview cached");
    assert!(preview.ends_with(&format!("{}.png", hash)));

    orchestrator
        .run(&source, &ScanOptions::default(), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(state.lookups.load(Ordering::SeqCst), 2);
    assert_eq!(state.image_hits.load(Ordering::SeqCst), 1);
}
