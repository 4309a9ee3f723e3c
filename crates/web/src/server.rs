//! HTTP API

use appdex_common::{AppdexConfig, Database, Error, IndexedItem};
use appdex_launcher::{Browser, CaptureQueue, Capturer, LaunchSpec, Registry};
use appdex_scanner::{index_folder, ScanOptions};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

/// Everything the handlers share
pub struct AppState {
    pub config: AppdexConfig,
    pub db: Database,
    pub registry: Registry,
    pub queue: CaptureQueue,
    pub scan_options: ScanOptions,
}

impl AppState {
    /// Wire the index, registry and capture queue from configuration.
    /// Must be called inside a tokio runtime.
    pub fn new(config: AppdexConfig, db: Database, browser: Arc<dyn Browser>) -> Self {
        let registry = Registry::new(config.launch.clone(), config.scratch_dir());
        let capturer = Capturer::new(registry.clone(), browser, &config.capture);
        let queue = CaptureQueue::start(
            capturer,
            db.clone(),
            config.thumbnails_dir(),
            config.capture.workers,
        );
        let scan_options = ScanOptions::from_config(&config.scan);

        Self {
            config,
            db,
            registry,
            queue,
            scan_options,
        }
    }

    /// Stop capture workers and every launched server
    pub async fn shutdown(&self) {
        self.queue.shutdown().await;
        let stopped = self.registry.stop_all().await;
        info!("Shutdown complete ({} servers stopped)", stopped);
    }
}

/// Web API server
pub struct WebServer {
    state: Arc<AppState>,
}

impl WebServer {
    pub fn new(state: AppState) -> Self {
        Self {
            state: Arc::new(state),
        }
    }

    pub fn state(&self) -> Arc<AppState> {
        self.state.clone()
    }

    /// Build the router
    pub fn router(&self) -> Router {
        Router::new()
            .route("/api/health", get(health_handler))
            // Items
            .route("/api/items", get(list_items_handler))
            .route(
                "/api/items/:id",
                get(get_item_handler).delete(delete_item_handler),
            )
            .route("/api/items/:id/favourite", post(favourite_handler))
            .route("/api/items/:id/description", post(description_handler))
            .route("/api/items/:id/launch", post(launch_handler))
            .route("/api/items/:id/stop", post(stop_item_handler))
            // Scanning and capture
            .route("/api/scan", post(scan_handler))
            .route("/api/regenerate-thumbnails", post(regenerate_handler))
            .route("/api/progress", get(progress_handler))
            // Housekeeping
            .route("/api/running", get(running_handler))
            .route("/api/clean-apps", post(clean_apps_handler))
            .route("/api/cleanup", post(cleanup_handler))
            .route("/api/remove-folder", post(remove_folder_handler))
            .route("/api/purge-database", post(purge_handler))
            .nest_service(
                "/thumbnails",
                ServeDir::new(self.state.config.thumbnails_dir()),
            )
            .fallback(not_found_handler)
            .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any))
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }

    /// Serve until `shutdown` resolves, then stop workers and launched servers
    pub async fn serve(
        self,
        addr: SocketAddr,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> anyhow::Result<()> {
        info!("Appdex API listening on http://{}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown)
            .await?;

        self.state.shutdown().await;
        Ok(())
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Maps domain errors onto JSON error responses
struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::NotFound { .. } => StatusCode::NOT_FOUND,
            Error::PortBusy { .. } => StatusCode::CONFLICT,
            Error::InvalidConfig(_) => StatusCode::BAD_REQUEST,
            Error::LaunchFailed { .. }
            | Error::PortExhausted { .. }
            | Error::CaptureTimeout { .. }
            | Error::Capture(_)
            | Error::BrowserNotFound => StatusCode::BAD_GATEWAY,
            Error::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            warn!("Request failed: {}", self.0);
        }
        (status, Json(serde_json::json!({ "error": self.0.to_string() }))).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

fn bad_request(message: &str) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(serde_json::json!({ "error": message })),
    )
        .into_response()
}

fn find_item(state: &AppState, id: i64) -> ApiResult<IndexedItem> {
    state
        .db
        .get_item(id)?
        .ok_or_else(|| ApiError(Error::item_not_found(id)))
}

/// Run blocking index work off the async runtime
async fn blocking<T, F>(f: F) -> ApiResult<T>
where
    F: FnOnce() -> appdex_common::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ApiError(Error::Internal(format!("blocking task failed: {}", e))))?
        .map_err(ApiError)
}

// ============================================================================
// Handlers
// ============================================================================

async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "appdex-web",
        "version": appdex_common::VERSION,
    }))
}

async fn not_found_handler() -> impl IntoResponse {
    (
        StatusCode::NOT_FOUND,
        Json(serde_json::json!({ "error": "not found" })),
    )
}

#[derive(Debug, Deserialize)]
struct ItemsQuery {
    q: Option<String>,
    #[serde(default)]
    favourites: bool,
}

async fn list_items_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ItemsQuery>,
) -> ApiResult<Json<Vec<IndexedItem>>> {
    let search = query.q.as_deref().map(str::trim).filter(|q| !q.is_empty());
    let mut items = match search {
        Some(q) => state.db.search_items(q)?,
        None if query.favourites => state.db.list_favourites()?,
        None => state.db.list_items()?,
    };
    if query.favourites {
        items.retain(|item| item.is_favourite);
    }
    Ok(Json(items))
}

async fn get_item_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<Json<IndexedItem>> {
    Ok(Json(find_item(&state, id)?))
}

async fn delete_item_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<Json<serde_json::Value>> {
    let item = find_item(&state, id)?;
    state
        .registry
        .stop(std::path::Path::new(&item.main_file_path))
        .await?;
    let removed = state.db.remove_item(id)?;
    Ok(Json(serde_json::json!({
        "removed": removed.simple_id,
        "name": removed.name,
    })))
}

async fn favourite_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<Json<serde_json::Value>> {
    let is_favourite = state.db.toggle_favourite(id)?;
    Ok(Json(serde_json::json!({ "id": id, "is_favourite": is_favourite })))
}

#[derive(Debug, Deserialize)]
struct DescriptionRequest {
    description: String,
}

async fn description_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(body): Json<DescriptionRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    state.db.set_description(id, body.description.trim())?;
    Ok(Json(serde_json::json!({ "id": id, "description": body.description.trim() })))
}

async fn launch_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<Json<serde_json::Value>> {
    let item = find_item(&state, id)?;
    let lease = state
        .registry
        .acquire(&LaunchSpec::for_item(&item.to_discovered()))
        .await?;

    let body = serde_json::json!({
        "id": id,
        "name": item.name,
        "url": lease.url(),
        "port": lease.port(),
        "started": lease.started(),
    });
    // The server stays warm after the lease is dropped
    state.registry.release(lease);
    Ok(Json(body))
}

async fn stop_item_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<Json<serde_json::Value>> {
    let item = find_item(&state, id)?;
    let stopped = state
        .registry
        .stop(std::path::Path::new(&item.main_file_path))
        .await?;
    Ok(Json(serde_json::json!({ "id": id, "stopped": stopped })))
}

#[derive(Debug, Deserialize)]
struct ScanRequest {
    folder_path: String,
    capture: Option<bool>,
}

async fn scan_handler(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ScanRequest>,
) -> ApiResult<Response> {
    let folder = body.folder_path.trim();
    if folder.is_empty() {
        return Ok(bad_request("folder_path required"));
    }

    let root = PathBuf::from(folder);
    let db = state.db.clone();
    let options = state.scan_options.clone();
    let report = blocking(move || index_folder(&db, &root, &options)).await?;

    let queued = if body.capture.unwrap_or(true) {
        state.queue.enqueue(report.needs_capture())?
    } else {
        0
    };

    Ok(Json(serde_json::json!({
        "root": report.root,
        "stats": report.stats,
        "found": report.stats.found(),
        "inserted": report.inserted,
        "updated": report.updated,
        "unchanged": report.unchanged,
        "queued_for_capture": queued,
        "items": report.items,
    }))
    .into_response())
}

async fn regenerate_handler(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<serde_json::Value>> {
    let missing = state.db.list_missing_thumbnails()?;
    let queued = state.queue.enqueue(missing)?;
    Ok(Json(serde_json::json!({ "queued": queued })))
}

async fn progress_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.queue.progress())
}

async fn running_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.registry.list())
}

async fn clean_apps_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stopped = state.registry.stop_all().await;
    Json(serde_json::json!({ "stopped_count": stopped }))
}

async fn cleanup_handler(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<serde_json::Value>> {
    let db = state.db.clone();
    let removed = blocking(move || db.cleanup_missing()).await?;
    Ok(Json(serde_json::json!({ "removed": removed })))
}

#[derive(Debug, Deserialize)]
struct RemoveFolderRequest {
    folder_path: String,
}

async fn remove_folder_handler(
    State(state): State<Arc<AppState>>,
    Json(body): Json<RemoveFolderRequest>,
) -> ApiResult<Response> {
    let folder = body.folder_path.trim().trim_end_matches('/');
    if folder.is_empty() {
        return Ok(bad_request("folder_path required"));
    }
    for item in state.db.list_folder_items(folder)? {
        state
            .registry
            .stop(std::path::Path::new(&item.main_file_path))
            .await?;
    }
    let removed = state.db.remove_folder_items(folder)?;
    Ok(Json(serde_json::json!({ "removed": removed, "folder_path": folder })).into_response())
}

async fn purge_handler(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<serde_json::Value>> {
    let stopped = state.registry.stop_all().await;
    let db = state.db.clone();
    let removed = blocking(move || db.purge()).await?;
    Ok(Json(serde_json::json!({ "removed": removed, "stopped_count": stopped })))
}
