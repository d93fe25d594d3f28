use crate::core::{AdvanceOutcome, Engine, SyncOutcome};
use crate::error::EngineError;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use deck_proto::protocol::{Direction, DownloadTask, StatusSnapshot, TimelineEvent};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::{error, info};

#[derive(Clone)]
struct HttpState {
    engine: Arc<Engine>,
}

/// `EngineError` as an HTTP response: a status code plus `{"error": ...}`.
struct ApiError(EngineError);

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            EngineError::NoFilesAvailable => StatusCode::CONFLICT,
            EngineError::FetchFailed(_) | EngineError::Player(_) => StatusCode::BAD_GATEWAY,
            EngineError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            EngineError::NotFound(_) => StatusCode::NOT_FOUND,
            EngineError::Busy | EngineError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(ErrorBody { error: self.0.to_string() })).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Serialize)]
struct PauseStatus {
    paused: bool,
}

#[derive(Serialize)]
struct VolumeStatus {
    volume: u8,
}

#[derive(Serialize)]
struct SeekStatus {
    position: f64,
}

#[derive(Serialize)]
struct StopStatus {
    stopped: bool,
}

#[derive(Serialize)]
struct AutoCacheStatus {
    auto_cache: bool,
}

#[derive(Serialize)]
struct FileList {
    count: usize,
    files: Vec<String>,
}

#[derive(Serialize)]
struct DownloadView {
    #[serde(flatten)]
    task: DownloadTask,
    percent: Option<f64>,
}

impl From<DownloadTask> for DownloadView {
    fn from(task: DownloadTask) -> Self {
        let percent = task.percent();
        Self { task, percent }
    }
}

#[derive(Deserialize)]
struct FilesQuery {
    #[serde(default)]
    q: String,
}

#[derive(Deserialize)]
struct TimelineQuery {
    limit: Option<usize>,
}

#[derive(Deserialize)]
struct AutoCacheQuery {
    enabled: bool,
}

const DEFAULT_TIMELINE_LIMIT: usize = 50;

pub fn router(engine: Arc<Engine>) -> Router {
    Router::new()
        .route("/api/status", get(get_status))
        .route("/api/next", post(next_track))
        .route("/api/prev", post(prev_track))
        .route("/api/random", post(random_track))
        .route("/api/pause", post(toggle_pause))
        .route("/api/stop", post(stop))
        .route("/api/play/:index", post(play_index))
        .route("/api/seek/:seconds", post(seek))
        .route("/api/volume/:value", post(set_volume))
        .route("/api/volume/adjust/:delta", post(adjust_volume))
        .route("/api/downloads", get(list_downloads))
        .route("/api/downloads/:id", get(get_download))
        .route("/api/files", get(list_files))
        .route("/api/files/sync", post(sync_files))
        .route("/api/timeline", get(get_timeline))
        .route("/api/timeline/clear", post(clear_timeline))
        .route("/api/cache/auto", post(set_auto_cache))
        .layer(CorsLayer::permissive())
        .with_state(HttpState { engine })
}

pub fn start_server(
    bind_address: String,
    port: u16,
    engine: Arc<Engine>,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let app = router(engine);

        let addr = format!("{}:{}", bind_address, port);
        let listener = match TcpListener::bind(&addr).await {
            Ok(l) => l,
            Err(e) => {
                error!("Failed to bind HTTP server to {}: {}", addr, e);
                return;
            }
        };

        info!("HTTP API server listening on http://{}", addr);

        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(async move { cancel.cancelled().await })
            .await
        {
            error!("HTTP server error: {}", e);
        }
    })
}

async fn get_status(State(state): State<HttpState>) -> Json<StatusSnapshot> {
    Json(state.engine.status().await)
}

async fn advance(state: &HttpState, direction: Direction) -> ApiResult<AdvanceOutcome> {
    info!("HTTP API: {}", direction.as_str());
    Ok(Json(state.engine.request_advance(direction).await?))
}

async fn next_track(State(state): State<HttpState>) -> ApiResult<AdvanceOutcome> {
    advance(&state, Direction::Next).await
}

async fn prev_track(State(state): State<HttpState>) -> ApiResult<AdvanceOutcome> {
    advance(&state, Direction::Prev).await
}

async fn random_track(State(state): State<HttpState>) -> ApiResult<AdvanceOutcome> {
    advance(&state, Direction::Random).await
}

async fn toggle_pause(State(state): State<HttpState>) -> ApiResult<PauseStatus> {
    info!("HTTP API: Toggle pause");
    let paused = state.engine.toggle_pause().await?;
    Ok(Json(PauseStatus { paused }))
}

async fn stop(State(state): State<HttpState>) -> ApiResult<StopStatus> {
    info!("HTTP API: Stop");
    state.engine.stop().await?;
    Ok(Json(StopStatus { stopped: true }))
}

async fn play_index(
    State(state): State<HttpState>,
    Path(index): Path<usize>,
) -> ApiResult<AdvanceOutcome> {
    info!("HTTP API: Play index {}", index);
    Ok(Json(state.engine.request_play_index(index).await?))
}

async fn seek(State(state): State<HttpState>, Path(seconds): Path<f64>) -> ApiResult<SeekStatus> {
    info!("HTTP API: Seek to {}s", seconds);
    let position = state.engine.seek(seconds).await?;
    Ok(Json(SeekStatus { position }))
}

async fn set_volume(State(state): State<HttpState>, Path(value): Path<i64>) -> ApiResult<VolumeStatus> {
    info!("HTTP API: Set volume to {}%", value);
    let volume = state.engine.set_volume(value).await?;
    Ok(Json(VolumeStatus { volume }))
}

async fn adjust_volume(
    State(state): State<HttpState>,
    Path(delta): Path<i64>,
) -> ApiResult<VolumeStatus> {
    info!("HTTP API: Adjust volume by {}", delta);
    let volume = state.engine.adjust_volume(delta).await?;
    Ok(Json(VolumeStatus { volume }))
}

async fn list_downloads(State(state): State<HttpState>) -> Json<Vec<DownloadView>> {
    let tasks = state.engine.downloads().await;
    Json(tasks.into_iter().map(DownloadView::from).collect())
}

async fn get_download(
    State(state): State<HttpState>,
    Path(id): Path<String>,
) -> ApiResult<DownloadView> {
    Ok(Json(state.engine.download(&id).await?.into()))
}

async fn list_files(
    State(state): State<HttpState>,
    Query(query): Query<FilesQuery>,
) -> Json<FileList> {
    let files = state.engine.search(&query.q).await;
    Json(FileList {
        count: files.len(),
        files,
    })
}

async fn sync_files(State(state): State<HttpState>) -> ApiResult<SyncOutcome> {
    info!("HTTP API: Sync cache");
    Ok(Json(state.engine.sync_cache().await?))
}

async fn get_timeline(
    State(state): State<HttpState>,
    Query(query): Query<TimelineQuery>,
) -> Json<Vec<TimelineEvent>> {
    let limit = query.limit.unwrap_or(DEFAULT_TIMELINE_LIMIT);
    Json(state.engine.timeline(limit).await)
}

async fn clear_timeline(State(state): State<HttpState>) -> Result<StatusCode, ApiError> {
    info!("HTTP API: Clear timeline");
    state.engine.clear_timeline().await?;
    Ok(StatusCode::OK)
}

async fn set_auto_cache(
    State(state): State<HttpState>,
    Query(query): Query<AutoCacheQuery>,
) -> Json<AutoCacheStatus> {
    info!("HTTP API: Auto-cache {}", query.enabled);
    let auto_cache = state.engine.set_auto_cache(query.enabled).await;
    Json(AutoCacheStatus { auto_cache })
}
