//! HTTP/WS surface (C11): the axum router binding the REST endpoints and push-channel path to
//! the aggregator, job broker, and pipeline runner. Business logic stays a thin pass-through —
//! every handler and every WS command dispatches into the same `AppState` methods.
//!
//! Grounded on `other_examples/hua0512-rust-srec`'s one-router-function-per-resource layout and
//! typed `ApiError`, and on the teacher's sibling `thaumic-cast`'s `axum` + `tower-http`
//! CORS/trace layers and `ws::on_upgrade` duplex-forwarding pattern. Routes use axum 0.7's
//! `:param` path syntax (this crate pins `axum = "0.7"`, not the `{param}` syntax of 0.8).

use crate::catalog::CatalogAggregator;
use crate::config::AppConfig;
use crate::events::{Event, EventBus};
use crate::error::StreamwatchError;
use crate::jobs::JobBroker;
use crate::models::{Job, JobState, Platform, StreamerRecord, StreamerRef};
use crate::pipeline::JobRunner;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

#[derive(Clone)]
pub struct AppState {
    pub catalog: Arc<CatalogAggregator>,
    pub jobs: Arc<JobBroker>,
    pub runner: Arc<JobRunner>,
    pub events: EventBus,
    pub config: Arc<AppConfig>,
    pub clips_dir: PathBuf,
    pub thumbnails_dir: PathBuf,
}

pub fn create_router(state: AppState) -> Router {
    let api_routes = Router::new()
        .route("/streamers", get(list_streamers))
        .route("/streamers/live", get(list_live_streamers))
        .route("/streamers/:platform", get(get_platform_slice))
        .route("/refresh", post(trigger_refresh))
        .route("/refresh/:platform", post(trigger_refresh_platform))
        .route("/capture", post(create_capture))
        .route("/jobs", get(list_jobs))
        .route("/jobs/:id", get(get_job_handler))
        .route("/clip", post(create_clip))
        .route("/preview", post(create_preview))
        .route("/upload", post(upload_clip))
        .route("/clips", get(list_clips))
        .route("/clips/:id", delete(delete_clip))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_api_key));

    Router::new()
        .nest("/api", api_routes)
        .route("/ws", get(ws_handler))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn require_api_key(
    State(state): State<AppState>,
    headers: HeaderMap,
    request: axum::extract::Request,
    next: Next,
) -> Response {
    let Some(expected) = &state.config.server.api_key else {
        return next.run(request).await;
    };
    let provided = headers.get("x-api-key").and_then(|v| v.to_str().ok());
    if provided == Some(expected.as_str()) {
        next.run(request).await
    } else {
        (StatusCode::UNAUTHORIZED, "missing or invalid api key").into_response()
    }
}

/// Thin wrapper turning a `StreamwatchError` into the right HTTP status, per §7's propagation
/// policy: client/programmer errors are 4xx, everything else is a 5xx the client should retry.
pub struct ApiError(StreamwatchError);

impl From<StreamwatchError> for ApiError {
    fn from(err: StreamwatchError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            StreamwatchError::NotFound | StreamwatchError::JobNotFound(_) | StreamwatchError::UnknownPlatform(_) => {
                StatusCode::NOT_FOUND
            }
            StreamwatchError::InvalidRange(_) | StreamwatchError::InvalidTransition { .. } => StatusCode::BAD_REQUEST,
            StreamwatchError::Stalled | StreamwatchError::Cancelled => StatusCode::CONFLICT,
            StreamwatchError::ConfigurationError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_GATEWAY,
        };
        (status, Json(ErrorBody { error: self.0.to_string() })).into_response()
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

type ApiResult<T> = Result<T, ApiError>;

// ---- request/response DTOs --------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CaptureRequest {
    platform: Platform,
    streamer_id: String,
    max_duration: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClipRequest {
    clip_id: String,
    start_time: f64,
    duration: f64,
    title: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PreviewRequest {
    clip_id: String,
    num_frames: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UploadRequest {
    clip_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ClipInfo {
    id: String,
    size_bytes: u64,
    thumbnail: Option<String>,
}

const DEFAULT_PREVIEW_FRAMES: u32 = 5;

/// Groups a flat record list into one bucket per platform, for `GET /api/streamers`.
fn group_by_platform(records: &[StreamerRecord]) -> HashMap<&'static str, Vec<&StreamerRecord>> {
    let mut groups: HashMap<&'static str, Vec<&StreamerRecord>> = HashMap::new();
    for record in records {
        groups.entry(record.platform.as_str()).or_default().push(record);
    }
    groups
}

// ---- shared operations (called by both REST handlers and the WS command dispatch) -------

async fn do_capture(state: &AppState, req: CaptureRequest) -> Result<Job, StreamwatchError> {
    let streamer_ref = StreamerRef::new(req.streamer_id);
    let job = state.jobs.create(req.platform, streamer_ref).await;
    let duration = req
        .max_duration
        .map(Duration::from_secs)
        .unwrap_or(state.runner_default_capture_duration());
    state.runner.spawn_capture(job.id.clone(), duration);
    Ok(job)
}

async fn do_clip(state: &AppState, req: ClipRequest) -> Result<Job, StreamwatchError> {
    state.runner.extract_clip(&req.clip_id, req.start_time, req.duration).await?;
    if let Some(title) = req.title {
        state.jobs.set_title(&req.clip_id, Some(title)).await?;
    }
    state.jobs.get(&req.clip_id).await
}

async fn do_preview(state: &AppState, req: PreviewRequest) -> Result<Job, StreamwatchError> {
    let job = state.jobs.get(&req.clip_id).await?;
    if job.state != JobState::Captured {
        return Err(StreamwatchError::InvalidTransition {
            from: job.state.as_str().to_string(),
            to: "captured (preview requires a captured buffer)".to_string(),
        });
    }
    let num_frames = req.num_frames.unwrap_or(DEFAULT_PREVIEW_FRAMES);
    let frames = state.runner.generate_previews(&req.clip_id, num_frames).await?;
    state.jobs.set_preview_frames(&req.clip_id, frames).await
}

async fn do_upload(state: &AppState, req: UploadRequest) -> Result<Job, StreamwatchError> {
    state.runner.upload(&req.clip_id).await?;
    state.jobs.get(&req.clip_id).await
}

async fn do_refresh_platform(state: &AppState, platform: Platform) -> Result<Vec<StreamerRecord>, StreamwatchError> {
    state.catalog.refresh_platform(platform).await
}

impl AppState {
    fn runner_default_capture_duration(&self) -> Duration {
        self.config.limits.capture_duration_default
    }
}

// ---- REST handlers -----------------------------------------------------------------------

async fn list_streamers(State(state): State<AppState>) -> impl IntoResponse {
    let snapshot = state.catalog.current_snapshot().await;
    let groups = group_by_platform(&snapshot.records);
    Json(groups)
}

async fn list_live_streamers(State(state): State<AppState>) -> impl IntoResponse {
    let snapshot = state.catalog.current_snapshot().await;
    let mut live: Vec<&StreamerRecord> = snapshot.live().collect();
    live.sort_by_key(|r| match &r.status {
        crate::models::StreamerStatus::Live { viewer_count, .. } => std::cmp::Reverse(*viewer_count),
        _ => std::cmp::Reverse(0),
    });
    Json(live)
}

async fn get_platform_slice(
    State(state): State<AppState>,
    Path(platform): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let platform = Platform::parse(&platform).ok_or(StreamwatchError::UnknownPlatform(platform))?;
    let snapshot = state.catalog.current_snapshot().await;
    let slice: Vec<&StreamerRecord> = snapshot.platform_slice(platform);
    Ok(Json(slice))
}

async fn trigger_refresh(State(state): State<AppState>) -> impl IntoResponse {
    let catalog = state.catalog.clone();
    tokio::spawn(async move {
        if let Err(e) = catalog.refresh().await {
            warn!("on-demand full refresh failed: {}", e);
        }
    });
    StatusCode::ACCEPTED
}

async fn trigger_refresh_platform(
    State(state): State<AppState>,
    Path(platform): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let platform = Platform::parse(&platform).ok_or(StreamwatchError::UnknownPlatform(platform))?;
    tokio::spawn(async move {
        if let Err(e) = do_refresh_platform(&state, platform).await {
            warn!(platform = %platform, "scoped refresh failed: {}", e);
        }
    });
    Ok(StatusCode::ACCEPTED)
}

async fn create_capture(State(state): State<AppState>, Json(req): Json<CaptureRequest>) -> ApiResult<impl IntoResponse> {
    let job = do_capture(&state, req).await?;
    Ok((StatusCode::CREATED, Json(job)))
}

async fn list_jobs(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.jobs.list().await)
}

async fn get_job_handler(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.jobs.get(&id).await?))
}

async fn create_clip(State(state): State<AppState>, Json(req): Json<ClipRequest>) -> ApiResult<impl IntoResponse> {
    Ok(Json(do_clip(&state, req).await?))
}

async fn create_preview(State(state): State<AppState>, Json(req): Json<PreviewRequest>) -> ApiResult<impl IntoResponse> {
    Ok(Json(do_preview(&state, req).await?))
}

async fn upload_clip(State(state): State<AppState>, Json(req): Json<UploadRequest>) -> ApiResult<impl IntoResponse> {
    Ok(Json(do_upload(&state, req).await?))
}

async fn list_clips(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    let mut out = Vec::new();
    if state.clips_dir.exists() {
        let mut entries = tokio::fs::read_dir(&state.clips_dir)
            .await
            .map_err(|e| StreamwatchError::IoError(e.to_string()))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StreamwatchError::IoError(e.to_string()))?
        {
            let metadata = entry.metadata().await.map_err(|e| StreamwatchError::IoError(e.to_string()))?;
            if !metadata.is_file() {
                continue;
            }
            let path = entry.path();
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let thumbnail_path = state.thumbnails_dir.join(format!("{stem}.jpg"));
            out.push(ClipInfo {
                id: stem.to_string(),
                size_bytes: metadata.len(),
                thumbnail: thumbnail_path.exists().then(|| thumbnail_path.display().to_string()),
            });
        }
    }
    Ok(Json(out))
}

async fn delete_clip(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<impl IntoResponse> {
    if let Ok(job) = state.jobs.get(&id).await {
        if !job.state.is_terminal() {
            return Err(StreamwatchError::InvalidTransition {
                from: job.state.as_str().to_string(),
                to: "deleted".to_string(),
            }
            .into());
        }
        if let Some(clip_path) = &job.clip_path {
            let _ = tokio::fs::remove_file(clip_path).await;
        }
        if let Some(thumbnail_path) = &job.thumbnail_path {
            let _ = tokio::fs::remove_file(thumbnail_path).await;
        }
        state.jobs.delete(&id).await?;
    } else {
        let clip_path = state.clips_dir.join(format!("{id}.mp4"));
        let thumbnail_path = state.thumbnails_dir.join(format!("{id}.jpg"));
        let _ = tokio::fs::remove_file(&clip_path).await;
        let _ = tokio::fs::remove_file(&thumbnail_path).await;
    }
    Ok(StatusCode::NO_CONTENT)
}

// ---- push channel (WS) --------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientCommand {
    StartCapture(CaptureRequest),
    CreateClip(ClipRequest),
    GeneratePreview(PreviewRequest),
    UploadClip(UploadRequest),
    RefreshStreamers,
    GetJobStatus(JobIdPayload),
}

#[derive(Debug, Deserialize)]
struct JobIdPayload {
    #[serde(rename = "jobId")]
    job_id: String,
}

#[derive(Debug, Serialize)]
struct CommandReply {
    command: &'static str,
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();
    let mut events = state.events.subscribe();

    loop {
        tokio::select! {
            event = events.recv() => {
                match event {
                    Ok(event) => {
                        let Ok(text) = serde_json::to_string(&event) else { continue };
                        if sender.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "ws subscriber lagged, resuming from live events");
                        continue;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        let reply = dispatch_command(&state, &text).await;
                        if let Ok(text) = serde_json::to_string(&reply) {
                            if sender.send(Message::Text(text)).await.is_err() {
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        warn!("ws receive error: {}", e);
                        break;
                    }
                }
            }
        }
    }
    info!("ws connection closed");
}

async fn dispatch_command(state: &AppState, raw: &str) -> CommandReply {
    let parsed: Result<ClientCommand, _> = serde_json::from_str(raw);
    let command = match parsed {
        Ok(command) => command,
        Err(e) => {
            return CommandReply { command: "unknown", success: false, data: None, error: Some(e.to_string()) }
        }
    };

    match command {
        ClientCommand::StartCapture(req) => reply("start_capture", do_capture(state, req).await),
        ClientCommand::CreateClip(req) => reply("create_clip", do_clip(state, req).await),
        ClientCommand::GeneratePreview(req) => reply("generate_preview", do_preview(state, req).await),
        ClientCommand::UploadClip(req) => reply("upload_clip", do_upload(state, req).await),
        ClientCommand::RefreshStreamers => {
            let catalog = state.catalog.clone();
            tokio::spawn(async move {
                if let Err(e) = catalog.refresh().await {
                    warn!("ws-triggered refresh failed: {}", e);
                }
            });
            CommandReply { command: "refresh_streamers", success: true, data: None, error: None }
        }
        ClientCommand::GetJobStatus(payload) => {
            reply("get_job_status", state.jobs.get(&payload.job_id).await)
        }
    }
}

fn reply<T: Serialize>(command: &'static str, result: Result<T, StreamwatchError>) -> CommandReply {
    match result {
        Ok(value) => CommandReply {
            command,
            success: true,
            data: serde_json::to_value(value).ok(),
            error: None,
        },
        Err(e) => CommandReply { command, success: false, data: None, error: Some(e.to_string()) },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::StreamerStatus;
    use chrono::Utc;

    fn record(platform: Platform, id: &str) -> StreamerRecord {
        StreamerRecord {
            platform,
            platform_id: StreamerRef::new(id),
            display_name: id.to_string(),
            avatar_url: None,
            channel_url: String::new(),
            status: StreamerStatus::NotFound,
            last_checked: Utc::now(),
            error_details: None,
            cached_stream_url: None,
        }
    }

    #[test]
    fn group_by_platform_buckets_every_record() {
        let records = vec![
            record(Platform::KickLike, "a"),
            record(Platform::KickLike, "b"),
            record(Platform::YouTubeLike, "c"),
        ];
        let groups = group_by_platform(&records);
        assert_eq!(groups.get("kicklike").map(|v| v.len()), Some(2));
        assert_eq!(groups.get("youtubelike").map(|v| v.len()), Some(1));
    }

    #[test]
    fn api_error_maps_not_found_to_404() {
        let response = ApiError(StreamwatchError::NotFound).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn api_error_maps_invalid_range_to_400() {
        let response = ApiError(StreamwatchError::InvalidRange("bad".to_string())).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn api_error_maps_transcode_error_to_502() {
        let response = ApiError(StreamwatchError::TranscodeError("boom".to_string())).into_response();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn client_command_parses_snake_case_tag_with_camel_case_body() {
        let raw = r#"{"type":"create_clip","clipId":"job-1","startTime":1.0,"duration":5.0}"#;
        let parsed: ClientCommand = serde_json::from_str(raw).unwrap();
        assert!(matches!(parsed, ClientCommand::CreateClip(req) if req.clip_id == "job-1"));
    }

    #[test]
    fn client_command_parses_get_job_status() {
        let raw = r#"{"type":"get_job_status","jobId":"job-1"}"#;
        let parsed: ClientCommand = serde_json::from_str(raw).unwrap();
        assert!(matches!(parsed, ClientCommand::GetJobStatus(payload) if payload.job_id == "job-1"));
    }
}
