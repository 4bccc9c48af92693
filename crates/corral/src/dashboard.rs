//! Operator dashboard API.
//!
//! Richer, id-addressed counterpart to the REST controller surface:
//! full instance CRUD, lifecycle commands with proper status codes,
//! bundle download/upload, and the media store. Everything under
//! `/api/` speaks JSON; `/media/` serves raw assets.
//!
//! Status mapping: 404 unknown id, 409 wrong state, 422 config not
//! startable, 400 bad request, 504 command deadline, 503 shutting down,
//! 500 worker failure.

use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::extract::{DefaultBodyLimit, Multipart, Path, State};
use axum::http::{header, StatusCode};
use axum::middleware;
use axum::response::{IntoResponse, Response};
use axum::routing::{any, delete, get, patch, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio_util::io::ReaderStream;
use tracing::debug;

use crate::bundle;
use crate::error::ControlError;
use crate::http::{cors_layer, identify, json_error, log_requests};
use crate::media::MediaStore;
use crate::registry::{Command, Registry};

#[derive(Clone)]
pub struct DashState {
    pub registry: Arc<Registry>,
    pub media: Arc<MediaStore>,
    pub started_at: Instant,
}

pub fn router(state: DashState) -> Router {
    // Uploads need headroom over the media cap for multipart framing.
    let body_limit = state.media.max_bytes() as usize + 1024 * 1024;
    Router::new()
        .route("/api/version", get(version))
        .route("/api/health", get(health))
        .route("/api/instances", get(list_instances).post(create_instance))
        .route(
            "/api/instances/{id}",
            patch(patch_instance).delete(delete_instance),
        )
        .route("/api/instances/{id}/{command}", any(instance_command))
        .route("/api/all/{command}", any(bulk_command))
        .route("/api/bundle", get(download_bundle).post(upload_bundle))
        .route("/api/media", get(list_media))
        .route("/api/media/upload", post(upload_media))
        .route("/api/media/{name}", delete(delete_media))
        .route("/media/{name}", get(serve_media))
        .with_state(state)
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(cors_layer())
        .layer(middleware::from_fn(identify))
        .layer(middleware::from_fn(log_requests))
}

fn error_response(err: ControlError) -> Response {
    let status = match &err {
        ControlError::UnknownInstance(_) => StatusCode::NOT_FOUND,
        ControlError::AlreadyRunning(_) | ControlError::NotRunning(_) => StatusCode::CONFLICT,
        ControlError::InvalidConfig { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        ControlError::ImportParse { .. } => StatusCode::BAD_REQUEST,
        ControlError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        ControlError::Worker(_) => StatusCode::INTERNAL_SERVER_ERROR,
        ControlError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
    };
    json_error(status, err.to_string())
}

#[tracing::instrument(name = "dash.version", skip(state))]
async fn version(State(state): State<DashState>) -> impl IntoResponse {
    Json(json!({
        "name": "corral",
        "version": env!("CARGO_PKG_VERSION"),
        "bundle_format": bundle::FORMAT_VERSION,
        "revision": state.registry.revision(),
    }))
}

#[tracing::instrument(name = "dash.health", skip(state))]
async fn health(State(state): State<DashState>) -> impl IntoResponse {
    let total = state.registry.len();
    let running = state.registry.running_count().await;
    Json(json!({
        "status": "ok",
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "instances": { "total": total, "running": running },
    }))
}

#[tracing::instrument(name = "dash.instances.list", skip(state))]
async fn list_instances(State(state): State<DashState>) -> impl IntoResponse {
    Json(state.registry.list().await)
}

#[tracing::instrument(name = "dash.instances.create", skip(state, payload))]
async fn create_instance(
    State(state): State<DashState>,
    Json(payload): Json<Value>,
) -> Response {
    let Value::Object(mut record) = payload else {
        return json_error(StatusCode::BAD_REQUEST, "payload must be a JSON object");
    };
    // Ids are assigned here, never accepted from the client.
    record.remove("id");
    match state.registry.add(record) {
        Ok(config) => (StatusCode::OK, Json(config.to_value())).into_response(),
        Err(e) => error_response(e),
    }
}

#[tracing::instrument(name = "dash.instances.patch", skip(state, payload))]
async fn patch_instance(
    State(state): State<DashState>,
    Path(id): Path<String>,
    Json(payload): Json<Value>,
) -> Response {
    let Value::Object(record) = payload else {
        return json_error(StatusCode::BAD_REQUEST, "payload must be a JSON object");
    };
    match state.registry.patch(&id, &record).await {
        Ok((config, restarted)) => (
            StatusCode::OK,
            Json(json!({
                "ok": true,
                "restarted": restarted,
                "instance": config.to_value(),
            })),
        )
            .into_response(),
        Err(e) => error_response(e),
    }
}

#[tracing::instrument(name = "dash.instances.delete", skip(state))]
async fn delete_instance(State(state): State<DashState>, Path(id): Path<String>) -> Response {
    match state.registry.remove(&id).await {
        Ok(()) => (StatusCode::OK, Json(json!({ "ok": true }))).into_response(),
        Err(e) => error_response(e),
    }
}

#[tracing::instrument(name = "dash.instances.command", skip(state))]
async fn instance_command(
    State(state): State<DashState>,
    Path((id, command)): Path<(String, String)>,
) -> Response {
    let Some(command) = Command::parse(&command) else {
        return json_error(StatusCode::BAD_REQUEST, format!("unknown command {command}"));
    };
    match state.registry.command_with_deadline(&id, command).await {
        Ok(()) => (StatusCode::OK, Json(json!({ "ok": true }))).into_response(),
        Err(e) => error_response(e),
    }
}

#[tracing::instrument(name = "dash.all.command", skip(state))]
async fn bulk_command(State(state): State<DashState>, Path(command): Path<String>) -> Response {
    let outcome = match Command::parse(&command) {
        Some(Command::Start) => state.registry.start_all().await,
        Some(Command::Stop) => state.registry.stop_all().await,
        Some(Command::Reload) => state.registry.reload_all().await,
        Some(Command::Clear) => {
            return json_error(StatusCode::BAD_REQUEST, "command clear does not fan out")
        }
        None => {
            return json_error(StatusCode::BAD_REQUEST, format!("unknown command {command}"))
        }
    };
    (StatusCode::OK, Json(json!({ "ok": true, "outcome": outcome }))).into_response()
}

#[tracing::instrument(name = "dash.bundle.download", skip(state))]
async fn download_bundle(State(state): State<DashState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        state.registry.export_bundle(),
    )
}

#[tracing::instrument(name = "dash.bundle.upload", skip(state, body))]
async fn upload_bundle(State(state): State<DashState>, body: String) -> Response {
    match state.registry.import_replace(&body).await {
        Ok(count) => (StatusCode::OK, Json(json!({ "ok": true, "count": count }))).into_response(),
        Err(e) => error_response(e),
    }
}

#[tracing::instrument(name = "dash.media.list", skip(state))]
async fn list_media(State(state): State<DashState>) -> Response {
    match state.media.list() {
        Ok(assets) => Json(assets).into_response(),
        Err(e) => json_error(StatusCode::INTERNAL_SERVER_ERROR, format!("{e:#}")),
    }
}

#[tracing::instrument(name = "dash.media.upload", skip(state, multipart))]
async fn upload_media(State(state): State<DashState>, mut multipart: Multipart) -> Response {
    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) => return json_error(StatusCode::BAD_REQUEST, format!("bad multipart: {e}")),
        };
        let Some(filename) = field.file_name().map(str::to_string) else {
            continue;
        };
        let data = match field.bytes().await {
            Ok(data) => data,
            Err(e) => return json_error(StatusCode::BAD_REQUEST, format!("upload truncated: {e}")),
        };
        return match state.media.store(&filename, &data) {
            Ok(asset) => (StatusCode::OK, Json(asset)).into_response(),
            Err(e) => json_error(StatusCode::BAD_REQUEST, format!("{e:#}")),
        };
    }
    json_error(StatusCode::BAD_REQUEST, "no file field in upload")
}

#[tracing::instrument(name = "dash.media.delete", skip(state))]
async fn delete_media(State(state): State<DashState>, Path(name): Path<String>) -> Response {
    match state.media.delete(&name) {
        Ok(true) => (StatusCode::OK, Json(json!({ "ok": true }))).into_response(),
        Ok(false) => json_error(StatusCode::NOT_FOUND, format!("no media named {name}")),
        Err(e) => json_error(StatusCode::INTERNAL_SERVER_ERROR, format!("{e:#}")),
    }
}

#[tracing::instrument(name = "dash.media.serve", skip(state))]
async fn serve_media(State(state): State<DashState>, Path(name): Path<String>) -> Response {
    let Some(path) = state.media.path_of(&name) else {
        return json_error(StatusCode::NOT_FOUND, format!("no media named {name}"));
    };
    match tokio::fs::File::open(&path).await {
        Ok(file) => {
            debug!(name, "Serving media");
            (
                [(header::CONTENT_TYPE, content_type(&name))],
                Body::from_stream(ReaderStream::new(file)),
            )
                .into_response()
        }
        Err(_) => json_error(StatusCode::NOT_FOUND, format!("no media named {name}")),
    }
}

fn content_type(name: &str) -> &'static str {
    let ext = name.rsplit('.').next().unwrap_or_default();
    match ext {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "svg" => "image/svg+xml",
        "bmp" => "image/bmp",
        "mp4" | "m4v" => "video/mp4",
        "webm" => "video/webm",
        "mov" => "video/quicktime",
        "mp3" => "audio/mpeg",
        "wav" => "audio/wav",
        "ogg" => "audio/ogg",
        "flac" => "audio/flac",
        "html" | "htm" => "text/html; charset=utf-8",
        _ => "application/octet-stream",
    }
}
