//! Title-addressed controller surface.
//!
//! This is the surface existing wall controllers and stream-deck macros
//! already speak, so it stays deliberately small and GET-friendly: `/`
//! lists titles, `/{title}/{command}` runs one lifecycle command,
//! `/all/{start|stop|reload}` fans out. Instances are addressed by title
//! (first match in creation order), and there are exactly three failure
//! codes: 400 for requests that make no sense, 404 for unknown titles,
//! 417 for anything that failed at runtime.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::middleware;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;

use crate::error::ControlError;
use crate::http::{cors_layer, identify, json_error, log_requests};
use crate::registry::{BulkOutcome, Command, Registry};

pub fn router(registry: Arc<Registry>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/{selector}/{command}", get(dispatch).post(dispatch))
        .with_state(registry)
        .layer(cors_layer())
        .layer(middleware::from_fn(identify))
        .layer(middleware::from_fn(log_requests))
}

#[tracing::instrument(name = "rest.index", skip(registry))]
async fn index(State(registry): State<Arc<Registry>>) -> impl IntoResponse {
    Json(registry.titles())
}

#[tracing::instrument(name = "rest.dispatch", skip(registry))]
async fn dispatch(
    State(registry): State<Arc<Registry>>,
    Path((selector, command)): Path<(String, String)>,
) -> Response {
    let Some(command) = Command::parse(&command) else {
        return json_error(StatusCode::BAD_REQUEST, format!("unknown command {command}"));
    };

    if selector == "all" {
        return match command {
            Command::Start => bulk_response(registry.start_all().await),
            Command::Stop => bulk_response(registry.stop_all().await),
            Command::Reload => bulk_response(registry.reload_all().await),
            Command::Clear => json_error(StatusCode::BAD_REQUEST, "clear does not fan out"),
        };
    }

    let id = match registry.resolve_title(&selector) {
        Ok(id) => id,
        Err(e) => return error_response(e),
    };
    match registry.command_with_deadline(&id, command).await {
        Ok(()) => (StatusCode::OK, Json(json!({ "ok": true }))).into_response(),
        Err(e) => error_response(e),
    }
}

fn bulk_response(outcome: BulkOutcome) -> Response {
    (StatusCode::OK, Json(json!({ "ok": true, "outcome": outcome }))).into_response()
}

fn error_response(err: ControlError) -> Response {
    let status = match err {
        ControlError::UnknownInstance(_) => StatusCode::NOT_FOUND,
        ControlError::ImportParse { .. } => StatusCode::BAD_REQUEST,
        _ => StatusCode::EXPECTATION_FAILED,
    };
    json_error(status, err.to_string())
}
