//! Middleware and response helpers shared by both HTTP surfaces.

use std::net::SocketAddr;

use axum::extract::{ConnectInfo, Request};
use axum::http::{header, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

/// `Server` header value, doubling as the wire-visible version stamp.
pub const SERVER_IDENT: &str = concat!("corral/", env!("CARGO_PKG_VERSION"));

/// Wide-open CORS: both surfaces sit on trusted networks and wall
/// controllers are often plain file:// pages.
pub fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
}

pub async fn identify(req: Request, next: Next) -> Response {
    let mut response = next.run(req).await;
    response
        .headers_mut()
        .insert(header::SERVER, HeaderValue::from_static(SERVER_IDENT));
    response
}

/// One line per request. The remote address comes from connect info when
/// the listener provides it and `-` otherwise (tests drive routers
/// directly).
pub async fn log_requests(req: Request, next: Next) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let remote = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.to_string())
        .unwrap_or_else(|| "-".to_string());
    let response = next.run(req).await;
    info!(
        %method,
        path,
        remote,
        status = response.status().as_u16(),
        "Request handled"
    );
    response
}

pub fn json_error(status: StatusCode, message: impl AsRef<str>) -> Response {
    (status, Json(json!({ "error": message.as_ref() }))).into_response()
}
