//! HTTP route handlers.
//!
//! - [`connector`]: `GET /Connector`, the controller WebSocket upgrade
//! - [`cloud`]: `/api/v1/cloud/*` statistics, sessions, ping, and JSON invoke
//! - [`proxy`]: fallback that tunnels any other request to the caller's controller
//!
//! Statistics and session listing require the admin key via the
//! [`crate::auth::require_admin_key`] middleware; everything else is
//! authorized with a channel access token.

pub mod cloud;
pub mod connector;
pub mod proxy;

use axum::{
    http::{header, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Extension, Json, Router,
};
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::debug;

use crate::auth::{require_admin_key, AdminKey};
use crate::error::ConnectorError;
use crate::protocol::{Message, KIND_ERROR, PAYLOAD_KIND};
use crate::state::AppState;

/// Status used when the caller went away before the controller answered.
const CLIENT_CLOSED_REQUEST: u16 = 499;

/// Build the full application router.
pub fn router(state: AppState) -> Router {
    let admin_routes = Router::new()
        .route("/api/v1/cloud/statistics", get(cloud::statistics))
        .route(
            "/api/v1/cloud/statistics/{identity}/{channel}",
            get(cloud::channel_statistics).delete(cloud::delete_channel_statistics),
        )
        .route(
            "/api/v1/cloud/statistics/{identity}/{channel}/reset",
            post(cloud::reset_channel_statistics),
        )
        .route("/api/v1/cloud/sessions", get(cloud::sessions))
        .layer(middleware::from_fn(require_admin_key));

    let channel_routes = Router::new()
        .route("/Connector", get(connector::connect))
        .route("/api/v1/cloud/ping", post(cloud::ping))
        .route("/api/v1/cloud/invoke", post(cloud::invoke))
        .route("/api/health", get(cloud::health));

    Router::new()
        .merge(admin_routes)
        .merge(channel_routes)
        .fallback(proxy::forward)
        .layer(Extension(AdminKey(state.config.auth.admin_key.clone())))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Translate a tunnel failure into the caller-visible response.
///
/// `path` decides how an offline device is reported: API callers get a 404
/// body, browsers are redirected to `device_not_connected_url`.
pub fn error_response(err: &ConnectorError, path: &str, device_not_connected_url: &str) -> Response {
    let status = match err {
        ConnectorError::Unauthorized => StatusCode::UNAUTHORIZED,
        ConnectorError::OpenChannelNotFound(_) if !is_api_path(path) => {
            let location = format!(
                "{device_not_connected_url}?returnUrl={}",
                percent_encode(path)
            );
            return (StatusCode::FOUND, [(header::LOCATION, location)]).into_response();
        }
        ConnectorError::OpenChannelNotFound(_) => StatusCode::NOT_FOUND,
        ConnectorError::CallTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
        ConnectorError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
        ConnectorError::CallCancelled => {
            debug!(path, "Caller went away before the controller answered");
            StatusCode::from_u16(CLIENT_CLOSED_REQUEST).unwrap_or(StatusCode::SERVICE_UNAVAILABLE)
        }
        ConnectorError::ChannelClosed
        | ConnectorError::MalformedFrame(_)
        | ConnectorError::Envelope(_)
        | ConnectorError::Transport(_) => StatusCode::BAD_GATEWAY,
        ConnectorError::DuplicateCorrelationId(_) | ConnectorError::Repository(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (
        status,
        Json(json!({"error": err.to_string(), "code": err.code()})),
    )
        .into_response()
}

/// The failure a controller reported in place of a reply, if any.
fn controller_rejection(reply: &Message) -> Option<ConnectorError> {
    (reply.property(PAYLOAD_KIND) == Some(KIND_ERROR)).then(|| {
        ConnectorError::Envelope(format!(
            "controller could not serve the request: {}",
            String::from_utf8_lossy(reply.payload())
        ))
    })
}

fn is_api_path(path: &str) -> bool {
    path == "/api" || path.starts_with("/api/")
}

/// Percent-encode everything outside the RFC 3986 unreserved set.
fn percent_encode(value: &str) -> String {
    use std::fmt::Write as _;

    let mut out = String::with_capacity(value.len());
    for b in value.bytes() {
        if b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.' | b'~') {
            out.push(char::from(b));
        } else {
            let _ = write!(out, "%{b:02X}");
        }
    }
    out
}
