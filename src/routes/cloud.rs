//! `/api/v1/cloud/*`: statistics, live sessions, ping, and JSON invoke.

use std::time::Instant;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};
use tracing::debug;

use crate::connector::SessionIdentifier;
use crate::protocol::{Message, MessageType, KIND_JSON, PAYLOAD_KIND};
use crate::state::AppState;

/// `GET /api/health`: liveness probe, no authentication.
pub async fn health(State(state): State<AppState>) -> Json<Value> {
    let stats = state.connector.get_statistics().await;
    Json(json!({
        "status": "ok",
        "uptime_secs": state.start_time.elapsed().as_secs(),
        "version": env!("CARGO_PKG_VERSION"),
        "open_sessions": stats.open_sessions,
    }))
}

/// `GET /api/v1/cloud/statistics`: totals plus one entry per known channel.
pub async fn statistics(State(state): State<AppState>) -> Response {
    Json(state.connector.get_statistics().await).into_response()
}

/// `GET /api/v1/cloud/statistics/{identity}/{channel}`
pub async fn channel_statistics(
    State(state): State<AppState>,
    Path((identity, channel)): Path<(String, String)>,
) -> Response {
    let identifier = SessionIdentifier::new(identity, channel);
    match state.connector.get_channel_statistics(&identifier).await {
        Some(snapshot) => Json(json!({
            "identity_uid": identifier.identity_uid,
            "channel_uid": identifier.channel_uid,
            "connected": state.connector.is_connected(&identifier).await,
            "statistics": snapshot,
        }))
        .into_response(),
        None => no_statistics(&identifier),
    }
}

/// `POST /api/v1/cloud/statistics/{identity}/{channel}/reset`: zero counters.
pub async fn reset_channel_statistics(
    State(state): State<AppState>,
    Path((identity, channel)): Path<(String, String)>,
) -> Response {
    let identifier = SessionIdentifier::new(identity, channel);
    let reset = state.connector.reset_channel_statistics(&identifier).await;
    Json(json!({"reset": reset})).into_response()
}

/// `DELETE /api/v1/cloud/statistics/{identity}/{channel}`: drop retained statistics.
pub async fn delete_channel_statistics(
    State(state): State<AppState>,
    Path((identity, channel)): Path<(String, String)>,
) -> Response {
    let identifier = SessionIdentifier::new(identity, channel);
    if state.connector.remove_channel_statistics(&identifier).await {
        StatusCode::NO_CONTENT.into_response()
    } else {
        no_statistics(&identifier)
    }
}

/// `GET /api/v1/cloud/sessions`
pub async fn sessions(State(state): State<AppState>) -> Json<Value> {
    Json(json!({"sessions": state.connector.list_sessions().await}))
}

/// `POST /api/v1/cloud/ping`: round-trip a Ping through the caller's channel.
pub async fn ping(State(state): State<AppState>, headers: HeaderMap) -> Response {
    const PATH: &str = "/api/v1/cloud/ping";
    let not_connected_url = &state.config.connector.device_not_connected_url;

    let identifier = match state.authorizer.resolve_caller(&headers).await {
        Ok(identifier) => identifier,
        Err(e) => return super::error_response(&e, PATH, not_connected_url),
    };

    let started = Instant::now();
    let result = state
        .connector
        .invoke_with_cancellation(
            &identifier,
            Message::request(MessageType::Ping, Bytes::new()),
            state.config.connector.ping_timeout(),
            &state.shutdown.child_token(),
        )
        .await;

    match result {
        Ok(_) => {
            let latency_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
            debug!(identity = %identifier.identity_uid, latency_ms, "Ping answered");
            Json(json!({
                "identity_uid": identifier.identity_uid,
                "channel_uid": identifier.channel_uid,
                "latency_ms": latency_ms,
            }))
            .into_response()
        }
        Err(e) => super::error_response(&e, PATH, not_connected_url),
    }
}

/// `POST /api/v1/cloud/invoke`: hand a JSON document to the controller and
/// return its JSON reply verbatim.
pub async fn invoke(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    const PATH: &str = "/api/v1/cloud/invoke";
    let not_connected_url = &state.config.connector.device_not_connected_url;

    let identifier = match state.authorizer.resolve_caller(&headers).await {
        Ok(identifier) => identifier,
        Err(e) => return super::error_response(&e, PATH, not_connected_url),
    };

    if let Err(e) = serde_json::from_slice::<Value>(&body) {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": format!("Invalid JSON body: {e}"), "code": "INVALID_JSON"})),
        )
            .into_response();
    }

    let request = Message::request(MessageType::Raw, body).with_property(PAYLOAD_KIND, KIND_JSON);
    match state
        .connector
        .invoke_with_cancellation(
            &identifier,
            request,
            state.config.connector.invoke_timeout(),
            &state.shutdown.child_token(),
        )
        .await
    {
        Ok(response) => match super::controller_rejection(&response) {
            Some(e) => super::error_response(&e, PATH, not_connected_url),
            None => (
                [(header::CONTENT_TYPE, "application/json")],
                response.payload().clone(),
            )
                .into_response(),
        },
        Err(e) => super::error_response(&e, PATH, not_connected_url),
    }
}

fn no_statistics(identifier: &SessionIdentifier) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({
            "error": format!("No statistics for {identifier}"),
            "code": "NOT_FOUND",
        })),
    )
        .into_response()
}
