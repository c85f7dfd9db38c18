//! `GET /Connector`: controller WebSocket registration.

use axum::{
    extract::{ws::rejection::WebSocketUpgradeRejection, Query, State, WebSocketUpgrade},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

use crate::auth::bearer_token;
use crate::connector::transport::split_axum;
use crate::state::AppState;

/// Fallback for controllers that cannot set an `Authorization` header.
#[derive(Deserialize)]
pub struct ConnectQuery {
    token: Option<String>,
}

/// Authorize the controller, upgrade, and run its session until it disconnects.
pub async fn connect(
    State(state): State<AppState>,
    Query(query): Query<ConnectQuery>,
    headers: HeaderMap,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let Ok(ws) = ws else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "WebSocket upgrade required", "code": "NOT_WEBSOCKET"})),
        )
            .into_response();
    };

    let token = bearer_token(&headers).or(query.token.as_deref());
    let identifier = match state.authorizer.authorize(token).await {
        Ok(identifier) => identifier,
        Err(e) => {
            warn!("Rejected controller connection: {e}");
            return super::error_response(
                &e,
                "/Connector",
                &state.config.connector.device_not_connected_url,
            );
        }
    };

    info!(
        identity = %identifier.identity_uid,
        channel = %identifier.channel_uid,
        "Controller connecting..."
    );

    let max_frame_size = state.config.connector.max_frame_size;
    ws.max_message_size(max_frame_size)
        .max_frame_size(max_frame_size)
        .on_upgrade(move |socket| async move {
            let (sink, stream) = split_axum(socket);
            let reason = state
                .connector
                .run_session(identifier.clone(), sink, stream)
                .await;
            info!(
                identity = %identifier.identity_uid,
                channel = %identifier.channel_uid,
                %reason,
                "Controller disconnected"
            );
        })
}
