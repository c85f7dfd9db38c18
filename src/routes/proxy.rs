//! Fallback reverse proxy: any request not matched by another route is
//! wrapped in an [`HttpRequestEnvelope`] and tunneled to the caller's
//! controller, whose [`HttpResponseEnvelope`] becomes the HTTP response.

use axum::{
    body::{to_bytes, Body},
    extract::{Request, State},
    http::{HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use http_body_util::LengthLimitError;
use tracing::{debug, warn};

use crate::error::{ConnectorError, Result};
use crate::protocol::http::{is_forwardable_header, HttpRequestEnvelope, HttpResponseEnvelope};
use crate::protocol::{Message, MessageType, KIND_HTTP_REQUEST, KIND_HTTP_RESPONSE, PAYLOAD_KIND};
use crate::state::AppState;

pub async fn forward(State(state): State<AppState>, request: Request) -> Response {
    let path = request.uri().path().to_string();
    let not_connected_url = state.config.connector.device_not_connected_url.clone();

    match tunnel(&state, request).await {
        Ok(response) => response,
        Err(e) => {
            if !matches!(e, ConnectorError::OpenChannelNotFound(_) | ConnectorError::Unauthorized) {
                warn!(path = %path, "Tunneled request failed: {e}");
            }
            super::error_response(&e, &path, &not_connected_url)
        }
    }
}

async fn tunnel(state: &AppState, request: Request) -> Result<Response> {
    let identifier = state.authorizer.resolve_caller(request.headers()).await?;

    let (parts, body) = request.into_parts();
    let body = read_body(body, state.config.connector.max_frame_size).await?;

    let envelope = HttpRequestEnvelope {
        method: parts.method.to_string(),
        uri: parts
            .uri
            .path_and_query()
            .map_or_else(|| parts.uri.path().to_string(), ToString::to_string),
        headers: parts
            .headers
            .iter()
            // The channel token authorizes the tunnel hop only.
            .filter(|(name, _)| is_forwardable_header(name.as_str()) && *name != "authorization")
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.to_string(), v.to_string()))
            })
            .collect(),
        body,
    };
    debug!(
        identity = %identifier.identity_uid,
        method = %envelope.method,
        uri = %envelope.uri,
        "Tunneling request"
    );

    let message = Message::request(MessageType::Raw, envelope.to_payload()?)
        .with_property(PAYLOAD_KIND, KIND_HTTP_REQUEST);
    let reply = state
        .connector
        .invoke_with_cancellation(
            &identifier,
            message,
            state.config.connector.invoke_timeout(),
            &state.shutdown.child_token(),
        )
        .await?;

    if let Some(rejection) = super::controller_rejection(&reply) {
        return Err(rejection);
    }
    if reply.property(PAYLOAD_KIND) != Some(KIND_HTTP_RESPONSE) {
        return Err(ConnectorError::Envelope(format!(
            "expected {KIND_HTTP_RESPONSE} reply, got {:?}",
            reply.property(PAYLOAD_KIND)
        )));
    }
    into_http_response(HttpResponseEnvelope::from_payload(reply.payload())?)
}

async fn read_body(body: Body, limit: usize) -> Result<Bytes> {
    to_bytes(body, limit).await.map_err(|e| {
        if exceeds_limit(&e) {
            ConnectorError::PayloadTooLarge(limit)
        } else {
            ConnectorError::Transport(format!("reading request body: {e}"))
        }
    })
}

fn exceeds_limit(err: &axum::Error) -> bool {
    let mut source: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(e) = source {
        if e.is::<LengthLimitError>() {
            return true;
        }
        source = e.source();
    }
    false
}

fn into_http_response(envelope: HttpResponseEnvelope) -> Result<Response> {
    let status = StatusCode::from_u16(envelope.status)
        .map_err(|_| ConnectorError::Envelope(format!("invalid status {}", envelope.status)))?;
    let mut response = (status, Body::from(envelope.body)).into_response();
    let headers = response.headers_mut();
    for (name, value) in &envelope.headers {
        if !is_forwardable_header(name) {
            continue;
        }
        let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) else {
            debug!(header = %name, "Dropping invalid response header");
            continue;
        };
        headers.append(name, value);
    }
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn oversized_body_is_payload_too_large() {
        let err = read_body(Body::from(vec![0u8; 64]), 16).await.unwrap_err();
        assert_eq!(err, ConnectorError::PayloadTooLarge(16));

        let body = read_body(Body::from(vec![0u8; 16]), 16).await.unwrap();
        assert_eq!(body.len(), 16);
    }

    #[test]
    fn response_envelope_becomes_http_response() {
        let envelope = HttpResponseEnvelope {
            status: 201,
            headers: vec![
                ("content-type".into(), "application/json".into()),
                ("x-multi".into(), "a".into()),
                ("x-multi".into(), "b".into()),
                ("connection".into(), "close".into()),
                ("bad header".into(), "x".into()),
            ],
            body: Bytes::from_static(b"{}"),
        };
        let response = into_http_response(envelope).unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(response.headers()["content-type"], "application/json");
        assert_eq!(response.headers().get_all("x-multi").iter().count(), 2);
        assert!(response.headers().get("connection").is_none());
    }

    #[test]
    fn invalid_status_is_an_envelope_error() {
        let envelope = HttpResponseEnvelope {
            status: 1000,
            headers: Vec::new(),
            body: Bytes::new(),
        };
        assert!(matches!(
            into_http_response(envelope),
            Err(ConnectorError::Envelope(_))
        ));
    }
}
