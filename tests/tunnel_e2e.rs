//! End-to-end: real router on a loopback port, a controller dialing
//! `/Connector` with tokio-tungstenite, and HTTP callers going through the tunnel.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use http_body_util::{BodyExt, Full};
use hyper::{HeaderMap, StatusCode};
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::TokioExecutor;
use serde_json::Value;
use tokio_tungstenite::tungstenite::{self, client::IntoClientRequest, http::HeaderValue};

use homelink::config::Config;
use homelink::protocol::codec::{self, DEFAULT_MAX_FRAME_SIZE};
use homelink::protocol::http::{HttpRequestEnvelope, HttpResponseEnvelope};
use homelink::protocol::{KIND_HTTP_REQUEST, KIND_HTTP_RESPONSE, KIND_JSON, PAYLOAD_KIND};
use homelink::repository::{StaticChannel, StaticIdentityRepository};
use homelink::{routes, AppState, Message, MessageType, SessionIdentifier};

const TOKEN: &str = "channel-token";
const ADMIN: &str = "admin-key";

async fn start_server() -> (SocketAddr, AppState) {
    let mut config = Config::default();
    config.auth.admin_key = Some(ADMIN.into());
    config.connector.keep_alive_interval_secs = 0;
    let repository = Arc::new(StaticIdentityRepository::new(&[StaticChannel {
        identity_uid: "dev-1".into(),
        channel_uid: "default".into(),
        access_token: TOKEN.into(),
        valid_until: None,
    }]));
    let state = AppState::new(config, repository);
    let app = routes::router(state.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, state)
}

/// Answer one cloud request the way a home controller would.
fn controller_reply(request: &Message) -> Option<Message> {
    match (request.message_type(), request.property(PAYLOAD_KIND)) {
        (MessageType::Ping, _) => Some(Message::response_to(request, Bytes::new())),
        (MessageType::Raw, Some(KIND_HTTP_REQUEST)) => {
            let envelope = HttpRequestEnvelope::from_payload(request.payload()).unwrap();
            let response = match envelope.uri.as_str() {
                "/status" => HttpResponseEnvelope {
                    status: 200,
                    headers: vec![("content-type".into(), "text/plain".into())],
                    body: Bytes::from_static(b"200 OK"),
                },
                "/echo-auth" => HttpResponseEnvelope {
                    status: 200,
                    headers: Vec::new(),
                    body: Bytes::from(
                        envelope
                            .headers
                            .iter()
                            .any(|(k, _)| k.eq_ignore_ascii_case("authorization"))
                            .to_string(),
                    ),
                },
                _ => HttpResponseEnvelope::error(404, "no such page"),
            };
            Some(
                Message::response_to(request, response.to_payload().unwrap())
                    .with_property(PAYLOAD_KIND, KIND_HTTP_RESPONSE),
            )
        }
        (MessageType::Raw, Some(KIND_JSON)) => Some(
            Message::response_to(request, request.payload().clone())
                .with_property(PAYLOAD_KIND, KIND_JSON),
        ),
        _ => None,
    }
}

/// Dial `/Connector` and serve requests until `stop` fires.
async fn run_controller(addr: SocketAddr, stop: tokio::sync::oneshot::Receiver<()>) {
    let mut request = format!("ws://{addr}/Connector").into_client_request().unwrap();
    request.headers_mut().insert(
        "authorization",
        HeaderValue::from_str(&format!("Bearer {TOKEN}")).unwrap(),
    );
    let (mut socket, _) = tokio_tungstenite::connect_async(request).await.unwrap();
    let mut stop = stop;
    loop {
        tokio::select! {
            _ = &mut stop => {
                let _ = socket.close(None).await;
                return;
            }
            frame = socket.next() => {
                let Some(Ok(tungstenite::Message::Binary(frame))) = frame else { return };
                let request = codec::decode(&frame, DEFAULT_MAX_FRAME_SIZE).unwrap();
                if let Some(reply) = controller_reply(&request) {
                    let frame = codec::encode(&reply, DEFAULT_MAX_FRAME_SIZE).unwrap();
                    socket.send(tungstenite::Message::Binary(frame)).await.unwrap();
                }
            }
        }
    }
}

async fn wait_for(state: &AppState, connected: bool) {
    let id = SessionIdentifier::for_identity("dev-1");
    tokio::time::timeout(Duration::from_secs(5), async {
        while state.connector.is_connected(&id).await != connected {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
}

async fn http(
    addr: SocketAddr,
    method: &str,
    path: &str,
    token: Option<&str>,
    body: &'static [u8],
) -> (StatusCode, HeaderMap, Bytes) {
    let client: Client<HttpConnector, Full<Bytes>> =
        Client::builder(TokioExecutor::new()).build_http();
    let mut builder = hyper::Request::builder()
        .method(method)
        .uri(format!("http://{addr}{path}"));
    if let Some(token) = token {
        builder = builder.header("authorization", format!("Bearer {token}"));
    }
    let response = client
        .request(builder.body(Full::new(Bytes::from_static(body))).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, headers, body)
}

fn json(body: &Bytes) -> Value {
    serde_json::from_slice(body).unwrap()
}

#[tokio::test]
async fn requests_tunnel_through_connected_controller() {
    let (addr, state) = start_server().await;
    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel();
    let controller = tokio::spawn(run_controller(addr, stop_rx));
    wait_for(&state, true).await;

    let (status, headers, body) = http(addr, "GET", "/status", Some(TOKEN), b"").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers["content-type"], "text/plain");
    assert_eq!(body.as_ref(), b"200 OK");

    // The channel token stays on the cloud side.
    let (_, _, body) = http(addr, "GET", "/echo-auth", Some(TOKEN), b"").await;
    assert_eq!(body.as_ref(), b"false");

    let (status, _, body) = http(addr, "POST", "/api/v1/cloud/ping", Some(TOKEN), b"").await;
    assert_eq!(status, StatusCode::OK);
    let ping = json(&body);
    assert_eq!(ping["identity_uid"], "dev-1");
    assert!(ping["latency_ms"].is_u64());

    let (status, headers, body) =
        http(addr, "POST", "/api/v1/cloud/invoke", Some(TOKEN), br#"{"cmd":"lights","on":true}"#).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers["content-type"], "application/json");
    assert_eq!(json(&body)["cmd"], "lights");

    let (status, _, body) = http(addr, "GET", "/api/v1/cloud/statistics", Some(ADMIN), b"").await;
    assert_eq!(status, StatusCode::OK);
    let stats = json(&body);
    assert_eq!(stats["open_sessions"], 1);
    assert_eq!(stats["channels"][0]["identity_uid"], "dev-1");
    assert_eq!(stats["channels"][0]["messages_sent"], 4);

    let (status, _, body) = http(addr, "GET", "/api/v1/cloud/sessions", Some(ADMIN), b"").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json(&body)["sessions"].as_array().unwrap().len(), 1);

    stop_tx.send(()).unwrap();
    controller.await.unwrap();
    wait_for(&state, false).await;

    let (status, _, body) = http(addr, "GET", "/api/v1/components", Some(TOKEN), b"").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json(&body)["code"], "DEVICE_NOT_CONNECTED");

    let (status, headers, _) = http(addr, "GET", "/ui/lights", Some(TOKEN), b"").await;
    assert_eq!(status, StatusCode::FOUND);
    assert_eq!(
        headers["location"],
        "/Cloud/Channel/DeviceNotConnected?returnUrl=%2Fui%2Flights"
    );

    // Statistics outlive the session.
    let (status, _, body) =
        http(addr, "GET", "/api/v1/cloud/statistics/dev-1/default", Some(ADMIN), b"").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json(&body)["connected"], false);
    assert_eq!(json(&body)["statistics"]["messages_sent"], 4);
}

#[tokio::test]
async fn unauthorized_callers_are_rejected() {
    let (addr, _state) = start_server().await;

    let (status, _, _) = http(addr, "GET", "/status", None, b"").await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    let (status, _, _) = http(addr, "GET", "/status", Some("wrong"), b"").await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _, _) = http(addr, "GET", "/api/v1/cloud/statistics", None, b"").await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    let (status, _, _) = http(addr, "GET", "/api/v1/cloud/statistics", Some(TOKEN), b"").await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    // Plain GET without an upgrade.
    let (status, _, _) = http(addr, "GET", "/Connector", Some(TOKEN), b"").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let mut request = format!("ws://{addr}/Connector").into_client_request().unwrap();
    request
        .headers_mut()
        .insert("authorization", HeaderValue::from_static("Bearer wrong"));
    match tokio_tungstenite::connect_async(request).await {
        Err(tungstenite::Error::Http(response)) => {
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        }
        Err(e) => panic!("expected 401 handshake failure, got {e}"),
        Ok(_) => panic!("handshake with a wrong token succeeded"),
    }
}

#[tokio::test]
async fn statistics_reset_and_delete() {
    let (addr, state) = start_server().await;
    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel();
    let controller = tokio::spawn(run_controller(addr, stop_rx));
    wait_for(&state, true).await;
    http(addr, "GET", "/status", Some(TOKEN), b"").await;

    let (status, _, body) = http(
        addr,
        "POST",
        "/api/v1/cloud/statistics/dev-1/default/reset",
        Some(ADMIN),
        b"",
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json(&body)["reset"], true);
    let (_, _, body) =
        http(addr, "GET", "/api/v1/cloud/statistics/dev-1/default", Some(ADMIN), b"").await;
    assert_eq!(json(&body)["statistics"]["messages_sent"], 0);

    stop_tx.send(()).unwrap();
    controller.await.unwrap();
    wait_for(&state, false).await;

    let (status, _, _) =
        http(addr, "DELETE", "/api/v1/cloud/statistics/dev-1/default", Some(ADMIN), b"").await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _, _) =
        http(addr, "GET", "/api/v1/cloud/statistics/dev-1/default", Some(ADMIN), b"").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
