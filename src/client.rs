//! Controller-side tunnel client: the other end of `/Connector`.
//!
//! Run by `homelink connect` on the home network. Maintains a persistent
//! WebSocket to the cloud with exponential-backoff reconnect and serves
//! whatever the cloud sends through it:
//!
//! - `Ping` is answered with an empty `Ping` reply
//! - `Raw` + `payload-kind: http-request` is forwarded to `forward_to` and the
//!   local response returned as an `http-response` envelope
//! - `Raw` + `payload-kind: json` is POSTed to `forward_to` + `json_path` and the
//!   response body returned verbatim
//! - any other request is answered with a `payload-kind: error` reply

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::TokioExecutor;
use serde_json::json;
use tokio_tungstenite::tungstenite::{
    client::IntoClientRequest,
    http::{header::AUTHORIZATION, HeaderValue},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::config::ClientConfig;
use crate::connector::session::{ChannelSession, CloseReason, SessionOptions, UnsolicitedMessageHandler};
use crate::connector::statistics::ChannelStatistics;
use crate::connector::transport::split_tungstenite;
use crate::connector::SessionIdentifier;
use crate::error::{ConnectorError, Result};
use crate::protocol::http::{is_forwardable_header, HttpRequestEnvelope, HttpResponseEnvelope};
use crate::protocol::{
    Message, MessageType, KIND_ERROR, KIND_HTTP_REQUEST, KIND_HTTP_RESPONSE, KIND_JSON,
    PAYLOAD_KIND,
};

/// Local label for the client's single session.
const CLOUD_IDENTITY: &str = "cloud";

/// Spawn the client loop. Runs until `shutdown` fires.
pub fn spawn(
    config: ClientConfig,
    options: SessionOptions,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(run(config, options, shutdown))
}

/// Main loop: connect, serve the session, reconnect on failure.
pub async fn run(config: ClientConfig, options: SessionOptions, shutdown: CancellationToken) {
    let initial_delay = Duration::from_secs(config.reconnect_delay_secs);
    let max_delay = Duration::from_secs(config.reconnect_max_delay_secs);
    let mut delay = initial_delay;
    let forwarder = Arc::new(LocalForwarder::new(&config));
    let statistics = Arc::new(ChannelStatistics::new());

    loop {
        info!("Tunnel: connecting to {}", config.url);
        let attempt = connect_and_serve(&config, &options, &forwarder, &statistics, &shutdown)
            .instrument(info_span!("tunnel_client", url = %config.url));
        match attempt.await {
            Ok(CloseReason::Shutdown) => return,
            Ok(reason) => {
                info!("Tunnel: session ended ({reason}), reconnecting...");
                delay = initial_delay;
            }
            Err(ConnectorError::Unauthorized) => {
                warn!(
                    "Tunnel: access token rejected, retrying in {}s",
                    delay.as_secs()
                );
            }
            Err(e) => {
                warn!(
                    "Tunnel: connection error: {e}, reconnecting in {}s",
                    delay.as_secs()
                );
            }
        }

        tokio::select! {
            () = shutdown.cancelled() => return,
            () = tokio::time::sleep(delay) => {}
        }
        delay = (delay * 2).min(max_delay);
    }
}

/// One connection attempt: dial, then run the session until it ends.
async fn connect_and_serve(
    config: &ClientConfig,
    options: &SessionOptions,
    forwarder: &Arc<LocalForwarder>,
    statistics: &Arc<ChannelStatistics>,
    shutdown: &CancellationToken,
) -> Result<CloseReason> {
    let mut request = config
        .url
        .as_str()
        .into_client_request()
        .map_err(|e| ConnectorError::Transport(format!("invalid url: {e}")))?;
    let bearer = HeaderValue::from_str(&format!("Bearer {}", config.access_token))
        .map_err(|_| ConnectorError::Unauthorized)?;
    request.headers_mut().insert(AUTHORIZATION, bearer);

    let connect_timeout = Duration::from_secs(config.connect_timeout_secs);
    let handshake = tokio_tungstenite::connect_async(request);
    let (socket, _response) = tokio::time::timeout(connect_timeout, handshake)
        .await
        .map_err(|_| {
            ConnectorError::Transport(format!(
                "no handshake response within {}s",
                connect_timeout.as_secs()
            ))
        })?
        .map_err(|e| match e {
            tokio_tungstenite::tungstenite::Error::Http(response)
                if response.status().as_u16() == 401 =>
            {
                ConnectorError::Unauthorized
            }
            e => ConnectorError::Transport(e.to_string()),
        })?;
    info!("Tunnel: connected");

    let (sink, stream) = split_tungstenite(socket);
    let session = ChannelSession::start(
        SessionIdentifier::for_identity(CLOUD_IDENTITY),
        sink,
        statistics.clone(),
        options.clone(),
        forwarder.clone(),
    );

    let reason = tokio::select! {
        reason = session.run(stream) => reason,
        () = shutdown.cancelled() => {
            session.close(CloseReason::Shutdown);
            CloseReason::Shutdown
        }
    };
    Ok(reason)
}

/// Serves cloud requests against the local network.
#[derive(Clone)]
pub struct LocalForwarder {
    client: Client<HttpConnector, Full<Bytes>>,
    forward_to: String,
    json_path: String,
    request_timeout: Duration,
}

impl LocalForwarder {
    pub fn new(config: &ClientConfig) -> Self {
        Self {
            client: Client::builder(TokioExecutor::new()).build_http(),
            forward_to: config.forward_to.trim_end_matches('/').to_string(),
            json_path: config.json_path.clone(),
            request_timeout: Duration::from_secs(config.request_timeout_secs),
        }
    }

    /// Produce the reply for one cloud request. Only notifications go
    /// unanswered.
    pub async fn handle(&self, message: Message) -> Option<Message> {
        if message.is_notification() {
            debug!(message_type = %message.message_type(), "Ignoring notification");
            return None;
        }
        match (message.message_type(), message.property(PAYLOAD_KIND)) {
            (MessageType::Ping, _) => Some(Message::response_to(&message, Bytes::new())),
            (MessageType::Raw, Some(KIND_HTTP_REQUEST)) => {
                let envelope = match HttpRequestEnvelope::from_payload(message.payload()) {
                    Ok(envelope) => self.forward_http(envelope).await,
                    Err(e) => HttpResponseEnvelope::error(400, &e.to_string()),
                };
                match envelope.to_payload() {
                    Ok(payload) => Some(
                        Message::response_to(&message, payload)
                            .with_property(PAYLOAD_KIND, KIND_HTTP_RESPONSE),
                    ),
                    Err(e) => Some(error_reply(&message, &e.to_string())),
                }
            }
            (MessageType::Raw, Some(KIND_JSON)) => {
                let body = self.forward_json(message.payload().clone()).await;
                Some(Message::response_to(&message, body).with_property(PAYLOAD_KIND, KIND_JSON))
            }
            (message_type, kind) => {
                warn!(%message_type, ?kind, "Unsupported request from cloud");
                let reason = match kind {
                    Some(kind) => format!("unsupported {message_type} request ({kind})"),
                    None => format!("unsupported {message_type} request"),
                };
                Some(error_reply(&message, &reason))
            }
        }
    }

    async fn forward_http(&self, envelope: HttpRequestEnvelope) -> HttpResponseEnvelope {
        let uri = format!("{}{}", self.forward_to, envelope.uri);
        let mut builder = hyper::Request::builder()
            .method(envelope.method.as_str())
            .uri(&uri);
        for (name, value) in &envelope.headers {
            if is_forwardable_header(name) {
                builder = builder.header(name.as_str(), value.as_str());
            }
        }
        let request = match builder.body(Full::new(envelope.body)) {
            Ok(request) => request,
            Err(e) => return HttpResponseEnvelope::error(400, &format!("invalid request: {e}")),
        };

        debug!(method = %envelope.method, uri = %uri, "Forwarding to local service");
        match self.send(request).await {
            Ok(response) => response,
            Err((status, message)) => {
                warn!(uri = %uri, "Local request failed: {message}");
                HttpResponseEnvelope::error(status, &message)
            }
        }
    }

    async fn forward_json(&self, body: Bytes) -> Bytes {
        let uri = format!("{}{}", self.forward_to, self.json_path);
        let request = hyper::Request::builder()
            .method("POST")
            .uri(&uri)
            .header("content-type", "application/json")
            .body(Full::new(body));
        let result = match request {
            Ok(request) => self.send(request).await,
            Err(e) => Err((400, format!("invalid request: {e}"))),
        };
        match result {
            Ok(response) => response.body,
            Err((status, message)) => {
                warn!(uri = %uri, "Local JSON invoke failed: {message}");
                Bytes::from(json!({"error": message, "status": status}).to_string())
            }
        }
    }

    async fn send(
        &self,
        request: hyper::Request<Full<Bytes>>,
    ) -> std::result::Result<HttpResponseEnvelope, (u16, String)> {
        let response = tokio::time::timeout(self.request_timeout, self.client.request(request))
            .await
            .map_err(|_| (504, "local service did not respond in time".to_string()))?
            .map_err(|e| (502, format!("local service unreachable: {e}")))?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter(|(name, _)| is_forwardable_header(name.as_str()))
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.to_string(), v.to_string()))
            })
            .collect();
        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| (502, format!("reading local response: {e}")))?
            .to_bytes();

        Ok(HttpResponseEnvelope {
            status,
            headers,
            body,
        })
    }
}

fn error_reply(request: &Message, reason: &str) -> Message {
    Message::response_to(request, Bytes::from(reason.to_string()))
        .with_property(PAYLOAD_KIND, KIND_ERROR)
}

impl UnsolicitedMessageHandler for LocalForwarder {
    fn on_message(&self, session: &Arc<ChannelSession>, message: Message) {
        let forwarder = self.clone();
        let session = session.clone();
        tokio::spawn(async move {
            let correlation_id = message.correlation_id().to_string();
            let Some(reply) = forwarder.handle(message).await else {
                return;
            };
            if let Err(e) = session.send(&reply).await {
                debug!(correlation_id = %correlation_id, "Could not send reply: {e}");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client_config(url: &str, forward_to: &str) -> ClientConfig {
        ClientConfig {
            url: url.into(),
            access_token: "tok".into(),
            forward_to: forward_to.into(),
            json_path: "/api/v1/cloud/invoke-local".into(),
            reconnect_delay_secs: 1,
            reconnect_max_delay_secs: 2,
            request_timeout_secs: 2,
            connect_timeout_secs: 1,
        }
    }

    fn forwarder(forward_to: &str) -> LocalForwarder {
        LocalForwarder::new(&client_config("ws://127.0.0.1:1/Connector", forward_to))
    }

    /// One-shot HTTP/1.1 server answering every request with `reply`.
    async fn local_service(reply: &'static str) -> String {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let mut buf = vec![0u8; 4096];
                let _ = stream.read(&mut buf).await;
                let response = format!(
                    "HTTP/1.1 200 OK\r\ncontent-type: text/plain\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{reply}",
                    reply.len()
                );
                let _ = stream.write_all(response.as_bytes()).await;
            }
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn silent_cloud_endpoint_times_out_the_handshake() {
        // Accepts TCP connections, never answers the upgrade.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });

        let config = client_config(&format!("ws://{addr}/Connector"), "http://127.0.0.1:1");
        let forwarder = Arc::new(LocalForwarder::new(&config));
        let options = SessionOptions::default();
        let statistics = Arc::new(ChannelStatistics::new());
        let cancel = CancellationToken::new();
        let attempt = connect_and_serve(&config, &options, &forwarder, &statistics, &cancel);
        let result = tokio::time::timeout(Duration::from_secs(10), attempt)
            .await
            .expect("handshake was not bounded");
        assert!(matches!(result, Err(ConnectorError::Transport(_))));
    }

    #[tokio::test]
    async fn ping_is_answered_with_same_correlation_id() {
        let request = Message::request(MessageType::Ping, Bytes::new());
        let reply = forwarder("http://127.0.0.1:1").handle(request.clone()).await.unwrap();
        assert_eq!(reply.message_type(), &MessageType::Ping);
        assert_eq!(reply.correlation_id(), request.correlation_id());
    }

    #[tokio::test]
    async fn notifications_get_no_reply() {
        let message = Message::notification(MessageType::Ping, Bytes::new());
        assert!(forwarder("http://127.0.0.1:1").handle(message).await.is_none());
    }

    #[tokio::test]
    async fn http_request_is_forwarded_to_local_service() {
        let base = local_service("200 OK").await;
        let envelope = HttpRequestEnvelope {
            method: "GET".into(),
            uri: "/status".into(),
            headers: vec![("accept".into(), "text/plain".into())],
            body: Bytes::new(),
        };
        let request = Message::request(MessageType::Raw, envelope.to_payload().unwrap())
            .with_property(PAYLOAD_KIND, KIND_HTTP_REQUEST);

        let reply = forwarder(&base).handle(request).await.unwrap();
        assert_eq!(reply.property(PAYLOAD_KIND), Some(KIND_HTTP_RESPONSE));
        let response = HttpResponseEnvelope::from_payload(reply.payload()).unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.body.as_ref(), b"200 OK");
        assert_eq!(response.header("content-type"), Some("text/plain"));
        assert!(response.header("connection").is_none());
    }

    #[tokio::test]
    async fn unreachable_local_service_is_bad_gateway() {
        // Bind then drop to get a port nothing listens on.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let envelope = HttpRequestEnvelope {
            method: "GET".into(),
            uri: "/".into(),
            headers: Vec::new(),
            body: Bytes::new(),
        };
        let request = Message::request(MessageType::Raw, envelope.to_payload().unwrap())
            .with_property(PAYLOAD_KIND, KIND_HTTP_REQUEST);
        let reply = forwarder(&format!("http://{addr}")).handle(request).await.unwrap();
        let response = HttpResponseEnvelope::from_payload(reply.payload()).unwrap();
        assert_eq!(response.status, 502);
    }

    #[tokio::test]
    async fn garbage_envelope_is_bad_request() {
        let request = Message::request(MessageType::Raw, Bytes::from_static(b"not json"))
            .with_property(PAYLOAD_KIND, KIND_HTTP_REQUEST);
        let reply = forwarder("http://127.0.0.1:1").handle(request).await.unwrap();
        let response = HttpResponseEnvelope::from_payload(reply.payload()).unwrap();
        assert_eq!(response.status, 400);
    }

    #[tokio::test]
    async fn unrecognised_requests_still_get_a_reply() {
        let forwarder = forwarder("http://127.0.0.1:1");

        let untagged = Message::request(MessageType::Raw, Bytes::from_static(b"GET /status"));
        let reply = forwarder.handle(untagged.clone()).await.unwrap();
        assert_eq!(reply.correlation_id(), untagged.correlation_id());
        assert_eq!(reply.property(PAYLOAD_KIND), Some(KIND_ERROR));
        assert_eq!(reply.payload().as_ref(), b"unsupported raw request");

        let custom = Message::request(MessageType::Other("lights".into()), Bytes::new());
        let reply = forwarder.handle(custom.clone()).await.unwrap();
        assert_eq!(reply.correlation_id(), custom.correlation_id());
        assert_eq!(reply.property(PAYLOAD_KIND), Some(KIND_ERROR));
    }

    #[tokio::test]
    async fn json_invoke_returns_local_body() {
        let base = local_service(r#"{"ok":true}"#).await;
        let request = Message::request(MessageType::Raw, Bytes::from_static(b"{\"cmd\":1}"))
            .with_property(PAYLOAD_KIND, KIND_JSON);
        let reply = forwarder(&base).handle(request).await.unwrap();
        assert_eq!(reply.property(PAYLOAD_KIND), Some(KIND_JSON));
        assert_eq!(reply.payload().as_ref(), br#"{"ok":true}"#);
    }
}
