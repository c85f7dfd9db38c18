//! WebSocket adapters: turn a socket into the `Sink<Bytes>` / `Stream<Bytes>`
//! pair a [`ChannelSession`](super::session::ChannelSession) runs over.
//!
//! Frames travel as binary WebSocket messages. Text messages are passed
//! through as bytes (they will fail to decode and be counted as malformed),
//! control frames are handled by the WebSocket layer, and a Close frame ends
//! the stream.

use bytes::Bytes;
use futures::{future, Sink, SinkExt, Stream, StreamExt};

/// Server side: an upgraded axum WebSocket.
pub fn split_axum(
    socket: axum::extract::ws::WebSocket,
) -> (
    impl Sink<Bytes, Error = axum::Error> + Send,
    impl Stream<Item = Result<Bytes, axum::Error>> + Send,
) {
    use axum::extract::ws::Message;

    let (sink, stream) = socket.split();
    let sink = sink.with(|frame: Bytes| future::ready(Ok::<_, axum::Error>(Message::Binary(frame))));
    let stream = stream
        .take_while(|msg| future::ready(!matches!(msg, Ok(Message::Close(_)))))
        .filter_map(|msg| {
            future::ready(match msg {
                Ok(Message::Binary(data)) => Some(Ok(data)),
                Ok(Message::Text(text)) => Some(Ok(Bytes::copy_from_slice(text.as_str().as_bytes()))),
                Ok(_) => None,
                Err(e) => Some(Err(e)),
            })
        });
    (sink, stream)
}

/// Client side: a tungstenite WebSocket dialed by the controller.
pub fn split_tungstenite<S>(
    socket: tokio_tungstenite::WebSocketStream<S>,
) -> (
    impl Sink<Bytes, Error = tokio_tungstenite::tungstenite::Error> + Send,
    impl Stream<Item = Result<Bytes, tokio_tungstenite::tungstenite::Error>> + Send,
)
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send,
{
    use tokio_tungstenite::tungstenite::{Error, Message};

    let (sink, stream) = socket.split();
    let sink = sink.with(|frame: Bytes| future::ready(Ok::<_, Error>(Message::Binary(frame))));
    let stream = stream
        .take_while(|msg| future::ready(!matches!(msg, Ok(Message::Close(_)))))
        .filter_map(|msg| {
            future::ready(match msg {
                Ok(Message::Binary(data)) => Some(Ok(data)),
                Ok(Message::Text(text)) => Some(Ok(Bytes::copy_from_slice(text.as_str().as_bytes()))),
                Ok(_) => None,
                Err(Error::ConnectionClosed | Error::AlreadyClosed) => None,
                Err(e) => Some(Err(e)),
            })
        });
    (sink, stream)
}
