//! WebSocket sessions over accepted transport streams.

use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use flowpipe_transport::TransportStream;
use tokio_tungstenite::tungstenite::error::ProtocolError;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;
use tracing::debug;

type Socket = WebSocketStream<TransportStream>;

/// Upgrade an accepted stream, requiring the request path to equal `path`.
///
/// A mismatched path is answered with `404 Not Found` and never admitted.
pub async fn accept_websocket(
    stream: TransportStream,
    path: &str,
    remote: &str,
) -> std::io::Result<(WsReader, WsWriter)> {
    let expected = path.to_string();
    let check_path = move |request: &Request, response: Response| {
        if request.uri().path() == expected {
            return Ok(response);
        }
        let mut rejection = ErrorResponse::new(Some(format!(
            "no WebSocket endpoint at {}",
            request.uri().path()
        )));
        *rejection.status_mut() = StatusCode::NOT_FOUND;
        Err(rejection)
    };

    let socket = tokio_tungstenite::accept_hdr_async(stream, check_path)
        .await
        .map_err(std::io::Error::other)?;
    debug!(%remote, "WebSocket upgrade complete");

    let (sink, stream) = socket.split();
    Ok((WsReader { stream }, WsWriter { sink }))
}

pub struct WsReader {
    stream: SplitStream<Socket>,
}

impl WsReader {
    /// Next text or binary payload. `None` once the peer closes.
    ///
    /// Control messages are consumed here; tungstenite answers pings itself.
    pub async fn next_message(&mut self) -> std::io::Result<Option<Bytes>> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Binary(body))) => return Ok(Some(body)),
                Some(Ok(Message::Text(text))) => {
                    return Ok(Some(Bytes::copy_from_slice(text.as_str().as_bytes())))
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => continue,
                Some(Ok(Message::Close(_))) | None => return Ok(None),
                Some(Err(
                    WsError::ConnectionClosed
                    | WsError::AlreadyClosed
                    | WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake),
                )) => return Ok(None),
                Some(Err(err)) => return Err(std::io::Error::other(err)),
            }
        }
    }
}

pub struct WsWriter {
    sink: SplitSink<Socket, Message>,
}

impl WsWriter {
    pub async fn send(&mut self, body: Bytes) -> std::io::Result<()> {
        self.sink
            .send(Message::Binary(body))
            .await
            .map_err(std::io::Error::other)
    }

    /// Send a close frame and flush.
    pub async fn close(&mut self) -> std::io::Result<()> {
        match self.sink.close().await {
            Ok(()) | Err(WsError::ConnectionClosed | WsError::AlreadyClosed) => Ok(()),
            Err(err) => Err(std::io::Error::other(err)),
        }
    }
}
