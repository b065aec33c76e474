//! Per-connection sessions: the protocol handshake and the split
//! reader/writer pair the gateway tasks drive.

use bytes::Bytes;
use flowpipe_transport::{accept_tls, Endpoint, Scheme, TlsAcceptor, TlsSettings, TransportStream};
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tracing::warn;

use crate::error::{GatewayError, Result};
use crate::lifecycle::{TCP_PACKET, TLS_PACKET, UNIX_PACKET, WS_PACKET};
use crate::websocket::{accept_websocket, WsReader, WsWriter};

/// How accepted streams become sessions.
#[derive(Clone)]
pub enum Protocol {
    Tcp,
    Tls(TlsAcceptor),
    Unix,
    WebSocket {
        tls: Option<TlsAcceptor>,
        path: String,
    },
}

impl std::fmt::Debug for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tcp => f.write_str("Tcp"),
            Self::Tls(_) => f.write_str("Tls"),
            Self::Unix => f.write_str("Unix"),
            Self::WebSocket { tls, path } => f
                .debug_struct("WebSocket")
                .field("tls", &tls.is_some())
                .field("path", path)
                .finish(),
        }
    }
}

impl Protocol {
    /// Pick the protocol for an endpoint, loading TLS material if needed.
    pub fn for_endpoint(endpoint: &Endpoint, tls: Option<&TlsSettings>) -> Result<Self> {
        let acceptor = |scheme: Scheme| -> Result<TlsAcceptor> {
            let settings = tls.ok_or_else(|| {
                GatewayError::Config(format!(
                    "{}:// endpoint requires a certificate and key",
                    scheme.as_str()
                ))
            })?;
            Ok(settings.acceptor()?)
        };

        if tls.is_some() && !endpoint.scheme.is_tls() {
            warn!(endpoint = %endpoint, "TLS material ignored for non-TLS endpoint");
        }

        Ok(match endpoint.scheme {
            Scheme::Tcp => Self::Tcp,
            Scheme::Unix => Self::Unix,
            Scheme::Tls => Self::Tls(acceptor(Scheme::Tls)?),
            Scheme::Ws => Self::WebSocket {
                tls: None,
                path: endpoint.path.clone().unwrap_or_else(|| "/".to_string()),
            },
            Scheme::Wss => Self::WebSocket {
                tls: Some(acceptor(Scheme::Wss)?),
                path: endpoint.path.clone().unwrap_or_else(|| "/".to_string()),
            },
        })
    }

    /// Body type for payload frames read from this protocol's connections.
    pub fn body_type(&self) -> &'static str {
        match self {
            Self::Tcp => TCP_PACKET,
            Self::Tls(_) => TLS_PACKET,
            Self::Unix => UNIX_PACKET,
            Self::WebSocket { .. } => WS_PACKET,
        }
    }

    /// Whether [`establish`](Self::establish) talks to the peer before the
    /// session is usable.
    pub fn has_handshake(&self) -> bool {
        !matches!(self, Self::Tcp | Self::Unix)
    }

    /// Complete the protocol handshake on an accepted stream.
    pub async fn establish(
        &self,
        stream: TransportStream,
        remote: &str,
        read_buffer: usize,
    ) -> Result<(SessionReader, SessionWriter)> {
        match self {
            Self::Tcp | Self::Unix => Ok(split_raw(stream, read_buffer)),
            Self::Tls(acceptor) => {
                let stream = accept_tls(acceptor, stream, remote).await?;
                Ok(split_raw(stream, read_buffer))
            }
            Self::WebSocket { tls, path } => {
                let stream = match tls {
                    Some(acceptor) => accept_tls(acceptor, stream, remote).await?,
                    None => stream,
                };
                let (reader, writer) = accept_websocket(stream, path, remote).await?;
                Ok((
                    SessionReader::WebSocket(reader),
                    SessionWriter::WebSocket(writer),
                ))
            }
        }
    }
}

fn split_raw(stream: TransportStream, read_buffer: usize) -> (SessionReader, SessionWriter) {
    let (read, write) = tokio::io::split(stream);
    (
        SessionReader::Stream {
            half: read,
            buf: vec![0u8; read_buffer.max(1)],
        },
        SessionWriter::Stream(write),
    )
}

/// Receiving side of a session.
pub enum SessionReader {
    /// Raw byte stream: each successful read becomes one payload.
    Stream {
        half: ReadHalf<TransportStream>,
        buf: Vec<u8>,
    },
    /// Each text or binary message becomes one payload.
    WebSocket(WsReader),
}

impl SessionReader {
    /// Next payload, or `None` at end of stream.
    pub async fn next_message(&mut self) -> std::io::Result<Option<Bytes>> {
        match self {
            Self::Stream { half, buf } => match half.read(buf).await? {
                0 => Ok(None),
                n => Ok(Some(Bytes::copy_from_slice(&buf[..n]))),
            },
            Self::WebSocket(reader) => reader.next_message().await,
        }
    }
}

/// Sending side of a session.
pub enum SessionWriter {
    Stream(WriteHalf<TransportStream>),
    WebSocket(WsWriter),
}

impl SessionWriter {
    pub async fn send(&mut self, body: Bytes) -> std::io::Result<()> {
        match self {
            Self::Stream(half) => {
                half.write_all(&body).await?;
                half.flush().await
            }
            Self::WebSocket(writer) => writer.send(body).await,
        }
    }

    pub async fn close(&mut self) -> std::io::Result<()> {
        match self {
            Self::Stream(half) => half.shutdown().await,
            Self::WebSocket(writer) => writer.close().await,
        }
    }
}
