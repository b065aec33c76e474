use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpStream, UnixStream};
use tokio_rustls::server::TlsStream;

/// An accepted transport connection; implements `AsyncRead + AsyncWrite`.
///
/// This is the fundamental I/O type handed to the gateway: plain TCP, a TLS
/// session over TCP, or a Unix domain socket stream.
pub struct TransportStream {
    inner: TransportStreamInner,
}

enum TransportStreamInner {
    Tcp(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
    Unix(UnixStream),
}

impl TransportStream {
    pub fn from_tcp(stream: TcpStream) -> Self {
        Self {
            inner: TransportStreamInner::Tcp(stream),
        }
    }

    pub fn from_unix(stream: UnixStream) -> Self {
        Self {
            inner: TransportStreamInner::Unix(stream),
        }
    }

    pub(crate) fn from_tls(stream: TlsStream<TcpStream>) -> Self {
        Self {
            inner: TransportStreamInner::Tls(Box::new(stream)),
        }
    }

    /// Take the plain TCP stream back out, if this is one.
    pub(crate) fn into_tcp(self) -> std::result::Result<TcpStream, Self> {
        match self.inner {
            TransportStreamInner::Tcp(stream) => Ok(stream),
            inner => Err(Self { inner }),
        }
    }

    /// Transport name for diagnostics.
    pub fn transport_name(&self) -> &'static str {
        match &self.inner {
            TransportStreamInner::Tcp(_) => "tcp",
            TransportStreamInner::Tls(_) => "tls",
            TransportStreamInner::Unix(_) => "unix",
        }
    }
}

impl AsyncRead for TransportStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match &mut self.get_mut().inner {
            TransportStreamInner::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
            TransportStreamInner::Tls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
            TransportStreamInner::Unix(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for TransportStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match &mut self.get_mut().inner {
            TransportStreamInner::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
            TransportStreamInner::Tls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
            TransportStreamInner::Unix(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut self.get_mut().inner {
            TransportStreamInner::Tcp(stream) => Pin::new(stream).poll_flush(cx),
            TransportStreamInner::Tls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
            TransportStreamInner::Unix(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut self.get_mut().inner {
            TransportStreamInner::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
            TransportStreamInner::Tls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
            TransportStreamInner::Unix(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

impl std::fmt::Debug for TransportStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportStream")
            .field("type", &self.transport_name())
            .finish()
    }
}
