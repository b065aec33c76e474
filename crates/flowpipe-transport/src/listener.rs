use std::net::SocketAddr;

use tokio::net::TcpListener;
use tracing::{debug, info};

use crate::endpoint::{Address, Endpoint};
use crate::error::{Result, TransportError};
use crate::stream::TransportStream;
use crate::uds::UnixSocketListener;

/// A bound listen endpoint handing out raw transport streams.
///
/// Protocol handshakes (TLS, WebSocket upgrade) are left to the caller so
/// they can run off the accept path.
pub struct Listener {
    inner: ListenerInner,
    endpoint: Endpoint,
}

enum ListenerInner {
    Tcp(TcpListener),
    Unix(UnixSocketListener),
}

impl Listener {
    /// Bind the endpoint's address.
    pub async fn bind(endpoint: &Endpoint) -> Result<Self> {
        let inner = match &endpoint.address {
            Address::Inet(authority) => {
                let listener =
                    TcpListener::bind(authority)
                        .await
                        .map_err(|source| TransportError::Bind {
                            address: authority.clone(),
                            source,
                        })?;
                info!(endpoint = %endpoint, local = ?listener.local_addr().ok(), "listening");
                ListenerInner::Tcp(listener)
            }
            Address::Path(path) => ListenerInner::Unix(UnixSocketListener::bind(path)?),
        };
        Ok(Self {
            inner,
            endpoint: endpoint.clone(),
        })
    }

    /// Accept the next raw connection and its remote address.
    pub async fn accept(&self) -> Result<(TransportStream, String)> {
        match &self.inner {
            ListenerInner::Tcp(listener) => {
                let (stream, addr) = listener.accept().await.map_err(TransportError::Accept)?;
                if let Err(err) = stream.set_nodelay(true) {
                    debug!(remote = %addr, error = %err, "failed to set TCP_NODELAY");
                }
                Ok((TransportStream::from_tcp(stream), addr.to_string()))
            }
            ListenerInner::Unix(listener) => listener.accept().await,
        }
    }

    /// Bound socket address for TCP endpoints (useful with port 0).
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match &self.inner {
            ListenerInner::Tcp(listener) => listener.local_addr().ok(),
            ListenerInner::Unix(_) => None,
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    #[tokio::test]
    async fn tcp_accept_reports_remote_address() {
        let endpoint = Endpoint::parse("tcp://127.0.0.1:0").unwrap();
        let listener = Listener::bind(&endpoint).await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = tokio::spawn(async move {
            let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
            stream.write_all(b"hi").await.unwrap();
            stream.local_addr().unwrap()
        });

        let (mut stream, remote) = listener.accept().await.unwrap();
        let client_addr = client.await.unwrap();
        assert_eq!(remote, client_addr.to_string());
        assert_eq!(stream.transport_name(), "tcp");

        let mut buf = [0u8; 2];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");
    }

    #[tokio::test]
    async fn bind_failure_is_reported() {
        let endpoint = Endpoint::parse("tcp://127.0.0.1:0").unwrap();
        let first = Listener::bind(&endpoint).await.unwrap();
        let taken = format!("tcp://{}", first.local_addr().unwrap());

        let err = Listener::bind(&Endpoint::parse(&taken).unwrap())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, TransportError::Bind { .. }));
    }
}
