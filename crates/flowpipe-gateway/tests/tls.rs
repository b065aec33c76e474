use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use flowpipe_frame::{port_close, FbpCodec, Frame};
use flowpipe_gateway::{ConfigLayer, Gateway};
use flowpipe_transport::Listener;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use tokio_rustls::rustls::{self, ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use tokio_tungstenite::client_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::codec::{FramedRead, FramedWrite};

const WAIT: Duration = Duration::from_secs(5);

fn fixture(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests/fixtures")
        .join(name)
}

fn certs(name: &str) -> Vec<CertificateDer<'static>> {
    let pem = std::fs::read(fixture(name)).unwrap();
    rustls_pemfile::certs(&mut pem.as_slice())
        .collect::<std::io::Result<_>>()
        .unwrap()
}

fn key(name: &str) -> PrivateKeyDer<'static> {
    let pem = std::fs::read(fixture(name)).unwrap();
    rustls_pemfile::private_key(&mut pem.as_slice()).unwrap().unwrap()
}

fn server_layer(client_ca: bool) -> ConfigLayer {
    ConfigLayer {
        tls_cert: Some(fixture("server.pem")),
        tls_key: Some(fixture("server.key")),
        tls_client_ca: client_ca.then(|| fixture("ca.pem")),
        ..ConfigLayer::endpoint("tls://127.0.0.1:0")
    }
}

/// A connector trusting the test CA, optionally presenting the client certificate.
fn connector(with_client_cert: bool) -> TlsConnector {
    let mut roots = RootCertStore::empty();
    for cert in certs("ca.pem") {
        roots.add(cert).unwrap();
    }
    let builder =
        ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_root_certificates(roots);
    let config = if with_client_cert {
        builder
            .with_client_auth_cert(certs("client.pem"), key("client.key"))
            .unwrap()
    } else {
        builder.with_no_client_auth()
    };
    TlsConnector::from(Arc::new(config))
}

struct Harness {
    addr: SocketAddr,
    to_gateway: FramedWrite<DuplexStream, FbpCodec>,
    from_gateway: FramedRead<DuplexStream, FbpCodec>,
    task: JoinHandle<flowpipe_gateway::Result<()>>,
}

impl Harness {
    async fn start(layer: ConfigLayer) -> Self {
        let config = layer.build().unwrap();
        let listener = Listener::bind(&config.endpoint).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let gateway = Gateway::new(config).unwrap();

        let (test_in, gateway_in) = tokio::io::duplex(64 * 1024);
        let (gateway_out, test_out) = tokio::io::duplex(64 * 1024);
        let task = tokio::spawn(async move { gateway.serve(listener, gateway_in, gateway_out).await });

        Self {
            addr,
            to_gateway: FramedWrite::new(test_in, FbpCodec::new()),
            from_gateway: FramedRead::new(test_out, FbpCodec::new()),
            task,
        }
    }

    async fn expect(&mut self, body_type: &str) -> Frame {
        let frame = tokio::time::timeout(WAIT, self.from_gateway.next())
            .await
            .expect("timed out waiting for gateway output")
            .expect("gateway output ended")
            .unwrap();
        assert_eq!(frame.body_type, body_type, "unexpected frame {frame:?}");
        frame
    }

    /// Nothing reaches the network side within `quiet`.
    async fn expect_silence(&mut self, quiet: Duration) {
        if let Ok(frame) = tokio::time::timeout(quiet, self.from_gateway.next()).await {
            panic!("unexpected output {frame:?}");
        }
    }

    async fn send(&mut self, frame: Frame) {
        self.to_gateway.send(frame).await.unwrap();
    }

    async fn connect(&self, connector: &TlsConnector) -> TlsStream<TcpStream> {
        let tcp = TcpStream::connect(self.addr).await.unwrap();
        let name = ServerName::try_from("localhost").unwrap();
        tokio::time::timeout(WAIT, connector.connect(name, tcp))
            .await
            .expect("TLS handshake stalled")
            .unwrap()
    }

    async fn shutdown(mut self) {
        self.send(port_close("in")).await;
        tokio::time::timeout(WAIT, self.task)
            .await
            .expect("gateway did not stop")
            .unwrap()
            .unwrap();
    }
}

fn data(body_type: &str, id: &str, body: &'static str) -> Frame {
    Frame::data(body_type, body).with_extension("conn-id", id)
}

#[tokio::test]
async fn tls_session_round_trip() {
    let mut h = Harness::start(server_layer(false)).await;
    let mut client = h.connect(&connector(false)).await;

    let open = h.expect("OpenNotification").await;
    assert_eq!(open.extension("conn-id"), Some("1"));
    let local = client.get_ref().0.local_addr().unwrap().to_string();
    assert_eq!(open.extension("remote-address"), Some(local.as_str()));

    client.write_all(b"PING").await.unwrap();
    client.flush().await.unwrap();
    let packet = h.expect("TLSPacket").await;
    assert_eq!(packet.extension("conn-id"), Some("1"));
    assert_eq!(packet.body.as_ref(), b"PING");

    h.send(data("TLSPacket", "1", "PONG")).await;
    let mut buf = [0u8; 4];
    tokio::time::timeout(WAIT, client.read_exact(&mut buf))
        .await
        .expect("no reply over TLS")
        .unwrap();
    assert_eq!(&buf, b"PONG");

    h.send(data("CloseConnection", "1", "")).await;
    let mut rest = Vec::new();
    let _ = tokio::time::timeout(WAIT, client.read_to_end(&mut rest))
        .await
        .expect("connection was not closed");
    assert!(rest.is_empty());
    let closed = h.expect("CloseNotification").await;
    assert_eq!(closed.extension("conn-id"), Some("1"));

    h.shutdown().await;
}

#[tokio::test]
async fn failed_and_stalled_handshakes_consume_no_id() {
    let mut h = Harness::start(ConfigLayer {
        handshake_timeout_ms: Some(200),
        ..server_layer(false)
    })
    .await;

    // Plain text on a TLS endpoint fails the handshake.
    let mut garbage = TcpStream::connect(h.addr).await.unwrap();
    garbage.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();

    // A client that never speaks holds a handshake slot until the timeout,
    // without blocking the next client.
    let mut silent = TcpStream::connect(h.addr).await.unwrap();

    let connector = connector(false);
    let mut first = h.connect(&connector).await;
    let open = h.expect("OpenNotification").await;
    assert_eq!(open.extension("conn-id"), Some("1"));

    let mut buf = [0u8; 64];
    let n = tokio::time::timeout(WAIT, silent.read(&mut buf))
        .await
        .expect("stalled handshake was not timed out")
        .unwrap_or(0);
    assert_eq!(n, 0);
    let _ = tokio::time::timeout(WAIT, garbage.read(&mut buf)).await;
    h.expect_silence(Duration::from_millis(100)).await;

    let _second = h.connect(&connector).await;
    let open = h.expect("OpenNotification").await;
    assert_eq!(open.extension("conn-id"), Some("2"));

    first.write_all(b"x").await.unwrap();
    first.flush().await.unwrap();
    assert_eq!(h.expect("TLSPacket").await.extension("conn-id"), Some("1"));

    h.shutdown().await;
}

#[tokio::test]
async fn client_certificate_required_when_ca_configured() {
    let mut h = Harness::start(server_layer(true)).await;

    // Without a certificate the server aborts the handshake. Under TLS 1.3
    // the client may only learn that on its first read.
    let tcp = TcpStream::connect(h.addr).await.unwrap();
    let name = ServerName::try_from("localhost").unwrap();
    if let Ok(Ok(mut anonymous)) =
        tokio::time::timeout(WAIT, connector(false).connect(name, tcp)).await
    {
        let mut buf = [0u8; 16];
        let read = tokio::time::timeout(WAIT, anonymous.read(&mut buf))
            .await
            .expect("rejected client was left open");
        assert!(matches!(read, Ok(0) | Err(_)), "{read:?}");
    }
    h.expect_silence(Duration::from_millis(100)).await;

    let mut trusted = h.connect(&connector(true)).await;
    let open = h.expect("OpenNotification").await;
    assert_eq!(open.extension("conn-id"), Some("1"));

    trusted.write_all(b"hi").await.unwrap();
    trusted.flush().await.unwrap();
    let packet = h.expect("TLSPacket").await;
    assert_eq!(packet.body.as_ref(), b"hi");

    h.shutdown().await;
}

#[tokio::test]
async fn secure_websocket_session() {
    let mut h = Harness::start(ConfigLayer {
        endpoint: Some("wss://127.0.0.1:0/feed".to_string()),
        ..server_layer(false)
    })
    .await;

    let tls = h.connect(&connector(false)).await;
    let (mut ws, _) = tokio::time::timeout(WAIT, client_async("wss://localhost/feed", tls))
        .await
        .expect("upgrade stalled")
        .unwrap();
    let open = h.expect("OpenNotification").await;
    assert_eq!(open.extension("conn-id"), Some("1"));

    ws.send(Message::text("hi")).await.unwrap();
    assert_eq!(h.expect("WSPacket").await.body.as_ref(), b"hi");

    h.send(data("WSPacket", "1", "yo")).await;
    let reply = tokio::time::timeout(WAIT, ws.next())
        .await
        .expect("no reply over wss")
        .unwrap()
        .unwrap();
    assert_eq!(reply, Message::binary(b"yo".to_vec()));

    ws.close(None).await.unwrap();
    let closed = h.expect("CloseNotification").await;
    assert_eq!(closed.extension("conn-id"), Some("1"));

    h.shutdown().await;
}
