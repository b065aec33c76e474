//! HTTP/1.1 on top of a byte-stream gateway.
//!
//! The [`HttpTranscoder`] sits between the gateway's framed pipes and the
//! network: raw packets from each connection are assembled into one
//! `HTTPRequest` frame, and each `HTTPResponse` frame is serialized back into
//! bytes followed by `CloseConnection`. One request per connection.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use flowpipe_frame::{is_port_close, FbpCodec, Frame, FrameConfig, FrameError};
use flowpipe_transport::Listener;
use futures_util::{SinkExt, Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, info, warn};

use crate::error::{GatewayError, Result};
use crate::gateway::Gateway;
use crate::lifecycle::{
    close_connection, conn_id_of, packet, ConnId, CLOSE_NOTIFICATION, CONN_ID, HTTP_REQUEST,
    HTTP_RESPONSE, OPEN_NOTIFICATION, REQ_ID, TCP_PACKET, TLS_PACKET,
};

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_MAX_HEAD: usize = 64 * 1024;
pub const DEFAULT_MAX_BODY: usize = 8 * 1024 * 1024;

const MAX_HEADERS: usize = 100;
const PIPE_CAPACITY: usize = 64 * 1024;
const HEADER_PREFIX: &str = "Header-";

#[derive(Debug, Clone)]
pub struct HttpConfig {
    /// Time allowed from connection open to a complete request.
    pub request_timeout: Duration,
    pub max_head: usize,
    pub max_body: usize,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            max_head: DEFAULT_MAX_HEAD,
            max_body: DEFAULT_MAX_BODY,
        }
    }
}

/// Why a request could not be assembled.
#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error("request not complete within timeout")]
    Timeout,

    #[error("connection ended mid-request")]
    Incomplete,

    #[error("malformed request: {0}")]
    Parse(#[from] httparse::Error),

    #[error("request head exceeds {0} bytes")]
    HeadTooLarge(usize),

    #[error("request body of {size} bytes exceeds {max}")]
    BodyTooLarge { size: usize, max: usize },

    #[error("invalid content-length {0:?}")]
    InvalidContentLength(String),

    #[error("unsupported: {0}")]
    Unsupported(&'static str),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Run a gateway with HTTP transcoding in-process.
///
/// `input` carries `HTTPResponse` frames from the network; `HTTPRequest`
/// frames are written to `output`. Only `tcp://` and `tls://` endpoints
/// are accepted.
pub async fn serve_http<S, W>(
    gateway: &Gateway,
    listener: Listener,
    config: HttpConfig,
    input: S,
    output: W,
) -> Result<()>
where
    S: Stream<Item = std::result::Result<Frame, FrameError>> + Unpin,
    W: AsyncWrite + Unpin,
{
    let packet_type = gateway.packet_body_type();
    if packet_type != TCP_PACKET && packet_type != TLS_PACKET {
        return Err(GatewayError::Config(format!(
            "HTTP needs a tcp:// or tls:// endpoint, got {}",
            gateway.config().endpoint
        )));
    }

    let (gateway_in, to_gateway) = tokio::io::duplex(PIPE_CAPACITY);
    let (gateway_out, from_gateway) = tokio::io::duplex(PIPE_CAPACITY);
    let transcoder = HttpTranscoder::new(config, packet_type);
    let gateway_in = FramedRead::new(gateway_in, FbpCodec::new());

    // A response can cross the CloseNotification for its connection; the
    // inner gateway must drop it rather than fail.
    tokio::select! {
        biased;
        res = gateway.run(listener, gateway_in, gateway_out, true) => res,
        res = transcoder.run(from_gateway, to_gateway, input, output) => res,
    }
}

struct Exchange {
    pipe: Option<DuplexStream>,
    assembler: AbortHandle,
    responded: bool,
}

impl Drop for Exchange {
    fn drop(&mut self) {
        self.assembler.abort();
    }
}

type Assembled = (ConnId, std::result::Result<HttpRequest, RequestError>);

pub struct HttpTranscoder {
    config: HttpConfig,
    packet_type: &'static str,
    max_packet: usize,
}

impl HttpTranscoder {
    /// `packet_type` is the body type used for response bytes sent to the gateway.
    pub fn new(config: HttpConfig, packet_type: &'static str) -> Self {
        Self {
            config,
            packet_type,
            max_packet: FrameConfig::default().max_body_size,
        }
    }

    /// Largest serialized response sent to the gateway as one packet; must
    /// not exceed the body limit of the gateway's input codec.
    pub fn with_max_packet(mut self, max_packet: usize) -> Self {
        self.max_packet = max_packet;
        self
    }

    /// Transcode until the network input or the gateway output ends.
    pub async fn run<GR, GW, S, NW>(
        &self,
        from_gateway: GR,
        to_gateway: GW,
        mut from_network: S,
        to_network: NW,
    ) -> Result<()>
    where
        GR: AsyncRead + Unpin,
        GW: AsyncWrite + Unpin,
        S: Stream<Item = std::result::Result<Frame, FrameError>> + Unpin,
        NW: AsyncWrite + Unpin,
    {
        let mut gateway_in = FramedRead::new(from_gateway, FbpCodec::new());
        let mut gateway_out = FramedWrite::new(to_gateway, FbpCodec::new());
        let mut network_out = FramedWrite::new(to_network, FbpCodec::new());
        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<Assembled>();
        let mut exchanges: HashMap<ConnId, Exchange> = HashMap::new();

        loop {
            tokio::select! {
                frame = gateway_in.next() => {
                    let Some(frame) = frame else {
                        debug!("gateway output ended");
                        return Ok(());
                    };
                    self.on_gateway_frame(frame?, &mut exchanges, &done_tx).await?;
                }
                frame = from_network.next() => {
                    let Some(frame) = frame else {
                        info!("input ended");
                        return Ok(());
                    };
                    let frame = frame?;
                    if frame.is_control() {
                        if is_port_close(&frame) {
                            info!(port = ?frame.port, "input port closed");
                            return Ok(());
                        }
                        continue;
                    }
                    self.on_response(frame, &mut exchanges, &mut gateway_out).await?;
                }
                Some((id, outcome)) = done_rx.recv() => {
                    let Some(exchange) = exchanges.get_mut(&id) else {
                        continue;
                    };
                    exchange.pipe = None;
                    match outcome {
                        Ok(request) => {
                            debug!(conn_id = %id, method = %request.method, uri = %request.uri, "request assembled");
                            network_out.send(request_frame(id, request)).await?;
                        }
                        Err(err) => {
                            warn!(conn_id = %id, error = %err, "dropping connection");
                            gateway_out.send(close_connection(id)).await?;
                        }
                    }
                }
            }
        }
    }

    async fn on_gateway_frame(
        &self,
        frame: Frame,
        exchanges: &mut HashMap<ConnId, Exchange>,
        done_tx: &mpsc::UnboundedSender<Assembled>,
    ) -> Result<()> {
        if frame.is_control() {
            return Ok(());
        }
        let id = conn_id_of(&frame)?;
        match frame.body_type.as_str() {
            OPEN_NOTIFICATION => {
                let (pipe, assembler_end) = tokio::io::duplex(PIPE_CAPACITY);
                let config = self.config.clone();
                let done_tx = done_tx.clone();
                let task = tokio::spawn(async move {
                    let outcome = match tokio::time::timeout(
                        config.request_timeout,
                        assemble_request(assembler_end, &config),
                    )
                    .await
                    {
                        Ok(outcome) => outcome,
                        Err(_) => Err(RequestError::Timeout),
                    };
                    let _ = done_tx.send((id, outcome));
                });
                exchanges.insert(
                    id,
                    Exchange {
                        pipe: Some(pipe),
                        assembler: task.abort_handle(),
                        responded: false,
                    },
                );
            }
            CLOSE_NOTIFICATION => {
                exchanges.remove(&id);
            }
            _ => match exchanges.get_mut(&id) {
                Some(exchange) => {
                    if let Some(pipe) = exchange.pipe.as_mut() {
                        if pipe.write_all(&frame.body).await.is_err() {
                            debug!(conn_id = %id, "request already complete; trailing bytes ignored");
                            exchange.pipe = None;
                        }
                    }
                }
                None => warn!(conn_id = %id, body_type = %frame.body_type, "packet for unknown connection"),
            },
        }
        Ok(())
    }

    async fn on_response<GW>(
        &self,
        frame: Frame,
        exchanges: &mut HashMap<ConnId, Exchange>,
        gateway_out: &mut FramedWrite<GW, FbpCodec>,
    ) -> Result<()>
    where
        GW: AsyncWrite + Unpin,
    {
        if frame.body_type != HTTP_RESPONSE {
            warn!(body_type = %frame.body_type, "ignoring non-response frame");
            return Ok(());
        }
        let id = conn_id_of(&frame)?;
        let Some(exchange) = exchanges.get_mut(&id) else {
            warn!(conn_id = %id, "response for closed connection dropped");
            return Ok(());
        };
        if exchange.responded {
            warn!(conn_id = %id, "duplicate response dropped");
            return Ok(());
        }
        exchange.responded = true;

        let response = serialize_response(&frame);
        if response.len() > self.max_packet {
            warn!(
                conn_id = %id,
                size = response.len(),
                max = self.max_packet,
                "response too large; closing connection"
            );
        } else {
            gateway_out
                .feed(packet(self.packet_type, id, response))
                .await?;
        }
        gateway_out.send(close_connection(id)).await?;
        Ok(())
    }
}

#[derive(Debug)]
struct HttpRequest {
    method: String,
    uri: String,
    version: u8,
    /// Lowercased names, in arrival order.
    headers: Vec<(String, String)>,
    body: Bytes,
}

impl HttpRequest {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }
}

async fn assemble_request<R>(
    mut pipe: R,
    config: &HttpConfig,
) -> std::result::Result<HttpRequest, RequestError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(4096);
    let (mut request, head_len) = loop {
        if pipe.read_buf(&mut buf).await? == 0 {
            return Err(RequestError::Incomplete);
        }
        if let Some(parsed) = parse_head(&buf)? {
            break parsed;
        }
        if buf.len() > config.max_head {
            return Err(RequestError::HeadTooLarge(config.max_head));
        }
    };
    buf.advance(head_len);

    let length = content_length(&request)?;
    if length > config.max_body {
        return Err(RequestError::BodyTooLarge {
            size: length,
            max: config.max_body,
        });
    }
    while buf.len() < length {
        if pipe.read_buf(&mut buf).await? == 0 {
            return Err(RequestError::Incomplete);
        }
    }
    request.body = buf.split_to(length).freeze();
    Ok(request)
}

fn parse_head(buf: &[u8]) -> std::result::Result<Option<(HttpRequest, usize)>, RequestError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut parsed = httparse::Request::new(&mut headers);
    let len = match parsed.parse(buf)? {
        httparse::Status::Partial => return Ok(None),
        httparse::Status::Complete(len) => len,
    };
    let request = HttpRequest {
        method: parsed.method.unwrap_or_default().to_string(),
        uri: parsed.path.unwrap_or_default().to_string(),
        version: parsed.version.unwrap_or(1),
        headers: parsed
            .headers
            .iter()
            .map(|h| {
                (
                    h.name.to_ascii_lowercase(),
                    String::from_utf8_lossy(h.value).trim().to_string(),
                )
            })
            .collect(),
        body: Bytes::new(),
    };
    Ok(Some((request, len)))
}

fn content_length(request: &HttpRequest) -> std::result::Result<usize, RequestError> {
    if request.header("transfer-encoding").is_some() {
        return Err(RequestError::Unsupported("transfer-encoding"));
    }
    let mut length = None;
    for (_, value) in request.headers.iter().filter(|(n, _)| n == "content-length") {
        let n: usize = value
            .parse()
            .map_err(|_| RequestError::InvalidContentLength(value.clone()))?;
        if length.is_some_and(|prev| prev != n) {
            return Err(RequestError::InvalidContentLength(value.clone()));
        }
        length = Some(n);
    }
    Ok(length.unwrap_or(0))
}

fn request_frame(id: ConnId, request: HttpRequest) -> Frame {
    let token = id.to_string();
    let mut frame = Frame::data(HTTP_REQUEST, request.body.clone())
        .with_extension(CONN_ID, token.clone())
        .with_extension(REQ_ID, token)
        .with_extension("method", request.method.as_str())
        .with_extension("uri", request.uri.as_str())
        .with_extension("proto", format!("HTTP/1.{}", request.version));

    for (name, value) in &request.headers {
        let key = format!("header-{name}");
        let merged = match frame.extension(&key) {
            Some(existing) => format!("{existing}, {value}"),
            None => value.clone(),
        };
        frame.set_extension(&key, merged);
    }
    if let Some(content_type) = request.header("content-type") {
        frame.content_type = Some(content_type.to_string());
    }
    frame
}

fn serialize_response(frame: &Frame) -> Bytes {
    let status = match frame.extension("status") {
        None => 200,
        Some(raw) => match raw.trim().parse::<u16>() {
            Ok(code) if (100..=999).contains(&code) => code,
            _ => {
                warn!(status = %raw, "invalid response status; sending 500");
                500
            }
        },
    };

    let mut head = format!("HTTP/1.1 {status} {}\r\n", reason_phrase(status));
    let mut has_content_type = false;
    for (key, value) in frame.extensions() {
        let Some(name) = key.strip_prefix(HEADER_PREFIX) else {
            continue;
        };
        if ["content-length", "connection", "transfer-encoding"]
            .iter()
            .any(|skip| name.eq_ignore_ascii_case(skip))
        {
            continue;
        }
        has_content_type |= name.eq_ignore_ascii_case("content-type");
        let _ = write!(head, "{name}: {value}\r\n");
    }
    if !has_content_type {
        if let Some(content_type) = &frame.content_type {
            let _ = write!(head, "Content-Type: {content_type}\r\n");
        }
    }
    let _ = write!(
        head,
        "Content-Length: {}\r\nConnection: close\r\n\r\n",
        frame.body.len()
    );

    let mut out = BytesMut::with_capacity(head.len() + frame.body.len());
    out.extend_from_slice(head.as_bytes());
    out.extend_from_slice(&frame.body);
    out.freeze()
}

fn reason_phrase(status: u16) -> &'static str {
    match status {
        100 => "Continue",
        101 => "Switching Protocols",
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        204 => "No Content",
        301 => "Moved Permanently",
        302 => "Found",
        303 => "See Other",
        304 => "Not Modified",
        307 => "Temporary Redirect",
        308 => "Permanent Redirect",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        409 => "Conflict",
        413 => "Payload Too Large",
        415 => "Unsupported Media Type",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "",
    }
}
