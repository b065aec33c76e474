use std::collections::BTreeMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{FrameError, Result};

/// Frame category for payload-carrying frames.
pub const DATA: &str = "data";

/// Frame category for stream-structure frames (brackets, port close).
pub const CONTROL: &str = "control";

/// Default maximum header block size: 64 KiB.
pub const DEFAULT_MAX_HEADER: usize = 64 * 1024;

/// Default maximum body size: 16 MiB.
pub const DEFAULT_MAX_BODY: usize = 16 * 1024 * 1024;

const TYPE: &str = "Type";
const PORT: &str = "Port";
const CONTENT_TYPE: &str = "Content-Type";
const CONTENT_LENGTH: &str = "Content-Length";

/// One message on a flow pipe: a header block plus an exact-length body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Category, `data` or `control`.
    pub frame_type: String,
    /// Application subtype, e.g. `TCPPacket`.
    pub body_type: String,
    /// Logical port, if addressed.
    pub port: Option<String>,
    /// MIME type of the body.
    pub content_type: Option<String>,
    extensions: BTreeMap<String, String>,
    /// Opaque body bytes.
    pub body: Bytes,
}

impl Frame {
    /// Create a frame with an empty body.
    pub fn new(frame_type: impl Into<String>, body_type: impl Into<String>) -> Self {
        Self {
            frame_type: frame_type.into(),
            body_type: body_type.into(),
            port: None,
            content_type: None,
            extensions: BTreeMap::new(),
            body: Bytes::new(),
        }
    }

    /// Create a `data` frame.
    pub fn data(body_type: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Self::new(DATA, body_type).with_body(body)
    }

    /// Create an empty `control` frame.
    pub fn control(body_type: impl Into<String>) -> Self {
        Self::new(CONTROL, body_type)
    }

    /// Address the frame to a logical port.
    pub fn with_port(mut self, port: impl Into<String>) -> Self {
        self.port = Some(port.into());
        self
    }

    /// Set the body's MIME type.
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    /// Add an extension header; see [`set_extension`](Self::set_extension).
    pub fn with_extension(mut self, key: &str, value: impl Into<String>) -> Self {
        self.set_extension(key, value);
        self
    }

    /// Replace the body.
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// True for `data` frames.
    pub fn is_data(&self) -> bool {
        self.frame_type == DATA
    }

    /// True for `control` frames (brackets, port close).
    pub fn is_control(&self) -> bool {
        self.frame_type == CONTROL
    }

    /// Look up an extension header; the key is matched in canonical form.
    pub fn extension(&self, key: &str) -> Option<&str> {
        self.extensions.get(&canonical_key(key)).map(String::as_str)
    }

    /// Set an extension header, returning the previous value.
    pub fn set_extension(&mut self, key: &str, value: impl Into<String>) -> Option<String> {
        self.extensions.insert(canonical_key(key), value.into())
    }

    /// Remove an extension header, returning its value.
    pub fn remove_extension(&mut self, key: &str) -> Option<String> {
        self.extensions.remove(&canonical_key(key))
    }

    /// Extension headers in canonical-name order.
    pub fn extensions(&self) -> impl Iterator<Item = (&str, &str)> {
        self.extensions
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// Canonical header-name form: first letter and each letter after `-`
/// upper-cased, the rest lower-cased (`conn-id` becomes `Conn-Id`).
pub fn canonical_key(name: &str) -> String {
    let mut upper = true;
    name.chars()
        .map(|c| {
            let out = if upper {
                c.to_ascii_uppercase()
            } else {
                c.to_ascii_lowercase()
            };
            upper = c == '-';
            out
        })
        .collect()
}

fn is_token(name: &str) -> bool {
    !name.is_empty()
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b))
}

fn is_reserved(canonical: &str) -> bool {
    matches!(canonical, TYPE | PORT | CONTENT_TYPE | CONTENT_LENGTH)
}

/// Encode a frame into the wire format.
///
/// Wire format:
/// ```text
/// Type: data.TCPPacket\r\n
/// Port: IN\r\n                 (optional)
/// Content-Type: text/plain\r\n (optional)
/// Content-Length: 4\r\n
/// Conn-Id: 7\r\n               (extensions, sorted)
/// \r\n
/// PING
/// ```
pub fn encode_frame(frame: &Frame, dst: &mut BytesMut) -> Result<()> {
    validate_for_encode(frame)?;

    let length = frame.body.len().to_string();
    dst.reserve(128 + frame.body.len());

    dst.put_slice(TYPE.as_bytes());
    dst.put_slice(b": ");
    dst.put_slice(frame.frame_type.as_bytes());
    dst.put_u8(b'.');
    dst.put_slice(frame.body_type.as_bytes());
    dst.put_slice(b"\r\n");

    if let Some(port) = &frame.port {
        put_line(dst, PORT, port);
    }
    if let Some(content_type) = &frame.content_type {
        put_line(dst, CONTENT_TYPE, content_type);
    }
    put_line(dst, CONTENT_LENGTH, &length);
    for (name, value) in &frame.extensions {
        put_line(dst, name, value);
    }
    dst.put_slice(b"\r\n");
    dst.put_slice(&frame.body);
    Ok(())
}

fn put_line(dst: &mut BytesMut, name: &str, value: &str) {
    dst.put_slice(name.as_bytes());
    dst.put_slice(b": ");
    dst.put_slice(value.as_bytes());
    dst.put_slice(b"\r\n");
}

fn validate_for_encode(frame: &Frame) -> Result<()> {
    if frame.frame_type.is_empty() || frame.frame_type.contains('.') {
        return Err(FrameError::Unencodable(format!(
            "frame type {:?} must be non-empty and dot-free",
            frame.frame_type
        )));
    }
    if frame.body_type.is_empty() {
        return Err(FrameError::Unencodable("body type is empty".to_string()));
    }
    check_value(TYPE, &frame.frame_type)?;
    check_value(TYPE, &frame.body_type)?;
    if let Some(port) = &frame.port {
        check_value(PORT, port)?;
    }
    if let Some(content_type) = &frame.content_type {
        check_value(CONTENT_TYPE, content_type)?;
    }
    for (name, value) in &frame.extensions {
        if !is_token(name) || is_reserved(name) {
            return Err(FrameError::Unencodable(format!(
                "invalid extension name {name:?}"
            )));
        }
        check_value(name, value)?;
    }
    Ok(())
}

fn check_value(name: &str, value: &str) -> Result<()> {
    if value.contains(['\r', '\n']) || value.trim() != value {
        return Err(FrameError::Unencodable(format!(
            "value of {name} contains line breaks or surrounding whitespace"
        )));
    }
    Ok(())
}

/// Decode a frame from a buffer.
///
/// Returns `Ok(None)` if the buffer doesn't contain a complete frame yet.
/// On success, consumes the frame bytes from the buffer. A header block that
/// fails to parse is consumed along with the error so it cannot be
/// re-read.
pub fn decode_frame(src: &mut BytesMut, config: &FrameConfig) -> Result<Option<Frame>> {
    let Some((block_len, header_len)) = find_header_end(src) else {
        if src.len() > config.max_header_size {
            return Err(FrameError::HeaderTooLarge {
                max: config.max_header_size,
            });
        }
        return Ok(None); // Need more data
    };

    if header_len > config.max_header_size {
        src.advance(header_len);
        return Err(FrameError::HeaderTooLarge {
            max: config.max_header_size,
        });
    }

    let header = match parse_header(&src[..block_len]) {
        Ok(header) => header,
        Err(err) => {
            src.advance(header_len);
            return Err(err);
        }
    };

    if header.content_length > config.max_body_size {
        src.advance(header_len);
        return Err(FrameError::BodyTooLarge {
            size: header.content_length,
            max: config.max_body_size,
        });
    }

    if src.len() < header_len + header.content_length {
        return Ok(None); // Need more data
    }

    src.advance(header_len);
    let body = src.split_to(header.content_length).freeze();

    Ok(Some(Frame {
        frame_type: header.frame_type,
        body_type: header.body_type,
        port: header.port,
        content_type: header.content_type,
        extensions: header.extensions,
        body,
    }))
}

/// Error for a stream that ended with `src` still holding an incomplete frame.
pub(crate) fn incomplete_frame_error(src: &[u8]) -> FrameError {
    let declared = find_header_end(src).and_then(|(block_len, header_len)| {
        parse_header(&src[..block_len])
            .ok()
            .map(|header| (header.content_length, src.len() - header_len))
    });
    match declared {
        Some((expected, actual)) => FrameError::ShortBody { expected, actual },
        None => FrameError::TruncatedHeader(src.len()),
    }
}

/// Locate the blank line ending the header block.
///
/// Returns `(block_len, header_len)`: the bytes of header lines, and the
/// bytes up to and including the blank line.
fn find_header_end(src: &[u8]) -> Option<(usize, usize)> {
    let mut line_start = 0;
    while let Some(offset) = src[line_start..].iter().position(|&b| b == b'\n') {
        let line_end = line_start + offset;
        let line = &src[line_start..line_end];
        if line.is_empty() || line == b"\r" {
            return Some((line_start, line_end + 1));
        }
        line_start = line_end + 1;
    }
    None
}

struct Header {
    frame_type: String,
    body_type: String,
    port: Option<String>,
    content_type: Option<String>,
    content_length: usize,
    extensions: BTreeMap<String, String>,
}

fn parse_header(block: &[u8]) -> Result<Header> {
    let text = std::str::from_utf8(block)
        .map_err(|_| FrameError::MalformedHeader("header block is not UTF-8".to_string()))?;

    let mut type_value: Option<(String, String)> = None;
    let mut content_length: Option<usize> = None;
    let mut port = None;
    let mut content_type = None;
    let mut extensions = BTreeMap::new();

    for raw in text.split('\n') {
        let line = raw.strip_suffix('\r').unwrap_or(raw);
        if line.is_empty() {
            continue;
        }
        let (name, value) = line.split_once(':').ok_or_else(|| {
            FrameError::MalformedHeader(format!("line without ':' separator: {line:?}"))
        })?;
        if !is_token(name) {
            return Err(FrameError::MalformedHeader(format!(
                "invalid header name {name:?}"
            )));
        }
        let name = canonical_key(name);
        let value = value.trim_matches([' ', '\t']);

        match name.as_str() {
            TYPE => {
                if type_value.is_some() {
                    return Err(FrameError::MalformedHeader("duplicate Type".to_string()));
                }
                type_value = Some(split_type(value)?);
            }
            CONTENT_LENGTH => {
                if content_length.is_some() {
                    return Err(FrameError::MalformedHeader(
                        "duplicate Content-Length".to_string(),
                    ));
                }
                content_length = Some(parse_length(value)?);
            }
            PORT => port = Some(value.to_string()),
            CONTENT_TYPE => content_type = Some(value.to_string()),
            _ => {
                extensions.insert(name, value.to_string());
            }
        }
    }

    let (frame_type, body_type) = type_value.ok_or(FrameError::MissingField(TYPE))?;
    let content_length = content_length.ok_or(FrameError::MissingField(CONTENT_LENGTH))?;

    Ok(Header {
        frame_type,
        body_type,
        port,
        content_type,
        content_length,
        extensions,
    })
}

fn split_type(value: &str) -> Result<(String, String)> {
    match value.split_once('.') {
        Some((frame_type, body_type)) if !frame_type.is_empty() && !body_type.is_empty() => {
            Ok((frame_type.to_string(), body_type.to_string()))
        }
        _ => Err(FrameError::MalformedHeader(format!(
            "Type {value:?} is not of the form <type>.<body-type>"
        ))),
    }
}

fn parse_length(value: &str) -> Result<usize> {
    if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
        return Err(FrameError::MalformedHeader(format!(
            "Content-Length {value:?} is not a non-negative integer"
        )));
    }
    value
        .parse()
        .map_err(|_| FrameError::MalformedHeader(format!("Content-Length {value:?} overflows")))
}

/// Configuration for the frame codec.
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// Maximum header block size in bytes. Default: 64 KiB.
    pub max_header_size: usize,
    /// Maximum body size in bytes. Default: 16 MiB.
    pub max_body_size: usize,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_header_size: DEFAULT_MAX_HEADER,
            max_body_size: DEFAULT_MAX_BODY,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(buf: &mut BytesMut) -> Result<Option<Frame>> {
        decode_frame(buf, &FrameConfig::default())
    }

    fn sample() -> Frame {
        Frame::data("TCPPacket", Bytes::from_static(b"PING"))
            .with_port("IN")
            .with_content_type("application/octet-stream")
            .with_extension("conn-id", "7")
            .with_extension("remote-address", "10.0.0.5:51000")
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let frame = sample();
        let mut buf = BytesMut::new();
        encode_frame(&frame, &mut buf).unwrap();

        let decoded = decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, frame);
        assert_eq!(decoded.extension("Conn-Id"), Some("7"));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_roundtrip_empty_and_binary_bodies() {
        for body in [&b""[..], &b"\0\0\r\n\r\n\0"[..], &[0xFFu8; 300][..]] {
            let frame = Frame::data("Blob", Bytes::copy_from_slice(body));
            let mut buf = BytesMut::new();
            encode_frame(&frame, &mut buf).unwrap();
            let decoded = decode(&mut buf).unwrap().unwrap();
            assert_eq!(decoded.body.as_ref(), body);
            assert_eq!(decoded, frame);
        }
    }

    #[test]
    fn test_stable_header_order() {
        let frame = Frame::data("TCPPacket", Bytes::from_static(b"hi"))
            .with_extension("zeta", "z")
            .with_extension("conn-id", "1")
            .with_port("OUT");
        let mut buf = BytesMut::new();
        encode_frame(&frame, &mut buf).unwrap();

        assert_eq!(
            &buf[..],
            b"Type: data.TCPPacket\r\nPort: OUT\r\nContent-Length: 2\r\nConn-Id: 1\r\nZeta: z\r\n\r\nhi"
        );
    }

    #[test]
    fn test_decode_incomplete_header() {
        let mut buf = BytesMut::from(&b"Type: data.X\r\nContent-Len"[..]);
        assert!(decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 25);
    }

    #[test]
    fn test_decode_incomplete_body() {
        let mut buf = BytesMut::new();
        encode_frame(&Frame::data("X", "hello"), &mut buf).unwrap();
        let full = buf.len();
        buf.truncate(full - 2);

        assert!(decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), full - 2, "partial frame must not be consumed");
    }

    #[test]
    fn test_decode_accepts_bare_newlines_and_canonicalizes() {
        let mut buf =
            BytesMut::from(&b"type: data.WSPacket\ncontent-length:  3\nconn-id: 42\n\nabc"[..]);
        let frame = decode(&mut buf).unwrap().unwrap();

        assert_eq!(frame.frame_type, "data");
        assert_eq!(frame.body_type, "WSPacket");
        assert_eq!(frame.extension("conn-id"), Some("42"));
        assert_eq!(frame.extensions().next(), Some(("Conn-Id", "42")));
        assert_eq!(frame.body.as_ref(), b"abc");
    }

    #[test]
    fn test_body_type_may_contain_dots() {
        let mut buf = BytesMut::from(&b"Type: data.a.b\r\nContent-Length: 0\r\n\r\n"[..]);
        let frame = decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.frame_type, "data");
        assert_eq!(frame.body_type, "a.b");
    }

    #[test]
    fn test_missing_content_length() {
        let mut buf = BytesMut::from(&b"Type: data.X\r\n\r\nbody"[..]);
        let err = decode(&mut buf).unwrap_err();
        assert!(matches!(err, FrameError::MissingField("Content-Length")));
        assert_eq!(&buf[..], b"body", "failed header block is consumed");
    }

    #[test]
    fn test_missing_type() {
        let mut buf = BytesMut::from(&b"Content-Length: 0\r\n\r\n"[..]);
        assert!(matches!(
            decode(&mut buf),
            Err(FrameError::MissingField("Type"))
        ));
    }

    #[test]
    fn test_type_without_dot_rejected() {
        for value in ["data", "data.", ".X"] {
            let wire = format!("Type: {value}\r\nContent-Length: 0\r\n\r\n");
            let mut buf = BytesMut::from(wire.as_bytes());
            assert!(
                matches!(decode(&mut buf), Err(FrameError::MalformedHeader(_))),
                "{value} should be rejected"
            );
        }
    }

    #[test]
    fn test_bad_content_length_rejected() {
        for value in ["-1", "+5", "12a", "", "99999999999999999999999"] {
            let wire = format!("Type: data.X\r\nContent-Length: {value}\r\n\r\n");
            let mut buf = BytesMut::from(wire.as_bytes());
            assert!(
                matches!(decode(&mut buf), Err(FrameError::MalformedHeader(_))),
                "{value:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_duplicate_required_headers_rejected() {
        let mut buf = BytesMut::from(
            &b"Type: data.X\r\nContent-Length: 1\r\nContent-Length: 2\r\n\r\nab"[..],
        );
        assert!(matches!(
            decode(&mut buf),
            Err(FrameError::MalformedHeader(_))
        ));
    }

    #[test]
    fn test_line_without_colon_rejected() {
        let mut buf = BytesMut::from(&b"Type: data.X\r\ngarbage\r\nContent-Length: 0\r\n\r\n"[..]);
        assert!(matches!(
            decode(&mut buf),
            Err(FrameError::MalformedHeader(_))
        ));
    }

    #[test]
    fn test_header_too_large() {
        let cfg = FrameConfig {
            max_header_size: 16,
            ..FrameConfig::default()
        };
        let mut buf = BytesMut::from(&b"Type: data.SomethingLong\r\n"[..]);
        assert!(matches!(
            decode_frame(&mut buf, &cfg),
            Err(FrameError::HeaderTooLarge { max: 16 })
        ));
    }

    #[test]
    fn test_body_too_large() {
        let cfg = FrameConfig {
            max_body_size: 4,
            ..FrameConfig::default()
        };
        let mut buf = BytesMut::from(&b"Type: data.X\r\nContent-Length: 1024\r\n\r\n"[..]);
        assert!(matches!(
            decode_frame(&mut buf, &cfg),
            Err(FrameError::BodyTooLarge { size: 1024, max: 4 })
        ));
    }

    #[test]
    fn test_multiple_frames() {
        let mut buf = BytesMut::new();
        encode_frame(&Frame::data("First", "one"), &mut buf).unwrap();
        encode_frame(&Frame::control("BracketOpen").with_port("IN"), &mut buf).unwrap();

        let f1 = decode(&mut buf).unwrap().unwrap();
        assert_eq!(f1.body_type, "First");
        assert_eq!(f1.body.as_ref(), b"one");

        let f2 = decode(&mut buf).unwrap().unwrap();
        assert!(f2.is_control());
        assert_eq!(f2.port.as_deref(), Some("IN"));
        assert!(f2.body.is_empty());

        assert!(buf.is_empty());
    }

    #[test]
    fn test_encode_rejects_unrepresentable_frames() {
        let mut buf = BytesMut::new();
        let cases = [
            Frame::new("da.ta", "X"),
            Frame::new("data", ""),
            Frame::data("X", "").with_port("IN\r\nType: data.Y"),
            Frame::data("X", "").with_extension("content-length", "3"),
            Frame::data("X", "").with_extension("bad name", "v"),
            Frame::data("X", "").with_extension("k", " padded "),
        ];
        for frame in cases {
            assert!(
                matches!(
                    encode_frame(&frame, &mut buf),
                    Err(FrameError::Unencodable(_))
                ),
                "{frame:?} should not encode"
            );
        }
        assert!(buf.is_empty());
    }

    #[test]
    fn test_canonical_key() {
        assert_eq!(canonical_key("conn-id"), "Conn-Id");
        assert_eq!(canonical_key("REMOTE-ADDRESS"), "Remote-Address");
        assert_eq!(canonical_key("x"), "X");
    }

    #[test]
    fn test_extension_accessors() {
        let mut frame = Frame::data("X", "");
        assert_eq!(frame.set_extension("req-id", "1"), None);
        assert_eq!(frame.set_extension("Req-Id", "2"), Some("1".to_string()));
        assert_eq!(frame.extension("REQ-ID"), Some("2"));
        assert_eq!(frame.remove_extension("req-id"), Some("2".to_string()));
        assert_eq!(frame.extensions().count(), 0);
    }
}
