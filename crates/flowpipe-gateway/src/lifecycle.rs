//! Reserved body types and extension keys at the gateway boundary, plus
//! builders for the frames the gateway emits.

use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use flowpipe_frame::Frame;

use crate::error::{GatewayError, Result};

/// A connection was admitted. Extensions: `conn-id`, `remote-address`.
pub const OPEN_NOTIFICATION: &str = "OpenNotification";
/// A connection was retired. Extensions: `conn-id`.
pub const CLOSE_NOTIFICATION: &str = "CloseNotification";
/// Command: close the connection. Extensions: `conn-id`.
pub const CLOSE_CONNECTION: &str = "CloseConnection";

pub const TCP_PACKET: &str = "TCPPacket";
pub const TLS_PACKET: &str = "TLSPacket";
pub const WS_PACKET: &str = "WSPacket";
pub const UNIX_PACKET: &str = "UNIXPacket";
pub const HTTP_REQUEST: &str = "HTTPRequest";
pub const HTTP_RESPONSE: &str = "HTTPResponse";

pub const CONN_ID: &str = "conn-id";
pub const REMOTE_ADDRESS: &str = "remote-address";
pub const REQ_ID: &str = "req-id";

/// Process-lifetime connection identifier. Allocated monotonically from 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(pub u64);

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for ConnId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        s.parse().map(ConnId)
    }
}

pub fn open_notification(id: ConnId, remote_address: &str) -> Frame {
    Frame::data(OPEN_NOTIFICATION, Bytes::new())
        .with_extension(CONN_ID, id.to_string())
        .with_extension(REMOTE_ADDRESS, remote_address)
}

pub fn close_notification(id: ConnId) -> Frame {
    Frame::data(CLOSE_NOTIFICATION, Bytes::new()).with_extension(CONN_ID, id.to_string())
}

pub fn close_connection(id: ConnId) -> Frame {
    Frame::data(CLOSE_CONNECTION, Bytes::new()).with_extension(CONN_ID, id.to_string())
}

/// A payload frame carrying bytes from or to one connection.
pub fn packet(body_type: &str, id: ConnId, body: impl Into<Bytes>) -> Frame {
    Frame::data(body_type, body).with_extension(CONN_ID, id.to_string())
}

/// The `conn-id` a frame is addressed to.
///
/// A missing or non-numeric id is a protocol violation on the shared pipe.
pub fn conn_id_of(frame: &Frame) -> Result<ConnId> {
    let raw = frame.extension(CONN_ID).ok_or_else(|| {
        GatewayError::Protocol(format!("{} frame without conn-id", frame.body_type))
    })?;
    raw.parse().map_err(|_| {
        GatewayError::Protocol(format!(
            "{} frame with invalid conn-id {raw:?}",
            frame.body_type
        ))
    })
}
