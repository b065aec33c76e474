//! Control frames: sub-stream brackets and port half-close.
//!
//! All of them carry `Type: control`, an empty body and the port they refer
//! to. They structure a stream without tearing down the pipe underneath.

use crate::codec::Frame;

/// Opens a bracketed sub-stream.
pub const BRACKET_OPEN: &str = "BracketOpen";

/// Closes a bracketed sub-stream.
pub const BRACKET_CLOSE: &str = "BracketClose";

/// The sender will write nothing more to this port.
pub const PORT_CLOSE: &str = "PortClose";

pub fn bracket_open(port: impl Into<String>) -> Frame {
    Frame::control(BRACKET_OPEN).with_port(port)
}

pub fn bracket_close(port: impl Into<String>) -> Frame {
    Frame::control(BRACKET_CLOSE).with_port(port)
}

pub fn port_close(port: impl Into<String>) -> Frame {
    Frame::control(PORT_CLOSE).with_port(port)
}

pub fn is_bracket_open(frame: &Frame) -> bool {
    frame.is_control() && frame.body_type == BRACKET_OPEN
}

pub fn is_bracket_close(frame: &Frame) -> bool {
    frame.is_control() && frame.body_type == BRACKET_CLOSE
}

pub fn is_port_close(frame: &Frame) -> bool {
    frame.is_control() && frame.body_type == PORT_CLOSE
}
