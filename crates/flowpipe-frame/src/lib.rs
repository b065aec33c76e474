//! Header-block message framing for flow-based-programming pipes.
//!
//! Every message on a pipe is one frame:
//! - `Key: value` header lines with canonicalized names
//! - a required `Type` (`<type>.<body-type>`) and `Content-Length`
//! - a blank line, then exactly `Content-Length` body bytes
//!
//! End of stream between frames is the normal termination signal; anything
//! else that ends early or fails to parse is an error.

#[cfg(feature = "async")]
pub mod async_codec;
pub mod codec;
pub mod control;
pub mod error;
pub mod reader;
pub mod writer;

#[cfg(feature = "async")]
pub use async_codec::FbpCodec;
pub use codec::{
    canonical_key, decode_frame, encode_frame, Frame, FrameConfig, CONTROL, DATA,
    DEFAULT_MAX_BODY, DEFAULT_MAX_HEADER,
};
pub use control::{
    bracket_close, bracket_open, is_bracket_close, is_bracket_open, is_port_close, port_close,
    BRACKET_CLOSE, BRACKET_OPEN, PORT_CLOSE,
};
pub use error::{FrameError, Result};
pub use reader::FrameReader;
pub use writer::FrameWriter;
