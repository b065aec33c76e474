//! Connection-multiplexing gateway.
//!
//! Presents a dynamic set of network connections (TCP, TLS, Unix, WebSocket)
//! as a single pair of framed streams: one carrying lifecycle notifications
//! and upstream payloads tagged with `conn-id`, the other carrying
//! downstream payloads and close commands addressed by `conn-id`.
//!
//! [`http`] layers HTTP/1.1 request/response transcoding on top.

pub mod config;
pub mod error;
pub mod gateway;
pub mod http;
pub mod lifecycle;
pub mod session;
pub mod table;
pub mod websocket;

pub use config::{ConfigLayer, GatewayConfig};
pub use error::{GatewayError, Result};
pub use gateway::Gateway;
pub use http::{serve_http, HttpConfig, HttpTranscoder, RequestError};
pub use lifecycle::{conn_id_of, ConnId};
pub use session::Protocol;
pub use table::{ConnState, ConnectionTable};
