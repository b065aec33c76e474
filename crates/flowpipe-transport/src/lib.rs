//! Listen endpoints for flowpipe gateways.
//!
//! Provides a unified interface over the transports a gateway accepts on:
//! - TCP (`tcp://`, and underneath `ws://`)
//! - TLS over TCP (`tls://`, `wss://`) via rustls
//! - Unix domain sockets (`unix://`)
//!
//! This is the lowest layer of flowpipe. Everything network-facing builds on
//! the [`TransportStream`] type provided here.

pub mod endpoint;
pub mod error;
pub mod listener;
pub mod stream;
pub mod tls;
pub mod uds;

pub use endpoint::{Address, Endpoint, Scheme};
pub use error::{Result, TransportError};
pub use listener::Listener;
pub use stream::TransportStream;
pub use tls::{accept_tls, TlsSettings};
pub use tokio_rustls::TlsAcceptor;
pub use uds::UnixSocketListener;
