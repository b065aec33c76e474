use std::path::PathBuf;

/// Errors that can occur in transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The endpoint URL could not be parsed.
    #[error("invalid endpoint {endpoint:?}: {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },

    /// Failed to bind to the specified address.
    #[error("failed to bind to {address}: {source}")]
    Bind {
        address: String,
        source: std::io::Error,
    },

    /// Failed to accept an incoming connection.
    #[error("failed to accept connection: {0}")]
    Accept(std::io::Error),

    /// An I/O error occurred on the transport stream.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The socket path is too long for the platform.
    #[error("socket path too long ({len} bytes, max {max}): {path}")]
    PathTooLong {
        path: PathBuf,
        len: usize,
        max: usize,
    },

    /// TLS material could not be loaded.
    #[error("TLS configuration error ({path}): {reason}")]
    TlsConfig { path: PathBuf, reason: String },

    /// TLS settings are inconsistent.
    #[error("TLS configuration error: {0}")]
    Tls(String),

    /// The TLS handshake with a peer failed.
    #[error("TLS handshake with {remote} failed: {source}")]
    Handshake {
        remote: String,
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, TransportError>;
