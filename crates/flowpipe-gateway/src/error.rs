/// Errors that can occur in gateway operations.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(#[from] flowpipe_transport::TransportError),

    /// Frame-level error on a shared pipe.
    #[error("frame error: {0}")]
    Frame(#[from] flowpipe_frame::FrameError),

    /// A frame on a shared pipe violates the gateway protocol.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// Invalid or inconsistent configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// The shared output pipe is no longer being written.
    #[error("shared output closed")]
    OutputClosed,

    /// A per-connection session failed (handshake, read or write).
    #[error("session error: {0}")]
    Session(#[from] std::io::Error),

    /// A coordinator task panicked or was cancelled.
    #[error("task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

pub type Result<T> = std::result::Result<T, GatewayError>;
