/// Errors that can occur while distributing frames.
#[derive(Debug, thiserror::Error)]
pub enum BalancerError {
    /// Frame-level error on the input or control pipe.
    #[error("frame error: {0}")]
    Frame(#[from] flowpipe_frame::FrameError),

    /// Invalid port declaration or balancer settings.
    #[error("configuration error: {0}")]
    Config(String),

    /// An output port could not be opened at startup.
    #[error("failed to open port {port}: {source}")]
    Open {
        port: String,
        #[source]
        source: std::io::Error,
    },

    /// A control command named a port that was never declared.
    #[error("unknown port {0:?} in control command")]
    UnknownPort(String),

    /// A port's forwarder stopped accepting frames.
    #[error("forwarder for port {0} is gone")]
    ForwarderGone(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, BalancerError>;
