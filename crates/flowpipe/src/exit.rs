use std::fmt;
use std::io;

use flowpipe_balancer::BalancerError;
use flowpipe_frame::FrameError;
use flowpipe_gateway::GatewayError;
use flowpipe_transport::TransportError;

// One exit-code taxonomy for every subcommand.
pub const SUCCESS: i32 = 0;
/// A shared pipe carried a malformed or inconsistent frame.
pub const PROTOCOL: i32 = 1;
/// Bad arguments, IIP, endpoint or TLS material; raised before serving.
pub const CONFIG: i32 = 2;
/// The process could not read or write a stream it depends on.
pub const IO: i32 = 3;

pub type CliResult<T> = Result<T, CliError>;

#[derive(Debug)]
pub struct CliError {
    pub code: i32,
    pub message: String,
}

impl CliError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::new(CONFIG, message)
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for CliError {}

pub fn io_error(context: &str, err: io::Error) -> CliError {
    CliError::new(IO, format!("{context}: {err}"))
}

pub fn transport_error(context: &str, err: TransportError) -> CliError {
    match err {
        TransportError::Accept(source) | TransportError::Io(source) => io_error(context, source),
        TransportError::Handshake { .. } => CliError::new(IO, format!("{context}: {err}")),
        other => CliError::config(format!("{context}: {other}")),
    }
}

pub fn frame_error(context: &str, err: FrameError) -> CliError {
    match err {
        FrameError::Io(source) => io_error(context, source),
        other => CliError::new(PROTOCOL, format!("{context}: {other}")),
    }
}

pub fn gateway_error(context: &str, err: GatewayError) -> CliError {
    match err {
        GatewayError::Transport(err) => transport_error(context, err),
        GatewayError::Frame(err) => frame_error(context, err),
        GatewayError::Config(_) => CliError::config(format!("{context}: {err}")),
        GatewayError::OutputClosed => CliError::new(IO, format!("{context}: {err}")),
        GatewayError::Session(source) => io_error(context, source),
        other => CliError::new(PROTOCOL, format!("{context}: {other}")),
    }
}

pub fn balancer_error(context: &str, err: BalancerError) -> CliError {
    match err {
        BalancerError::Frame(err) => frame_error(context, err),
        BalancerError::Config(_) | BalancerError::UnknownPort(_) => {
            CliError::config(format!("{context}: {err}"))
        }
        other => CliError::new(IO, format!("{context}: {other}")),
    }
}
