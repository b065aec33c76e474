use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Args, Subcommand};
use flowpipe_balancer::PortSpec;
use flowpipe_gateway::ConfigLayer;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::exit::{io_error, CliError, CliResult};

pub mod balance;
pub mod gateway;
pub mod http;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Bridge a listen endpoint's connections onto framed stdin/stdout.
    Gateway(GatewayArgs),
    /// Serve HTTP/1.1, exchanging HTTPRequest/HTTPResponse frames.
    HttpServer(HttpServerArgs),
    /// Distribute input frames round-robin over named output ports.
    Balance(BalanceArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command) -> CliResult<i32> {
    match command {
        Command::Gateway(args) => gateway::run(args),
        Command::HttpServer(args) => http::run(args),
        Command::Balance(args) => balance::run(args),
        Command::Version(args) => version::run(args),
    }
}

#[derive(Args, Debug, Default)]
pub struct StreamArgs {
    /// Read frames from this file or FIFO instead of stdin.
    #[arg(long, value_name = "PATH")]
    pub input: Option<PathBuf>,
    /// Write frames to this file or FIFO instead of stdout.
    #[arg(long, value_name = "PATH")]
    pub output: Option<PathBuf>,
}

#[derive(Args, Debug, Default)]
pub struct TlsArgs {
    /// PEM certificate chain for tls:// and wss:// endpoints.
    #[arg(long, value_name = "PEM", env = "FLOWPIPE_TLS_CERT")]
    pub tls_cert: Option<PathBuf>,
    /// PEM private key matching --tls-cert.
    #[arg(long, value_name = "PEM", env = "FLOWPIPE_TLS_KEY")]
    pub tls_key: Option<PathBuf>,
    /// Require client certificates issued by this PEM bundle.
    #[arg(long, value_name = "PEM", env = "FLOWPIPE_TLS_CLIENT_CA")]
    pub tls_client_ca: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct GatewayArgs {
    /// Listen endpoint: tcp://host:port, tls://host:port, unix:///path,
    /// ws://host:port/path or wss://host:port/path.
    #[arg(required_unless_present = "iip")]
    pub endpoint: Option<String>,
    #[command(flatten)]
    pub streams: StreamArgs,
    #[command(flatten)]
    pub tls: TlsArgs,
    /// Take configuration from the first input frame (JSON object or endpoint).
    #[arg(long)]
    pub iip: bool,
    /// Maximum bytes per upstream packet.
    #[arg(long, value_name = "BYTES")]
    pub read_buffer: Option<usize>,
    /// Time allowed for TLS/WebSocket handshakes (e.g. 10s, 500ms).
    #[arg(long, value_name = "DURATION")]
    pub handshake_timeout: Option<String>,
    /// Outbound queue depth per connection.
    #[arg(long, value_name = "N")]
    pub queue: Option<usize>,
    /// Drop frames for already-closed connections instead of exiting.
    #[arg(long)]
    pub drop_late_frames: bool,
}

impl GatewayArgs {
    /// The command-line configuration layer; an IIP layer may override it.
    pub fn layer(&self) -> CliResult<ConfigLayer> {
        let handshake_timeout_ms = self
            .handshake_timeout
            .as_deref()
            .map(parse_duration)
            .transpose()?
            .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX));
        Ok(ConfigLayer {
            endpoint: self.endpoint.clone(),
            tls_cert: self.tls.tls_cert.clone(),
            tls_key: self.tls.tls_key.clone(),
            tls_client_ca: self.tls.tls_client_ca.clone(),
            read_buffer: self.read_buffer,
            handshake_timeout_ms,
            queue: self.queue,
            drop_late_frames: self.drop_late_frames.then_some(true),
        })
    }
}

#[derive(Args, Debug)]
pub struct HttpServerArgs {
    #[command(flatten)]
    pub gateway: GatewayArgs,
    /// Time allowed for a complete request after connect (e.g. 10s).
    #[arg(long, value_name = "DURATION", default_value = "10s")]
    pub request_timeout: String,
    /// Largest accepted request body.
    #[arg(long, value_name = "BYTES")]
    pub max_body: Option<usize>,
}

#[derive(Args, Debug)]
pub struct BalanceArgs {
    /// Output port, in round-robin order (repeatable).
    #[arg(long = "port", value_name = "NAME=PATH", required = true)]
    pub ports: Vec<PortSpec>,
    /// Read frames from this file or FIFO instead of stdin.
    #[arg(long, value_name = "PATH")]
    pub input: Option<PathBuf>,
    /// Control stream: frames whose body lists the ports to enable.
    #[arg(long, value_name = "PATH")]
    pub control: Option<PathBuf>,
    /// Frames buffered per port before dispatch blocks.
    #[arg(long, value_name = "N", default_value_t = flowpipe_balancer::DEFAULT_QUEUE_DEPTH)]
    pub queue: usize,
    /// Pause between attempts to reopen a failed port (e.g. 1s, 250ms).
    #[arg(long, value_name = "DURATION", default_value = "1s")]
    pub reopen_delay: String,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

pub fn parse_duration(input: &str) -> CliResult<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CliError::config("duration must not be empty"));
    }

    let (number, unit) = if let Some(num) = input.strip_suffix("ms") {
        (num, "ms")
    } else if let Some(num) = input.strip_suffix('s') {
        (num, "s")
    } else {
        (input, "s")
    };

    let value: u64 = number
        .parse()
        .map_err(|_| CliError::config(format!("invalid duration value: {input}")))?;

    if value == 0 {
        return Err(CliError::config("duration must be greater than zero"));
    }

    match unit {
        "ms" => Ok(Duration::from_millis(value)),
        _ => Ok(Duration::from_secs(value)),
    }
}

pub(crate) fn runtime() -> CliResult<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| io_error("failed to start runtime", err))
}

pub(crate) type FrameInput = Box<dyn AsyncRead + Unpin + Send>;
pub(crate) type FrameOutput = Box<dyn AsyncWrite + Unpin + Send>;

pub(crate) async fn open_input(path: Option<&Path>) -> CliResult<FrameInput> {
    match path {
        Some(path) => {
            let file = tokio::fs::File::open(path)
                .await
                .map_err(|err| io_error(&format!("cannot open input {}", path.display()), err))?;
            Ok(Box::new(file))
        }
        None => Ok(Box::new(tokio::io::stdin())),
    }
}

pub(crate) async fn open_output(path: Option<&Path>) -> CliResult<FrameOutput> {
    match path {
        Some(path) => {
            let file = tokio::fs::OpenOptions::new()
                .write(true)
                .open(path)
                .await
                .map_err(|err| io_error(&format!("cannot open output {}", path.display()), err))?;
            Ok(Box::new(file))
        }
        None => Ok(Box::new(tokio::io::stdout())),
    }
}

/// Resolves on Ctrl-C; never resolves if the handler cannot be installed.
pub(crate) async fn interrupted() {
    if tokio::signal::ctrl_c().await.is_err() {
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exit::CONFIG;

    #[test]
    fn parse_duration_seconds_and_millis() {
        assert_eq!(parse_duration("2s").unwrap(), Duration::from_secs(2));
        assert_eq!(parse_duration("150ms").unwrap(), Duration::from_millis(150));
        assert_eq!(parse_duration("3").unwrap(), Duration::from_secs(3));
    }

    #[test]
    fn parse_duration_rejects_invalid_values() {
        assert_eq!(parse_duration("0s").unwrap_err().code, CONFIG);
        assert!(parse_duration("bad").is_err());
        assert!(parse_duration("").is_err());
    }

    #[test]
    fn gateway_layer_from_flags() {
        let args = GatewayArgs {
            endpoint: Some("tcp://127.0.0.1:0".to_string()),
            streams: StreamArgs::default(),
            tls: TlsArgs::default(),
            iip: false,
            read_buffer: Some(512),
            handshake_timeout: Some("250ms".to_string()),
            queue: None,
            drop_late_frames: false,
        };
        let layer = args.layer().unwrap();
        assert_eq!(layer.handshake_timeout_ms, Some(250));
        assert_eq!(layer.read_buffer, Some(512));
        assert_eq!(layer.drop_late_frames, None);
    }
}
