mod cmd;
mod exit;
mod logging;

use clap::Parser;

use crate::cmd::Command;
use crate::logging::LoggingArgs;

#[derive(Parser, Debug)]
#[command(
    name = "flowpipe",
    version,
    about = "Network gateways and load balancing for FBP pipes"
)]
struct Cli {
    #[command(flatten)]
    logging: LoggingArgs,

    #[command(subcommand)]
    command: Command,
}

fn main() {
    let cli = Cli::parse();
    cli.logging.init();

    match cmd::run(cli.command) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(err.code);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_gateway_subcommand() {
        let cli = Cli::try_parse_from([
            "flowpipe",
            "gateway",
            "tcp://127.0.0.1:9000",
            "--read-buffer",
            "4096",
            "--handshake-timeout",
            "3s",
        ])
        .expect("gateway args should parse");

        let Command::Gateway(args) = cli.command else {
            panic!("expected gateway");
        };
        assert_eq!(args.endpoint.as_deref(), Some("tcp://127.0.0.1:9000"));
        assert_eq!(args.read_buffer, Some(4096));
    }

    #[test]
    fn gateway_needs_endpoint_or_iip() {
        let err = Cli::try_parse_from(["flowpipe", "gateway"]).expect_err("should fail");
        assert_eq!(err.kind(), clap::error::ErrorKind::MissingRequiredArgument);

        let cli = Cli::try_parse_from(["flowpipe", "gateway", "--iip"]).expect("iip alone is enough");
        assert!(matches!(cli.command, Command::Gateway(_)));
    }

    #[test]
    fn parses_balance_ports_in_order() {
        let cli = Cli::try_parse_from([
            "flowpipe",
            "balance",
            "--port",
            "a=/tmp/a.fifo",
            "--port",
            "b=/tmp/b.fifo",
            "--reopen-delay",
            "250ms",
        ])
        .expect("balance args should parse");

        let Command::Balance(args) = cli.command else {
            panic!("expected balance");
        };
        let names: Vec<_> = args.ports.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn rejects_malformed_port_spec() {
        let err = Cli::try_parse_from(["flowpipe", "balance", "--port", "nopath"])
            .expect_err("should fail");
        assert_eq!(err.kind(), clap::error::ErrorKind::ValueValidation);
    }

    #[test]
    fn log_flags_are_global() {
        let cli = Cli::try_parse_from([
            "flowpipe",
            "version",
            "--log-level",
            "debug",
            "--log-format",
            "json",
        ])
        .expect("global flags should parse after subcommand");
        assert_eq!(cli.logging.log_level, crate::logging::LogLevel::Debug);
    }
}
