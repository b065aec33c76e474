use std::fs::File;
use std::io::{self, Read};
use std::path::PathBuf;
use std::sync::Arc;

use flowpipe_balancer::{Balancer, BalancerConfig, FifoOpener};
use tracing::info;

use crate::cmd::{parse_duration, BalanceArgs};
use crate::exit::{balancer_error, io_error, CliResult, SUCCESS};

pub fn run(args: BalanceArgs) -> CliResult<i32> {
    let mut config = BalancerConfig::new(args.ports);
    config.queue_depth = args.queue;
    config.reopen_delay = parse_duration(&args.reopen_delay)?;
    config
        .validate()
        .map_err(|err| balancer_error("invalid configuration", err))?;

    let input: Box<dyn Read> = match &args.input {
        Some(path) => Box::new(
            File::open(path)
                .map_err(|err| io_error(&format!("cannot open input {}", path.display()), err))?,
        ),
        None => Box::new(io::stdin().lock()),
    };

    let opener = Arc::new(FifoOpener::new(&config.ports));
    let balancer = Balancer::start(&config, opener)
        .map_err(|err| balancer_error("cannot open ports", err))?;

    if let Some(path) = args.control {
        balancer
            .watch_control(LazyFile::new(path))
            .map_err(|err| balancer_error("cannot watch control stream", err))?;
    }

    let summary = balancer
        .run(input)
        .map_err(|err| balancer_error("balancer failed", err))?;
    info!(
        dispatched = summary.dispatched,
        dropped = summary.dropped,
        "balancer finished"
    );
    Ok(SUCCESS)
}

/// Opens the file on first read, so a control FIFO without a writer does
/// not hold up startup.
struct LazyFile {
    path: PathBuf,
    file: Option<File>,
}

impl LazyFile {
    fn new(path: PathBuf) -> Self {
        Self { path, file: None }
    }
}

impl Read for LazyFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let file = match &mut self.file {
            Some(file) => file,
            None => self.file.insert(File::open(&self.path)?),
        };
        file.read(buf)
    }
}
