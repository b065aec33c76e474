//! Output ports: availability flags, opening, and the per-port forwarder.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, TryRecvError};
use std::sync::Arc;
use std::time::Duration;

use flowpipe_frame::{Frame, FrameError, FrameWriter};
use tracing::{debug, info, warn};

use crate::config::PortSpec;

/// Shared availability of one output port.
///
/// A port receives frames only while it is both enabled (by the control
/// stream) and healthy (its last write succeeded).
#[derive(Debug)]
pub struct PortState {
    name: String,
    enabled: AtomicBool,
    healthy: AtomicBool,
}

impl PortState {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            enabled: AtomicBool::new(true),
            healthy: AtomicBool::new(true),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_available(&self) -> bool {
        self.is_enabled() && self.is_healthy()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    pub(crate) fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::Release);
    }
}

/// Opens (and reopens) the byte stream behind a named port.
pub trait PortOpener: Send + Sync + 'static {
    fn open(&self, name: &str) -> io::Result<Box<dyn Write + Send>>;
}

/// Opens ports as files or FIFOs for writing.
///
/// Opening a FIFO blocks until a reader appears.
#[derive(Debug, Clone, Default)]
pub struct FifoOpener {
    paths: HashMap<String, PathBuf>,
}

impl FifoOpener {
    pub fn new(ports: &[PortSpec]) -> Self {
        Self {
            paths: ports
                .iter()
                .map(|p| (p.name.clone(), p.path.clone()))
                .collect(),
        }
    }
}

impl PortOpener for FifoOpener {
    fn open(&self, name: &str) -> io::Result<Box<dyn Write + Send>> {
        let path = self.paths.get(name).ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("no path for port {name}"))
        })?;
        let file = OpenOptions::new().write(true).open(path)?;
        debug!(port = %name, path = %path.display(), "port opened");
        Ok(Box::new(file))
    }
}

pub(crate) struct Forwarder {
    pub state: Arc<PortState>,
    pub rx: Receiver<Frame>,
    pub writer: Box<dyn Write + Send>,
    pub opener: Arc<dyn PortOpener>,
    pub reopen_delay: Duration,
}

impl Forwarder {
    /// Drain the queue into the port until every sender is gone.
    ///
    /// Flushes whenever the queue is momentarily empty. A failed write marks
    /// the port unhealthy, reopens it, and retries the frame in hand; frames
    /// buffered but not yet flushed at the time of failure are lost.
    pub fn run(self) {
        let Forwarder {
            state,
            rx,
            writer,
            opener,
            reopen_delay,
        } = self;
        let mut writer = FrameWriter::new(writer);
        let mut next = rx.recv().ok();

        while let Some(frame) = next.take() {
            loop {
                match writer.write_frame(&frame) {
                    Ok(()) => break,
                    Err(FrameError::Io(err)) => {
                        writer = reopen(&state, &*opener, reopen_delay, &err.to_string());
                    }
                    Err(err) => {
                        warn!(port = %state.name(), error = %err, "frame dropped");
                        break;
                    }
                }
            }
            next = match rx.try_recv() {
                Ok(frame) => Some(frame),
                Err(TryRecvError::Empty) => {
                    if let Err(err) = writer.flush() {
                        writer = reopen(&state, &*opener, reopen_delay, &err.to_string());
                    }
                    rx.recv().ok()
                }
                Err(TryRecvError::Disconnected) => None,
            };
        }

        if let Err(err) = writer.flush() {
            warn!(port = %state.name(), error = %err, "final flush failed");
        }
        debug!(port = %state.name(), "forwarder stopped");
    }
}

fn reopen(
    state: &PortState,
    opener: &dyn PortOpener,
    delay: Duration,
    cause: &str,
) -> FrameWriter<Box<dyn Write + Send>> {
    warn!(port = %state.name(), error = %cause, "write failed; port unavailable");
    state.set_healthy(false);
    loop {
        std::thread::sleep(delay);
        match opener.open(state.name()) {
            Ok(writer) => {
                state.set_healthy(true);
                info!(port = %state.name(), "port reopened");
                return FrameWriter::new(writer);
            }
            Err(err) => debug!(port = %state.name(), error = %err, "reopen failed"),
        }
    }
}
