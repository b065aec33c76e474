use std::io::Read;
use std::sync::mpsc::{self, Receiver, Sender, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use flowpipe_frame::{is_bracket_close, is_bracket_open, is_port_close, port_close, Frame, FrameReader};
use tracing::{debug, info, warn};

use crate::config::BalancerConfig;
use crate::error::{BalancerError, Result};
use crate::port::{Forwarder, PortOpener, PortState};

/// Round-robin port selection with bracket pinning.
///
/// Pure routing state; owned by the dispatching thread.
#[derive(Debug)]
pub struct Dispatcher {
    ports: Vec<Arc<PortState>>,
    cursor: usize,
    pinned: Option<usize>,
    depth: usize,
}

impl Dispatcher {
    pub fn new(ports: Vec<Arc<PortState>>) -> Self {
        Self {
            ports,
            cursor: 0,
            pinned: None,
            depth: 0,
        }
    }

    /// Index of the port that should receive `frame`, or `None` to drop it.
    ///
    /// A bracketed sub-stream stays on the port it opened on; while that
    /// port is unavailable its frames are dropped, never moved elsewhere.
    pub fn route(&mut self, frame: &Frame) -> Option<usize> {
        if is_bracket_open(frame) {
            if let Some(port) = self.pinned {
                self.depth += 1;
                return self.if_available(port);
            }
            let port = self.next_available()?;
            self.pinned = Some(port);
            self.depth = 1;
            return Some(port);
        }
        if let Some(port) = self.pinned {
            if is_bracket_close(frame) {
                self.depth -= 1;
                if self.depth == 0 {
                    self.pinned = None;
                }
            }
            return self.if_available(port);
        }
        self.next_available()
    }

    /// Position the next scan starts from.
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn ports(&self) -> &[Arc<PortState>] {
        &self.ports
    }

    fn if_available(&self, port: usize) -> Option<usize> {
        self.ports[port].is_available().then_some(port)
    }

    fn next_available(&mut self) -> Option<usize> {
        let n = self.ports.len();
        let chosen = (0..n)
            .map(|step| (self.cursor + step) % n)
            .find(|&idx| self.ports[idx].is_available())?;
        self.cursor = (chosen + 1) % n;
        Some(chosen)
    }
}

/// Replace the enabled set with the space-separated port names in `body`.
///
/// An unknown name rejects the whole command and leaves every flag as it was.
pub fn apply_control(ports: &[Arc<PortState>], body: &[u8]) -> Result<()> {
    let text = std::str::from_utf8(body)
        .map_err(|_| BalancerError::Config("control command is not UTF-8".to_string()))?;
    let names: Vec<&str> = text.split_whitespace().collect();
    if let Some(unknown) = names
        .iter()
        .find(|name| !ports.iter().any(|p| p.name() == **name))
    {
        return Err(BalancerError::UnknownPort((*unknown).to_string()));
    }
    for port in ports {
        port.set_enabled(names.contains(&port.name()));
    }
    info!(enabled = ?names, "output set updated");
    Ok(())
}

const QUEUE_POLL: Duration = Duration::from_millis(5);

enum Offer {
    Queued,
    /// The port stopped being usable while its queue was full.
    Refused,
    Gone,
}

/// Queue `frame`, waiting on a full queue only while `usable` holds.
///
/// A forwarder stuck reopening its port never drains the queue, so a
/// blocking send could wait forever.
fn offer(queue: &SyncSender<Frame>, mut frame: Frame, usable: impl Fn() -> bool) -> Offer {
    loop {
        match queue.try_send(frame) {
            Ok(()) => return Offer::Queued,
            Err(TrySendError::Disconnected(_)) => return Offer::Gone,
            Err(TrySendError::Full(back)) => {
                if !usable() {
                    return Offer::Refused;
                }
                frame = back;
                std::thread::sleep(QUEUE_POLL);
            }
        }
    }
}

/// Totals from a finished run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub dispatched: u64,
    pub dropped: u64,
}

/// Fans one input frame stream out over named output ports.
///
/// One forwarder thread per port drains a bounded queue; the dispatching
/// thread blocks when the chosen port's queue is full.
pub struct Balancer {
    dispatcher: Dispatcher,
    queues: Vec<SyncSender<Frame>>,
    forwarders: Vec<JoinHandle<()>>,
    fatal_tx: Sender<BalancerError>,
    fatal_rx: Receiver<BalancerError>,
    summary: RunSummary,
}

impl Balancer {
    /// Open every port (in declaration order) and start the forwarders.
    pub fn start(config: &BalancerConfig, opener: Arc<dyn PortOpener>) -> Result<Self> {
        config.validate()?;

        let mut ports = Vec::with_capacity(config.ports.len());
        let mut queues = Vec::with_capacity(config.ports.len());
        let mut forwarders = Vec::with_capacity(config.ports.len());
        for spec in &config.ports {
            debug!(port = %spec.name, path = %spec.path.display(), "opening port");
            let writer = opener.open(&spec.name).map_err(|source| BalancerError::Open {
                port: spec.name.clone(),
                source,
            })?;
            let state = Arc::new(PortState::new(spec.name.clone()));
            let (tx, rx) = mpsc::sync_channel(config.queue_depth);
            let forwarder = Forwarder {
                state: Arc::clone(&state),
                rx,
                writer,
                opener: Arc::clone(&opener),
                reopen_delay: config.reopen_delay,
            };
            let handle = std::thread::Builder::new()
                .name(format!("fp-port-{}", spec.name))
                .spawn(move || forwarder.run())?;
            ports.push(state);
            queues.push(tx);
            forwarders.push(handle);
        }
        info!(ports = ports.len(), "balancer started");

        let (fatal_tx, fatal_rx) = mpsc::channel();
        Ok(Self {
            dispatcher: Dispatcher::new(ports),
            queues,
            forwarders,
            fatal_tx,
            fatal_rx,
            summary: RunSummary::default(),
        })
    }

    pub fn ports(&self) -> &[Arc<PortState>] {
        self.dispatcher.ports()
    }

    /// Read control commands from `control` on a background thread.
    ///
    /// A malformed control stream is fatal; it is reported by the next
    /// [`dispatch`](Self::dispatch) or by [`run`](Self::run).
    pub fn watch_control<C>(&self, control: C) -> Result<JoinHandle<()>>
    where
        C: Read + Send + 'static,
    {
        let ports = self.dispatcher.ports().to_vec();
        let fatal_tx = self.fatal_tx.clone();
        let handle = std::thread::Builder::new()
            .name("fp-control".to_string())
            .spawn(move || {
                let mut reader = FrameReader::new(control);
                loop {
                    match reader.next_frame() {
                        Ok(Some(frame)) if frame.is_control() => {
                            debug!(body_type = %frame.body_type, "ignoring control frame on control port");
                        }
                        Ok(Some(frame)) => {
                            if let Err(err) = apply_control(&ports, &frame.body) {
                                warn!(error = %err, "control command discarded");
                            }
                        }
                        Ok(None) => {
                            debug!("control stream ended");
                            return;
                        }
                        Err(err) => {
                            let _ = fatal_tx.send(err.into());
                            return;
                        }
                    }
                }
            })?;
        Ok(handle)
    }

    /// Route one frame. Returns `false` if it was dropped.
    pub fn dispatch(&mut self, frame: Frame) -> Result<bool> {
        if let Ok(err) = self.fatal_rx.try_recv() {
            return Err(err);
        }
        let Some(idx) = self.dispatcher.route(&frame) else {
            warn!(body_type = %frame.body_type, "no output port available; frame dropped");
            self.summary.dropped += 1;
            return Ok(false);
        };
        let port = &self.dispatcher.ports()[idx];
        match offer(&self.queues[idx], frame, || port.is_available()) {
            Offer::Queued => {
                self.summary.dispatched += 1;
                Ok(true)
            }
            Offer::Refused => {
                warn!(port = %port.name(), "port became unavailable; frame dropped");
                self.summary.dropped += 1;
                Ok(false)
            }
            Offer::Gone => Err(BalancerError::ForwarderGone(port.name().to_string())),
        }
    }

    /// Dispatch every frame from `input` until EOF or `PortClose`, then shut down.
    pub fn run<R: Read>(mut self, input: R) -> Result<RunSummary> {
        let mut reader = FrameReader::new(input);
        let outcome = loop {
            match reader.next_frame() {
                Ok(Some(frame)) if is_port_close(&frame) => {
                    info!(port = ?frame.port, "input port closed");
                    break Ok(());
                }
                Ok(Some(frame)) => {
                    if let Err(err) = self.dispatch(frame) {
                        break Err(err);
                    }
                }
                Ok(None) => {
                    info!("input ended");
                    break Ok(());
                }
                Err(err) => break Err(err.into()),
            }
        };
        let outcome = outcome.and_then(|()| match self.fatal_rx.try_recv() {
            Ok(err) => Err(err),
            Err(_) => Ok(()),
        });
        let summary = self.shutdown();
        outcome.map(|()| summary)
    }

    /// Send `PortClose` on every port, close the queues and join the
    /// forwarders. Ports stuck reopening are abandoned.
    pub fn shutdown(self) -> RunSummary {
        let Balancer {
            dispatcher,
            queues,
            forwarders,
            summary,
            ..
        } = self;
        for (port, queue) in dispatcher.ports().iter().zip(&queues) {
            match offer(queue, port_close(port.name()), || port.is_healthy()) {
                Offer::Queued => {}
                Offer::Refused => {
                    warn!(port = %port.name(), "port unavailable at shutdown; PortClose not sent");
                }
                Offer::Gone => debug!(port = %port.name(), "forwarder already stopped"),
            }
        }
        drop(queues);

        for (port, handle) in dispatcher.ports().iter().zip(forwarders) {
            if !port.is_healthy() {
                warn!(port = %port.name(), "port unavailable at shutdown; not waiting");
                continue;
            }
            if handle.join().is_err() {
                warn!(port = %port.name(), "forwarder panicked");
            }
        }
        info!(
            dispatched = summary.dispatched,
            dropped = summary.dropped,
            "balancer stopped"
        );
        summary
    }
}

#[cfg(test)]
mod tests {
    use flowpipe_frame::{bracket_close, bracket_open};

    use super::*;

    fn ports(names: &[&str]) -> Vec<Arc<PortState>> {
        names.iter().map(|n| Arc::new(PortState::new(*n))).collect()
    }

    fn frame() -> Frame {
        Frame::data("Item", "x")
    }

    #[test]
    fn round_robin_visits_every_port_once() {
        let mut d = Dispatcher::new(ports(&["a", "b", "c"]));
        let start = d.cursor();
        let routed: Vec<_> = (0..3).map(|_| d.route(&frame()).unwrap()).collect();
        assert_eq!(routed, vec![0, 1, 2]);
        assert_eq!(d.cursor(), start);
    }

    #[test]
    fn cursor_advances_past_chosen_port() {
        let ports = ports(&["a", "b", "c"]);
        let mut d = Dispatcher::new(ports.clone());
        assert_eq!(d.route(&frame()), Some(0));

        ports[1].set_enabled(false);
        assert_eq!(d.route(&frame()), Some(2));
        assert_eq!(d.route(&frame()), Some(0));
        assert_eq!(d.route(&frame()), Some(2));
    }

    #[test]
    fn degrades_to_remaining_port_then_drops() {
        let ports = ports(&["a", "b", "c"]);
        let mut d = Dispatcher::new(ports.clone());
        ports[0].set_enabled(false);
        ports[2].set_healthy(false);
        for _ in 0..4 {
            assert_eq!(d.route(&frame()), Some(1));
        }

        ports[1].set_enabled(false);
        assert_eq!(d.route(&frame()), None);
    }

    #[test]
    fn brackets_pin_one_port() {
        let mut d = Dispatcher::new(ports(&["a", "b"]));
        assert_eq!(d.route(&bracket_open("in")), Some(0));
        assert_eq!(d.route(&frame()), Some(0));
        assert_eq!(d.route(&bracket_open("in")), Some(0));
        assert_eq!(d.route(&frame()), Some(0));
        assert_eq!(d.route(&bracket_close("in")), Some(0));
        assert_eq!(d.route(&frame()), Some(0));
        assert_eq!(d.route(&bracket_close("in")), Some(0));

        // Released: rotation resumes after the pinned port.
        assert_eq!(d.route(&frame()), Some(1));
        assert_eq!(d.route(&frame()), Some(0));
    }

    #[test]
    fn pinned_port_going_unavailable_drops_until_released() {
        let ports = ports(&["a", "b"]);
        let mut d = Dispatcher::new(ports.clone());
        assert_eq!(d.route(&bracket_open("in")), Some(0));

        apply_control(&ports, b"").unwrap();
        assert_eq!(d.route(&frame()), None);
        assert_eq!(d.route(&bracket_close("in")), None);

        apply_control(&ports, b"a b").unwrap();
        ports[0].set_healthy(false);
        assert_eq!(d.route(&frame()), Some(1));

        // Re-pinned on a healthy port; the pin does not move when it fails.
        assert_eq!(d.route(&bracket_open("in")), Some(1));
        ports[1].set_healthy(false);
        ports[0].set_healthy(true);
        assert_eq!(d.route(&frame()), None);
        assert_eq!(d.route(&bracket_close("in")), None);
        assert_eq!(d.route(&frame()), Some(0));
    }

    #[test]
    fn unmatched_bracket_close_routes_normally() {
        let mut d = Dispatcher::new(ports(&["a", "b"]));
        assert_eq!(d.route(&bracket_close("in")), Some(0));
        assert_eq!(d.route(&frame()), Some(1));
    }

    #[test]
    fn control_sets_exact_enabled_set() {
        let ports = ports(&["a", "b", "c"]);
        apply_control(&ports, b"c a").unwrap();
        let enabled: Vec<_> = ports.iter().map(|p| p.is_enabled()).collect();
        assert_eq!(enabled, vec![true, false, true]);

        apply_control(&ports, b"").unwrap();
        assert!(ports.iter().all(|p| !p.is_enabled()));
    }

    #[test]
    fn unknown_port_discards_whole_command() {
        let ports = ports(&["a", "b"]);
        apply_control(&ports, b"a").unwrap();

        let err = apply_control(&ports, b"b zzz").unwrap_err();
        assert!(matches!(err, BalancerError::UnknownPort(name) if name == "zzz"));
        let enabled: Vec<_> = ports.iter().map(|p| p.is_enabled()).collect();
        assert_eq!(enabled, vec![true, false]);

        assert!(apply_control(&ports, &[0xff, 0xfe]).is_err());
    }
}
