//! Round-robin distribution of one frame stream over named output ports.
//!
//! Each port is an independently failing byte stream (typically a FIFO)
//! served by its own forwarder thread. Availability is the conjunction of
//! an operator-controlled enabled flag and a health flag maintained by the
//! forwarder; frames are never queued for a port that is unavailable at
//! dispatch time.

pub mod balancer;
pub mod config;
pub mod error;
pub mod port;

pub use balancer::{apply_control, Balancer, Dispatcher, RunSummary};
pub use config::{BalancerConfig, PortSpec, DEFAULT_QUEUE_DEPTH, DEFAULT_REOPEN_DELAY};
pub use error::{BalancerError, Result};
pub use port::{FifoOpener, PortOpener, PortState};
