use std::collections::HashSet;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{BalancerError, Result};

pub const DEFAULT_QUEUE_DEPTH: usize = 64;
pub const DEFAULT_REOPEN_DELAY: Duration = Duration::from_secs(1);

/// A named output port and the path it writes to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortSpec {
    pub name: String,
    pub path: PathBuf,
}

impl FromStr for PortSpec {
    type Err = BalancerError;

    /// Parse `NAME=PATH`.
    fn from_str(s: &str) -> Result<Self> {
        let (name, path) = s
            .split_once('=')
            .ok_or_else(|| BalancerError::Config(format!("expected NAME=PATH, got {s:?}")))?;
        let name = name.trim();
        if name.is_empty() || name.contains(char::is_whitespace) {
            return Err(BalancerError::Config(format!("invalid port name {name:?}")));
        }
        if path.is_empty() {
            return Err(BalancerError::Config(format!("port {name} has no path")));
        }
        Ok(Self {
            name: name.to_string(),
            path: PathBuf::from(path),
        })
    }
}

#[derive(Debug, Clone)]
pub struct BalancerConfig {
    /// Output ports in round-robin order.
    pub ports: Vec<PortSpec>,
    /// Frames buffered per port before dispatch blocks.
    pub queue_depth: usize,
    /// Pause between attempts to reopen a failed port.
    pub reopen_delay: Duration,
}

impl BalancerConfig {
    pub fn new(ports: Vec<PortSpec>) -> Self {
        Self {
            ports,
            queue_depth: DEFAULT_QUEUE_DEPTH,
            reopen_delay: DEFAULT_REOPEN_DELAY,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.ports.is_empty() {
            return Err(BalancerError::Config("no output ports declared".to_string()));
        }
        if self.queue_depth == 0 {
            return Err(BalancerError::Config("queue depth must be non-zero".to_string()));
        }
        let mut seen = HashSet::new();
        for port in &self.ports {
            if !seen.insert(port.name.as_str()) {
                return Err(BalancerError::Config(format!(
                    "port {} declared twice",
                    port.name
                )));
            }
        }
        Ok(())
    }
}
