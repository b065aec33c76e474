//! Endpoint URLs: `tcp://host:port`, `tls://host:port`, `unix:///path`,
//! `ws://host:port/path`, `wss://host:port/path`.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::{Result, TransportError};

/// Transport scheme of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Tcp,
    Tls,
    Unix,
    Ws,
    Wss,
}

impl Scheme {
    pub fn as_str(self) -> &'static str {
        match self {
            Scheme::Tcp => "tcp",
            Scheme::Tls => "tls",
            Scheme::Unix => "unix",
            Scheme::Ws => "ws",
            Scheme::Wss => "wss",
        }
    }

    /// Whether connections need a TLS handshake before use.
    pub fn is_tls(self) -> bool {
        matches!(self, Scheme::Tls | Scheme::Wss)
    }

    pub fn is_websocket(self) -> bool {
        matches!(self, Scheme::Ws | Scheme::Wss)
    }
}

/// Where a listener binds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    /// `host:port`, resolved at bind time.
    Inet(String),
    /// Filesystem path of a Unix domain socket.
    Path(PathBuf),
}

/// A parsed listen endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub scheme: Scheme,
    pub address: Address,
    /// Request path for WebSocket endpoints (`/` when omitted).
    pub path: Option<String>,
}

impl Endpoint {
    pub fn parse(input: &str) -> Result<Self> {
        let invalid = |reason: &str| TransportError::InvalidEndpoint {
            endpoint: input.to_string(),
            reason: reason.to_string(),
        };

        let (scheme, rest) = input
            .split_once("://")
            .ok_or_else(|| invalid("expected <scheme>://<address>"))?;
        let scheme = match scheme.to_ascii_lowercase().as_str() {
            "tcp" => Scheme::Tcp,
            "tls" => Scheme::Tls,
            "unix" => Scheme::Unix,
            "ws" => Scheme::Ws,
            "wss" => Scheme::Wss,
            _ => return Err(invalid("unknown scheme (tcp, tls, unix, ws, wss)")),
        };

        if scheme == Scheme::Unix {
            if !rest.starts_with('/') || rest.len() < 2 {
                return Err(invalid("unix endpoints need an absolute path (unix:///path)"));
            }
            return Ok(Self {
                scheme,
                address: Address::Path(PathBuf::from(rest)),
                path: None,
            });
        }

        let (authority, path) = match rest.find('/') {
            Some(idx) => (&rest[..idx], Some(&rest[idx..])),
            None => (rest, None),
        };
        validate_authority(authority).map_err(|reason| invalid(&reason))?;

        let path = if scheme.is_websocket() {
            Some(path.unwrap_or("/").to_string())
        } else if path.is_some_and(|p| p != "/") {
            return Err(invalid("only WebSocket endpoints take a path"));
        } else {
            None
        };

        Ok(Self {
            scheme,
            address: Address::Inet(authority.to_string()),
            path,
        })
    }
}

fn validate_authority(authority: &str) -> std::result::Result<(), String> {
    let (host, port) = authority
        .rsplit_once(':')
        .ok_or_else(|| "expected host:port".to_string())?;
    if host.is_empty() {
        return Err("missing host".to_string());
    }
    port.parse::<u16>()
        .map(|_| ())
        .map_err(|_| format!("invalid port {port:?}"))
}

impl FromStr for Endpoint {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.address {
            Address::Inet(authority) => write!(f, "{}://{}", self.scheme.as_str(), authority)?,
            Address::Path(path) => write!(f, "{}://{}", self.scheme.as_str(), path.display())?,
        }
        if let Some(path) = &self.path {
            write!(f, "{path}")?;
        }
        Ok(())
    }
}
