//! Gateway configuration and the IIP (initial information packet) layer.

use std::path::PathBuf;
use std::time::Duration;

use flowpipe_frame::Frame;
use flowpipe_transport::{Endpoint, TlsSettings};
use serde::Deserialize;

use crate::error::{GatewayError, Result};

pub const DEFAULT_READ_BUFFER: usize = 32 * 1024;
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_CONNECTION_QUEUE: usize = 64;
pub const DEFAULT_OUTPUT_QUEUE: usize = 1024;

/// Resolved gateway settings.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub endpoint: Endpoint,
    pub tls: Option<TlsSettings>,
    /// Upper bound on bytes per upstream packet for byte-stream protocols.
    pub read_buffer: usize,
    pub handshake_timeout: Duration,
    /// Outbound queue depth per connection.
    pub connection_queue: usize,
    /// Depth of the shared output queue.
    pub output_queue: usize,
    /// Drop (rather than fail on) frames for already-retired connections.
    pub drop_late_frames: bool,
}

impl GatewayConfig {
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            tls: None,
            read_buffer: DEFAULT_READ_BUFFER,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            connection_queue: DEFAULT_CONNECTION_QUEUE,
            output_queue: DEFAULT_OUTPUT_QUEUE,
            drop_late_frames: false,
        }
    }
}

/// A partial configuration, from the command line or an IIP.
///
/// Layers are merged with [`merge`](Self::merge); the result is validated by
/// [`build`](Self::build).
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigLayer {
    pub endpoint: Option<String>,
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
    pub tls_client_ca: Option<PathBuf>,
    pub read_buffer: Option<usize>,
    pub handshake_timeout_ms: Option<u64>,
    pub queue: Option<usize>,
    pub drop_late_frames: Option<bool>,
}

impl ConfigLayer {
    /// Parse an IIP body: a JSON object, or a bare endpoint string.
    pub fn from_iip(frame: &Frame) -> Result<Self> {
        let text = std::str::from_utf8(&frame.body)
            .map_err(|_| GatewayError::Config("IIP body is not UTF-8".to_string()))?
            .trim();
        if text.is_empty() {
            return Err(GatewayError::Config("IIP body is empty".to_string()));
        }
        if text.starts_with('{') {
            return serde_json::from_str(text)
                .map_err(|err| GatewayError::Config(format!("invalid IIP: {err}")));
        }
        if text.starts_with('"') {
            let endpoint: String = serde_json::from_str(text)
                .map_err(|err| GatewayError::Config(format!("invalid IIP: {err}")))?;
            return Ok(Self::endpoint(endpoint));
        }
        Ok(Self::endpoint(text))
    }

    pub fn endpoint(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: Some(endpoint.into()),
            ..Self::default()
        }
    }

    /// Overlay `over` on `self`; fields present in `over` win.
    pub fn merge(self, over: ConfigLayer) -> ConfigLayer {
        ConfigLayer {
            endpoint: over.endpoint.or(self.endpoint),
            tls_cert: over.tls_cert.or(self.tls_cert),
            tls_key: over.tls_key.or(self.tls_key),
            tls_client_ca: over.tls_client_ca.or(self.tls_client_ca),
            read_buffer: over.read_buffer.or(self.read_buffer),
            handshake_timeout_ms: over.handshake_timeout_ms.or(self.handshake_timeout_ms),
            queue: over.queue.or(self.queue),
            drop_late_frames: over.drop_late_frames.or(self.drop_late_frames),
        }
    }

    pub fn build(self) -> Result<GatewayConfig> {
        let endpoint = self
            .endpoint
            .ok_or_else(|| GatewayError::Config("no endpoint configured".to_string()))?;
        let mut config = GatewayConfig::new(Endpoint::parse(&endpoint)?);

        config.tls = match (self.tls_cert, self.tls_key) {
            (Some(cert), Some(key)) => Some(TlsSettings {
                cert,
                key,
                client_ca: self.tls_client_ca,
            }),
            (None, None) if self.tls_client_ca.is_none() => None,
            (None, None) => {
                return Err(GatewayError::Config(
                    "a client CA needs a certificate and key".to_string(),
                ))
            }
            _ => {
                return Err(GatewayError::Config(
                    "certificate and key must be given together".to_string(),
                ))
            }
        };

        if let Some(read_buffer) = self.read_buffer {
            if read_buffer == 0 {
                return Err(GatewayError::Config("read buffer must be non-zero".to_string()));
            }
            config.read_buffer = read_buffer;
        }
        if let Some(ms) = self.handshake_timeout_ms {
            if ms == 0 {
                return Err(GatewayError::Config(
                    "handshake timeout must be non-zero".to_string(),
                ));
            }
            config.handshake_timeout = Duration::from_millis(ms);
        }
        if let Some(queue) = self.queue {
            if queue == 0 {
                return Err(GatewayError::Config("queue depth must be non-zero".to_string()));
            }
            config.connection_queue = queue;
        }
        config.drop_late_frames = self.drop_late_frames.unwrap_or(false);
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use flowpipe_transport::Scheme;

    use super::*;

    fn iip(body: &str) -> Frame {
        Frame::data("IIP", body.to_string())
    }

    #[test]
    fn bare_endpoint_iip() {
        let layer = ConfigLayer::from_iip(&iip("tcp://0.0.0.0:8080\n")).unwrap();
        assert_eq!(layer, ConfigLayer::endpoint("tcp://0.0.0.0:8080"));

        let quoted = ConfigLayer::from_iip(&iip("\"unix:///tmp/fp.sock\"")).unwrap();
        assert_eq!(quoted.endpoint.as_deref(), Some("unix:///tmp/fp.sock"));
    }

    #[test]
    fn json_iip_overrides_command_line() {
        let cli = ConfigLayer {
            endpoint: Some("tcp://127.0.0.1:1".to_string()),
            read_buffer: Some(1024),
            ..ConfigLayer::default()
        };
        let layer = ConfigLayer::from_iip(&iip(
            r#"{"endpoint": "ws://127.0.0.1:0/feed", "handshake_timeout_ms": 250, "drop_late_frames": true}"#,
        ))
        .unwrap();

        let config = cli.merge(layer).build().unwrap();
        assert_eq!(config.endpoint.scheme, Scheme::Ws);
        assert_eq!(config.endpoint.path.as_deref(), Some("/feed"));
        assert_eq!(config.read_buffer, 1024);
        assert_eq!(config.handshake_timeout, Duration::from_millis(250));
        assert!(config.drop_late_frames);
    }

    #[test]
    fn invalid_iip_rejected() {
        for body in ["", "  ", "{\"endpoint\": 5}", "{\"bogus\": 1}", "{not json"] {
            let err = ConfigLayer::from_iip(&iip(body)).unwrap_err();
            assert!(matches!(err, GatewayError::Config(_)), "{body:?}: {err}");
        }
    }

    #[test]
    fn build_validation() {
        assert!(matches!(
            ConfigLayer::default().build(),
            Err(GatewayError::Config(_))
        ));
        assert!(matches!(
            ConfigLayer::endpoint("bogus").build(),
            Err(GatewayError::Transport(_))
        ));

        let half_tls = ConfigLayer {
            tls_cert: Some(PathBuf::from("cert.pem")),
            ..ConfigLayer::endpoint("tls://127.0.0.1:0")
        };
        assert!(matches!(half_tls.build(), Err(GatewayError::Config(_))));

        let zero_buffer = ConfigLayer {
            read_buffer: Some(0),
            ..ConfigLayer::endpoint("tcp://127.0.0.1:0")
        };
        assert!(matches!(zero_buffer.build(), Err(GatewayError::Config(_))));
    }

    #[test]
    fn defaults() {
        let config = ConfigLayer::endpoint("tcp://127.0.0.1:0").build().unwrap();
        assert_eq!(config.read_buffer, DEFAULT_READ_BUFFER);
        assert_eq!(config.handshake_timeout, DEFAULT_HANDSHAKE_TIMEOUT);
        assert_eq!(config.connection_queue, DEFAULT_CONNECTION_QUEUE);
        assert!(config.tls.is_none());
        assert!(!config.drop_late_frames);
    }
}
