//! Server-side TLS: certificate loading and the per-connection handshake.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::server::WebPkiClientVerifier;
use tokio_rustls::rustls::{self, RootCertStore, ServerConfig};
use tokio_rustls::TlsAcceptor;
use tracing::debug;

use crate::error::{Result, TransportError};
use crate::stream::TransportStream;

/// PEM files for a TLS listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsSettings {
    /// Certificate chain presented to clients.
    pub cert: PathBuf,
    /// Private key for the leaf certificate.
    pub key: PathBuf,
    /// When set, clients must present a certificate chaining to one of these roots.
    pub client_ca: Option<PathBuf>,
}

impl TlsSettings {
    /// Load the PEM material and build an acceptor.
    ///
    /// Fails on unreadable files, empty certificate bundles, a missing key
    /// or a key that does not match the certificate.
    pub fn acceptor(&self) -> Result<TlsAcceptor> {
        let certs = load_certs(&self.cert)?;
        let key = load_key(&self.key)?;
        let provider = Arc::new(rustls::crypto::ring::default_provider());

        let builder = ServerConfig::builder_with_provider(Arc::clone(&provider))
            .with_safe_default_protocol_versions()
            .map_err(|err| TransportError::Tls(err.to_string()))?;

        let builder = match &self.client_ca {
            Some(path) => {
                let mut roots = RootCertStore::empty();
                for cert in load_certs(path)? {
                    roots.add(cert).map_err(|err| TransportError::TlsConfig {
                        path: path.clone(),
                        reason: err.to_string(),
                    })?;
                }
                let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider)
                    .build()
                    .map_err(|err| TransportError::TlsConfig {
                        path: path.clone(),
                        reason: err.to_string(),
                    })?;
                builder.with_client_cert_verifier(verifier)
            }
            None => builder.with_no_client_auth(),
        };

        let config = builder
            .with_single_cert(certs, key)
            .map_err(|err| TransportError::TlsConfig {
                path: self.key.clone(),
                reason: err.to_string(),
            })?;

        Ok(TlsAcceptor::from(Arc::new(config)))
    }
}

/// Run the server handshake on an accepted TCP stream.
///
/// Certificate verification (when client auth is configured) happens here,
/// so a failed peer never reaches the caller.
pub async fn accept_tls(
    acceptor: &TlsAcceptor,
    stream: TransportStream,
    remote: &str,
) -> Result<TransportStream> {
    let tcp = stream.into_tcp().map_err(|other| {
        TransportError::Tls(format!(
            "TLS requires a TCP stream, got {}",
            other.transport_name()
        ))
    })?;
    let tls = acceptor
        .accept(tcp)
        .await
        .map_err(|source| TransportError::Handshake {
            remote: remote.to_string(),
            source,
        })?;
    debug!(%remote, "TLS handshake complete");
    Ok(TransportStream::from_tls(tls))
}

fn open(path: &Path) -> Result<BufReader<File>> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|err| TransportError::TlsConfig {
            path: path.to_path_buf(),
            reason: err.to_string(),
        })
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let certs = rustls_pemfile::certs(&mut open(path)?)
        .collect::<std::io::Result<Vec<_>>>()
        .map_err(|err| TransportError::TlsConfig {
            path: path.to_path_buf(),
            reason: err.to_string(),
        })?;
    if certs.is_empty() {
        return Err(TransportError::TlsConfig {
            path: path.to_path_buf(),
            reason: "no certificates found".to_string(),
        });
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    rustls_pemfile::private_key(&mut open(path)?)
        .map_err(|err| TransportError::TlsConfig {
            path: path.to_path_buf(),
            reason: err.to_string(),
        })?
        .ok_or_else(|| TransportError::TlsConfig {
            path: path.to_path_buf(),
            reason: "no private key found".to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "fp-tls-{tag}-{}-{}",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .expect("time should be after epoch")
                .as_nanos()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn missing_certificate_file() {
        let settings = TlsSettings {
            cert: PathBuf::from("/nonexistent/cert.pem"),
            key: PathBuf::from("/nonexistent/key.pem"),
            client_ca: None,
        };
        let err = settings.acceptor().err().expect("acceptor should fail");
        assert!(matches!(err, TransportError::TlsConfig { path, .. } if path.ends_with("cert.pem")));
    }

    #[test]
    fn empty_bundle_and_missing_key_rejected() {
        let dir = temp_dir("empty");
        let cert = dir.join("cert.pem");
        let key = dir.join("key.pem");
        std::fs::write(&cert, b"not a pem file\n").unwrap();
        std::fs::write(&key, b"").unwrap();

        let settings = TlsSettings {
            cert: cert.clone(),
            key: key.clone(),
            client_ca: None,
        };
        let err = settings.acceptor().err().expect("acceptor should fail");
        assert!(
            matches!(&err, TransportError::TlsConfig { path, reason } if *path == cert && reason.contains("no certificates")),
            "{err}"
        );

        assert!(matches!(
            load_key(&key),
            Err(TransportError::TlsConfig { reason, .. }) if reason.contains("no private key")
        ));

        let _ = std::fs::remove_dir_all(&dir);
    }
}
