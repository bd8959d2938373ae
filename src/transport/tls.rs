use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use super::TransportError;

/// Client-side TLS settings. Without a CA file the platform roots are trusted.
#[derive(Debug, Clone, Default)]
pub struct TlsClientOptions {
    pub ca_path: Option<PathBuf>,
    /// Overrides the name checked against the server certificate.
    pub server_name: Option<String>,
}

#[derive(Debug, Clone)]
pub struct TlsServerOptions {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

fn tls_err(context: &str, err: impl std::fmt::Display) -> TransportError {
    TransportError::Tls(format!("{}: {}", context, err))
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TransportError> {
    let file = File::open(path).map_err(|e| tls_err(&path.display().to_string(), e))?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| tls_err("parse certificates", e))?;
    if certs.is_empty() {
        return Err(TransportError::Tls(format!(
            "no certificates found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, TransportError> {
    let file = File::open(path).map_err(|e| tls_err(&path.display().to_string(), e))?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|e| tls_err("parse private key", e))?
        .ok_or_else(|| TransportError::Tls(format!("no private key found in {}", path.display())))
}

pub fn client_connector(options: &TlsClientOptions) -> Result<TlsConnector, TransportError> {
    let mut roots = RootCertStore::empty();
    match &options.ca_path {
        Some(path) => {
            for cert in load_certs(path)? {
                roots.add(cert).map_err(|e| tls_err("add CA certificate", e))?;
            }
        }
        None => {
            let native = rustls_native_certs::load_native_certs();
            for err in &native.errors {
                tracing::warn!(error = %err, "could not load a platform root certificate");
            }
            let (added, ignored) = roots.add_parsable_certificates(native.certs);
            tracing::debug!(added, ignored, "loaded platform root certificates");
        }
    }

    let config = ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .map_err(|e| tls_err("protocol versions", e))?
    .with_root_certificates(roots)
    .with_no_client_auth();
    Ok(TlsConnector::from(Arc::new(config)))
}

pub fn server_acceptor(options: &TlsServerOptions) -> Result<TlsAcceptor, TransportError> {
    let certs = load_certs(&options.cert_path)?;
    let key = load_key(&options.key_path)?;
    let config = ServerConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .map_err(|e| tls_err("protocol versions", e))?
    .with_no_client_auth()
    .with_single_cert(certs, key)
    .map_err(|e| tls_err("server certificate", e))?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Name to verify the server certificate against: the override, else the host part of `addr`.
pub fn server_name(addr: &str, name_override: Option<&str>) -> Result<ServerName<'static>, TransportError> {
    let host = match name_override {
        Some(name) => name,
        None => host_of(addr),
    };
    ServerName::try_from(host.to_string()).map_err(|e| tls_err("server name", e))
}

fn host_of(addr: &str) -> &str {
    let host = match addr.rsplit_once(':') {
        Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => host,
        _ => addr,
    };
    host.trim_start_matches('[').trim_end_matches(']')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_is_split_from_port() {
        assert_eq!(host_of("controlplane.local:8899"), "controlplane.local");
        assert_eq!(host_of("[::1]:8899"), "::1");
        assert_eq!(host_of("localhost"), "localhost");
    }

    #[test]
    fn missing_certificate_file_is_reported() {
        let err = server_acceptor(&TlsServerOptions {
            cert_path: PathBuf::from("/nonexistent/cert.pem"),
            key_path: PathBuf::from("/nonexistent/key.pem"),
        })
        .err()
        .unwrap();
        assert!(matches!(err, TransportError::Tls(_)));
    }
}
