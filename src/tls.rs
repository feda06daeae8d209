//! TLS identity shared by every HTTPS listener of a [`StaticServer`](crate::server::StaticServer)
//!
//! Certificates come from PEM files when both paths are configured, otherwise a
//! self-signed certificate for `localhost`/`127.0.0.1` is generated. The same
//! certificate is trusted by the upstream client so aliases can point at local
//! HTTPS listeners.

use crate::error::ServeError;
use rcgen::{generate_simple_self_signed, CertifiedKey};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{info, warn};

/// Where the listener certificate comes from
#[derive(Debug, Clone, Default)]
pub struct TlsSettings {
    /// Path to TLS certificate file (PEM format)
    pub cert: Option<PathBuf>,
    /// Path to TLS private key file (PEM format)
    pub key: Option<PathBuf>,
}

impl TlsSettings {
    pub fn has_tls_files(&self) -> bool {
        self.cert.is_some() && self.key.is_some()
    }
}

pub struct TlsIdentity {
    acceptor: TlsAcceptor,
    connector: TlsConnector,
}

impl TlsIdentity {
    pub fn load(settings: &TlsSettings) -> Result<Self, ServeError> {
        let (certs, key) = match (&settings.cert, &settings.key) {
            (Some(cert_path), Some(key_path)) => {
                let certs = load_certs(cert_path)?;
                let key = load_key(key_path)?;
                info!(cert = %cert_path.display(), key = %key_path.display(), "TLS enabled with provided certificates");
                (certs, key)
            }
            _ => {
                let (certs, key) = generate_self_signed_cert()?;
                warn!("TLS enabled with auto-generated self-signed certificate (not for production)");
                (certs, key)
            }
        };

        let provider = Arc::new(rustls::crypto::ring::default_provider());

        let mut roots = rustls::RootCertStore::empty();
        for cert in &certs {
            roots
                .add(cert.clone())
                .map_err(|e| ServeError::Tls(format!("untrusted certificate: {}", e)))?;
        }

        let server_config = rustls::ServerConfig::builder_with_provider(Arc::clone(&provider))
            .with_safe_default_protocol_versions()
            .map_err(|e| ServeError::Tls(e.to_string()))?
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| ServeError::Tls(format!("TLS configuration error: {}", e)))?;

        let client_config = rustls::ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| ServeError::Tls(e.to_string()))?
            .with_root_certificates(roots)
            .with_no_client_auth();

        Ok(Self {
            acceptor: TlsAcceptor::from(Arc::new(server_config)),
            connector: TlsConnector::from(Arc::new(client_config)),
        })
    }

    pub fn acceptor(&self) -> TlsAcceptor {
        self.acceptor.clone()
    }

    /// Client side, trusting the listener certificate
    pub fn connector(&self) -> TlsConnector {
        self.connector.clone()
    }
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, ServeError> {
    let file = File::open(path).map_err(|e| {
        ServeError::Tls(format!("Failed to open certificate file {}: {}", path.display(), e))
    })?;
    let mut reader = BufReader::new(file);
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| {
            ServeError::Tls(format!("Failed to parse certificates from {}: {}", path.display(), e))
        })?;

    if certs.is_empty() {
        return Err(ServeError::Tls(format!(
            "No certificates found in {}",
            path.display()
        )));
    }

    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, ServeError> {
    let file = File::open(path).map_err(|e| {
        ServeError::Tls(format!("Failed to open key file {}: {}", path.display(), e))
    })?;
    let mut reader = BufReader::new(file);

    loop {
        match rustls_pemfile::read_one(&mut reader).map_err(|e| {
            ServeError::Tls(format!("Failed to parse key from {}: {}", path.display(), e))
        })? {
            Some(rustls_pemfile::Item::Pkcs1Key(key)) => return Ok(key.into()),
            Some(rustls_pemfile::Item::Pkcs8Key(key)) => return Ok(key.into()),
            Some(rustls_pemfile::Item::Sec1Key(key)) => return Ok(key.into()),
            None => break,
            _ => continue,
        }
    }

    Err(ServeError::Tls(format!(
        "No private key found in {}",
        path.display()
    )))
}

fn generate_self_signed_cert(
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>), ServeError> {
    let subject_alt_names = vec!["localhost".to_string(), "127.0.0.1".to_string()];

    let CertifiedKey { cert, key_pair } = generate_simple_self_signed(subject_alt_names)
        .map_err(|e| ServeError::Tls(format!("Failed to generate self-signed certificate: {}", e)))?;

    let cert_der = CertificateDer::from(cert.der().to_vec());
    let key_der = PrivateKeyDer::try_from(key_pair.serialize_der())
        .map_err(|e| ServeError::Tls(format!("Failed to serialize private key: {}", e)))?;

    Ok((vec![cert_der], key_der))
}
