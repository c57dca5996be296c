//! TLS termination and back-end connectors.
//!
//! Inbound connections are terminated with a certificate selected by SNI
//! through a [`CertificateProvider`]. The file-backed provider loads a
//! default chain plus optional per-domain PEMs at startup; an ACME-backed
//! provider would implement the same trait.
//!
//! Outbound TLS uses two connectors: one verifying against webpki roots
//! (plus an optional extra CA file), and one that skips verification for
//! back-ends with self-signed certificates.

use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::io::{self, BufReader};
use std::path::Path;
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::ring;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig, SignatureScheme};
use thiserror::Error;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, warn};

use crate::backend::normalize;

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("failed to read {path}: {source}")]
    ReadFile {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("invalid certificate or key in {path}: {detail}")]
    InvalidPem { path: String, detail: String },

    #[error("no certificate available for '{0}'")]
    NoCertificate(String),
}

/// Resolves a certificate chain and private key for a server name.
///
/// Implementations must be safe to call concurrently, once per connection.
/// An empty server name requests the default certificate.
pub trait CertificateProvider: fmt::Debug + Send + Sync {
    fn certificate(&self, server_name: &str) -> Result<Arc<CertifiedKey>, TlsError>;
}

/// Certificate provider backed by local PEM files.
///
/// The default chain and key are mandatory. A certificate directory may
/// hold per-domain pairs named `<domain>.crt`/`<domain>.key`; a `_.` file
/// name prefix stands for a wildcard label (`_.example.com.crt` serves
/// `*.example.com`).
#[derive(Debug)]
pub struct FileCertificateProvider {
    default: Arc<CertifiedKey>,
    by_name: HashMap<String, Arc<CertifiedKey>>,
}

impl FileCertificateProvider {
    pub fn load(
        default_cert: &Path,
        default_key: &Path,
        cert_dir: Option<&Path>,
    ) -> Result<Self, TlsError> {
        let default = Arc::new(load_certified_key(default_cert, default_key)?);

        let mut by_name = HashMap::new();
        if let Some(dir) = cert_dir {
            let entries = std::fs::read_dir(dir).map_err(|source| TlsError::ReadFile {
                path: dir.display().to_string(),
                source,
            })?;

            for entry in entries {
                let entry = entry.map_err(|source| TlsError::ReadFile {
                    path: dir.display().to_string(),
                    source,
                })?;
                let cert_path = entry.path();
                if cert_path.extension().and_then(|e| e.to_str()) != Some("crt") {
                    continue;
                }
                let Some(stem) = cert_path.file_stem().and_then(|s| s.to_str()) else {
                    continue;
                };

                let key_path = cert_path.with_extension("key");
                let certified = load_certified_key(&cert_path, &key_path)?;
                debug!(domain = %stem, path = %cert_path.display(), "loaded certificate");
                by_name.insert(normalize(stem), Arc::new(certified));
            }
        }

        Ok(Self { default, by_name })
    }

    /// Number of per-domain certificates loaded beside the default.
    pub fn domain_count(&self) -> usize {
        self.by_name.len()
    }
}

impl CertificateProvider for FileCertificateProvider {
    fn certificate(&self, server_name: &str) -> Result<Arc<CertifiedKey>, TlsError> {
        if let Some(certified) = self.by_name.get(server_name) {
            return Ok(Arc::clone(certified));
        }

        // Wildcard file: leftmost label replaced by `_`.
        if let Some((_, parent)) = server_name.split_once('.') {
            if let Some(certified) = self.by_name.get(&format!("_.{parent}")) {
                return Ok(Arc::clone(certified));
            }
        }

        Ok(Arc::clone(&self.default))
    }
}

/// rustls certificate resolver consulting a [`CertificateProvider`] with
/// the SNI name of each ClientHello.
#[derive(Debug)]
struct SniResolver {
    provider: Arc<dyn CertificateProvider>,
}

impl SniResolver {
    /// Look up the certificate for an optional SNI name. A provider
    /// failure yields `None`, which aborts the handshake.
    fn certificate_for(&self, server_name: Option<&str>) -> Option<Arc<CertifiedKey>> {
        let server_name = server_name.map(normalize).unwrap_or_default();

        match self.provider.certificate(&server_name) {
            Ok(certified) => Some(certified),
            Err(error) => {
                warn!(server_name = %server_name, error = %error, "certificate unavailable");
                None
            }
        }
    }
}

impl ResolvesServerCert for SniResolver {
    fn resolve(&self, client_hello: ClientHello) -> Option<Arc<CertifiedKey>> {
        self.certificate_for(client_hello.server_name())
    }
}

/// Build the TLS acceptor used for inbound connections.
pub fn acceptor(provider: Arc<dyn CertificateProvider>) -> TlsAcceptor {
    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(SniResolver { provider }));
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    TlsAcceptor::from(Arc::new(config))
}

/// Outbound TLS connectors for the two TLS-enabled endpoint modes.
#[derive(Clone)]
pub struct BackendConnectors {
    verified: TlsConnector,
    insecure: TlsConnector,
}

impl BackendConnectors {
    /// Build both connectors. `extra_ca` adds a PEM bundle to the verified
    /// root store, for back-ends signed by a private CA.
    pub fn new(extra_ca: Option<&Path>) -> Result<Self, TlsError> {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        if let Some(path) = extra_ca {
            for cert in load_certs(path)? {
                roots.add(cert).map_err(|e| TlsError::InvalidPem {
                    path: path.display().to_string(),
                    detail: e.to_string(),
                })?;
            }
        }

        let verified = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();

        let insecure = ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(SkipVerification::new())
            .with_no_client_auth();

        Ok(Self {
            verified: TlsConnector::from(Arc::new(verified)),
            insecure: TlsConnector::from(Arc::new(insecure)),
        })
    }

    pub fn verified(&self) -> &TlsConnector {
        &self.verified
    }

    pub fn insecure(&self) -> &TlsConnector {
        &self.insecure
    }
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let file = File::open(path).map_err(|source| TlsError::ReadFile {
        path: path.display().to_string(),
        source,
    })?;
    let mut reader = BufReader::new(file);

    rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TlsError::InvalidPem {
            path: path.display().to_string(),
            detail: e.to_string(),
        })
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    let file = File::open(path).map_err(|source| TlsError::ReadFile {
        path: path.display().to_string(),
        source,
    })?;
    let mut reader = BufReader::new(file);

    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| TlsError::InvalidPem {
            path: path.display().to_string(),
            detail: e.to_string(),
        })?
        .ok_or_else(|| TlsError::InvalidPem {
            path: path.display().to_string(),
            detail: "no private key found".to_string(),
        })
}

fn load_certified_key(cert_path: &Path, key_path: &Path) -> Result<CertifiedKey, TlsError> {
    let certs = load_certs(cert_path)?;
    if certs.is_empty() {
        return Err(TlsError::InvalidPem {
            path: cert_path.display().to_string(),
            detail: "no certificates found".to_string(),
        });
    }
    let key = load_private_key(key_path)?;

    let signing_key = ring::sign::any_supported_type(&key).map_err(|e| TlsError::InvalidPem {
        path: key_path.display().to_string(),
        detail: e.to_string(),
    })?;

    Ok(CertifiedKey::new(certs, signing_key))
}

// Certificate verifier that skips verification (INSECURE).
#[derive(Debug)]
struct SkipVerification;

impl SkipVerification {
    fn new() -> Arc<Self> {
        Arc::new(Self)
    }
}

impl ServerCertVerifier for SkipVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
            SignatureScheme::ED448,
        ]
    }
}
