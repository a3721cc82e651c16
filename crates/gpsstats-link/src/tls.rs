//! TLS client configuration for the MQTT link
//!
//! Builds a rustls [`ClientConfig`] from PEM files on disk. All failures here
//! are [`LinkError::Setup`]: they come from configuration, not from the network.

use std::fs::{self, File};
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{CryptoProvider, WebPkiSupportedAlgorithms};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{
    ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme, SupportedCipherSuite,
    SupportedProtocolVersion,
};
use tracing::{debug, warn};

use crate::LinkError;

static TLS13_ONLY: &[&SupportedProtocolVersion] = &[&rustls::version::TLS13];

/// Lowest TLS version the client will negotiate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TlsVersion {
    #[default]
    Tls12,
    Tls13,
}

impl TlsVersion {
    pub fn as_str(self) -> &'static str {
        match self {
            TlsVersion::Tls12 => "tlsv1.2",
            TlsVersion::Tls13 => "tlsv1.3",
        }
    }

    fn protocol_versions(self) -> &'static [&'static SupportedProtocolVersion] {
        match self {
            TlsVersion::Tls12 => rustls::DEFAULT_VERSIONS,
            TlsVersion::Tls13 => TLS13_ONLY,
        }
    }
}

impl FromStr for TlsVersion {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tlsv1.2" => Ok(TlsVersion::Tls12),
            "tlsv1.3" => Ok(TlsVersion::Tls13),
            other => Err(format!(
                "unsupported TLS version {:?} (expected tlsv1.2 or tlsv1.3)",
                other
            )),
        }
    }
}

impl std::fmt::Display for TlsVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// TLS options of the MQTT link
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsSettings {
    /// PEM bundle of trusted CA certificates
    pub ca_cert_file: Option<PathBuf>,
    /// Directory of PEM CA certificates (`*.pem`, `*.crt`)
    pub ca_cert_path: Option<PathBuf>,
    /// Client certificate chain (PEM)
    pub cert_file: Option<PathBuf>,
    /// Client private key (PEM)
    pub key_file: Option<PathBuf>,
    pub verify_peer: bool,
    pub version: TlsVersion,
    /// Colon separated rustls cipher suite names; `None` keeps the defaults
    pub ciphers: Option<String>,
}

impl Default for TlsSettings {
    fn default() -> Self {
        Self {
            ca_cert_file: None,
            ca_cert_path: None,
            cert_file: None,
            key_file: None,
            verify_peer: true,
            version: TlsVersion::default(),
            ciphers: None,
        }
    }
}

/// Builds the client configuration described by `settings`
pub fn client_config(settings: &TlsSettings) -> Result<Arc<ClientConfig>, LinkError> {
    let mut provider = rustls::crypto::ring::default_provider();
    if let Some(ref ciphers) = settings.ciphers {
        provider.cipher_suites = select_cipher_suites(&provider.cipher_suites, ciphers)?;
    }
    let provider = Arc::new(provider);

    let builder = ClientConfig::builder_with_provider(provider.clone())
        .with_protocol_versions(settings.version.protocol_versions())
        .map_err(|e| LinkError::Setup(format!("TLS {}: {}", settings.version, e)))?;

    let builder = if settings.verify_peer {
        builder.with_root_certificates(load_roots(settings)?)
    } else {
        warn!("TLS peer verification is disabled");
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerifier::new(&provider)))
    };

    let config = match (&settings.cert_file, &settings.key_file) {
        (Some(cert_file), Some(key_file)) => builder
            .with_client_auth_cert(load_certs(cert_file)?, load_key(key_file)?)
            .map_err(|e| LinkError::Setup(format!("client certificate: {}", e)))?,
        (None, None) => builder.with_no_client_auth(),
        _ => {
            return Err(LinkError::Setup(
                "client certificate and key must be configured together".into(),
            ));
        },
    };

    Ok(Arc::new(config))
}

/// Names accepted in [`TlsSettings::ciphers`]
pub fn cipher_suite_names() -> Vec<String> {
    rustls::crypto::ring::default_provider()
        .cipher_suites
        .iter()
        .map(suite_name)
        .collect()
}

fn suite_name(suite: &SupportedCipherSuite) -> String {
    format!("{:?}", suite.suite())
}

fn select_cipher_suites(
    available: &[SupportedCipherSuite],
    list: &str,
) -> Result<Vec<SupportedCipherSuite>, LinkError> {
    let mut selected = Vec::new();
    for name in list.split([':', ',']).map(str::trim).filter(|n| !n.is_empty()) {
        let suite = available
            .iter()
            .find(|suite| suite_name(suite).eq_ignore_ascii_case(name))
            .ok_or_else(|| LinkError::Setup(format!("unknown cipher suite {:?}", name)))?;
        selected.push(*suite);
    }
    if selected.is_empty() {
        return Err(LinkError::Setup("empty cipher suite list".into()));
    }
    Ok(selected)
}

fn load_roots(settings: &TlsSettings) -> Result<RootCertStore, LinkError> {
    let mut roots = RootCertStore::empty();

    if let Some(ref file) = settings.ca_cert_file {
        for cert in load_certs(file)? {
            roots
                .add(cert)
                .map_err(|e| LinkError::Setup(format!("{}: {}", file.display(), e)))?;
        }
    }

    if let Some(ref dir) = settings.ca_cert_path {
        let entries = fs::read_dir(dir)
            .map_err(|e| LinkError::Setup(format!("{}: {}", dir.display(), e)))?;
        for entry in entries.flatten() {
            let path = entry.path();
            let is_pem = path
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| matches!(ext, "pem" | "crt"));
            if !is_pem {
                continue;
            }
            match load_certs(&path) {
                Ok(certs) => {
                    let (added, ignored) = roots.add_parsable_certificates(certs);
                    debug!("{}: {} CA certificates added, {} ignored", path.display(), added, ignored);
                },
                Err(e) => warn!("Skipping {}: {}", path.display(), e),
            }
        }
    }

    if roots.is_empty() {
        return Err(LinkError::Setup("no usable CA certificates configured".into()));
    }
    Ok(roots)
}

fn open_pem(path: &Path) -> Result<BufReader<File>, LinkError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|e| LinkError::Setup(format!("{}: {}", path.display(), e)))
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, LinkError> {
    let mut reader = open_pem(path)?;
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| LinkError::Setup(format!("{}: {}", path.display(), e)))?;
    if certs.is_empty() {
        return Err(LinkError::Setup(format!(
            "{}: no certificates found",
            path.display()
        )));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, LinkError> {
    let mut reader = open_pem(path)?;
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| LinkError::Setup(format!("{}: {}", path.display(), e)))?
        .ok_or_else(|| LinkError::Setup(format!("{}: no private key found", path.display())))
}

/// Accepts any server certificate but still checks handshake signatures
#[derive(Debug)]
struct NoVerifier {
    algorithms: WebPkiSupportedAlgorithms,
}

impl NoVerifier {
    fn new(provider: &CryptoProvider) -> Self {
        Self {
            algorithms: provider.signature_verification_algorithms,
        }
    }
}

impl ServerCertVerifier for NoVerifier {
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
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}
