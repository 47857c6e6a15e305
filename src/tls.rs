use std::collections::BTreeMap;
use std::sync::Arc;

use rustls::client::WebPkiServerVerifier;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{CertificateError, DigitallySignedStruct, SignatureScheme};
use tracing::{debug, warn};

use crate::Result;
use crate::error::Error;
use crate::util::sha256_hex;

/// What a [`TrustEvaluator`] sees during a handshake.
pub struct ServerTrust<'a> {
    host: &'a str,
    chain: &'a [CertificateDer<'a>],
    platform_trusted: bool,
}

impl<'a> ServerTrust<'a> {
    pub fn host(&self) -> &str {
        self.host
    }

    /// Leaf certificate first.
    pub fn chain(&self) -> &[CertificateDer<'a>] {
        self.chain
    }

    /// Whether the chain passed WebPKI validation against the bundled roots.
    pub fn is_platform_trusted(&self) -> bool {
        self.platform_trusted
    }
}

pub trait TrustEvaluator: Send + Sync {
    fn evaluate(&self, trust: &ServerTrust<'_>) -> bool;
}

/// Accepts a server whose leaf certificate is exactly the pinned one, even
/// when it does not chain to a public root.
#[derive(Clone, Debug)]
pub struct PinnedCertificate {
    der: Vec<u8>,
}

impl PinnedCertificate {
    pub fn from_der(der: impl Into<Vec<u8>>) -> Self {
        Self { der: der.into() }
    }

    pub fn from_pem(pem: &[u8]) -> Result<Vec<Self>> {
        let mut pinned = Vec::new();
        for item in CertificateDer::pem_slice_iter(pem) {
            let certificate = item.map_err(|source| Error::TlsConfig {
                message: format!("failed to parse pinned PEM certificate: {source}"),
            })?;
            pinned.push(Self::from_der(certificate.as_ref()));
        }
        if pinned.is_empty() {
            return Err(Error::TlsConfig {
                message: "no certificate blocks found in pinned PEM".to_owned(),
            });
        }
        Ok(pinned)
    }
}

impl TrustEvaluator for PinnedCertificate {
    fn evaluate(&self, trust: &ServerTrust<'_>) -> bool {
        trust
            .chain()
            .first()
            .is_some_and(|leaf| leaf.as_ref() == self.der.as_slice())
    }
}

/// Accepts a publicly trusted chain containing a certificate with the pinned
/// SHA-256 digest.
#[derive(Clone, Debug)]
pub struct PinnedCertificateDigest {
    sha256_hex: String,
}

impl PinnedCertificateDigest {
    pub fn new(sha256_hex: impl AsRef<str>) -> Result<Self> {
        let normalized: String = sha256_hex
            .as_ref()
            .chars()
            .filter(|character| *character != ':')
            .collect::<String>()
            .to_ascii_lowercase();
        let valid = normalized.len() == 64 && normalized.chars().all(|c| c.is_ascii_hexdigit());
        if !valid {
            return Err(Error::TlsConfig {
                message: format!("invalid sha256 certificate digest: {}", sha256_hex.as_ref()),
            });
        }
        Ok(Self {
            sha256_hex: normalized,
        })
    }
}

impl TrustEvaluator for PinnedCertificateDigest {
    fn evaluate(&self, trust: &ServerTrust<'_>) -> bool {
        trust.is_platform_trusted()
            && trust
                .chain()
                .iter()
                .any(|certificate| sha256_hex(certificate.as_ref()) == self.sha256_hex)
    }
}

/// Per-host certificate pinning.
///
/// Hosts without evaluators get standard WebPKI validation. For a pinned host
/// at least one evaluator has to accept the presented chain.
#[derive(Clone, Default)]
pub struct ServerTrustConfiguration {
    evaluators: BTreeMap<String, Vec<Arc<dyn TrustEvaluator>>>,
}

impl ServerTrustConfiguration {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_evaluator(
        mut self,
        host: impl AsRef<str>,
        evaluator: Arc<dyn TrustEvaluator>,
    ) -> Self {
        self.evaluators
            .entry(host.as_ref().to_ascii_lowercase())
            .or_default()
            .push(evaluator);
        self
    }

    pub fn with_certificate_der(self, host: impl AsRef<str>, der: impl Into<Vec<u8>>) -> Self {
        self.with_evaluator(host, Arc::new(PinnedCertificate::from_der(der)))
    }

    pub fn with_certificate_pem(self, host: impl AsRef<str>, pem: &[u8]) -> Result<Self> {
        let host = host.as_ref().to_owned();
        let pinned = PinnedCertificate::from_pem(pem)?;
        Ok(pinned.into_iter().fold(self, |configuration, certificate| {
            configuration.with_evaluator(&host, Arc::new(certificate))
        }))
    }

    pub fn with_certificate_sha256(
        self,
        host: impl AsRef<str>,
        sha256_hex: impl AsRef<str>,
    ) -> Result<Self> {
        let digest = PinnedCertificateDigest::new(sha256_hex)?;
        Ok(self.with_evaluator(host, Arc::new(digest)))
    }

    pub fn is_empty(&self) -> bool {
        self.evaluators.is_empty()
    }

    pub fn pinned_hosts(&self) -> impl Iterator<Item = &str> {
        self.evaluators.keys().map(String::as_str)
    }

    pub(crate) fn evaluators_for(&self, host: &str) -> Option<&[Arc<dyn TrustEvaluator>]> {
        self.evaluators
            .get(&host.to_ascii_lowercase())
            .map(Vec::as_slice)
    }
}

impl std::fmt::Debug for ServerTrustConfiguration {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let hosts: BTreeMap<&str, usize> = self
            .evaluators
            .iter()
            .map(|(host, evaluators)| (host.as_str(), evaluators.len()))
            .collect();
        formatter
            .debug_struct("ServerTrustConfiguration")
            .field("evaluators", &hosts)
            .finish()
    }
}

pub(crate) fn build_rustls_tls_config(
    server_trust: Option<&ServerTrustConfiguration>,
) -> Result<rustls::ClientConfig> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let root_store = Arc::new(rustls::RootCertStore::from_iter(
        webpki_roots::TLS_SERVER_ROOTS.iter().cloned(),
    ));
    let config_builder = rustls::ClientConfig::builder_with_provider(Arc::clone(&provider))
        .with_safe_default_protocol_versions()
        .map_err(|source| Error::TlsConfig {
            message: source.to_string(),
        })?;

    let Some(server_trust) = server_trust.filter(|trust| !trust.is_empty()) else {
        return Ok(config_builder
            .with_root_certificates(root_store)
            .with_no_client_auth());
    };

    let verifier = PinningServerVerifier::new(server_trust.clone(), root_store, provider)?;
    Ok(config_builder
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier))
        .with_no_client_auth())
}

struct PinningServerVerifier {
    trust: ServerTrustConfiguration,
    webpki: Arc<WebPkiServerVerifier>,
}

impl PinningServerVerifier {
    fn new(
        trust: ServerTrustConfiguration,
        root_store: Arc<rustls::RootCertStore>,
        provider: Arc<CryptoProvider>,
    ) -> Result<Self> {
        let webpki = WebPkiServerVerifier::builder_with_provider(root_store, provider)
            .build()
            .map_err(|source| Error::TlsConfig {
                message: source.to_string(),
            })?;
        Ok(Self { trust, webpki })
    }
}

impl std::fmt::Debug for PinningServerVerifier {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("PinningServerVerifier")
            .field("trust", &self.trust)
            .finish()
    }
}

impl ServerCertVerifier for PinningServerVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        let platform = self.webpki.verify_server_cert(
            end_entity,
            intermediates,
            server_name,
            ocsp_response,
            now,
        );
        let host = host_of(server_name);
        let Some(evaluators) = self.trust.evaluators_for(&host) else {
            return platform;
        };

        let mut chain = Vec::with_capacity(intermediates.len() + 1);
        chain.push(end_entity.clone());
        chain.extend(intermediates.iter().cloned());
        let trust = ServerTrust {
            host: &host,
            chain: &chain,
            platform_trusted: platform.is_ok(),
        };

        if evaluators.iter().any(|evaluator| evaluator.evaluate(&trust)) {
            debug!(host = %host, "pinned server trust accepted");
            return Ok(ServerCertVerified::assertion());
        }
        warn!(host = %host, "pinned server trust rejected");
        Err(rustls::Error::InvalidCertificate(
            CertificateError::ApplicationVerificationFailure,
        ))
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.webpki.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.webpki.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.webpki.supported_verify_schemes()
    }
}

fn host_of(server_name: &ServerName<'_>) -> String {
    match server_name {
        ServerName::DnsName(name) => name.as_ref().to_ascii_lowercase(),
        ServerName::IpAddress(address) => std::net::IpAddr::from(*address).to_string(),
        _ => String::new(),
    }
}
