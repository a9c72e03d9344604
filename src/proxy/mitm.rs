//! MITM tunnel interception support.
//!
//! The MITM collaborator decides, per CONNECT request, whether the
//! destination is presumed to speak TLS, and supplies both TLS engines for
//! an intercepted tunnel: the upstream-facing client configuration and the
//! client-facing server configuration carrying a freshly minted certificate
//! for the requested host. [`CertificateAuthority`] is the provided
//! implementation, with an in-memory CA and a per-host leaf cache.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose,
};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig, SignatureScheme};
use tracing::{debug, info};

use crate::error::{ProxyError, Result};

/// Decides interception and supplies both TLS engines for a tunnel
pub trait MitmManager: Send + Sync {
    /// Whether the CONNECT destination is presumed to speak TLS.
    ///
    /// Derived from request context; a destination that is not presumed to
    /// speak TLS gets a blind relay tunnel instead of interception.
    fn presumes_tls(&self, host: &str, port: u16) -> bool {
        let _ = host;
        port == 443
    }

    /// TLS client configuration for the proxy-to-origin session
    fn upstream_config(&self, host: &str) -> Result<Arc<ClientConfig>>;

    /// TLS server configuration for the client-facing session, carrying a
    /// certificate for `host`
    fn client_facing_config(&self, host: &str) -> Result<Arc<ServerConfig>>;
}

/// Certificate authority configuration
#[derive(Debug, Clone)]
pub struct CaConfig {
    /// Organization name on the CA and generated certificates
    pub organization: String,
    /// Common name of the CA root
    pub common_name: String,
    /// Destination ports presumed to speak TLS
    pub tls_ports: Vec<u16>,
    /// Skip upstream certificate verification. Only for test rigs talking to
    /// self-signed origins.
    pub accept_invalid_upstream_certs: bool,
}

impl Default for CaConfig {
    fn default() -> Self {
        Self {
            organization: "Viaduct Proxy".to_string(),
            common_name: "Viaduct Proxy CA".to_string(),
            tls_ports: vec![443],
            accept_invalid_upstream_certs: false,
        }
    }
}

/// In-memory certificate authority for MITM interception.
///
/// Generates a root at construction and signs one leaf per intercepted host,
/// cached for the lifetime of the authority. The root PEM can be exported
/// for installation into client trust stores.
pub struct CertificateAuthority {
    ca_cert: Certificate,
    ca_key: KeyPair,
    config: CaConfig,
    upstream: Arc<ClientConfig>,
    leaf_cache: Mutex<HashMap<String, Arc<ServerConfig>>>,
}

impl CertificateAuthority {
    pub fn new(config: CaConfig) -> Result<Self> {
        info!("Generating MITM CA certificate");

        let ca_key = KeyPair::generate()
            .map_err(|e| ProxyError::Certificate(format!("CA key generation failed: {}", e)))?;

        let mut params = CertificateParams::default();
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);

        let mut distinguished_name = DistinguishedName::new();
        distinguished_name.push(DnType::OrganizationName, &config.organization);
        distinguished_name.push(DnType::CommonName, &config.common_name);
        params.distinguished_name = distinguished_name;

        params.not_before = rcgen::date_time_ymd(2024, 1, 1);
        params.not_after = rcgen::date_time_ymd(2034, 1, 1);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];

        let ca_cert = params
            .self_signed(&ca_key)
            .map_err(|e| ProxyError::Certificate(format!("CA self-signing failed: {}", e)))?;

        let upstream = build_upstream_config(config.accept_invalid_upstream_certs);

        Ok(Self {
            ca_cert,
            ca_key,
            config,
            upstream,
            leaf_cache: Mutex::new(HashMap::new()),
        })
    }

    /// CA root certificate in PEM form, for client trust-store installation
    pub fn ca_certificate_pem(&self) -> String {
        self.ca_cert.pem()
    }

    /// CA root certificate in DER form
    pub fn ca_certificate_der(&self) -> CertificateDer<'static> {
        self.ca_cert.der().clone()
    }

    /// Mint (or fetch from cache) the serving config for one host
    fn issue(&self, host: &str) -> Result<Arc<ServerConfig>> {
        if let Some(config) = self.leaf_cache.lock().get(host) {
            return Ok(config.clone());
        }

        debug!("Minting leaf certificate for {}", host);

        let leaf_key = KeyPair::generate()
            .map_err(|e| ProxyError::Certificate(format!("leaf key generation failed: {}", e)))?;

        let mut params = CertificateParams::new(vec![host.to_string()])
            .map_err(|e| ProxyError::Certificate(format!("bad certificate name: {}", e)))?;

        let mut distinguished_name = DistinguishedName::new();
        distinguished_name.push(DnType::OrganizationName, &self.config.organization);
        distinguished_name.push(DnType::CommonName, host);
        params.distinguished_name = distinguished_name;

        params.not_before = rcgen::date_time_ymd(2024, 1, 1);
        params.not_after = rcgen::date_time_ymd(2034, 1, 1);
        params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

        let leaf = params
            .signed_by(&leaf_key, &self.ca_cert, &self.ca_key)
            .map_err(|e| ProxyError::Certificate(format!("leaf signing failed: {}", e)))?;

        let chain = vec![leaf.der().clone(), self.ca_cert.der().clone()];
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(leaf_key.serialize_der()));

        let mut server_config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(chain, key)
            .map_err(|e| ProxyError::Certificate(format!("serving config failed: {}", e)))?;
        server_config.alpn_protocols = vec![b"http/1.1".to_vec()];

        let server_config = Arc::new(server_config);
        self.leaf_cache
            .lock()
            .insert(host.to_string(), server_config.clone());
        Ok(server_config)
    }
}

impl MitmManager for CertificateAuthority {
    fn presumes_tls(&self, _host: &str, port: u16) -> bool {
        self.config.tls_ports.contains(&port)
    }

    fn upstream_config(&self, _host: &str) -> Result<Arc<ClientConfig>> {
        Ok(self.upstream.clone())
    }

    fn client_facing_config(&self, host: &str) -> Result<Arc<ServerConfig>> {
        self.issue(host)
    }
}

fn build_upstream_config(accept_invalid: bool) -> Arc<ClientConfig> {
    let config = if accept_invalid {
        let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
        ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(InsecureUpstreamVerifier(provider)))
            .with_no_client_auth()
    } else {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth()
    };
    Arc::new(config)
}

/// Verifier that accepts any upstream certificate.
///
/// Signatures are still validated; only the chain check is skipped.
#[derive(Debug)]
struct InsecureUpstreamVerifier(Arc<CryptoProvider>);

impl ServerCertVerifier for InsecureUpstreamVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presumes_tls_follows_configured_ports() {
        let ca = CertificateAuthority::new(CaConfig::default()).unwrap();
        assert!(ca.presumes_tls("example.com", 443));
        assert!(!ca.presumes_tls("example.com", 8080));

        let ca = CertificateAuthority::new(CaConfig {
            tls_ports: vec![443, 8443],
            ..CaConfig::default()
        })
        .unwrap();
        assert!(ca.presumes_tls("example.com", 8443));
        assert!(!ca.presumes_tls("example.com", 80));
    }

    #[test]
    fn test_leaf_configs_are_cached_per_host() {
        let ca = CertificateAuthority::new(CaConfig::default()).unwrap();

        let first = ca.client_facing_config("example.com").unwrap();
        let second = ca.client_facing_config("example.com").unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        let other = ca.client_facing_config("other.example").unwrap();
        assert!(!Arc::ptr_eq(&first, &other));
    }

    #[test]
    fn test_ip_hosts_get_certificates() {
        let ca = CertificateAuthority::new(CaConfig::default()).unwrap();
        assert!(ca.client_facing_config("127.0.0.1").is_ok());
    }

    #[test]
    fn test_ca_pem_export() {
        let ca = CertificateAuthority::new(CaConfig::default()).unwrap();
        let pem = ca.ca_certificate_pem();
        assert!(pem.starts_with("-----BEGIN CERTIFICATE-----"));
    }
}
