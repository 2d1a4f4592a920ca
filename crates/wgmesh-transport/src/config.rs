//! QUIC transport configuration

use crate::{TransportError, TransportResult};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// ALPN identifier for the wgmesh control protocol
pub const ALPN_WGMESH: &str = "wgmesh/1";

/// QUIC-specific configuration
#[derive(Debug, Clone)]
pub struct QuicConfig {
    /// Verify the server certificate against the root store
    verify_server_cert: bool,

    /// Additional DER root certificates (empty = system roots)
    root_certs: Vec<Vec<u8>>,

    /// ALPN protocols
    alpn_protocols: Vec<String>,

    /// Server certificate path (for servers)
    pub server_cert_path: Option<String>,

    /// Server private key path (for servers)
    pub server_key_path: Option<String>,

    /// Keep-alive interval
    pub keep_alive_interval: Duration,

    /// Maximum idle timeout
    pub max_idle_timeout: Duration,

    /// Maximum number of concurrent bidirectional streams
    pub max_concurrent_streams: u64,
}

impl QuicConfig {
    /// Client configuration verifying against system roots
    pub fn client_default() -> Self {
        Self {
            verify_server_cert: true,
            root_certs: Vec::new(),
            alpn_protocols: vec![ALPN_WGMESH.to_string()],
            server_cert_path: None,
            server_key_path: None,
            keep_alive_interval: Duration::from_secs(5),
            max_idle_timeout: Duration::from_secs(30),
            max_concurrent_streams: 100,
        }
    }

    /// Client configuration that skips certificate verification
    ///
    /// **INSECURE**: only for deployments running on self-signed
    /// certificates (development, tests, closed networks).
    pub fn client_insecure() -> Self {
        let mut config = Self::client_default();
        config.verify_server_cert = false;
        config
    }

    /// Server configuration from PEM certificate and key paths
    pub fn server_default(cert_path: &str, key_path: &str) -> Self {
        Self {
            verify_server_cert: true,
            root_certs: Vec::new(),
            alpn_protocols: vec![ALPN_WGMESH.to_string()],
            server_cert_path: Some(cert_path.to_string()),
            server_key_path: Some(key_path.to_string()),
            keep_alive_interval: Duration::from_secs(5),
            max_idle_timeout: Duration::from_secs(30),
            max_concurrent_streams: 1000,
        }
    }

    /// Zero-config server with an ephemeral self-signed certificate
    ///
    /// Each call generates a unique certificate in the temp directory so
    /// parallel test listeners never collide. Clients must use
    /// [`QuicConfig::client_insecure`].
    pub fn server_ephemeral() -> TransportResult<Self> {
        let cert = wgmesh_cert::generate_self_signed_cert()
            .map_err(|e| TransportError::TlsError(format!("self-signed cert: {}", e)))?;

        let temp_dir = std::env::temp_dir();
        let unique_id = uuid::Uuid::new_v4();
        let cert_path = temp_dir.join(format!("wgmesh-quic-{}.crt", unique_id));
        let key_path = temp_dir.join(format!("wgmesh-quic-{}.key", unique_id));

        cert.save_to_files(cert_path.to_str().unwrap(), key_path.to_str().unwrap())
            .map_err(|e| TransportError::TlsError(format!("save cert files: {}", e)))?;

        Ok(Self::server_default(
            cert_path.to_str().unwrap(),
            key_path.to_str().unwrap(),
        ))
    }

    /// Set custom keep-alive interval
    pub fn with_keep_alive(mut self, interval: Duration) -> Self {
        self.keep_alive_interval = interval;
        self
    }

    /// Set custom idle timeout
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.max_idle_timeout = timeout;
        self
    }

    /// Trust an additional DER-encoded root certificate
    pub fn with_root_cert(mut self, cert_der: Vec<u8>) -> Self {
        self.root_certs.push(cert_der);
        self
    }

    pub(crate) fn validate(&self) -> TransportResult<()> {
        if self.keep_alive_interval.as_secs() == 0 {
            return Err(TransportError::ConfigurationError(
                "Keep-alive interval must be > 0".to_string(),
            ));
        }

        if self.max_idle_timeout < self.keep_alive_interval * 2 {
            return Err(TransportError::ConfigurationError(
                "Idle timeout must be at least 2x keep-alive interval".to_string(),
            ));
        }

        Ok(())
    }

    /// Build quinn ClientConfig
    pub(crate) fn build_client_config(&self) -> TransportResult<quinn::ClientConfig> {
        let mut roots = quinn::rustls::RootCertStore::empty();

        if self.root_certs.is_empty() {
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        } else {
            for cert_der in &self.root_certs {
                roots
                    .add(quinn::rustls::pki_types::CertificateDer::from(
                        cert_der.clone(),
                    ))
                    .map_err(|e| {
                        TransportError::ConfigurationError(format!("Invalid root cert: {}", e))
                    })?;
            }
        }

        let mut client_crypto = if self.verify_server_cert {
            quinn::rustls::ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth()
        } else {
            quinn::rustls::ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(SkipVerification::new())
                .with_no_client_auth()
        };

        client_crypto.alpn_protocols = self
            .alpn_protocols
            .iter()
            .map(|s| s.as_bytes().to_vec())
            .collect();

        let mut client_config = quinn::ClientConfig::new(Arc::new(
            quinn::crypto::rustls::QuicClientConfig::try_from(client_crypto)
                .map_err(|e| TransportError::TlsError(e.to_string()))?,
        ));

        let mut transport = quinn::TransportConfig::default();
        transport.keep_alive_interval(Some(self.keep_alive_interval));
        transport.max_idle_timeout(Some(self.max_idle_timeout.try_into().map_err(|_| {
            TransportError::ConfigurationError("Idle timeout out of range".to_string())
        })?));
        transport.max_concurrent_bidi_streams(
            u32::try_from(self.max_concurrent_streams)
                .unwrap_or(u32::MAX)
                .into(),
        );

        client_config.transport_config(Arc::new(transport));

        Ok(client_config)
    }

    /// Build quinn ServerConfig
    pub(crate) fn build_server_config(&self) -> TransportResult<quinn::ServerConfig> {
        let cert_path = self.server_cert_path.as_ref().ok_or_else(|| {
            TransportError::ConfigurationError("Server cert path required".to_string())
        })?;
        let key_path = self.server_key_path.as_ref().ok_or_else(|| {
            TransportError::ConfigurationError("Server key path required".to_string())
        })?;

        let certs = load_certs(Path::new(cert_path))?;
        let key = load_private_key(Path::new(key_path))?;

        let mut server_crypto = quinn::rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| TransportError::TlsError(format!("Invalid cert/key: {}", e)))?;

        server_crypto.alpn_protocols = self
            .alpn_protocols
            .iter()
            .map(|s| s.as_bytes().to_vec())
            .collect();

        let mut server_config = quinn::ServerConfig::with_crypto(Arc::new(
            quinn::crypto::rustls::QuicServerConfig::try_from(server_crypto)
                .map_err(|e| TransportError::TlsError(e.to_string()))?,
        ));

        let mut transport = quinn::TransportConfig::default();
        transport.keep_alive_interval(Some(self.keep_alive_interval));
        transport.max_idle_timeout(Some(self.max_idle_timeout.try_into().map_err(|_| {
            TransportError::ConfigurationError("Idle timeout out of range".to_string())
        })?));
        transport.max_concurrent_bidi_streams(
            u32::try_from(self.max_concurrent_streams)
                .unwrap_or(u32::MAX)
                .into(),
        );

        server_config.transport_config(Arc::new(transport));

        Ok(server_config)
    }
}

fn load_certs(
    path: &Path,
) -> TransportResult<Vec<quinn::rustls::pki_types::CertificateDer<'static>>> {
    let file = File::open(path)
        .map_err(|e| TransportError::TlsError(format!("Failed to open cert file: {}", e)))?;
    let mut reader = BufReader::new(file);

    rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TransportError::TlsError(format!("Failed to parse certs: {}", e)))
}

fn load_private_key(
    path: &Path,
) -> TransportResult<quinn::rustls::pki_types::PrivateKeyDer<'static>> {
    let file = File::open(path)
        .map_err(|e| TransportError::TlsError(format!("Failed to open key file: {}", e)))?;
    let mut reader = BufReader::new(file);

    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| TransportError::TlsError(format!("Failed to parse key: {}", e)))?
        .ok_or_else(|| TransportError::TlsError("No private key found".to_string()))
}

// Certificate verifier that skips verification (INSECURE - self-signed only!)
#[derive(Debug)]
struct SkipVerification;

impl SkipVerification {
    fn new() -> Arc<Self> {
        Arc::new(Self)
    }
}

impl quinn::rustls::client::danger::ServerCertVerifier for SkipVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &quinn::rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[quinn::rustls::pki_types::CertificateDer<'_>],
        _server_name: &quinn::rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: quinn::rustls::pki_types::UnixTime,
    ) -> Result<quinn::rustls::client::danger::ServerCertVerified, quinn::rustls::Error> {
        Ok(quinn::rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &quinn::rustls::pki_types::CertificateDer<'_>,
        _dss: &quinn::rustls::DigitallySignedStruct,
    ) -> Result<quinn::rustls::client::danger::HandshakeSignatureValid, quinn::rustls::Error> {
        Ok(quinn::rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &quinn::rustls::pki_types::CertificateDer<'_>,
        _dss: &quinn::rustls::DigitallySignedStruct,
    ) -> Result<quinn::rustls::client::danger::HandshakeSignatureValid, quinn::rustls::Error> {
        Ok(quinn::rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<quinn::rustls::SignatureScheme> {
        use quinn::rustls::SignatureScheme;
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
