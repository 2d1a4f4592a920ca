//! Self-signed certificate generation for development and testing
//!
//! Provides zero-config TLS certificates for QUIC listeners. Production
//! deployments point the transport at CA-issued PEM files instead.

use rcgen::{CertificateParams, DistinguishedName};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::time::SystemTime;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CertError {
    #[error("Certificate generation failed: {0}")]
    GenerationFailed(String),

    #[error("Key generation failed: {0}")]
    KeyGenerationFailed(String),

    #[error("Failed to write certificate files: {0}")]
    WriteFailed(std::io::Error),
}

/// Generate a self-signed certificate for development/testing
///
/// Valid for 90 days, covers localhost and the loopback addresses.
/// **DO NOT use in production** - use proper CA-signed certificates.
pub fn generate_self_signed_cert() -> Result<SelfSignedCertificate, CertError> {
    let mut params = CertificateParams::default();

    let mut dn = DistinguishedName::new();
    dn.push(rcgen::DnType::CommonName, "wgmesh Development Certificate");
    dn.push(rcgen::DnType::OrganizationName, "wgmesh Dev");
    params.distinguished_name = dn;

    params.subject_alt_names = vec![
        rcgen::SanType::DnsName(rcgen::Ia5String::try_from("localhost").unwrap()),
        rcgen::SanType::IpAddress(std::net::IpAddr::V4(std::net::Ipv4Addr::new(127, 0, 0, 1))),
        rcgen::SanType::IpAddress(std::net::IpAddr::V6(std::net::Ipv6Addr::new(
            0, 0, 0, 0, 0, 0, 0, 1,
        ))),
    ];

    let not_before = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap();
    params.not_before = time::OffsetDateTime::from_unix_timestamp(not_before.as_secs() as i64)
        .map_err(|e| CertError::GenerationFailed(e.to_string()))?;

    let not_after = not_before + std::time::Duration::from_secs(90 * 24 * 60 * 60);
    params.not_after = time::OffsetDateTime::from_unix_timestamp(not_after.as_secs() as i64)
        .map_err(|e| CertError::GenerationFailed(e.to_string()))?;

    params.serial_number = Some(rcgen::SerialNumber::from(rand::random::<u64>()));

    let key_pair =
        rcgen::KeyPair::generate().map_err(|e| CertError::GenerationFailed(e.to_string()))?;

    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| CertError::GenerationFailed(e.to_string()))?;

    let cert_pem = cert.pem();
    let key_pem = key_pair.serialize_pem();

    let cert_der = cert.der().to_vec();
    let key_der = key_pair.serialize_der();

    Ok(SelfSignedCertificate {
        cert_der: CertificateDer::from(cert_der),
        key_der: PrivateKeyDer::try_from(key_der)
            .map_err(|e| CertError::KeyGenerationFailed(format!("{:?}", e)))?,
        pem_cert: cert_pem,
        pem_key: key_pem,
    })
}

/// A self-signed certificate with its private key
pub struct SelfSignedCertificate {
    /// Certificate in DER format
    pub cert_der: CertificateDer<'static>,
    /// Private key in DER format
    pub key_der: PrivateKeyDer<'static>,
    /// Certificate in PEM format (for file storage)
    pub pem_cert: String,
    /// Private key in PEM format (for file storage)
    pub pem_key: String,
}

impl SelfSignedCertificate {
    /// Write the PEM forms to the given paths
    pub fn save_to_files(&self, cert_path: &str, key_path: &str) -> Result<(), CertError> {
        std::fs::write(cert_path, self.pem_cert.as_bytes()).map_err(CertError::WriteFailed)?;
        std::fs::write(key_path, self.pem_key.as_bytes()).map_err(CertError::WriteFailed)?;
        Ok(())
    }
}
