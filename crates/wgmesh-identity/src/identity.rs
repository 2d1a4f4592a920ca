//! Keypair management and auth signatures

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use std::path::Path;
use tracing::info;
use wgmesh_proto::PeerRole;

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("Failed to read keyfile: {0}")]
    ReadError(std::io::Error),

    #[error("Failed to write keyfile: {0}")]
    WriteError(std::io::Error),

    #[error("Invalid keyfile format: expected 32 bytes, got {0}")]
    InvalidKeyfile(usize),

    #[error("Invalid base64 encoding: {0}")]
    InvalidEncoding(#[from] base64::DecodeError),

    #[error("Invalid public key: {0}")]
    InvalidPublicKey(String),

    #[error("Invalid signature: {0}")]
    InvalidSignature(String),

    #[error("Signature verification failed")]
    VerificationFailed,

    #[error("Failed to create directory: {0}")]
    CreateDirError(std::io::Error),
}

/// Build the canonical auth string a peer signs.
///
/// `||` is a literal two-character separator; the nonce stays in its
/// base64 wire form so both sides sign identical bytes.
pub fn auth_message(peer_id: &str, role: PeerRole, region: &str, nonce_b64: &str) -> String {
    format!("{}||{}||{}||{}", peer_id, role, region, nonce_b64)
}

/// An Ed25519 keypair identifying one peer on the control plane
#[derive(Clone)]
pub struct PeerIdentity {
    signing_key: SigningKey,
}

impl PeerIdentity {
    /// Generate a fresh identity
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self { signing_key }
    }

    /// Load the 32-byte secret key from disk, generating and persisting
    /// one if the file does not exist yet.
    pub fn load_or_generate(keyfile: &Path) -> Result<Self, IdentityError> {
        if let Some(parent) = keyfile.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent).map_err(IdentityError::CreateDirError)?;
            }
        }

        if keyfile.exists() {
            let bytes = std::fs::read(keyfile).map_err(IdentityError::ReadError)?;
            let secret: [u8; 32] = bytes
                .as_slice()
                .try_into()
                .map_err(|_| IdentityError::InvalidKeyfile(bytes.len()))?;
            info!(path = %keyfile.display(), "Loaded existing peer identity");
            return Ok(Self {
                signing_key: SigningKey::from_bytes(&secret),
            });
        }

        let identity = Self::generate();
        std::fs::write(keyfile, identity.signing_key.to_bytes())
            .map_err(IdentityError::WriteError)?;
        info!(path = %keyfile.display(), "Generated new peer identity");
        Ok(identity)
    }

    /// Standard-base64 verification key for the auth message
    pub fn public_key_b64(&self) -> String {
        STANDARD.encode(self.signing_key.verifying_key().to_bytes())
    }

    /// Sign the auth string for the given announce parameters
    pub fn sign_auth(&self, peer_id: &str, role: PeerRole, region: &str, nonce_b64: &str) -> String {
        let message = auth_message(peer_id, role, region, nonce_b64);
        let signature = self.signing_key.sign(message.as_bytes());
        STANDARD.encode(signature.to_bytes())
    }

    /// Generate a fresh random nonce in wire form (16 bytes, base64)
    pub fn fresh_nonce() -> String {
        let mut nonce = [0u8; 16];
        OsRng.fill_bytes(&mut nonce);
        STANDARD.encode(nonce)
    }
}

impl std::fmt::Debug for PeerIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerIdentity")
            .field("public_key", &self.public_key_b64())
            .finish()
    }
}

/// Verify an auth signature against the key the peer declared.
///
/// Both key and signature arrive base64-encoded on the wire; any decode
/// failure is reported distinctly from a verification failure so the
/// coordinator can log the difference.
pub fn verify_auth(
    public_key_b64: &str,
    peer_id: &str,
    role: PeerRole,
    region: &str,
    nonce_b64: &str,
    signature_b64: &str,
) -> Result<(), IdentityError> {
    let key_bytes = STANDARD.decode(public_key_b64)?;
    let key_bytes: [u8; 32] = key_bytes
        .as_slice()
        .try_into()
        .map_err(|_| IdentityError::InvalidPublicKey(format!("{} bytes", key_bytes.len())))?;
    let verifying_key = VerifyingKey::from_bytes(&key_bytes)
        .map_err(|e| IdentityError::InvalidPublicKey(e.to_string()))?;

    let sig_bytes = STANDARD.decode(signature_b64)?;
    let sig_bytes: [u8; 64] = sig_bytes
        .as_slice()
        .try_into()
        .map_err(|_| IdentityError::InvalidSignature(format!("{} bytes", sig_bytes.len())))?;
    let signature = Signature::from_bytes(&sig_bytes);

    let message = auth_message(peer_id, role, region, nonce_b64);
    verifying_key
        .verify(message.as_bytes(), &signature)
        .map_err(|_| IdentityError::VerificationFailed)
}

impl PeerIdentity {
    /// Convenience re-export so callers verify through one type
    pub fn verify(
        public_key_b64: &str,
        peer_id: &str,
        role: PeerRole,
        region: &str,
        nonce_b64: &str,
        signature_b64: &str,
    ) -> Result<(), IdentityError> {
        verify_auth(
            public_key_b64,
            peer_id,
            role,
            region,
            nonce_b64,
            signature_b64,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_and_verify() {
        let identity = PeerIdentity::generate();
        let nonce = PeerIdentity::fresh_nonce();
        let signature = identity.sign_auth("p1", PeerRole::Client, "us-east", &nonce);

        assert!(verify_auth(
            &identity.public_key_b64(),
            "p1",
            PeerRole::Client,
            "us-east",
            &nonce,
            &signature,
        )
        .is_ok());
    }

    #[test]
    fn test_verify_rejects_wrong_key() {
        let identity = PeerIdentity::generate();
        let other = PeerIdentity::generate();
        let nonce = PeerIdentity::fresh_nonce();
        let signature = identity.sign_auth("p1", PeerRole::Client, "us-east", &nonce);

        let result = verify_auth(
            &other.public_key_b64(),
            "p1",
            PeerRole::Client,
            "us-east",
            &nonce,
            &signature,
        );
        assert!(matches!(result, Err(IdentityError::VerificationFailed)));
    }

    #[test]
    fn test_verify_rejects_tampered_fields() {
        let identity = PeerIdentity::generate();
        let nonce = PeerIdentity::fresh_nonce();
        let signature = identity.sign_auth("p1", PeerRole::Client, "us-east", &nonce);

        // Same signature, different role: must fail
        let result = verify_auth(
            &identity.public_key_b64(),
            "p1",
            PeerRole::Exit,
            "us-east",
            &nonce,
            &signature,
        );
        assert!(matches!(result, Err(IdentityError::VerificationFailed)));
    }

    #[test]
    fn test_verify_rejects_garbage_encoding() {
        let identity = PeerIdentity::generate();
        let nonce = PeerIdentity::fresh_nonce();
        let signature = identity.sign_auth("p1", PeerRole::Client, "us-east", &nonce);

        assert!(verify_auth(
            "not base64!!!",
            "p1",
            PeerRole::Client,
            "us-east",
            &nonce,
            &signature,
        )
        .is_err());

        assert!(verify_auth(
            &identity.public_key_b64(),
            "p1",
            PeerRole::Client,
            "us-east",
            &nonce,
            "also not base64!!!",
        )
        .is_err());
    }

    #[test]
    fn test_load_or_generate_round_trip() {
        let dir = std::env::temp_dir().join(format!("wgmesh-id-test-{}", std::process::id()));
        let keyfile = dir.join("peer.key");

        let first = PeerIdentity::load_or_generate(&keyfile).unwrap();
        let second = PeerIdentity::load_or_generate(&keyfile).unwrap();
        assert_eq!(first.public_key_b64(), second.public_key_b64());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_auth_message_layout() {
        assert_eq!(
            auth_message("p1", PeerRole::Hybrid, "eu", "AAAA"),
            "p1||hybrid||eu||AAAA"
        );
    }
}
