//! WireGuard tunnel keypairs
//!
//! Tunnel keys are x25519 and deliberately distinct from the Ed25519
//! control-plane identity: the control key authenticates the stream,
//! the tunnel key configures data-plane peers. Wire form is the same
//! padded base64 the `wg` tool prints.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rand::rngs::OsRng;
use std::fmt;
use x25519_dalek::{PublicKey, StaticSecret};

#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("invalid key length: expected 32 bytes, got {0}")]
    InvalidLength(usize),

    #[error("invalid base64 encoding: {0}")]
    InvalidBase64(#[from] base64::DecodeError),
}

/// A WireGuard private key
#[derive(Clone)]
pub struct WgPrivateKey {
    bytes: [u8; 32],
}

impl WgPrivateKey {
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        Self {
            bytes: secret.to_bytes(),
        }
    }

    pub fn from_base64(s: &str) -> Result<Self, KeyError> {
        let bytes = STANDARD.decode(s)?;
        let bytes: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| KeyError::InvalidLength(bytes.len()))?;
        Ok(Self { bytes })
    }

    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.bytes)
    }

    pub fn public_key(&self) -> WgPublicKey {
        let secret = StaticSecret::from(self.bytes);
        let public = PublicKey::from(&secret);
        WgPublicKey {
            bytes: *public.as_bytes(),
        }
    }
}

impl fmt::Debug for WgPrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WgPrivateKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// A WireGuard public key
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct WgPublicKey {
    bytes: [u8; 32],
}

impl WgPublicKey {
    pub fn from_base64(s: &str) -> Result<Self, KeyError> {
        let bytes = STANDARD.decode(s)?;
        let bytes: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| KeyError::InvalidLength(bytes.len()))?;
        Ok(Self { bytes })
    }

    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.bytes)
    }
}

impl fmt::Debug for WgPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WgPublicKey({})", self.to_base64())
    }
}

impl fmt::Display for WgPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base64())
    }
}

/// A generated private/public pair
#[derive(Clone, Debug)]
pub struct WgKeyPair {
    pub private: WgPrivateKey,
    pub public: WgPublicKey,
}

impl WgKeyPair {
    pub fn generate() -> Self {
        let private = WgPrivateKey::generate();
        let public = private.public_key();
        Self { private, public }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_produces_valid_base64() {
        let pair = WgKeyPair::generate();
        // wg keys are 44 characters of padded base64
        assert_eq!(pair.private.to_base64().len(), 44);
        assert_eq!(pair.public.to_base64().len(), 44);
    }

    #[test]
    fn test_private_round_trip() {
        let pair = WgKeyPair::generate();
        let restored = WgPrivateKey::from_base64(&pair.private.to_base64()).unwrap();
        assert_eq!(restored.public_key(), pair.public);
    }

    #[test]
    fn test_public_round_trip() {
        let pair = WgKeyPair::generate();
        let restored = WgPublicKey::from_base64(&pair.public.to_base64()).unwrap();
        assert_eq!(restored, pair.public);
    }

    #[test]
    fn test_rejects_wrong_length() {
        let short = STANDARD.encode([0u8; 16]);
        assert!(matches!(
            WgPublicKey::from_base64(&short),
            Err(KeyError::InvalidLength(16))
        ));
    }

    #[test]
    fn test_distinct_pairs() {
        let a = WgKeyPair::generate();
        let b = WgKeyPair::generate();
        assert_ne!(a.public, b.public);
    }
}
