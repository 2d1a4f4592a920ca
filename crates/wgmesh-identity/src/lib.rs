//! Ed25519 control-plane identity
//!
//! Peers authenticate their persistent streams by signing
//! `peer_id||role||region||nonce` with an Ed25519 key announced in the
//! auth message itself. This crate owns key load/generate, signing,
//! verification, and the server-side nonce replay window.

mod identity;
mod nonce;

pub use identity::{auth_message, verify_auth, IdentityError, PeerIdentity};
pub use nonce::NonceCache;
