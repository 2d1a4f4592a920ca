//! Nonce replay window
//!
//! A nonce seen from a peer within the window is rejected, which stops a
//! captured auth frame from being replayed to steal a session slot.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Sliding-window cache of recently seen (peer, nonce) pairs
pub struct NonceCache {
    window: Duration,
    seen: Mutex<HashMap<(String, String), Instant>>,
}

impl NonceCache {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            seen: Mutex::new(HashMap::new()),
        }
    }

    /// Record a nonce, returning false if it was already seen within the
    /// window. Expired entries are pruned on the way in.
    pub fn check_and_insert(&self, peer_id: &str, nonce: &str) -> bool {
        let mut seen = self.seen.lock().unwrap();
        let now = Instant::now();

        seen.retain(|_, stamped| now.duration_since(*stamped) < self.window);

        let key = (peer_id.to_string(), nonce.to_string());
        if seen.contains_key(&key) {
            return false;
        }

        seen.insert(key, now);
        true
    }

    /// Number of live entries (test hook)
    pub fn len(&self) -> usize {
        self.seen.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for NonceCache {
    fn default() -> Self {
        // The recommended replay window for auth nonces
        Self::new(Duration::from_secs(300))
    }
}
