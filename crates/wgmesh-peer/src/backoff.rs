//! Reconnection backoff

use std::time::Duration;

/// Backoff tuning
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Initial backoff duration
    pub initial: Duration,
    /// Maximum backoff duration
    pub max: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(5),
            max: Duration::from_secs(60),
        }
    }
}

/// Capped exponential backoff: doubles on each consecutive failure,
/// resets on successful authentication.
#[derive(Debug)]
pub struct ReconnectBackoff {
    config: BackoffConfig,
    current: Duration,
    attempt: usize,
}

impl ReconnectBackoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            current: config.initial,
            config,
            attempt: 0,
        }
    }

    /// Delay to wait before the next attempt; advances the schedule.
    pub fn next_delay(&mut self) -> Duration {
        self.attempt += 1;
        let delay = self.current;
        self.current = (self.current * 2).min(self.config.max);
        delay
    }

    /// Reset after a successful connection
    pub fn reset(&mut self) {
        self.current = self.config.initial;
        self.attempt = 0;
    }

    pub fn attempt(&self) -> usize {
        self.attempt
    }
}
