//! Reconnection delay schedule.

use crate::config::BackoffConfig;
use rand::Rng;
use std::time::Duration;

/// Exponential backoff with a ceiling and randomized jitter.
///
/// The un-jittered delay for attempt `n` is `min(initial * factor^n, max)`.
/// Jitter only ever shortens it, by up to `jitter * delay`, so the ceiling is
/// never exceeded.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    attempt: u32,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Failed attempts since the last successful handshake.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Un-jittered delay for a given attempt index.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let initial = self.config.initial_ms as f64;
        let max = self.config.max_ms.max(self.config.initial_ms) as f64;
        let factor = self.config.factor.max(1.0);
        let scaled = initial * factor.powi(attempt.min(i32::MAX as u32) as i32);
        Duration::from_millis(scaled.min(max) as u64)
    }

    /// Delay before the next attempt, advancing the counter.
    ///
    /// Returns `None` once `max_attempts` is used up.
    pub fn next_delay<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Option<Duration> {
        if let Some(max) = self.config.max_attempts {
            if self.attempt >= max {
                return None;
            }
        }
        let base = self.base_delay(self.attempt);
        self.attempt = self.attempt.saturating_add(1);

        let jitter = self.config.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 || base.is_zero() {
            return Some(base);
        }
        let cut = rng.gen_range(0.0..=jitter);
        Some(base.mul_f64(1.0 - cut))
    }

    /// Forget past failures after a successful handshake.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
