use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::ReconnectConfig;

/// Exponential backoff with bounded jitter:
/// `min(base * 2^(attempt-1) + jitter, max_delay)`.
#[derive(Debug)]
pub struct ReconnectPolicy {
    config: ReconnectConfig,
    attempt: u32,
    rng: StdRng,
}

impl ReconnectPolicy {
    pub fn new(config: ReconnectConfig) -> Self {
        Self { config, attempt: 0, rng: StdRng::from_entropy() }
    }

    pub fn with_seed(config: ReconnectConfig, seed: u64) -> Self {
        Self { config, attempt: 0, rng: StdRng::seed_from_u64(seed) }
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Delay before the next attempt, or `None` once the budget is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.config.max_attempts {
            return None;
        }
        self.attempt += 1;

        let cap = self.config.max_delay;
        let backoff = 2u32
            .checked_pow(self.attempt - 1)
            .and_then(|factor| self.config.base_delay.checked_mul(factor))
            .unwrap_or(cap);
        let jitter_ms = self.config.jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(self.rng.gen_range(0..=jitter_ms))
        };
        Some(backoff.saturating_add(jitter).min(cap))
    }
}
