//! Exponential backoff for response posts.

use std::time::Duration;

/// Deterministic exponential backoff schedule (no jitter: chunk posts for
/// one request are serial, so synchronized retries across clients are not
/// a concern here).
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    initial: Duration,
    multiplier: u32,
    max_interval: Duration,
    attempt: u32,
}

impl ExponentialBackoff {
    pub fn new(initial: Duration, multiplier: u32, max_interval: Duration) -> Self {
        Self {
            initial,
            multiplier,
            max_interval,
            attempt: 0,
        }
    }

    /// Schedule used between relay response-post attempts: 1 s doubling up
    /// to a 10 s ceiling.
    pub fn for_response_posts() -> Self {
        Self::new(Duration::from_secs(1), 2, Duration::from_secs(10))
    }

    /// Delay before the next retry. The schedule never ends; the caller
    /// bounds the number of attempts.
    pub fn next_delay(&mut self) -> Duration {
        let factor = self.multiplier.saturating_pow(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        self.initial
            .saturating_mul(factor)
            .min(self.max_interval)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
