//! # Reconnection Backoff
//!
//! Capped exponential backoff with jitter for the push transport.
//! Delays double per consecutive failure until the cap; the attempt
//! budget bounds how many retries are granted before the channel is
//! declared disconnected.

use std::time::Duration;

use rand::Rng;

/// Backoff policy for transport reconnection
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Delay before the first retry
    pub base: Duration,
    /// Upper bound for any single delay
    pub max: Duration,
    /// Retries granted after a failure before giving up
    pub max_attempts: u32,
    /// Jitter fraction in `0.0..=1.0`, applied as `delay * (1 ± jitter)`
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            max: Duration::from_secs(30),
            max_attempts: 5,
            jitter: 0.2,
        }
    }
}

impl BackoffPolicy {
    /// Policy without jitter, useful where deterministic delays matter
    pub fn fixed(base: Duration, max: Duration, max_attempts: u32) -> Self {
        Self {
            base,
            max,
            max_attempts,
            jitter: 0.0,
        }
    }
}

/// Stateful attempt tracker for one connection
#[derive(Debug)]
pub struct Backoff {
    policy: BackoffPolicy,
    attempts: u32,
}

impl Backoff {
    /// Create a tracker with zero recorded attempts
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            attempts: 0,
        }
    }

    /// Delay before the next retry, or `None` once the attempt budget
    /// is spent
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempts >= self.policy.max_attempts {
            return None;
        }

        let exp = self
            .policy
            .base
            .saturating_mul(2u32.saturating_pow(self.attempts));
        let capped = exp.min(self.policy.max);
        self.attempts += 1;

        Some(apply_jitter(capped, self.policy.jitter))
    }

    /// Clear the attempt counter after a successful connection
    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    /// Consecutive failures recorded so far
    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

/// Spread a delay by up to ±`jitter` of its length
fn apply_jitter(delay: Duration, jitter: f64) -> Duration {
    if jitter <= 0.0 {
        return delay;
    }

    let spread = delay.as_secs_f64() * jitter;
    let offset = rand::thread_rng().gen_range(-spread..=spread);
    Duration::from_secs_f64((delay.as_secs_f64() + offset).max(0.0))
}
