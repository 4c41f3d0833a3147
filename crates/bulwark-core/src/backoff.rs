//! Exponential backoff with bounded jitter.
//!
//! `delay(k) = min(initial_delay * factor^k, max_delay)` for a 0-based
//! attempt `k`, plus up to 10% extra when jitter is enabled so that many
//! callers failing together do not retry in lockstep.

use rand::Rng;
use std::time::Duration;

/// Pure delay computation for retry attempts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    /// Delay before the first retry
    pub initial_delay: Duration,

    /// Upper bound for the un-jittered delay
    pub max_delay: Duration,

    /// Multiplier applied per attempt
    pub factor: f64,

    /// Add up to 10% random extra delay
    pub jitter: bool,
}

impl BackoffPolicy {
    pub fn new(initial_delay: Duration, max_delay: Duration, factor: f64, jitter: bool) -> Self {
        Self {
            initial_delay,
            max_delay,
            factor,
            jitter,
        }
    }

    /// Capped exponential delay for `attempt`, without jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let nanos = self.initial_delay.as_nanos() as f64 * self.factor.powi(exponent);
        let max_nanos = self.max_delay.as_nanos() as f64;

        if !nanos.is_finite() || nanos >= max_nanos {
            return self.max_delay;
        }
        Duration::from_nanos(nanos.max(0.0) as u64)
    }

    /// Delay to wait after the 0-based `attempt` failed.
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if !self.jitter {
            return base;
        }
        base + jitter(base, &mut rand::thread_rng())
    }

    /// Iterate over successive delays, starting at attempt 0.
    pub fn iter(&self) -> Delays {
        Delays {
            policy: *self,
            attempt: 0,
        }
    }
}

/// Uniform random extra in `[0, delay / 10]`.
fn jitter<R: Rng>(delay: Duration, rng: &mut R) -> Duration {
    let ceiling = delay.as_nanos() as u64 / 10;
    if ceiling == 0 {
        return Duration::ZERO;
    }
    Duration::from_nanos(rng.gen_range(0..=ceiling))
}

/// Endless iterator over the delays of a [`BackoffPolicy`].
#[derive(Debug, Clone)]
pub struct Delays {
    policy: BackoffPolicy,
    attempt: u32,
}

impl Iterator for Delays {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        let delay = self.policy.delay(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        Some(delay)
    }
}
