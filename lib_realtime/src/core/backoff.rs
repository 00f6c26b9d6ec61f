//! Reconnect delay policy: the base delay doubles per consecutive failure, is
//! capped at a maximum, and is shortened by a random jitter fraction so that
//! many clients dropped at once do not reconnect in lockstep.

use rand::Rng;
use std::time::Duration;

/// Exponential backoff with a cap and subtractive jitter.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    jitter: f64,
    attempt: u32,
}

impl Backoff {
    /// `jitter` is clamped to `0.0..=1.0`; `0.0` makes delays deterministic.
    pub fn new(base: Duration, max: Duration, jitter: f64) -> Self {
        Self {
            base,
            max: max.max(base),
            jitter: jitter.clamp(0.0, 1.0),
            attempt: 0,
        }
    }

    /// The delay before the next attempt. Advances the attempt counter.
    pub fn next_delay(&mut self) -> Duration {
        let factor = 2u32.saturating_pow(self.attempt);
        let raw = self.base.checked_mul(factor).unwrap_or(self.max).min(self.max);
        self.attempt = self.attempt.saturating_add(1);

        if self.jitter == 0.0 {
            return raw;
        }
        let cut = rand::rng().random_range(0.0..=self.jitter);
        raw.mul_f64(1.0 - cut)
    }

    /// Number of delays handed out since the last reset.
    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    /// Starts over from the base delay after a successful connection.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
