//! Exponential backoff with jitter
//!
//! Used by the telemetry channel reconnect loop. Delays grow from a base
//! value by a factor of two up to a cap, with a small random jitter so that
//! multiple clients do not retry in lockstep.

use rand::Rng;
use std::time::Duration;

/// Jitter applied to each delay, as a fraction of the computed value.
const JITTER_FRACTION: f64 = 0.10;

/// Exponential backoff state for a single retry loop
#[derive(Debug)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            attempt: 0,
        }
    }

    /// Compute the next delay and advance the attempt counter.
    pub fn next_delay(&mut self) -> Duration {
        let exp = self
            .base
            .checked_mul(1u32 << self.attempt.min(16))
            .unwrap_or(self.cap)
            .min(self.cap);
        self.attempt = self.attempt.saturating_add(1);

        let jitter = rand::thread_rng().gen_range(-JITTER_FRACTION..=JITTER_FRACTION);
        let jittered = exp.as_secs_f64() * (1.0 + jitter);
        Duration::from_secs_f64(jittered.max(0.0))
    }

    /// Reset after a successful connection so the next failure starts
    /// from the base delay again.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(500), Duration::from_secs(30))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn within_jitter(actual: Duration, expected: Duration) -> bool {
        let lo = expected.as_secs_f64() * (1.0 - JITTER_FRACTION);
        let hi = expected.as_secs_f64() * (1.0 + JITTER_FRACTION);
        let a = actual.as_secs_f64();
        a >= lo && a <= hi
    }

    #[test]
    fn test_growth_to_cap() {
        let mut backoff = Backoff::default();

        assert!(within_jitter(
            backoff.next_delay(),
            Duration::from_millis(500)
        ));
        assert!(within_jitter(
            backoff.next_delay(),
            Duration::from_millis(1000)
        ));
        assert!(within_jitter(
            backoff.next_delay(),
            Duration::from_millis(2000)
        ));

        // Many attempts later the delay is pinned at the cap
        for _ in 0..10 {
            backoff.next_delay();
        }
        assert!(within_jitter(backoff.next_delay(), Duration::from_secs(30)));
    }

    #[test]
    fn test_reset() {
        let mut backoff = Backoff::default();
        backoff.next_delay();
        backoff.next_delay();
        assert_eq!(backoff.attempt(), 2);

        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
        assert!(within_jitter(
            backoff.next_delay(),
            Duration::from_millis(500)
        ));
    }
}
