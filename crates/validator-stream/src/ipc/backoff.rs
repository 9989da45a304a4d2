//! Capped exponential backoff between reconnect attempts.

use crate::domain::ReconnectConfig;
use rand::Rng;
use std::time::Duration;

/// Delay schedule: `min(initial * multiplier^attempt, max)`, optionally
/// jittered into `[delay/2, delay]`.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    initial: Duration,
    max: Duration,
    multiplier: f64,
    jitter: bool,
    attempt: u32,
}

impl ExponentialBackoff {
    pub fn new(config: &ReconnectConfig) -> Self {
        Self {
            initial: config.initial_backoff(),
            max: config.max_backoff(),
            multiplier: config.multiplier,
            jitter: config.jitter,
            attempt: 0,
        }
    }

    /// Delay before the next attempt; advances the schedule.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.base_delay(self.attempt);
        self.attempt = self.attempt.saturating_add(1);

        if self.jitter && !base.is_zero() {
            let low = base / 2;
            rand::thread_rng().gen_range(low..=base)
        } else {
            base
        }
    }

    /// Back to the initial delay, after a successful connect.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Consecutive attempts since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    fn base_delay(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt.min(i32::MAX as u32) as i32);
        let millis = self.initial.as_millis() as f64 * factor;
        if !millis.is_finite() || millis >= self.max.as_millis() as f64 {
            self.max
        } else {
            Duration::from_millis(millis as u64)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(jitter: bool) -> ReconnectConfig {
        ReconnectConfig {
            initial_backoff_ms: 100,
            max_backoff_ms: 1_000,
            multiplier: 2.0,
            jitter,
        }
    }

    #[test]
    fn test_grows_then_caps() {
        let mut backoff = ExponentialBackoff::new(&config(false));
        let delays: Vec<u64> = (0..6)
            .map(|_| backoff.next_delay().as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1_000, 1_000]);
        assert_eq!(backoff.attempt(), 6);
    }

    #[test]
    fn test_reset() {
        let mut backoff = ExponentialBackoff::new(&config(false));
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let mut backoff = ExponentialBackoff::new(&config(true));
        for attempt in 0..20u32 {
            let base = (100u64 << attempt.min(10)).min(1_000);
            let delay = backoff.next_delay().as_millis() as u64;
            assert!(delay >= base / 2 && delay <= base, "attempt {}: {}", attempt, delay);
        }
    }

    #[test]
    fn test_huge_attempt_count_saturates() {
        let mut backoff = ExponentialBackoff::new(&config(false));
        backoff.attempt = u32::MAX;
        assert_eq!(backoff.next_delay(), Duration::from_millis(1_000));
        assert_eq!(backoff.attempt(), u32::MAX);
    }
}
