use crate::config::BackoffConfig;
use rand::Rng;
use std::time::Duration;
use tracing::warn;

/// Exponential backoff for reconnection attempts.
///
/// Each failed attempt yields the current delay and grows it by
/// `multiplier`, scaled by a uniform jitter in `[1 - J, 1 + J]` and capped at
/// `max_delay`. Once `max_retries` failures have been recorded (0 = never)
/// the policy is exhausted.
pub struct Backoff {
    initial_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
    max_retries: u32,
    jitter_factor: f64,
    current_delay: Duration,
    retries: u32,
}

impl Backoff {
    /// Fresh policy starting at `initial_delay_ms`.
    pub fn new(config: &BackoffConfig) -> Self {
        let initial_delay = Duration::from_millis(config.initial_delay_ms);
        let max_delay = Duration::from_millis(config.max_delay_ms);
        Self {
            initial_delay,
            max_delay,
            multiplier: config.multiplier,
            max_retries: config.max_retries,
            jitter_factor: config.jitter_factor.clamp(0.0, 1.0),
            current_delay: initial_delay.min(max_delay),
            retries: 0,
        }
    }

    /// Record a failed attempt.
    ///
    /// Returns the delay to wait before the next attempt, or `None` once the
    /// retry budget is spent.
    pub fn record_failure(&mut self) -> Option<Duration> {
        self.retries += 1;
        if self.max_retries > 0 && self.retries >= self.max_retries {
            warn!(
                retries = self.retries,
                max_retries = self.max_retries,
                "reconnection retries exhausted"
            );
            return None;
        }

        let delay = self.current_delay;
        let grown = self.current_delay.as_secs_f64() * self.multiplier * self.jitter();
        self.current_delay = Duration::from_secs_f64(grown.max(0.0)).min(self.max_delay);
        Some(delay)
    }

    /// Start over from the initial delay.
    pub fn reset(&mut self) {
        self.retries = 0;
        self.current_delay = self.initial_delay.min(self.max_delay);
    }

    /// Failed attempts recorded so far.
    pub fn retries(&self) -> u32 {
        self.retries
    }

    fn jitter(&self) -> f64 {
        if self.jitter_factor == 0.0 {
            return 1.0;
        }
        let j = self.jitter_factor;
        rand::rng().random_range((1.0 - j)..=(1.0 + j))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(max_retries: u32, jitter_factor: f64) -> BackoffConfig {
        BackoffConfig {
            initial_delay_ms: 5_000,
            max_delay_ms: 20_000,
            multiplier: 1.5,
            max_retries,
            jitter_factor,
        }
    }

    #[test]
    fn test_delays_grow_by_multiplier() {
        let mut backoff = Backoff::new(&config(0, 0.0));
        assert_eq!(backoff.record_failure(), Some(Duration::from_millis(5_000)));
        assert_eq!(backoff.record_failure(), Some(Duration::from_millis(7_500)));
        assert_eq!(backoff.record_failure(), Some(Duration::from_millis(11_250)));
    }

    #[test]
    fn test_delay_capped_at_max() {
        let mut backoff = Backoff::new(&config(0, 0.0));
        let delays: Vec<Duration> = (0..8).filter_map(|_| backoff.record_failure()).collect();
        assert_eq!(delays[3], Duration::from_millis(16_875));
        assert!(delays[4..].iter().all(|d| *d == Duration::from_millis(20_000)));
    }

    #[test]
    fn test_unlimited_retries_never_exhaust() {
        let mut backoff = Backoff::new(&config(0, 0.0));
        for _ in 0..100 {
            assert!(backoff.record_failure().is_some());
        }
        assert_eq!(backoff.retries(), 100);
    }

    #[test]
    fn test_exhausted_after_max_retries() {
        let mut backoff = Backoff::new(&config(3, 0.0));
        assert!(backoff.record_failure().is_some());
        assert!(backoff.record_failure().is_some());
        // Third failure spends the budget
        assert_eq!(backoff.record_failure(), None);
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let mut backoff = Backoff::new(&BackoffConfig {
            initial_delay_ms: 1_000,
            max_delay_ms: 1_000_000,
            multiplier: 2.0,
            max_retries: 0,
            jitter_factor: 0.2,
        });
        let first = backoff.record_failure().unwrap();
        let second = backoff.record_failure().unwrap();
        assert_eq!(first, Duration::from_millis(1_000));
        // 1s * 2.0 * [0.8, 1.2]
        assert!(second >= Duration::from_millis(1_599), "{second:?}");
        assert!(second <= Duration::from_millis(2_401), "{second:?}");
    }

    #[test]
    fn test_reset_restores_initial_delay() {
        let mut backoff = Backoff::new(&config(0, 0.0));
        backoff.record_failure();
        backoff.record_failure();
        backoff.reset();
        assert_eq!(backoff.retries(), 0);
        assert_eq!(backoff.record_failure(), Some(Duration::from_millis(5_000)));
    }

    #[test]
    fn test_zero_initial_delay_stays_zero() {
        let mut backoff = Backoff::new(&BackoffConfig {
            initial_delay_ms: 0,
            ..config(0, 0.0)
        });
        assert_eq!(backoff.record_failure(), Some(Duration::ZERO));
        assert_eq!(backoff.record_failure(), Some(Duration::ZERO));
    }
}
