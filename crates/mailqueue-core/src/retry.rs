//! Retry policy with exponential backoff and jitter

use mailqueue_common::config::RetryConfig;
use rand::Rng;
use std::time::Duration;

/// How a delivery attempt failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Transient,
    Permanent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { delay: Duration },
    NoRetry,
}

/// Decides whether and when a failed message is attempted again
///
/// The delay after attempt `n` is `min(base * 2^(n-1), max)`, spread by
/// `± jitter` and never above `max`.
#[derive(Debug, Clone)]
pub struct RetryScheduler {
    base_delay: Duration,
    max_delay: Duration,
    jitter: f64,
}

impl Default for RetryScheduler {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryScheduler {
    pub fn new(base_delay: Duration, max_delay: Duration, jitter: f64) -> Self {
        Self {
            base_delay,
            max_delay: max_delay.max(base_delay),
            jitter: jitter.clamp(0.0, 0.99),
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(
            Duration::from_secs(config.base_delay_secs),
            Duration::from_secs(config.max_delay_secs),
            config.jitter,
        )
    }

    /// `attempt_count` includes the attempt that just failed
    pub fn decide(&self, attempt_count: u32, max_attempts: u32, kind: FailureKind) -> RetryDecision {
        if kind == FailureKind::Permanent || attempt_count >= max_attempts {
            return RetryDecision::NoRetry;
        }
        RetryDecision::Retry {
            delay: self.jittered(self.backoff(attempt_count)),
        }
    }

    /// Backoff before jitter
    pub fn backoff(&self, attempt_count: u32) -> Duration {
        let exponent = attempt_count.saturating_sub(1);
        let multiplier = 1u32.checked_shl(exponent).unwrap_or(u32::MAX);
        self.base_delay
            .saturating_mul(multiplier)
            .min(self.max_delay)
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if self.jitter == 0.0 || delay.is_zero() {
            return delay;
        }
        let factor = 1.0 + rand::rng().random_range(-self.jitter..=self.jitter);
        Duration::try_from_secs_f64(delay.as_secs_f64() * factor)
            .unwrap_or(delay)
            .min(self.max_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scheduler(jitter: f64) -> RetryScheduler {
        RetryScheduler::new(Duration::from_secs(300), Duration::from_secs(14400), jitter)
    }

    #[test]
    fn test_exponential_backoff() {
        let retry = scheduler(0.0);
        assert_eq!(retry.backoff(1), Duration::from_secs(300));
        assert_eq!(retry.backoff(2), Duration::from_secs(600));
        assert_eq!(retry.backoff(3), Duration::from_secs(1200));
        assert_eq!(retry.backoff(6), Duration::from_secs(9600));
        // Capped
        assert_eq!(retry.backoff(7), Duration::from_secs(14400));
        assert_eq!(retry.backoff(40), Duration::from_secs(14400));
        assert_eq!(retry.backoff(u32::MAX), Duration::from_secs(14400));
    }

    #[test]
    fn test_backoff_is_monotonic() {
        let retry = scheduler(0.0);
        let mut previous = Duration::ZERO;
        for attempt in 1..64 {
            let delay = retry.backoff(attempt);
            assert!(delay >= previous);
            previous = delay;
        }
    }

    #[test]
    fn test_decide_transient() {
        let retry = scheduler(0.0);
        assert_eq!(
            retry.decide(1, 3, FailureKind::Transient),
            RetryDecision::Retry {
                delay: Duration::from_secs(300)
            }
        );
        assert_eq!(
            retry.decide(2, 3, FailureKind::Transient),
            RetryDecision::Retry {
                delay: Duration::from_secs(600)
            }
        );
        assert_eq!(retry.decide(3, 3, FailureKind::Transient), RetryDecision::NoRetry);
    }

    #[test]
    fn test_permanent_never_retries() {
        let retry = scheduler(0.0);
        assert_eq!(retry.decide(1, 10, FailureKind::Permanent), RetryDecision::NoRetry);
    }

    #[test]
    fn test_jitter_bounds() {
        let retry = scheduler(0.2);
        for _ in 0..200 {
            let RetryDecision::Retry { delay } = retry.decide(1, 5, FailureKind::Transient) else {
                panic!("expected retry");
            };
            assert!(delay >= Duration::from_secs(240), "{:?}", delay);
            assert!(delay <= Duration::from_secs(360), "{:?}", delay);
        }

        // Jitter never pushes past the cap
        for _ in 0..200 {
            let RetryDecision::Retry { delay } = retry.decide(10, 20, FailureKind::Transient) else {
                panic!("expected retry");
            };
            assert!(delay <= Duration::from_secs(14400));
        }
    }

    #[test]
    fn test_from_config() {
        let config = RetryConfig {
            base_delay_secs: 10,
            max_delay_secs: 60,
            jitter: 0.0,
        };
        let retry = RetryScheduler::from_config(&config);
        assert_eq!(retry.backoff(1), Duration::from_secs(10));
        assert_eq!(retry.backoff(4), Duration::from_secs(60));
    }
}
