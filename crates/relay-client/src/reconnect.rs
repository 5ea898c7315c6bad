//! Reconnect backoff.

use rand::Rng;
use std::time::Duration;

/// Default delay before the first reconnect attempt.
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_secs(1);

/// Default cap on the delay between attempts.
pub const DEFAULT_BACKOFF_MAX: Duration = Duration::from_secs(30);

/// Default jitter as a fraction of the delay (+/-20%).
pub const DEFAULT_BACKOFF_JITTER: f64 = 0.2;

/// Exponential backoff with a cap and proportional jitter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
    /// Fraction in `0.0..=1.0`.
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: DEFAULT_BACKOFF_BASE,
            max: DEFAULT_BACKOFF_MAX,
            jitter: DEFAULT_BACKOFF_JITTER,
        }
    }
}

impl BackoffPolicy {
    /// Same schedule with jitter disabled.
    #[must_use]
    pub fn without_jitter(self) -> Self {
        Self {
            jitter: 0.0,
            ..self
        }
    }

    /// Delay before attempt `attempt` (1-based), without jitter.
    #[must_use]
    pub fn nominal_delay(&self, attempt: u32) -> Duration {
        let mut delay = self.base;
        for _ in 1..attempt {
            delay = (delay * 2).min(self.max);
            if delay == self.max {
                break;
            }
        }
        delay.min(self.max)
    }

    /// Delay before attempt `attempt` (1-based), jittered.
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let nominal = self.nominal_delay(attempt);
        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter <= 0.0 {
            return nominal;
        }
        let factor = rand::thread_rng().gen_range((1.0 - jitter)..=(1.0 + jitter));
        nominal.mul_f64(factor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nominal_delay_doubles_then_caps() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.nominal_delay(1), Duration::from_secs(1));
        assert_eq!(policy.nominal_delay(2), Duration::from_secs(2));
        assert_eq!(policy.nominal_delay(3), Duration::from_secs(4));
        assert_eq!(policy.nominal_delay(5), Duration::from_secs(16));
        assert_eq!(policy.nominal_delay(6), Duration::from_secs(30));
        assert_eq!(policy.nominal_delay(1000), Duration::from_secs(30));
    }

    #[test]
    fn test_attempt_zero_uses_base() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.nominal_delay(0), Duration::from_secs(1));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let policy = BackoffPolicy::default();
        for attempt in 1..10 {
            let nominal = policy.nominal_delay(attempt);
            for _ in 0..50 {
                let delay = policy.delay(attempt);
                assert!(delay >= nominal.mul_f64(0.8));
                assert!(delay <= nominal.mul_f64(1.2));
            }
        }
    }

    #[test]
    fn test_without_jitter_is_exact() {
        let policy = BackoffPolicy::default().without_jitter();
        assert_eq!(policy.delay(4), Duration::from_secs(8));
    }
}
