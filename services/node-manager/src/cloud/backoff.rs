//! Exponential backoff with jitter.

use std::time::Duration;

use rand::Rng;

use crate::config::BackoffConfig;

/// Exponential backoff configuration.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Base delay for first retry.
    pub base: Duration,

    /// Maximum delay.
    pub max: Duration,

    /// Jitter factor (0.0 to 1.0).
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::from(&BackoffConfig::default())
    }
}

impl From<&BackoffConfig> for BackoffPolicy {
    fn from(config: &BackoffConfig) -> Self {
        Self {
            base: Duration::from_millis(config.base_ms),
            max: Duration::from_millis(config.max_ms),
            jitter: config.jitter,
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry number `attempt` (0-based).
    ///
    /// `base * 2^attempt`, capped at `max`, then spread by up to
    /// `±jitter * delay`. The result never exceeds `max`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base.as_secs_f64();
        let max = self.max.as_secs_f64();
        let delay = (base * 2f64.powi(attempt.min(30) as i32)).min(max);

        let spread = delay * self.jitter.clamp(0.0, 1.0);
        let jitter = if spread > 0.0 {
            rand::rng().random_range(-spread..=spread)
        } else {
            0.0
        };

        Duration::from_secs_f64((delay + jitter).clamp(0.0, max))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows() {
        let policy = BackoffPolicy {
            base: Duration::from_millis(100),
            max: Duration::from_secs(30),
            jitter: 0.25,
        };

        // Exponential with bounded jitter.
        for attempt in 0..5 {
            let nominal = 100.0 * 2f64.powi(attempt as i32);
            let d = policy.delay(attempt).as_secs_f64() * 1000.0;
            assert!(d >= nominal * 0.75 - 1.0, "attempt {attempt}: {d}");
            assert!(d <= nominal * 1.25 + 1.0, "attempt {attempt}: {d}");
        }
    }

    #[test]
    fn test_backoff_capped() {
        let policy = BackoffPolicy {
            base: Duration::from_secs(1),
            max: Duration::from_secs(5),
            jitter: 0.5,
        };

        for attempt in [10, 31, u32::MAX] {
            assert!(policy.delay(attempt) <= Duration::from_secs(5));
        }
    }

    #[test]
    fn test_no_jitter_is_exact() {
        let policy = BackoffPolicy {
            base: Duration::from_millis(200),
            max: Duration::from_secs(10),
            jitter: 0.0,
        };
        assert_eq!(policy.delay(0), Duration::from_millis(200));
        assert_eq!(policy.delay(3), Duration::from_millis(1600));
    }
}
