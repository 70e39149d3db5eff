//! Pluggable retry policies for failed fetch executions.

use std::time::Duration;

/// Decides whether a failed fetch attempt should be retried.
///
/// The query consults the policy after each failure with the number of
/// failures so far (starting at 1) and the failure reason. Returning
/// `Some(delay)` schedules another attempt after `delay`; `None` makes the
/// failure terminal. The query itself never hard-codes a backoff curve.
pub trait RetryPolicy: Send + Sync {
    /// Delay before the next attempt, or `None` to stop retrying.
    fn retry_after(&self, failure_count: u32, error: &anyhow::Error) -> Option<Duration>;
}

/// Never retries: the first failure surfaces immediately.
///
/// This is the default policy.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRetry;

impl RetryPolicy for NoRetry {
    fn retry_after(&self, _failure_count: u32, _error: &anyhow::Error) -> Option<Duration> {
        None
    }
}

/// Retries with a fixed delay up to `max_attempts` total attempts.
#[derive(Debug, Clone, Copy)]
pub struct FixedBackoff {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay between attempts.
    pub delay: Duration,
}

impl RetryPolicy for FixedBackoff {
    fn retry_after(&self, failure_count: u32, _error: &anyhow::Error) -> Option<Duration> {
        (failure_count < self.max_attempts).then_some(self.delay)
    }
}

/// Retries with a doubling delay, capped at `max_delay`, up to
/// `max_attempts` total attempts.
#[derive(Debug, Clone, Copy)]
pub struct ExponentialBackoff {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound on the delay between attempts.
    pub max_delay: Duration,
}

impl RetryPolicy for ExponentialBackoff {
    fn retry_after(&self, failure_count: u32, _error: &anyhow::Error) -> Option<Duration> {
        if failure_count >= self.max_attempts {
            return None;
        }
        let exponent = failure_count.saturating_sub(1).min(31);
        let delay = self
            .initial_delay
            .saturating_mul(2u32.saturating_pow(exponent));
        Some(delay.min(self.max_delay))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn error() -> anyhow::Error {
        anyhow::anyhow!("boom")
    }

    #[test]
    fn no_retry_always_stops() {
        assert_eq!(NoRetry.retry_after(1, &error()), None);
    }

    #[test]
    fn fixed_backoff_counts_total_attempts() {
        let policy = FixedBackoff {
            max_attempts: 3,
            delay: Duration::from_millis(10),
        };
        assert_eq!(policy.retry_after(1, &error()), Some(policy.delay));
        assert_eq!(policy.retry_after(2, &error()), Some(policy.delay));
        assert_eq!(policy.retry_after(3, &error()), None);
    }

    #[test]
    fn exponential_backoff_doubles_and_caps() {
        let policy = ExponentialBackoff {
            max_attempts: 5,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(300),
        };
        assert_eq!(
            policy.retry_after(1, &error()),
            Some(Duration::from_millis(100))
        );
        assert_eq!(
            policy.retry_after(2, &error()),
            Some(Duration::from_millis(200))
        );
        assert_eq!(
            policy.retry_after(3, &error()),
            Some(Duration::from_millis(300))
        );
        assert_eq!(policy.retry_after(5, &error()), None);
    }
}
