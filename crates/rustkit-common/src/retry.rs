//! Backoff and timeout utilities.

use std::future::Future;
use std::time::Duration;

/// Exponential backoff between failed attempts.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    /// Delay after the first failure.
    pub initial_delay: Duration,
    /// Growth factor applied for every further failure.
    pub multiplier: f64,
    /// Upper bound on any single delay.
    pub max_delay: Option<Duration>,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(100),
            multiplier: 2.0,
            max_delay: None,
        }
    }
}

impl BackoffPolicy {
    /// Create a policy without an upper bound.
    pub fn new(initial_delay: Duration, multiplier: f64) -> Self {
        Self {
            initial_delay,
            multiplier,
            max_delay: None,
        }
    }

    /// Cap every delay at `max_delay`.
    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = Some(max_delay);
        self
    }

    /// Delay to wait after `failures` consecutive failures.
    ///
    /// `initial_delay * multiplier^(failures - 1)`; zero failures means no wait.
    pub fn delay_for_failures(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }

        let exponent = i32::try_from(failures - 1).unwrap_or(i32::MAX);
        let secs = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let delay = Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX);

        match self.max_delay {
            Some(max) => delay.min(max),
            None => delay,
        }
    }
}

/// Run an operation with a timeout.
pub async fn with_timeout<T, Fut>(timeout: Duration, operation: Fut) -> crate::Result<T>
where
    Fut: Future<Output = T>,
{
    tokio::time::timeout(timeout, operation)
        .await
        .map_err(|_| crate::RustKitError::Timeout(timeout))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::sleep;

    #[test]
    fn test_no_failures_no_delay() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay_for_failures(0), Duration::ZERO);
    }

    #[test]
    fn test_delay_grows_geometrically() {
        let policy = BackoffPolicy::new(Duration::from_secs(5), 2.0);

        assert_eq!(policy.delay_for_failures(1), Duration::from_secs(5));
        assert_eq!(policy.delay_for_failures(2), Duration::from_secs(10));
        assert_eq!(policy.delay_for_failures(3), Duration::from_secs(20));
    }

    #[test]
    fn test_delay_strictly_increasing() {
        let policy = BackoffPolicy::new(Duration::from_millis(300), 3.0);
        let delays: Vec<_> = (1..8).map(|k| policy.delay_for_failures(k)).collect();
        assert!(delays.windows(2).all(|pair| pair[0] < pair[1]));
    }

    #[test]
    fn test_delay_respects_max() {
        let policy = BackoffPolicy::new(Duration::from_secs(10), 2.0)
            .with_max_delay(Duration::from_secs(15));

        assert_eq!(policy.delay_for_failures(1), Duration::from_secs(10));
        assert_eq!(policy.delay_for_failures(2), Duration::from_secs(15));
    }

    #[test]
    fn test_huge_exponent_saturates() {
        let policy = BackoffPolicy::new(Duration::from_secs(1), 10.0);
        assert_eq!(policy.delay_for_failures(u32::MAX), Duration::MAX);
    }

    #[tokio::test]
    async fn test_timeout() {
        let result = with_timeout(Duration::from_millis(10), async {
            sleep(Duration::from_secs(1)).await;
            42
        })
        .await;

        assert!(matches!(result, Err(crate::RustKitError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_timeout_passes_value_through() {
        let result = with_timeout(Duration::from_secs(1), async { 7 }).await;
        assert_eq!(result.unwrap(), 7);
    }
}
