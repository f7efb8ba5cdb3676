//! Exponential backoff for transient provider failures.

use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::ExecutionConfig;
use crate::error::{ApplyError, Result};

/// Retry settings for one action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, the first one included.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub base_delay: Duration,
    /// Upper bound on the computed delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&ExecutionConfig::default())
    }
}

impl From<&ExecutionConfig> for RetryPolicy {
    fn from(config: &ExecutionConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
        }
    }
}

impl RetryPolicy {
    /// Delay after failed attempt number `attempt` (1-based): `base * 2^(attempt-1)`, capped.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_delay.saturating_mul(1u32 << exponent).min(self.max_delay)
    }

    /// Runs `op` until it succeeds, fails permanently or runs out of attempts.
    ///
    /// A provider-supplied delay hint replaces the computed backoff. Returns the
    /// outcome together with the number of attempts made. Exhausting the
    /// attempts on a transient error yields `MaxRetriesExceeded`.
    pub async fn run<T, F, Fut>(&self, resource: &str, mut op: F) -> (Result<T>, u32)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let err = match op().await {
                Ok(value) => return (Ok(value), attempt),
                Err(err) => err,
            };

            if !err.is_retryable() {
                return (Err(err), attempt);
            }

            if attempt >= self.max_attempts {
                warn!("{resource}: giving up after {attempt} attempts: {err}");
                let exhausted = ApplyError::MaxRetriesExceeded {
                    resource: resource.to_string(),
                    attempts: attempt,
                    last_error: err.to_string(),
                };
                return (Err(exhausted.into()), attempt);
            }

            let delay = err.retry_delay().unwrap_or_else(|| self.delay_for(attempt));
            debug!("{resource}: attempt {attempt} failed ({err}), retrying in {delay:?}");
            tokio::time::sleep(delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ConvergeError, ProviderError};

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(3),
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for(2), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(3), Duration::from_millis(2000));
        assert_eq!(policy.delay_for(4), Duration::from_secs(3));
        assert_eq!(policy.delay_for(64), Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_transient_then_success() {
        let mut failures = 2;
        let (result, attempts) = policy(5)
            .run("cluster", || {
                let fail = failures > 0;
                failures -= i32::from(fail);
                async move {
                    if fail {
                        Err(ProviderError::transient("cluster", "throttled").into())
                    } else {
                        Ok("eks-123")
                    }
                }
            })
            .await;

        assert_eq!(result.expect("eventually succeeds"), "eks-123");
        assert_eq!(attempts, 3);
    }

    #[tokio::test]
    async fn test_permanent_error_is_not_retried() {
        let (result, attempts) = policy(5)
            .run("addon", || async { Err::<(), _>(ProviderError::permanent("addon", "bad name").into()) })
            .await;

        assert!(matches!(result, Err(ConvergeError::Provider(ProviderError::Permanent { .. }))));
        assert_eq!(attempts, 1);
    }

    #[tokio::test]
    async fn test_exhaustion_reports_attempts() {
        let (result, attempts) = policy(3)
            .run("node-group", || async {
                Err::<(), _>(ProviderError::transient("node-group", "eventual consistency").into())
            })
            .await;

        assert_eq!(attempts, 3);
        match result {
            Err(ConvergeError::Apply(ApplyError::MaxRetriesExceeded { resource, attempts, .. })) => {
                assert_eq!(resource, "node-group");
                assert_eq!(attempts, 3);
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
