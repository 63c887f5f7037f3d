//! Fail-open and transient-retry helpers
//!
//! `fail_open` is for sinks whose failure must never affect run state
//! (notifications, reports). `retry_transient` wraps collaborator calls: only
//! errors reporting `is_transient()` are retried, everything else is returned
//! on the first failure.
//!
//! DO NOT use fail-open for:
//! - Run state reads and commits
//! - Validation and test classification

use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::config::TransientConfig;
use crate::Result;

/// Execute an operation that should fail open
///
/// Logs the error via `tracing::warn!` on failure and returns `None`.
pub async fn fail_open<F, Fut, T>(operation_name: &str, f: F) -> Option<T>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    match f().await {
        Ok(val) => Some(val),
        Err(e) => {
            warn!("{} failed (fail-open): {}", operation_name, e);
            None
        }
    }
}

/// Bounded linear backoff for transient dependency failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: usize, backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    /// Single attempt, no waiting
    pub fn none() -> Self {
        Self::new(1, Duration::ZERO)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&TransientConfig::default())
    }
}

impl From<&TransientConfig> for RetryPolicy {
    fn from(config: &TransientConfig) -> Self {
        Self::new(config.max_attempts, config.backoff())
    }
}

/// Retry an operation while it fails transiently
///
/// Attempt `n` that fails transiently waits `backoff * n` before the next one.
/// The last error is returned once attempts run out.
pub async fn retry_transient<F, Fut, T>(
    operation_name: &str,
    policy: RetryPolicy,
    mut f: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 1;
    loop {
        match f().await {
            Ok(val) => return Ok(val),
            Err(e) if e.is_transient() && attempt < policy.max_attempts => {
                warn!(
                    "{} failed transiently (attempt {}/{}): {}",
                    operation_name, attempt, policy.max_attempts, e
                );
                tokio::time::sleep(policy.backoff * attempt as u32).await;
                attempt += 1;
            }
            Err(e) => {
                if e.is_transient() {
                    warn!(
                        "{} failed after {} attempts: {}",
                        operation_name, policy.max_attempts, e
                    );
                }
                return Err(e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::LiftifyError;

    fn fast_policy() -> RetryPolicy {
        RetryPolicy::new(3, Duration::from_millis(1))
    }

    #[tokio::test]
    async fn test_fail_open_success() {
        let result = fail_open("test_op", || async { Ok::<_, LiftifyError>(42) }).await;
        assert_eq!(result, Some(42));
    }

    #[tokio::test]
    async fn test_fail_open_failure() {
        let result = fail_open("test_op", || async {
            Err::<i32, _>(LiftifyError::Other("sink down".to_string()))
        })
        .await;
        assert_eq!(result, None);
    }

    #[tokio::test]
    async fn test_retry_transient_recovers() {
        let mut attempts = 0;
        let result = retry_transient("test_op", fast_policy(), || {
            attempts += 1;
            let current = attempts;
            async move {
                if current < 2 {
                    Err(LiftifyError::transient("test_op", "connection reset"))
                } else {
                    Ok(42)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts, 2);
    }

    #[tokio::test]
    async fn test_retry_transient_gives_up() {
        let mut attempts = 0;
        let result: Result<i32> = retry_transient("test_op", fast_policy(), || {
            attempts += 1;
            async { Err(LiftifyError::transient("test_op", "still down")) }
        })
        .await;
        assert!(result.unwrap_err().is_transient());
        assert_eq!(attempts, 3);
    }

    #[tokio::test]
    async fn test_retry_transient_skips_permanent_errors() {
        let mut attempts = 0;
        let result: Result<i32> = retry_transient("test_op", fast_policy(), || {
            attempts += 1;
            async { Err(LiftifyError::Collaborator("bad request".to_string())) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(attempts, 1);
    }

    #[test]
    fn test_policy_never_zero_attempts() {
        assert_eq!(RetryPolicy::new(0, Duration::ZERO).max_attempts, 1);
        assert_eq!(RetryPolicy::default().max_attempts, 3);
    }
}
