//! Retry with exponential backoff.
//!
//! Ledger commits, archive writes and reconciliation fetches all go through
//! [`retry_if`] so that transient failures are retried the same way
//! everywhere and authoritative rejections are not retried at all.

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
    /// Total attempts including the first; `None` retries forever.
    pub max_attempts: Option<usize>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::commit(5)
    }
}

impl RetryConfig {
    /// Ledger submissions: bounded, since an unreachable ledger must
    /// eventually surface as a FAILED batch.
    #[must_use]
    pub fn commit(max_attempts: usize) -> Self {
        Self {
            max_attempts: Some(max_attempts.max(1)),
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            factor: 2.0,
        }
    }

    /// Archive writes after a commit: a handful of quick attempts, after
    /// which the repair sweep takes over.
    #[must_use]
    pub fn archive() -> Self {
        Self {
            max_attempts: Some(5),
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
            factor: 2.0,
        }
    }

    /// Quick retry for individual reads.
    #[must_use]
    pub fn query() -> Self {
        Self {
            max_attempts: Some(3),
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            factor: 2.0,
        }
    }

    /// Minimal delays, for tests.
    #[must_use]
    pub fn fast(max_attempts: usize) -> Self {
        Self {
            max_attempts: Some(max_attempts.max(1)),
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            factor: 2.0,
        }
    }
}

/// Run `operation` until it succeeds, fails with an error `should_retry`
/// rejects, or the attempt budget is spent. The last error is returned.
pub async fn retry_if<F, Fut, T, E, P>(
    operation_name: &str,
    config: &RetryConfig,
    mut operation: F,
    should_retry: P,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut delay = config.initial_delay;
    let mut attempts = 0;

    loop {
        match operation().await {
            Ok(val) => {
                if attempts > 0 {
                    info!(
                        "Operation '{}' succeeded after {} retries",
                        operation_name, attempts
                    );
                }
                return Ok(val);
            }
            Err(err) => {
                attempts += 1;

                if !should_retry(&err) {
                    return Err(err);
                }

                match config.max_attempts {
                    Some(max) if attempts >= max => return Err(err),
                    Some(max) => warn!(
                        "Operation '{}' failed (attempt {}/{}): {}. Retrying in {:?}...",
                        operation_name, attempts, max, err, delay
                    ),
                    None => warn!(
                        "Operation '{}' failed (attempt {}, will retry forever): {}. Next retry in {:?}...",
                        operation_name, attempts, err, delay
                    ),
                }

                sleep(delay).await;
                delay = (delay.mul_f64(config.factor)).min(config.max_delay);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use openvote_core::Error;

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();

        let result: Result<u64, Error> = retry_if(
            "commit",
            &RetryConfig::fast(5),
            || {
                let a = counter.clone();
                async move {
                    let n = a.fetch_add(1, Ordering::SeqCst) + 1;
                    if n < 3 {
                        Err(Error::LedgerUnreachable(format!("attempt {}", n)))
                    } else {
                        Ok(7)
                    }
                }
            },
            Error::is_transient,
        )
        .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn authoritative_errors_are_not_retried() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();

        let result: Result<(), Error> = retry_if(
            "commit",
            &RetryConfig::fast(5),
            || {
                let a = counter.clone();
                async move {
                    a.fetch_add(1, Ordering::SeqCst);
                    Err(Error::LedgerRejected("duplicate dedup key".to_string()))
                }
            },
            Error::is_transient,
        )
        .await;

        assert!(matches!(result, Err(Error::LedgerRejected(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausts_attempt_budget() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();

        let result: Result<(), Error> = retry_if(
            "archive",
            &RetryConfig::fast(4),
            || {
                let a = counter.clone();
                async move {
                    a.fetch_add(1, Ordering::SeqCst);
                    Err(Error::LedgerUnreachable("down".to_string()))
                }
            },
            |_| true,
        )
        .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn delay_caps_at_max() {
        let config = RetryConfig {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
            factor: 10.0,
            max_attempts: Some(5),
        };
        let delay = (config.initial_delay.mul_f64(config.factor)).min(config.max_delay);
        assert_eq!(delay, Duration::from_secs(5));
        assert_eq!(RetryConfig::commit(0).max_attempts, Some(1));
    }
}
