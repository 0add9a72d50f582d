//! Bounded exponential backoff around single store calls.
//!
//! Only transient failures are retried. Everything else, including a clean
//! predicate mismatch, goes straight back to the caller.

use crate::config::RetryPolicy;
use crate::error::Result;
use std::future::Future;
use tracing::warn;

/// Runs `op` until it succeeds, fails permanently, or the policy runs out of
/// attempts. The last error is returned unchanged.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, operation: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt + 1 < max_attempts => {
                let backoff = policy.backoff_for_attempt(attempt);
                warn!(
                    operation,
                    attempt = attempt + 1,
                    max_attempts,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %err,
                    "transient store failure, retrying"
                );
                tokio::time::sleep(backoff).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LedgerError;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::immediate(3);

        let result = with_retry(&policy, "flaky", || {
            let calls = calls.clone();
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(LedgerError::StoreError("connection reset".into()))
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_attempts_are_bounded() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::immediate(4);

        let result: Result<()> = with_retry(&policy, "down", || {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(LedgerError::StoreError("unreachable".into()))
            }
        })
        .await;

        assert!(matches!(result, Err(LedgerError::StoreError(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_permanent_failures_are_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::immediate(5);

        let result: Result<()> = with_retry(&policy, "missing", || {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(LedgerError::not_found("accounts", "Z"))
            }
        })
        .await;

        assert!(matches!(result, Err(LedgerError::NotFound { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_waits_between_attempts() {
        let policy = RetryPolicy {
            max_attempts: 3,
            initial_backoff_ms: 100,
            max_backoff_ms: 1_000,
            backoff_multiplier: 2.0,
        };
        let start = tokio::time::Instant::now();

        let _: Result<()> = with_retry(&policy, "slow", || async {
            Err(LedgerError::StoreError("busy".into()))
        })
        .await;

        assert!(start.elapsed() >= std::time::Duration::from_millis(300));
    }
}
