//! Transfer retry logic
//!
//! Wraps a transfer call with retry honouring the profile's `retries` and
//! `retries_sleep`. Only transient filesystem errors are retried; hard
//! validation errors fail immediately. All attempts share one cancellation
//! scope, so cancellation collapses the remaining attempts at once.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use driftsync_core::CoreError;

/// Executes `f` up to `retries` times, sleeping `sleep` between attempts.
///
/// `retries` counts total attempts (a value of 0 still runs once).
pub async fn with_retry<F, Fut, T>(
    operation: &str,
    retries: u32,
    sleep: Duration,
    cancel: &CancellationToken,
    f: F,
) -> Result<T, CoreError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, CoreError>>,
{
    let attempts = retries.max(1);
    let mut last_error = None;

    for attempt in 1..=attempts {
        if cancel.is_cancelled() {
            return Err(CoreError::Cancelled);
        }

        match f().await {
            Ok(value) => {
                if attempt > 1 {
                    info!(operation, attempt, "Operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(CoreError::Cancelled) => return Err(CoreError::Cancelled),
            Err(err) => {
                if attempt < attempts && err.is_transient() {
                    warn!(
                        operation,
                        attempt,
                        sleep_secs = sleep.as_secs(),
                        error = %err,
                        "Transient error, retrying"
                    );
                    last_error = Some(err);
                    if !sleep.is_zero() {
                        tokio::select! {
                            _ = tokio::time::sleep(sleep) => {}
                            _ = cancel.cancelled() => return Err(CoreError::Cancelled),
                        }
                    }
                } else {
                    return Err(err);
                }
            }
        }
    }

    Err(last_error
        .unwrap_or_else(|| CoreError::Internal(format!("retry exhausted for {operation}"))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_success_on_first_attempt() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = Arc::clone(&calls);
        let result = with_retry(
            "op",
            3,
            Duration::ZERO,
            &CancellationToken::new(),
            move || {
                let calls = Arc::clone(&calls2);
                async move {
                    calls.fetch_add(1, Ordering::Relaxed);
                    Ok::<_, CoreError>(42)
                }
            },
        )
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = Arc::clone(&calls);
        let result = with_retry(
            "op",
            3,
            Duration::ZERO,
            &CancellationToken::new(),
            move || {
                let calls = Arc::clone(&calls2);
                async move {
                    if calls.fetch_add(1, Ordering::Relaxed) < 2 {
                        Err(CoreError::fs_transient("connection reset"))
                    } else {
                        Ok(7)
                    }
                }
            },
        )
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn test_validation_errors_fail_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = Arc::clone(&calls);
        let result: Result<(), _> = with_retry(
            "op",
            5,
            Duration::ZERO,
            &CancellationToken::new(),
            move || {
                let calls = Arc::clone(&calls2);
                async move {
                    calls.fetch_add(1, Ordering::Relaxed);
                    Err(CoreError::Validation("bad remote".into()))
                }
            },
        )
        .await;
        assert!(matches!(result, Err(CoreError::Validation(_))));
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_exhausted_retries_return_last_error() {
        let result: Result<(), _> = with_retry(
            "op",
            2,
            Duration::ZERO,
            &CancellationToken::new(),
            || async { Err(CoreError::fs_transient("flaky")) },
        )
        .await;
        match result {
            Err(CoreError::Filesystem { message, .. }) => assert_eq!(message, "flaky"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_cancellation_collapses_retries() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result: Result<(), _> = with_retry(
            "op",
            5,
            Duration::from_secs(30),
            &cancel,
            || async { Err(CoreError::fs_transient("flaky")) },
        )
        .await;
        assert!(matches!(result, Err(CoreError::Cancelled)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_during_sleep() {
        let cancel = CancellationToken::new();
        let cancel2 = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            cancel2.cancel();
        });

        let result: Result<(), _> = with_retry(
            "op",
            3,
            Duration::from_secs(60),
            &cancel,
            || async { Err(CoreError::fs_transient("flaky")) },
        )
        .await;
        assert!(matches!(result, Err(CoreError::Cancelled)));
    }
}
