//! Exponential-backoff retry executor.

use anyhow::{Result, anyhow};
use log::{debug, warn};
use std::future::Future;
use tokio_util::sync::CancellationToken;

use super::classify::{classify_anyhow, is_retryable, is_retryable_status};
use super::client::Response;
use super::error::TransportError;
use super::policy::RetryPolicy;

/// Runs `operation` until it yields a non-retryable outcome or retries run out.
///
/// `operation` must be safe to replay: multipart uploads and streaming
/// bodies bypass the executor. Attempts run one after another on the
/// calling task; the inter-attempt delay and the attempt itself both race
/// `cancel`, which short-circuits with [`TransportError::Cancelled`].
///
/// A response whose status is in the policy's retryable set is retried; if
/// retries run out it is returned as `Ok` so its status and body stay
/// available to the caller. Any other response, including 4xx, is returned
/// immediately.
#[tracing::instrument(skip(policy, cancel, operation))]
pub async fn execute<F, Fut>(
    operation_name: &str,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    mut operation: F,
) -> Result<Response>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Response>>,
{
    let total = u64::from(policy.max_retries()) + 1;
    let mut last: Option<Result<Response>> = None;

    for attempt in 0..=policy.max_retries() {
        if attempt > 0 {
            let delay = policy.next_delay(attempt);
            if let Some(Err(e)) = &last {
                warn!(
                    "{}: attempt {}/{} failed ({}), retrying in {:?}...",
                    operation_name, attempt, total, e, delay
                );
            } else if let Some(Ok(response)) = &last {
                warn!(
                    "{}: attempt {}/{} returned HTTP {}, retrying in {:?}...",
                    operation_name,
                    attempt,
                    total,
                    response.status.as_u16(),
                    delay
                );
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(cancelled(last)),
                _ = tokio::time::sleep(delay) => {}
            }
        }

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(cancelled(last)),
            outcome = operation() => outcome,
        };

        match outcome {
            Ok(response) => {
                if !is_retryable_status(response.status.as_u16(), policy) {
                    return Ok(response);
                }
                let err = anyhow::Error::from(TransportError::RetryableStatus(response.status));
                debug!("{}: {}", operation_name, err);
                last = Some(Ok(response));
            }
            Err(e) => {
                if let Some(TransportError::Cancelled { .. }) = e.downcast_ref::<TransportError>() {
                    return Err(e);
                }
                if !is_retryable(e.as_ref(), policy) {
                    debug!(
                        "{}: non-retryable error ({}): {}",
                        operation_name,
                        classify_anyhow(&e),
                        e
                    );
                    return Err(e);
                }
                last = Some(Err(e));
            }
        }
    }

    match last {
        Some(Ok(response)) => {
            debug!(
                "{}: giving up after {} attempts with HTTP {}",
                operation_name,
                total,
                response.status.as_u16()
            );
            Ok(response)
        }
        Some(Err(e)) => Err(e.context(format!(
            "{}: failed after {} attempts",
            operation_name, total
        ))),
        None => Err(anyhow!("{}: no attempt was made", operation_name)),
    }
}

fn cancelled(last: Option<Result<Response>>) -> anyhow::Error {
    anyhow::Error::from(TransportError::Cancelled {
        last_response: last.and_then(Result::ok),
    })
}

/// Returns true when `err` is (or wraps) a cancellation from the executor.
pub fn is_cancelled(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        matches!(
            cause.downcast_ref::<TransportError>(),
            Some(TransportError::Cancelled { .. })
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::StatusCode;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn response(status: u16) -> Response {
        Response::new(
            StatusCode::from_u16(status).unwrap(),
            Default::default(),
            format!("status {status}").into_bytes(),
        )
    }

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy::new(
            max_retries,
            Duration::from_millis(1),
            Duration::from_millis(5),
            2.0,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_execute_success_first_attempt() {
        let cancel = CancellationToken::new();
        let result =
            execute("test", &fast_policy(3), &cancel, || async { Ok(response(200)) }).await;
        assert_eq!(result.unwrap().status, StatusCode::OK);
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_exhausts_retries_on_retryable_error() {
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts_clone = Arc::clone(&attempts);
        let cancel = CancellationToken::new();

        let result = execute("test", &RetryPolicy::default(), &cancel, || {
            let attempts = Arc::clone(&attempts_clone);
            async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(anyhow!("read: connection reset by peer"))
            }
        })
        .await;

        let err = result.unwrap_err();
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
        assert!(format!("{:#}", err).contains("connection reset by peer"));
    }

    #[tokio::test]
    async fn test_execute_non_retryable_error_single_attempt() {
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts_clone = Arc::clone(&attempts);
        let cancel = CancellationToken::new();

        let result = execute("test", &fast_policy(3), &cancel, || {
            let attempts = Arc::clone(&attempts_clone);
            async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(anyhow!("notebook payload failed validation"))
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_execute_dns_error_without_temporary_single_attempt() {
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts_clone = Arc::clone(&attempts);
        let cancel = CancellationToken::new();

        let result = execute("test", &fast_policy(3), &cancel, || {
            let attempts = Arc::clone(&attempts_clone);
            async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(anyhow!("lookup notebook.invalid: no such host"))
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[test_log::test(tokio::test)]
    async fn test_execute_retries_503_then_succeeds() {
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts_clone = Arc::clone(&attempts);
        let cancel = CancellationToken::new();

        let result = execute("test", &fast_policy(3), &cancel, || {
            let attempts = Arc::clone(&attempts_clone);
            async move {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                if n < 2 { Ok(response(503)) } else { Ok(response(200)) }
            }
        })
        .await;

        assert_eq!(result.unwrap().status, StatusCode::OK);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_execute_404_not_retried() {
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts_clone = Arc::clone(&attempts);
        let cancel = CancellationToken::new();

        let result = execute("test", &fast_policy(3), &cancel, || {
            let attempts = Arc::clone(&attempts_clone);
            async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                Ok(response(404))
            }
        })
        .await;

        assert_eq!(result.unwrap().status, StatusCode::NOT_FOUND);
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_execute_returns_last_retryable_response_when_exhausted() {
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts_clone = Arc::clone(&attempts);
        let cancel = CancellationToken::new();

        let result = execute("test", &fast_policy(2), &cancel, || {
            let attempts = Arc::clone(&attempts_clone);
            async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                Ok(response(503))
            }
        })
        .await;

        let response = result.unwrap();
        assert_eq!(response.status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.body, b"status 503");
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_execute_zero_retries_single_attempt_without_delay() {
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts_clone = Arc::clone(&attempts);
        let cancel = CancellationToken::new();
        let policy = RetryPolicy::no_retry();

        let start = std::time::Instant::now();
        let result = execute("test", &policy, &cancel, || {
            let attempts = Arc::clone(&attempts_clone);
            async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(anyhow!("i/o timeout"))
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_execute_max_retries_at_u32_max() {
        let cancel = CancellationToken::new();
        let policy = RetryPolicy::new(u32::MAX, Duration::ZERO, Duration::ZERO, 1.0).unwrap();

        let result = execute("test", &policy, &cancel, || async { Ok(response(200)) }).await;
        assert_eq!(result.unwrap().status, StatusCode::OK);
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_cancel_during_delay_returns_early() {
        let cancel = CancellationToken::new();
        let policy =
            RetryPolicy::new(3, Duration::from_secs(10), Duration::from_secs(10), 1.0).unwrap();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let start = tokio::time::Instant::now();
        let result = execute("test", &policy, &cancel, || async { Ok(response(502)) }).await;

        let err = result.unwrap_err();
        assert!(start.elapsed() < Duration::from_secs(5));
        assert!(is_cancelled(&err));
        match err.downcast_ref::<TransportError>() {
            Some(TransportError::Cancelled { last_response }) => {
                let last = last_response.as_ref().expect("last response kept");
                assert_eq!(last.status, StatusCode::BAD_GATEWAY);
            }
            other => panic!("expected cancellation, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_cancel_during_call() {
        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let result = execute("test", &fast_policy(3), &cancel, || async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(response(200))
        })
        .await;

        assert!(is_cancelled(&result.unwrap_err()));
    }

    #[tokio::test]
    async fn test_execute_already_cancelled_makes_no_attempt() {
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts_clone = Arc::clone(&attempts);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = execute("test", &fast_policy(3), &cancel, || {
            let attempts = Arc::clone(&attempts_clone);
            async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                Ok(response(200))
            }
        })
        .await;

        assert!(is_cancelled(&result.unwrap_err()));
        assert_eq!(attempts.load(Ordering::SeqCst), 0);
    }
}
