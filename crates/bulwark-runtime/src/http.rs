//! Retry executor specialised for HTTP responses.
//!
//! A response with a transient status (408, 429, 500, 502, 503, 504) is
//! treated as a retryable failure. Any other non-2xx response is handed
//! back immediately so the caller can inspect it.

use bulwark_core::{is_retryable_status, retry, CancellationToken, ResilienceError, RetryConfig};
use reqwest::Response;
use std::future::Future;

/// Run an HTTP operation with retries.
///
/// Returns `Ok` for 2xx and for non-retryable statuses. When every
/// attempt ends in a retryable status, the last one is reported as
/// [`ResilienceError::HttpStatus`].
pub async fn execute_http<F, Fut>(
    token: &CancellationToken,
    config: &RetryConfig,
    mut op: F,
) -> Result<Response, ResilienceError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Response, ResilienceError>>,
{
    retry::execute(token, config, || {
        let attempt = op();
        async move { classify(attempt.await?) }
    })
    .await
}

fn classify(response: Response) -> Result<Response, ResilienceError> {
    let status = response.status();
    if is_retryable_status(status.as_u16()) {
        tracing::debug!(status = status.as_u16(), url = %response.url(), "Retryable HTTP status");
        return Err(ResilienceError::http_status(
            status.as_u16(),
            status.canonical_reason().unwrap_or("unknown status"),
        ));
    }
    Ok(response)
}

/// Turn a non-2xx response into [`ResilienceError::HttpStatus`].
pub fn error_for_status(response: Response) -> Result<Response, ResilienceError> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else {
        Err(ResilienceError::http_status(
            status.as_u16(),
            status.canonical_reason().unwrap_or("unknown status"),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn response(status: u16) -> Response {
        let inner = http::Response::builder()
            .status(status)
            .body("body")
            .unwrap();
        Response::from(inner)
    }

    fn quick() -> RetryConfig {
        RetryConfig {
            max_attempts: 3,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
            backoff_factor: 2.0,
            jitter_enabled: false,
            ..RetryConfig::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_transient_status_then_succeeds() {
        let calls = AtomicU32::new(0);
        let token = CancellationToken::new();

        let result = execute_http(&token, &quick(), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move { Ok(response(if n == 0 { 503 } else { 200 })) }
        })
        .await
        .unwrap();

        assert_eq!(result.status(), 200);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_client_error_returned_without_retry() {
        let calls = AtomicU32::new(0);
        let token = CancellationToken::new();

        let result = execute_http(&token, &quick(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok(response(404)) }
        })
        .await
        .unwrap();

        assert_eq!(result.status(), 404);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_reports_last_status() {
        let calls = AtomicU32::new(0);
        let token = CancellationToken::new();

        let err = execute_http(&token, &quick(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok(response(429)) }
        })
        .await
        .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(matches!(err, ResilienceError::HttpStatus { status: 429, .. }));
        assert_eq!(err.to_string(), "HTTP 429: Too Many Requests");
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_errors_are_retried() {
        let calls = AtomicU32::new(0);
        let token = CancellationToken::new();

        let result = execute_http(&token, &quick(), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(ResilienceError::Transport("connection reset".to_string()))
                } else {
                    Ok(response(200))
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(result.status(), 200);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_error_for_status() {
        assert!(error_for_status(response(204)).is_ok());
        let err = error_for_status(response(404)).unwrap_err();
        assert_eq!(err.status(), Some(404));
        assert!(!err.is_retryable());
    }
}
