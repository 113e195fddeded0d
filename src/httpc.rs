//! Control-plane HTTP client with a bounded retry policy.
//!
//! Transient failures — connection refused while the guest is still
//! booting, request timeouts, 500/502/504 from a half-started listener —
//! are retried with exponential backoff up to a fixed count. Exhaustion is
//! the caller's fatal error; anything else (4xx) is returned immediately.

use std::time::Duration;

use anyhow::{Context, Result, bail};
use reqwest::StatusCode;
use tracing::{debug, warn};

/// Bounded exponential backoff: delay before retry `n` (1-based) is
/// `backoff_factor * 2^(n-1)` seconds, capped at [`RetryPolicy::MAX_BACKOFF`].
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_retries: 30, backoff_factor: 0.3 }
    }
}

impl RetryPolicy {
    pub const MAX_BACKOFF: Duration = Duration::from_secs(120);

    /// No retries at all; for best-effort pings.
    pub fn none() -> Self {
        Self { max_retries: 0, backoff_factor: 0.0 }
    }

    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let secs = self.backoff_factor * f64::from(2u32.saturating_pow(attempt - 1).min(1 << 20));
        Duration::from_secs_f64(secs).min(Self::MAX_BACKOFF)
    }
}

/// Statuses treated as transient listener trouble.
pub fn is_retryable_status(status: StatusCode) -> bool {
    matches!(status.as_u16(), 500 | 502 | 504)
}

/// Client with the standard per-request timeout for control-plane calls.
pub fn control_client(timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .expect("reqwest client build failed")
}

/// POST a form-encoded body, retrying per `policy`. Returns the response
/// body text of the first success.
pub async fn post_form_retrying(
    client: &reqwest::Client,
    url: &str,
    fields: &[(&str, String)],
    policy: &RetryPolicy,
) -> Result<String> {
    retrying(url, policy, || async {
        client.post(url).form(fields).send().await
    })
    .await
}

/// GET with the same retry behaviour.
pub async fn get_retrying(
    client: &reqwest::Client,
    url: &str,
    policy: &RetryPolicy,
) -> Result<String> {
    retrying(url, policy, || async { client.get(url).send().await }).await
}

async fn retrying<F, Fut>(url: &str, policy: &RetryPolicy, send: F) -> Result<String>
where
    F: Fn() -> Fut,
    Fut: Future<Output = reqwest::Result<reqwest::Response>>,
{
    let mut attempt = 0u32;
    loop {
        match send().await {
            Ok(resp) if !is_retryable_status(resp.status()) => {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                if !status.is_success() {
                    bail!("{url} returned {status}: {body}");
                }
                return Ok(body);
            }
            Ok(resp) => {
                warn!(url, status = resp.status().as_u16(), attempt, "retryable status");
            }
            Err(e) if e.is_connect() || e.is_timeout() => {
                debug!(url, attempt, error = %e, "transient request failure");
            }
            Err(e) => {
                return Err(e).with_context(|| format!("request to {url} failed"));
            }
        }

        attempt += 1;
        if attempt > policy.max_retries {
            bail!("{url} still failing after {} retries", policy.max_retries);
        }
        tokio::time::sleep(policy.backoff_delay(attempt)).await;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_schedule_doubles() {
        let policy = RetryPolicy { max_retries: 5, backoff_factor: 0.3 };
        assert_eq!(policy.backoff_delay(1), Duration::from_secs_f64(0.3));
        assert_eq!(policy.backoff_delay(2), Duration::from_secs_f64(0.6));
        assert_eq!(policy.backoff_delay(3), Duration::from_secs_f64(1.2));
        assert_eq!(policy.backoff_delay(4), Duration::from_secs_f64(2.4));
    }

    #[test]
    fn backoff_is_capped() {
        let policy = RetryPolicy { max_retries: 30, backoff_factor: 0.3 };
        assert_eq!(policy.backoff_delay(30), RetryPolicy::MAX_BACKOFF);
    }

    #[test]
    fn retryable_statuses_match_forcelist() {
        assert!(is_retryable_status(StatusCode::INTERNAL_SERVER_ERROR));
        assert!(is_retryable_status(StatusCode::BAD_GATEWAY));
        assert!(is_retryable_status(StatusCode::GATEWAY_TIMEOUT));
        assert!(!is_retryable_status(StatusCode::NOT_FOUND));
        assert!(!is_retryable_status(StatusCode::SERVICE_UNAVAILABLE));
        assert!(!is_retryable_status(StatusCode::OK));
    }

    #[tokio::test]
    async fn non_retryable_client_error_is_fatal_immediately() {
        // Bind a listener that always answers 404.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = axum::Router::new();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        let client = control_client(Duration::from_secs(2));
        let policy = RetryPolicy { max_retries: 3, backoff_factor: 0.01 };
        let err = get_retrying(&client, &format!("http://{addr}/missing"), &policy)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("404"), "got: {err}");
    }
}
