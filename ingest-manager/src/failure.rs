//! Upstream failure classification.
//!
//! Each provider client maps raw HTTP/transport errors into an [`ApiFailure`]
//! with a closed [`FailureKind`]; [`run_with_budgets`] then applies the
//! budget matching the first failure's class. Auth failures are handed back
//! untouched so the client can refresh credentials and retry on its own
//! terms.

use std::future::Future;

use keeper::Error;

use crate::retry::{retry_with_policy, RetryPolicy};

/// Closed classification of upstream failures.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureKind {
    /// HTTP 429 or an explicit rate-limit error code
    RateLimited,
    /// HTTP 401 or an explicit expired/invalid-token error code
    AuthExpired,
    /// Connection refused, timeout, DNS failure
    Network,
    Other,
}

/// A classified upstream failure, pre-wrap.
#[derive(Clone, Debug)]
pub struct ApiFailure {
    pub kind: FailureKind,
    pub message: String,
    /// Upstream HTTP status, when the failure came from a response
    pub status: Option<u16>,
}

impl ApiFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>, status: Option<u16>) -> Self {
        Self {
            kind,
            message: message.into(),
            status,
        }
    }

    /// Classifies an HTTP response status.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let kind = match status {
            429 => FailureKind::RateLimited,
            401 => FailureKind::AuthExpired,
            _ => FailureKind::Other,
        };
        Self::new(kind, message, Some(status))
    }

    /// Classifies a transport error from the HTTP client.
    pub fn from_transport(err: &reqwest::Error) -> Self {
        let kind = if is_network_error(err) {
            FailureKind::Network
        } else {
            FailureKind::Other
        };
        Self::new(kind, err.to_string(), err.status().map(|s| s.as_u16()))
    }

    /// Wraps the failure as a terminal error, naming the operation that was
    /// being attempted (e.g. "fetching accounts").
    pub fn into_error(self, operation: &str) -> Error {
        match self.kind {
            FailureKind::RateLimited => Error::provider_api(
                format!("Rate limit exceeded when {}", operation),
                self.status,
            ),
            FailureKind::Network => Error::provider_api(
                format!("Network error when {}: {}", operation, self.message),
                self.status,
            ),
            FailureKind::AuthExpired => Error::AuthExpired(format!(
                "authentication rejected when {}: {}",
                operation, self.message
            )),
            FailureKind::Other => Error::provider_api(
                format!("Upstream error when {}: {}", operation, self.message),
                self.status,
            ),
        }
    }
}

/// Recognized transport-level network failure signatures.
fn is_network_error(err: &reqwest::Error) -> bool {
    if err.is_connect() || err.is_timeout() {
        return true;
    }
    let message = err.to_string().to_ascii_lowercase();
    message.contains("connection refused")
        || message.contains("timed out")
        || message.contains("dns error")
        || message.contains("failed to lookup address")
}

/// Per-provider retry budgets, keyed by failure class.
#[derive(Clone, Copy, Debug)]
pub struct RetryBudgets {
    pub rate_limited: RetryPolicy,
    pub network: RetryPolicy,
}

impl Default for RetryBudgets {
    fn default() -> Self {
        Self {
            rate_limited: RetryPolicy::new(2, 1000),
            network: RetryPolicy::new(1, 1000),
        }
    }
}

/// Runs `op`, letting the first failure's class pick the retry budget.
///
/// Rate-limit and network failures are retried under the matching budget,
/// counting the probe attempt against it, so an operation that always fails
/// rate-limited runs exactly `rate_limited.max_retries + 1` times. Auth
/// failures and everything else are returned after the first attempt.
pub async fn run_with_budgets<T, F, Fut>(budgets: RetryBudgets, mut op: F) -> Result<T, ApiFailure>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ApiFailure>>,
{
    let first = match op().await {
        Ok(value) => return Ok(value),
        Err(failure) => failure,
    };

    let policy = match first.kind {
        FailureKind::RateLimited => budgets.rate_limited,
        FailureKind::Network => budgets.network,
        FailureKind::AuthExpired | FailureKind::Other => return Err(first),
    };

    if policy.max_retries == 0 {
        return Err(first);
    }

    tokio::time::sleep(policy.delay).await;
    retry_with_policy(
        RetryPolicy {
            max_retries: policy.max_retries - 1,
            delay: policy.delay,
        },
        op,
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn tiny_budgets() -> RetryBudgets {
        RetryBudgets {
            rate_limited: RetryPolicy::new(2, 1),
            network: RetryPolicy::new(1, 1),
        }
    }

    #[test]
    fn test_status_classification() {
        assert_eq!(ApiFailure::from_status(429, "slow down").kind, FailureKind::RateLimited);
        assert_eq!(ApiFailure::from_status(401, "expired").kind, FailureKind::AuthExpired);
        assert_eq!(ApiFailure::from_status(500, "boom").kind, FailureKind::Other);
        assert_eq!(ApiFailure::from_status(404, "gone").status, Some(404));
    }

    #[test]
    fn test_terminal_error_messages_name_the_operation() {
        let err = ApiFailure::from_status(429, "slow down").into_error("fetching accounts");
        assert_eq!(
            err.to_string(),
            "provider API error: Rate limit exceeded when fetching accounts"
        );
        assert_eq!(err.upstream_status(), Some(429));

        let err = ApiFailure::new(FailureKind::Network, "connection refused", None)
            .into_error("fetching transactions");
        assert!(err
            .to_string()
            .contains("Network error when fetching transactions"));

        let err = ApiFailure::from_status(401, "expired").into_error("listing messages");
        assert!(matches!(err, keeper::Error::AuthExpired(_)));
    }

    #[tokio::test]
    async fn test_rate_limited_exhausts_its_budget() {
        let attempts = AtomicU32::new(0);

        let result: Result<(), ApiFailure> = run_with_budgets(tiny_budgets(), || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(ApiFailure::from_status(429, "slow down")) }
        })
        .await;

        assert_eq!(result.unwrap_err().kind, FailureKind::RateLimited);
        // budget is 2 retries: probe + 2 = 3 attempts total
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_network_budget_is_narrower() {
        let attempts = AtomicU32::new(0);

        let result: Result<(), ApiFailure> = run_with_budgets(tiny_budgets(), || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(ApiFailure::new(FailureKind::Network, "timed out", None)) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_auth_failure_returned_untouched() {
        let attempts = AtomicU32::new(0);

        let result: Result<(), ApiFailure> = run_with_budgets(tiny_budgets(), || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(ApiFailure::from_status(401, "expired")) }
        })
        .await;

        assert_eq!(result.unwrap_err().kind, FailureKind::AuthExpired);
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_other_failure_not_retried() {
        let attempts = AtomicU32::new(0);

        let result: Result<(), ApiFailure> = run_with_budgets(tiny_budgets(), || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(ApiFailure::from_status(500, "boom")) }
        })
        .await;

        assert_eq!(result.unwrap_err().kind, FailureKind::Other);
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_recovery_mid_budget() {
        let attempts = AtomicU32::new(0);

        let result: Result<u32, ApiFailure> = run_with_budgets(tiny_budgets(), || {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 1 {
                    Err(ApiFailure::from_status(429, "slow down"))
                } else {
                    Ok(n)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 1);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }
}
