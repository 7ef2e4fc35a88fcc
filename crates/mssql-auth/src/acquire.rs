//! Retry policy for token acquisition.
//!
//! Identity providers fail in three ways: they throttle (with an optional
//! retry-after hint), they fail for reasons that may clear up, or they reject
//! the request outright. Throttling is retried a bounded number of times,
//! transient failures back off exponentially while the time budget allows,
//! and everything else is returned immediately with authority context.

use std::time::Duration;

use tokio::time::Instant;

use crate::error::{AuthError, ProviderError};
use crate::provider::{FedAuthToken, TokenProvider, TokenRequest};

/// Bounds for [`acquire_with_retry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcquirePolicy {
    /// Throttled responses tolerated before giving up.
    pub max_throttle_attempts: u32,
    /// First sleep after a transient failure; doubles each time.
    pub initial_backoff: Duration,
}

impl Default for AcquirePolicy {
    fn default() -> Self {
        Self {
            max_throttle_attempts: 3,
            initial_backoff: Duration::from_millis(100),
        }
    }
}

fn fits_budget(deadline: Option<Instant>, wait: Duration) -> bool {
    deadline.is_none_or(|deadline| Instant::now() + wait < deadline)
}

/// Acquire a token from `provider`, retrying per `policy` until `deadline`.
///
/// # Errors
///
/// - [`AuthError::AcquisitionTimeout`] if the deadline already passed.
/// - [`AuthError::TokenAcquisitionThrottled`] when throttling outlasts the
///   attempt limit or the retry-after hint does not fit the budget.
/// - [`AuthError::TokenAcquisition`] for fatal failures, and for transient
///   failures once the budget is spent.
pub async fn acquire_with_retry(
    provider: &dyn TokenProvider,
    request: &TokenRequest,
    deadline: Option<Instant>,
    policy: &AcquirePolicy,
) -> Result<FedAuthToken, AuthError> {
    if deadline.is_some_and(|d| Instant::now() >= d) {
        return Err(AuthError::AcquisitionTimeout {
            authority: request.authority.clone(),
        });
    }

    let mut throttled = 0u32;
    let mut backoff = policy.initial_backoff;

    loop {
        let source = match provider.acquire_token(request).await {
            Ok(token) => {
                tracing::debug!(
                    authority = %request.authority,
                    resource = %request.resource,
                    "token acquired"
                );
                return Ok(token);
            }
            Err(e) => e,
        };

        match source {
            ProviderError::RateLimited { retry_after } => {
                throttled += 1;
                let wait = retry_after.unwrap_or(backoff);
                if throttled >= policy.max_throttle_attempts || !fits_budget(deadline, wait) {
                    return Err(AuthError::TokenAcquisitionThrottled {
                        authority: request.authority.clone(),
                        attempts: throttled,
                        retry_after,
                    });
                }
                tracing::warn!(
                    authority = %request.authority,
                    attempt = throttled,
                    wait_ms = wait.as_millis() as u64,
                    "identity provider throttled token request, retrying"
                );
                tokio::time::sleep(wait).await;
            }
            ProviderError::Transient(_) => {
                if !fits_budget(deadline, backoff) {
                    return Err(AuthError::TokenAcquisition {
                        authority: request.authority.clone(),
                        resource: request.resource.clone(),
                        source,
                    });
                }
                tracing::warn!(
                    authority = %request.authority,
                    error = %source,
                    wait_ms = backoff.as_millis() as u64,
                    "transient token acquisition failure, retrying"
                );
                tokio::time::sleep(backoff).await;
                backoff = backoff.saturating_mul(2);
            }
            ProviderError::Fatal(_) => {
                return Err(AuthError::TokenAcquisition {
                    authority: request.authority.clone(),
                    resource: request.resource.clone(),
                    source,
                });
            }
        }
    }
}
