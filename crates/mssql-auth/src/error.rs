//! Authentication error types.

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur during authentication.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AuthError {
    /// Invalid credentials provided.
    #[error("invalid credentials: {0}")]
    InvalidCredentials(String),

    /// Token expired or invalid.
    #[error("token expired or invalid")]
    TokenExpired,

    /// The identity provider failed with a non-retryable error.
    #[error("failed to acquire token from {authority} for {resource}: {source}")]
    TokenAcquisition {
        /// STS authority the request was sent to.
        authority: String,
        /// Resource (service principal name) the token was requested for.
        resource: String,
        /// Underlying provider failure.
        #[source]
        source: ProviderError,
    },

    /// The identity provider kept rate-limiting the request.
    #[error("token acquisition from {authority} throttled after {attempts} attempt(s)")]
    TokenAcquisitionThrottled {
        /// STS authority the request was sent to.
        authority: String,
        /// Number of attempts made before giving up.
        attempts: u32,
        /// The last retry-after hint supplied by the provider.
        retry_after: Option<Duration>,
    },

    /// The time budget ran out while acquiring a token.
    #[error("token acquisition from {authority} exceeded the time budget")]
    AcquisitionTimeout {
        /// STS authority the request was sent to.
        authority: String,
    },

    /// No provider is registered for the authentication method.
    #[error("unsupported authentication method: {0}")]
    UnsupportedMethod(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Azure identity error.
    #[error("Azure identity error: {0}")]
    AzureIdentity(String),
}

impl AuthError {
    /// Check if this error came from rate-limiting by the identity provider.
    #[must_use]
    pub fn is_throttled(&self) -> bool {
        matches!(self, Self::TokenAcquisitionThrottled { .. })
    }

    /// Check if this error is shaped like a timeout.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::AcquisitionTimeout { .. })
    }
}

/// Failure reported by a [`TokenProvider`](crate::TokenProvider).
///
/// The classification drives the retry policy in [`crate::acquire`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum ProviderError {
    /// The provider asked the caller to back off.
    #[error("rate limited by identity provider")]
    RateLimited {
        /// Delay hinted by the provider, if any.
        retry_after: Option<Duration>,
    },

    /// A failure of unknown cause that may succeed on retry.
    #[error("transient provider failure: {0}")]
    Transient(String),

    /// A failure that will not go away on retry.
    #[error("{0}")]
    Fatal(String),
}

impl ProviderError {
    /// Create a fatal provider error.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal(message.into())
    }

    /// Create a transient provider error.
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }
}
