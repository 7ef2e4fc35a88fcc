//! Token provider abstraction and the method-to-provider strategy map.
//!
//! A [`TokenProvider`] talks to an identity provider on behalf of one
//! authentication method. Connections never call providers directly: they
//! look one up in a [`ProviderRegistry`] and go through the shared
//! [`TokenCache`](crate::TokenCache) so pooled connections reuse tokens.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use futures_util::future::BoxFuture;

use crate::credentials::{AuthenticationMethod, Credentials};
use crate::error::{AuthError, ProviderError};

/// A bearer token issued by an identity provider.
#[derive(Clone, PartialEq, Eq)]
pub struct FedAuthToken {
    token: String,
    expires_at: SystemTime,
}

impl FedAuthToken {
    /// Create a token expiring at the given instant.
    pub fn new(token: impl Into<String>, expires_at: SystemTime) -> Self {
        Self {
            token: token.into(),
            expires_at,
        }
    }

    /// Create a token expiring `lifetime` from now.
    pub fn expiring_in(token: impl Into<String>, lifetime: Duration) -> Self {
        Self::new(token, SystemTime::now() + lifetime)
    }

    /// The raw token string.
    #[must_use]
    pub fn token(&self) -> &str {
        &self.token
    }

    /// When the token stops being valid.
    #[must_use]
    pub fn expires_at(&self) -> SystemTime {
        self.expires_at
    }

    /// How long the token stays valid after `now`. Zero once expired.
    #[must_use]
    pub fn validity_at(&self, now: SystemTime) -> Duration {
        self.expires_at.duration_since(now).unwrap_or(Duration::ZERO)
    }

    /// How long the token stays valid from now.
    #[must_use]
    pub fn remaining_validity(&self) -> Duration {
        self.validity_at(SystemTime::now())
    }

    /// Encode the token as UTF-16LE for the FEDAUTH token message.
    #[must_use]
    pub fn to_utf16le(&self) -> Vec<u8> {
        self.token.encode_utf16().flat_map(u16::to_le_bytes).collect()
    }
}

impl fmt::Debug for FedAuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FedAuthToken")
            .field("token", &"[REDACTED]")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// What a provider needs to issue a token.
#[derive(Clone)]
pub struct TokenRequest {
    /// STS URL advertised by the server in FEDAUTHINFO.
    pub authority: String,
    /// Resource (SPN) advertised by the server in FEDAUTHINFO.
    pub resource: String,
    /// User or client identifier.
    pub user_id: Option<String>,
    /// Password or client secret.
    pub secret: Option<String>,
}

impl TokenRequest {
    /// Create a request for the given authority and resource.
    pub fn new(authority: impl Into<String>, resource: impl Into<String>) -> Self {
        Self {
            authority: authority.into(),
            resource: resource.into(),
            user_id: None,
            secret: None,
        }
    }

    /// Attach the user identifier and secret carried by `credentials`.
    #[must_use]
    pub fn with_credentials(mut self, credentials: &Credentials) -> Self {
        if let Credentials::Federated {
            user_id, secret, ..
        } = credentials
        {
            self.user_id = user_id.as_ref().map(|u| u.to_string());
            self.secret = secret.as_ref().map(|s| s.to_string());
        }
        self
    }

    /// OAuth scope derived from the resource.
    #[must_use]
    pub fn scope(&self) -> String {
        if self.resource.ends_with('/') {
            format!("{}.default", self.resource)
        } else {
            format!("{}/.default", self.resource)
        }
    }
}

impl fmt::Debug for TokenRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenRequest")
            .field("authority", &self.authority)
            .field("resource", &self.resource)
            .field("user_id", &self.user_id)
            .field("secret", &self.secret.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

/// Source of federated-authentication tokens.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Acquire a fresh token for the request.
    async fn acquire_token(&self, request: &TokenRequest) -> Result<FedAuthToken, ProviderError>;
}

/// Provider that always hands out the same token.
#[derive(Debug, Clone)]
pub struct StaticTokenProvider {
    token: FedAuthToken,
}

impl StaticTokenProvider {
    /// Create a provider for a pre-acquired token.
    pub fn new(token: FedAuthToken) -> Self {
        Self { token }
    }
}

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn acquire_token(&self, _request: &TokenRequest) -> Result<FedAuthToken, ProviderError> {
        Ok(self.token.clone())
    }
}

type TokenCallback =
    dyn Fn(TokenRequest) -> BoxFuture<'static, Result<FedAuthToken, ProviderError>> + Send + Sync;

/// Provider backed by a caller-supplied async callback.
///
/// ```rust
/// use std::time::Duration;
/// use mssql_auth::{CallbackTokenProvider, FedAuthToken};
///
/// let provider = CallbackTokenProvider::new(|request| {
///     Box::pin(async move {
///         let token = format!("token-for-{}", request.resource);
///         Ok(FedAuthToken::expiring_in(token, Duration::from_secs(3600)))
///     })
/// });
/// # let _ = provider;
/// ```
#[derive(Clone)]
pub struct CallbackTokenProvider {
    callback: Arc<TokenCallback>,
}

impl CallbackTokenProvider {
    /// Wrap an async callback.
    pub fn new<F>(callback: F) -> Self
    where
        F: Fn(TokenRequest) -> BoxFuture<'static, Result<FedAuthToken, ProviderError>>
            + Send
            + Sync
            + 'static,
    {
        Self {
            callback: Arc::new(callback),
        }
    }
}

impl fmt::Debug for CallbackTokenProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackTokenProvider").finish_non_exhaustive()
    }
}

#[async_trait]
impl TokenProvider for CallbackTokenProvider {
    async fn acquire_token(&self, request: &TokenRequest) -> Result<FedAuthToken, ProviderError> {
        (self.callback)(request.clone()).await
    }
}

/// Strategy map from authentication method to token provider.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<AuthenticationMethod, Arc<dyn TokenProvider>>,
}

impl ProviderRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the provider for a method.
    pub fn register(&mut self, method: AuthenticationMethod, provider: Arc<dyn TokenProvider>) {
        tracing::debug!(%method, "registering token provider");
        self.providers.insert(method, provider);
    }

    /// Builder form of [`register`](Self::register).
    #[must_use]
    pub fn with_provider(
        mut self,
        method: AuthenticationMethod,
        provider: Arc<dyn TokenProvider>,
    ) -> Self {
        self.register(method, provider);
        self
    }

    /// Check whether a provider is registered for the method.
    #[must_use]
    pub fn contains(&self, method: AuthenticationMethod) -> bool {
        self.providers.contains_key(&method)
    }

    /// Look up the provider for a method.
    pub fn resolve(&self, method: AuthenticationMethod) -> Result<Arc<dyn TokenProvider>, AuthError> {
        self.providers
            .get(&method)
            .cloned()
            .ok_or_else(|| AuthError::UnsupportedMethod(method.to_string()))
    }
}

impl fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("methods", &self.providers.keys().collect::<Vec<_>>())
            .finish()
    }
}
