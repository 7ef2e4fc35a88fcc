//! Shared cache of federated-authentication tokens.
//!
//! One cache is shared by every connection of a pool group. Entries are keyed
//! by the `(authority, resource)` pair the server advertises in FEDAUTHINFO
//! and are never removed; refreshes merge into the existing entry.
//!
//! ## Refresh protocol
//!
//! | Remaining validity | Behavior |
//! |--------------------|----------|
//! | no entry | acquire and insert |
//! | more than 45 minutes | return the cached token |
//! | 10 to 45 minutes | one caller refreshes (CAS on the entry lock), others use the cached token |
//! | 10 minutes or less | every caller acquires, regardless of the entry lock |
//!
//! A refreshed token replaces the cached one only when it stays valid longer.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime};

use parking_lot::RwLock;

use crate::error::AuthError;
use crate::provider::FedAuthToken;

/// Cached tokens with more validity than this are returned as-is.
pub const NO_REFRESH_THRESHOLD: Duration = Duration::from_secs(45 * 60);

/// Cached tokens with this much validity or less are always re-acquired.
pub const FORCE_REFRESH_THRESHOLD: Duration = Duration::from_secs(10 * 60);

/// Cache key: STS authority and resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AuthContextKey {
    authority: String,
    resource: String,
}

impl AuthContextKey {
    /// Create a key.
    pub fn new(authority: impl Into<String>, resource: impl Into<String>) -> Self {
        Self {
            authority: authority.into(),
            resource: resource.into(),
        }
    }

    /// STS authority.
    #[must_use]
    pub fn authority(&self) -> &str {
        &self.authority
    }

    /// Resource the token is scoped to.
    #[must_use]
    pub fn resource(&self) -> &str {
        &self.resource
    }
}

/// One cache entry.
pub struct AuthenticationContext {
    key: AuthContextKey,
    token: RwLock<FedAuthToken>,
    refresh_lock: AtomicBool,
}

impl AuthenticationContext {
    fn new(key: AuthContextKey, token: FedAuthToken) -> Self {
        Self {
            key,
            token: RwLock::new(token),
            refresh_lock: AtomicBool::new(false),
        }
    }

    /// Key of this entry.
    #[must_use]
    pub fn key(&self) -> &AuthContextKey {
        &self.key
    }

    /// Current token.
    #[must_use]
    pub fn token(&self) -> FedAuthToken {
        self.token.read().clone()
    }

    /// Expiry of the current token.
    #[must_use]
    pub fn expires_at(&self) -> SystemTime {
        self.token.read().expires_at()
    }

    /// Check whether some caller is refreshing this entry.
    #[must_use]
    pub fn is_refreshing(&self) -> bool {
        self.refresh_lock.load(Ordering::Acquire)
    }

    /// Take the refresh lock if nobody holds it.
    pub fn try_begin_refresh(&self) -> Option<RefreshGuard<'_>> {
        self.refresh_lock
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| RefreshGuard { context: self })
    }

    /// Keep whichever of the cached and offered tokens stays valid longer.
    ///
    /// Returns the token that is cached afterwards.
    pub fn merge(&self, offered: FedAuthToken) -> FedAuthToken {
        let mut current = self.token.write();
        if offered.expires_at() > current.expires_at() {
            *current = offered;
        }
        current.clone()
    }
}

impl fmt::Debug for AuthenticationContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthenticationContext")
            .field("key", &self.key)
            .field("token", &"[REDACTED]")
            .field("expires_at", &self.expires_at())
            .field("refreshing", &self.is_refreshing())
            .finish()
    }
}

/// Holds an entry's refresh lock; releases it on drop.
#[derive(Debug)]
pub struct RefreshGuard<'a> {
    context: &'a AuthenticationContext,
}

impl Drop for RefreshGuard<'_> {
    fn drop(&mut self) {
        self.context.refresh_lock.store(false, Ordering::Release);
    }
}

/// Token cache shared across a pool group.
#[derive(Debug, Default)]
pub struct TokenCache {
    entries: RwLock<HashMap<AuthContextKey, Arc<AuthenticationContext>>>,
}

impl TokenCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up an entry.
    #[must_use]
    pub fn get(&self, key: &AuthContextKey) -> Option<Arc<AuthenticationContext>> {
        self.entries.read().get(key).cloned()
    }

    /// Number of cached entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Check if the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Insert a token, merging with any existing entry.
    ///
    /// Returns the token cached afterwards.
    pub fn insert(&self, key: &AuthContextKey, token: FedAuthToken) -> FedAuthToken {
        let context = {
            let mut entries = self.entries.write();
            Arc::clone(
                entries
                    .entry(key.clone())
                    .or_insert_with(|| Arc::new(AuthenticationContext::new(key.clone(), token.clone()))),
            )
        };
        context.merge(token)
    }

    /// Return a usable token for `key`, calling `acquire` when the refresh
    /// protocol requires a new one.
    ///
    /// # Errors
    ///
    /// Returns the error from `acquire` when a token had to be acquired.
    /// A failed proactive refresh (10 to 45 minutes left) falls back to the
    /// cached token instead.
    pub async fn get_or_refresh<F, Fut>(
        &self,
        key: &AuthContextKey,
        acquire: F,
    ) -> Result<FedAuthToken, AuthError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<FedAuthToken, AuthError>>,
    {
        let Some(context) = self.get(key) else {
            tracing::debug!(authority = %key.authority, "no cached token, acquiring");
            let token = acquire().await?;
            return Ok(self.insert(key, token));
        };

        let validity = context.token.read().remaining_validity();

        if validity > NO_REFRESH_THRESHOLD {
            tracing::debug!(
                authority = %key.authority,
                remaining_secs = validity.as_secs(),
                "using cached token"
            );
            return Ok(context.token());
        }

        if validity > FORCE_REFRESH_THRESHOLD {
            let Some(_guard) = context.try_begin_refresh() else {
                tracing::debug!(
                    authority = %key.authority,
                    "refresh in progress elsewhere, using cached token"
                );
                return Ok(context.token());
            };

            tracing::debug!(
                authority = %key.authority,
                remaining_secs = validity.as_secs(),
                "proactively refreshing cached token"
            );
            return match acquire().await {
                Ok(token) => Ok(context.merge(token)),
                Err(e) => {
                    tracing::warn!(
                        authority = %key.authority,
                        error = %e,
                        "proactive token refresh failed, keeping cached token"
                    );
                    Ok(context.token())
                }
            };
        }

        tracing::debug!(
            authority = %key.authority,
            remaining_secs = validity.as_secs(),
            "cached token near expiry, acquiring"
        );
        let token = acquire().await?;
        Ok(context.merge(token))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn key() -> AuthContextKey {
        AuthContextKey::new("https://login.example.net/tenant", "https://db.example.net/")
    }

    fn token(name: &str, minutes: u64) -> FedAuthToken {
        FedAuthToken::expiring_in(name, Duration::from_secs(minutes * 60))
    }

    fn seeded(minutes: u64) -> TokenCache {
        let cache = TokenCache::new();
        cache.insert(&key(), token("cached", minutes));
        cache
    }

    #[tokio::test]
    async fn test_missing_entry_acquires_and_inserts() {
        let cache = TokenCache::new();
        let calls = AtomicUsize::new(0);

        let issued = cache
            .get_or_refresh(&key(), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(token("fresh", 60))
            })
            .await
            .unwrap();

        assert_eq!(issued.token(), "fresh");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(&key()).unwrap().token().token(), "fresh");
    }

    #[tokio::test]
    async fn test_long_lived_token_returned_without_acquiring() {
        let cache = seeded(60);
        let calls = AtomicUsize::new(0);

        let issued = cache
            .get_or_refresh(&key(), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(token("fresh", 60))
            })
            .await
            .unwrap();

        assert_eq!(issued.token(), "cached");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_mid_validity_with_held_lock_returns_cached() {
        let cache = seeded(30);
        let context = cache.get(&key()).unwrap();
        let _held = context.try_begin_refresh().unwrap();
        let calls = AtomicUsize::new(0);

        let issued = cache
            .get_or_refresh(&key(), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(token("fresh", 60))
            })
            .await
            .unwrap();

        assert_eq!(issued.token(), "cached");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_mid_validity_refreshes_and_releases_lock() {
        let cache = seeded(30);

        let issued = cache
            .get_or_refresh(&key(), || async { Ok(token("fresh", 60)) })
            .await
            .unwrap();

        assert_eq!(issued.token(), "fresh");
        let context = cache.get(&key()).unwrap();
        assert!(!context.is_refreshing());
        assert_eq!(context.token().token(), "fresh");
    }

    #[tokio::test]
    async fn test_refresh_keeps_longer_lived_token() {
        let cache = seeded(30);

        let issued = cache
            .get_or_refresh(&key(), || async { Ok(token("shorter", 20)) })
            .await
            .unwrap();

        assert_eq!(issued.token(), "cached");
    }

    #[tokio::test]
    async fn test_failed_proactive_refresh_keeps_cached() {
        let cache = seeded(30);

        let issued = cache
            .get_or_refresh(&key(), || async { Err(AuthError::TokenExpired) })
            .await
            .unwrap();

        assert_eq!(issued.token(), "cached");
        assert!(!cache.get(&key()).unwrap().is_refreshing());
    }

    #[tokio::test]
    async fn test_near_expiry_always_acquires_even_mid_refresh() {
        let cache = seeded(5);
        let context = cache.get(&key()).unwrap();
        let _held = context.try_begin_refresh().unwrap();
        let calls = AtomicUsize::new(0);

        let issued = cache
            .get_or_refresh(&key(), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(token("fresh", 60))
            })
            .await
            .unwrap();

        assert_eq!(issued.token(), "fresh");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_near_expiry_propagates_acquire_error() {
        let cache = seeded(5);

        let err = cache
            .get_or_refresh(&key(), || async { Err(AuthError::TokenExpired) })
            .await
            .unwrap_err();

        assert!(matches!(err, AuthError::TokenExpired));
    }

    #[test]
    fn test_refresh_lock_is_exclusive() {
        let cache = seeded(30);
        let context = cache.get(&key()).unwrap();

        let first = context.try_begin_refresh();
        assert!(first.is_some());
        assert!(context.try_begin_refresh().is_none());
        drop(first);
        assert!(context.try_begin_refresh().is_some());
    }

    #[test]
    fn test_keys_are_distinct_per_resource() {
        let cache = TokenCache::new();
        cache.insert(&AuthContextKey::new("sts", "db-a"), token("a", 60));
        cache.insert(&AuthContextKey::new("sts", "db-b"), token("b", 60));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_debug_redacts_token() {
        let cache = seeded(60);
        let debug = format!("{:?}", cache.get(&key()).unwrap());
        assert!(!debug.contains("cached"));
        assert!(debug.contains("login.example.net"));
    }
}
