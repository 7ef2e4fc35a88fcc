//! State shared by the connections of one pool group.
//!
//! Pooling policy lives outside this crate. A pool hands the same
//! [`PoolGroupContext`] to every connection it opens so they share one
//! token cache and learn which host of a failover pair answered last.

use std::sync::Arc;

use mssql_auth::TokenCache;
use parking_lot::Mutex;

/// Shared context for connections with identical connection options.
#[derive(Debug, Default)]
pub struct PoolGroupContext {
    token_cache: Arc<TokenCache>,
    use_failover_host: Mutex<bool>,
}

impl PoolGroupContext {
    /// Create a context with an empty token cache.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Token cache shared by the group.
    #[must_use]
    pub fn token_cache(&self) -> &Arc<TokenCache> {
        &self.token_cache
    }

    /// Whether the next login should try the failover host first.
    #[must_use]
    pub fn prefer_failover(&self) -> bool {
        *self.use_failover_host.lock()
    }

    /// Remember which host a login succeeded on.
    pub fn record_login(&self, connected_to_failover: bool) {
        let mut hint = self.use_failover_host.lock();
        if *hint != connected_to_failover {
            tracing::info!(
                failover = connected_to_failover,
                "pool group switched preferred host"
            );
        }
        *hint = connected_to_failover;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_failover_hint() {
        let group = PoolGroupContext::new();
        assert!(!group.prefer_failover());
        group.record_login(true);
        assert!(group.prefer_failover());
        group.record_login(false);
        assert!(!group.prefer_failover());
    }

    #[test]
    fn test_cache_is_shared() {
        let group = PoolGroupContext::new();
        let a = Arc::clone(group.token_cache());
        let b = Arc::clone(group.token_cache());
        assert!(Arc::ptr_eq(&a, &b));
        assert!(a.is_empty());
    }
}
