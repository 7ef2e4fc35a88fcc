//! # mssql-auth
//!
//! Federated authentication for TDS connections: credentials, a strategy map
//! from authentication method to token provider, a retrying acquisition
//! policy, and the token cache shared by the connections of a pool group.
//!
//! ## Supported Token Sources
//!
//! | Source | Feature Flag | Description |
//! |--------|--------------|-------------|
//! | Access token | default | Pre-obtained token |
//! | Callback | default | Caller-supplied async function |
//! | Azure Managed Identity | `azure-identity` | VM/container identity |
//! | Service Principal | `azure-identity` | App credentials |
//!
//! ## Example
//!
//! ```rust
//! use std::time::Duration;
//! use mssql_auth::{AuthContextKey, FedAuthToken, TokenCache};
//!
//! # tokio_test::block_on(async {
//! let cache = TokenCache::new();
//! let key = AuthContextKey::new("https://login.example.net/tenant", "https://db.example.net/");
//! let token = cache
//!     .get_or_refresh(&key, || async {
//!         Ok(FedAuthToken::expiring_in("jwt", Duration::from_secs(3600)))
//!     })
//!     .await?;
//! assert_eq!(token.token(), "jwt");
//! # Ok::<(), mssql_auth::AuthError>(())
//! # }).unwrap();
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod acquire;
#[cfg(feature = "azure-identity")]
pub mod azure_identity_auth;
pub mod credentials;
pub mod error;
pub mod provider;
pub mod token_cache;

pub use acquire::{AcquirePolicy, acquire_with_retry};
#[cfg(feature = "azure-identity")]
pub use azure_identity_auth::{ManagedIdentityProvider, ServicePrincipalProvider};
pub use credentials::{AuthenticationMethod, Credentials};
pub use error::{AuthError, ProviderError};
pub use provider::{
    CallbackTokenProvider, FedAuthToken, ProviderRegistry, StaticTokenProvider, TokenProvider,
    TokenRequest,
};
pub use token_cache::{AuthContextKey, AuthenticationContext, RefreshGuard, TokenCache};
