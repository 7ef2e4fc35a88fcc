//! Azure Identity token providers.
//!
//! These adapt `azure_identity` credentials to [`TokenProvider`] so they can
//! be registered in a [`ProviderRegistry`](crate::ProviderRegistry):
//!
//! - **Managed Identity**: Azure VMs, App Service, Container Instances, AKS
//! - **Service Principal**: application client credentials
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use mssql_auth::{AuthenticationMethod, ManagedIdentityProvider, ProviderRegistry};
//!
//! let registry = ProviderRegistry::new().with_provider(
//!     AuthenticationMethod::ActiveDirectoryManagedIdentity,
//!     Arc::new(ManagedIdentityProvider::system_assigned()?),
//! );
//! ```

use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use azure_core::credentials::TokenCredential;
use azure_core::error::ErrorKind;
use azure_identity::{
    ClientSecretCredential, ManagedIdentityCredential, ManagedIdentityCredentialOptions,
    UserAssignedId,
};

use crate::error::{AuthError, ProviderError};
use crate::provider::{FedAuthToken, TokenProvider, TokenRequest};

fn classify(e: &azure_core::Error) -> ProviderError {
    match e.kind() {
        ErrorKind::Io => ProviderError::transient(e.to_string()),
        _ => ProviderError::fatal(e.to_string()),
    }
}

async fn fetch(
    credential: &dyn TokenCredential,
    request: &TokenRequest,
) -> Result<FedAuthToken, ProviderError> {
    let scope = request.scope();
    let token = credential
        .get_token(&[scope.as_str()], None)
        .await
        .map_err(|e| classify(&e))?;
    Ok(FedAuthToken::new(
        token.token.secret(),
        SystemTime::from(token.expires_on),
    ))
}

/// Managed Identity token provider.
#[derive(Clone)]
pub struct ManagedIdentityProvider {
    credential: Arc<ManagedIdentityCredential>,
}

impl ManagedIdentityProvider {
    /// Use the system-assigned identity of the host.
    ///
    /// # Errors
    ///
    /// Returns an error if the managed identity credential cannot be created.
    pub fn system_assigned() -> Result<Self, AuthError> {
        let credential = ManagedIdentityCredential::new(None)
            .map_err(|e| AuthError::AzureIdentity(e.to_string()))?;
        Ok(Self { credential })
    }

    /// Use a user-assigned identity selected by client ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the managed identity credential cannot be created.
    pub fn user_assigned(client_id: impl Into<String>) -> Result<Self, AuthError> {
        let options = ManagedIdentityCredentialOptions {
            user_assigned_id: Some(UserAssignedId::ClientId(client_id.into())),
            ..Default::default()
        };
        let credential = ManagedIdentityCredential::new(Some(options))
            .map_err(|e| AuthError::AzureIdentity(e.to_string()))?;
        Ok(Self { credential })
    }
}

impl std::fmt::Debug for ManagedIdentityProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedIdentityProvider").finish_non_exhaustive()
    }
}

#[async_trait]
impl TokenProvider for ManagedIdentityProvider {
    async fn acquire_token(&self, request: &TokenRequest) -> Result<FedAuthToken, ProviderError> {
        fetch(self.credential.as_ref(), request).await
    }
}

/// Service Principal (client secret) token provider.
#[derive(Clone)]
pub struct ServicePrincipalProvider {
    credential: Arc<ClientSecretCredential>,
}

impl ServicePrincipalProvider {
    /// Create a provider for an application registration.
    ///
    /// # Errors
    ///
    /// Returns an error if the credential cannot be created.
    pub fn new(
        tenant_id: impl AsRef<str>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> Result<Self, AuthError> {
        use azure_core::credentials::Secret;

        let secret = Secret::new(client_secret.into());
        let credential =
            ClientSecretCredential::new(tenant_id.as_ref(), client_id.into(), secret, None)
                .map_err(|e| AuthError::AzureIdentity(e.to_string()))?;
        Ok(Self { credential })
    }
}

impl std::fmt::Debug for ServicePrincipalProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServicePrincipalProvider")
            .field("credential", &"[REDACTED]")
            .finish()
    }
}

#[async_trait]
impl TokenProvider for ServicePrincipalProvider {
    async fn acquire_token(&self, request: &TokenRequest) -> Result<FedAuthToken, ProviderError> {
        fetch(self.credential.as_ref(), request).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    #[ignore = "Requires Azure Managed Identity environment"]
    async fn test_managed_identity_system_assigned() {
        let provider = ManagedIdentityProvider::system_assigned().expect("credential");
        let request = TokenRequest::new(
            "https://login.microsoftonline.com/common",
            "https://database.windows.net/",
        );
        let token = provider.acquire_token(&request).await.expect("token");
        assert!(!token.token().is_empty());
    }

    #[test]
    fn test_debug_redacts_credentials() {
        if let Ok(provider) = ServicePrincipalProvider::new("tenant", "client", "very-secret") {
            let debug = format!("{provider:?}");
            assert!(!debug.contains("very-secret"));
        }
    }
}
