//! Credential types for authentication.

use std::borrow::Cow;
use std::fmt;
use std::str::FromStr;

use crate::error::AuthError;

/// Authentication method selected by the `Authentication` connection-string key.
///
/// Federated methods resolve to a [`TokenProvider`](crate::TokenProvider)
/// through the [`ProviderRegistry`](crate::ProviderRegistry).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum AuthenticationMethod {
    /// SQL Server login with username and password.
    SqlPassword,
    /// Entra ID username and password.
    ActiveDirectoryPassword,
    /// Entra ID with the integrated (ambient) identity of the process.
    ActiveDirectoryIntegrated,
    /// Entra ID interactive sign-in.
    ActiveDirectoryInteractive,
    /// Entra ID application credentials.
    ActiveDirectoryServicePrincipal,
    /// Entra ID device code flow.
    ActiveDirectoryDeviceCodeFlow,
    /// Entra ID managed identity of the host.
    ActiveDirectoryManagedIdentity,
    /// Entra ID default credential chain.
    ActiveDirectoryDefault,
    /// Entra ID workload identity federation.
    ActiveDirectoryWorkloadIdentity,
    /// Pre-acquired access token supplied by the caller.
    AccessToken,
}

impl AuthenticationMethod {
    /// Check if this method authenticates through the FEDAUTH feature.
    #[must_use]
    pub fn is_federated(self) -> bool {
        !matches!(self, Self::SqlPassword)
    }

    /// Check if the server is expected to send FEDAUTHINFO for this method.
    ///
    /// Pre-acquired tokens go out with LOGIN7 directly; every other federated
    /// method learns the authority and resource from the server first.
    #[must_use]
    pub fn expects_fed_auth_info(self) -> bool {
        self.is_federated() && self != Self::AccessToken
    }

    /// Connection-string spelling of the method.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SqlPassword => "Sql Password",
            Self::ActiveDirectoryPassword => "Active Directory Password",
            Self::ActiveDirectoryIntegrated => "Active Directory Integrated",
            Self::ActiveDirectoryInteractive => "Active Directory Interactive",
            Self::ActiveDirectoryServicePrincipal => "Active Directory Service Principal",
            Self::ActiveDirectoryDeviceCodeFlow => "Active Directory Device Code Flow",
            Self::ActiveDirectoryManagedIdentity => "Active Directory Managed Identity",
            Self::ActiveDirectoryDefault => "Active Directory Default",
            Self::ActiveDirectoryWorkloadIdentity => "Active Directory Workload Identity",
            Self::AccessToken => "Access Token",
        }
    }
}

impl fmt::Display for AuthenticationMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuthenticationMethod {
    type Err = AuthError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect::<String>()
            .to_ascii_lowercase();

        let method = match normalized.as_str() {
            "sqlpassword" => Self::SqlPassword,
            "activedirectorypassword" => Self::ActiveDirectoryPassword,
            "activedirectoryintegrated" => Self::ActiveDirectoryIntegrated,
            "activedirectoryinteractive" => Self::ActiveDirectoryInteractive,
            "activedirectoryserviceprincipal" => Self::ActiveDirectoryServicePrincipal,
            "activedirectorydevicecodeflow" => Self::ActiveDirectoryDeviceCodeFlow,
            "activedirectorymanagedidentity" | "activedirectorymsi" => {
                Self::ActiveDirectoryManagedIdentity
            }
            "activedirectorydefault" => Self::ActiveDirectoryDefault,
            "activedirectoryworkloadidentity" => Self::ActiveDirectoryWorkloadIdentity,
            "accesstoken" => Self::AccessToken,
            _ => return Err(AuthError::UnsupportedMethod(s.to_string())),
        };
        Ok(method)
    }
}

/// Credentials for SQL Server authentication.
///
/// Credentials are designed to minimize copying of sensitive data.
#[derive(Clone)]
pub enum Credentials {
    /// SQL Server authentication with username and password.
    SqlServer {
        /// Username.
        username: Cow<'static, str>,
        /// Password.
        password: Cow<'static, str>,
    },

    /// Pre-acquired Entra ID access token.
    AccessToken {
        /// The access token string.
        token: Cow<'static, str>,
    },

    /// Federated authentication through a registered token provider.
    Federated {
        /// Method used to pick the provider.
        method: AuthenticationMethod,
        /// User or client identifier, when the method takes one.
        user_id: Option<Cow<'static, str>>,
        /// Password or client secret, when the method takes one.
        secret: Option<Cow<'static, str>>,
    },
}

impl Credentials {
    /// Create SQL Server credentials.
    pub fn sql_server(
        username: impl Into<Cow<'static, str>>,
        password: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self::SqlServer {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Create access token credentials.
    pub fn access_token(token: impl Into<Cow<'static, str>>) -> Self {
        Self::AccessToken {
            token: token.into(),
        }
    }

    /// Create federated credentials without a user or secret.
    pub fn federated(method: AuthenticationMethod) -> Self {
        Self::Federated {
            method,
            user_id: None,
            secret: None,
        }
    }

    /// Create federated credentials carrying a user id and secret.
    pub fn federated_with_secret(
        method: AuthenticationMethod,
        user_id: impl Into<Cow<'static, str>>,
        secret: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self::Federated {
            method,
            user_id: Some(user_id.into()),
            secret: Some(secret.into()),
        }
    }

    /// The authentication method these credentials use.
    #[must_use]
    pub fn method(&self) -> AuthenticationMethod {
        match self {
            Self::SqlServer { .. } => AuthenticationMethod::SqlPassword,
            Self::AccessToken { .. } => AuthenticationMethod::AccessToken,
            Self::Federated { method, .. } => *method,
        }
    }

    /// Check if these credentials use SQL authentication.
    #[must_use]
    pub fn is_sql_auth(&self) -> bool {
        matches!(self, Self::SqlServer { .. })
    }

    /// Check if these credentials request the FEDAUTH feature.
    #[must_use]
    pub fn is_federated(&self) -> bool {
        self.method().is_federated()
    }

    /// User identifier carried by the credentials, if any.
    #[must_use]
    pub fn user_id(&self) -> Option<&str> {
        match self {
            Self::SqlServer { username, .. } => Some(username),
            Self::AccessToken { .. } => None,
            Self::Federated { user_id, .. } => user_id.as_deref(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never expose sensitive data in debug output
        match self {
            Self::SqlServer { username, .. } => f
                .debug_struct("SqlServer")
                .field("username", username)
                .field("password", &"[REDACTED]")
                .finish(),
            Self::AccessToken { .. } => f
                .debug_struct("AccessToken")
                .field("token", &"[REDACTED]")
                .finish(),
            Self::Federated {
                method,
                user_id,
                secret,
            } => f
                .debug_struct("Federated")
                .field("method", method)
                .field("user_id", user_id)
                .field("secret", &secret.as_ref().map(|_| "[REDACTED]"))
                .finish(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_methods() {
        assert_eq!(
            "Active Directory Managed Identity".parse::<AuthenticationMethod>().unwrap(),
            AuthenticationMethod::ActiveDirectoryManagedIdentity
        );
        assert_eq!(
            "active directory msi".parse::<AuthenticationMethod>().unwrap(),
            AuthenticationMethod::ActiveDirectoryManagedIdentity
        );
        assert_eq!(
            "SqlPassword".parse::<AuthenticationMethod>().unwrap(),
            AuthenticationMethod::SqlPassword
        );
        assert!(matches!(
            "Kerberos".parse::<AuthenticationMethod>(),
            Err(AuthError::UnsupportedMethod(_))
        ));
    }

    #[test]
    fn test_display_round_trips_through_parse() {
        let method = AuthenticationMethod::ActiveDirectoryServicePrincipal;
        assert_eq!(method.to_string().parse::<AuthenticationMethod>().unwrap(), method);
    }

    #[test]
    fn test_fed_auth_info_expectation() {
        assert!(!AuthenticationMethod::SqlPassword.is_federated());
        assert!(AuthenticationMethod::AccessToken.is_federated());
        assert!(!AuthenticationMethod::AccessToken.expects_fed_auth_info());
        assert!(AuthenticationMethod::ActiveDirectoryDefault.expects_fed_auth_info());
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let creds = Credentials::sql_server("sa", "hunter2");
        let debug = format!("{creds:?}");
        assert!(debug.contains("sa"));
        assert!(!debug.contains("hunter2"));

        let creds = Credentials::federated_with_secret(
            AuthenticationMethod::ActiveDirectoryServicePrincipal,
            "app-id",
            "client-secret",
        );
        let debug = format!("{creds:?}");
        assert!(debug.contains("app-id"));
        assert!(!debug.contains("client-secret"));

        let creds = Credentials::access_token("eyJ0eXAi");
        assert!(!format!("{creds:?}").contains("eyJ0eXAi"));
    }

    #[test]
    fn test_method_of_credentials() {
        assert!(Credentials::sql_server("u", "p").is_sql_auth());
        assert!(Credentials::access_token("t").is_federated());
        assert_eq!(
            Credentials::federated(AuthenticationMethod::ActiveDirectoryDefault).method(),
            AuthenticationMethod::ActiveDirectoryDefault
        );
        assert_eq!(Credentials::sql_server("u", "p").user_id(), Some("u"));
    }
}
