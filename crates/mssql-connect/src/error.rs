//! Connection error types.

use std::sync::Arc;

use tds_protocol::{ProtocolError, ServerError};
use thiserror::Error;

use crate::lock::LockError;

/// Server error numbers that are worth retrying during login.
///
/// Covers database-unavailable and Azure SQL throttling/failover conditions.
pub const TRANSIENT_ERROR_NUMBERS: &[i32] = &[
    4060,  // Cannot open database requested by the login
    4221,  // Login to read-secondary failed due to long wait on HADR_DATABASE_WAIT_FOR_TRANSITION_TO_VERSIONING
    10928, // Resource ID limit reached
    10929, // Resource ID minimum guarantee not available
    40197, // Service error processing request
    40501, // Service is currently busy
    40613, // Database is currently unavailable
    42108, // Cannot connect to the SQL pool
    42109, // The SQL pool is warming up
];

/// Server error numbers that fail the login immediately.
pub const AUTH_FAILURE_NUMBERS: &[i32] = &[
    18456, // Login failed for user
    18486, // Account locked out
    18487, // Password expired
    18488, // Password must be changed
    1346,  // Impersonation failed
];

/// Server error number the server uses for a timed-out request.
pub const SERVER_TIMEOUT_NUMBER: i32 = -2;

/// Errors that can occur while establishing or using a connection.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// A control-plane record was malformed or carried an unsupported value.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Token acquisition or credential handling failed.
    #[error("authentication failed: {0}")]
    Authentication(#[from] mssql_auth::AuthError),

    /// Server returned an error.
    #[error("server error {number}: {message}")]
    Server {
        /// Error number.
        number: i32,
        /// Error class/severity (0-25).
        class: u8,
        /// Error state.
        state: u8,
        /// Error message.
        message: String,
        /// Server name where error occurred.
        server: Option<String>,
    },

    /// IO error from the transport.
    #[error("IO error: {0}")]
    Io(Arc<std::io::Error>),

    /// A single connection attempt ran out of time.
    #[error("connection attempt to {host} timed out")]
    ConnectTimeout {
        /// Target host.
        host: String,
    },

    /// The overall login budget ran out.
    #[error("login timeout expired{}", .last.as_ref().map(|e| format!(": {e}")).unwrap_or_default())]
    TimeoutExpired {
        /// The error that ended the final attempt, if any.
        #[source]
        last: Option<Box<Error>>,
    },

    /// The server redirected the login too many times.
    #[error("too many routing redirects (max {max})")]
    RoutingLimitExceeded {
        /// Maximum redirects allowed.
        max: u8,
    },

    /// Failover partner settings conflict with the connection or the server.
    #[error("invalid failover partner configuration: {0}")]
    InvalidPartnerConfiguration(&'static str),

    /// The session carries state that cannot be replayed on a new connection.
    #[error("session state is not recoverable")]
    SessionNotRecoverable,

    /// The server finished a login without acknowledging a required step.
    #[error("login incomplete: {0}")]
    LoginIncomplete(&'static str),

    /// The session cannot accept a new request right now.
    #[error("session not ready: {0}")]
    NotReady(&'static str),

    /// Connection closed unexpectedly.
    #[error("connection closed")]
    ConnectionClosed,

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Exclusive access could not be obtained.
    #[error("lock error: {0}")]
    Lock(#[from] LockError),
}

/// Classification of [`Error`] used by retry and failover decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ErrorKind {
    /// Malformed or undersized control-plane record.
    ProtocolViolation,
    /// Unsupported capability or protocol version.
    InvalidVersion,
    /// Bad credential, expired password or insufficient privilege.
    AuthenticationFailure,
    /// Server error from [`TRANSIENT_ERROR_NUMBERS`].
    TransientServerError,
    /// Any other server error.
    ServerError,
    /// Network failure or per-attempt timeout.
    Transport,
    /// Too many routing redirects.
    RoutingLimitExceeded,
    /// Malformed routing payload.
    InvalidRoutingInfo,
    /// The login budget ran out.
    TimeoutExpired,
    /// The identity provider kept rate-limiting token requests.
    TokenAcquisitionThrottled,
    /// Conflicting failover settings.
    InvalidPartnerConfiguration,
    /// Session state cannot be replayed.
    SessionNotRecoverable,
    /// Invalid configuration.
    Configuration,
    /// The connection is closed or not ready.
    Unavailable,
    /// Lock acquisition failed.
    Lock,
}

impl Error {
    pub(crate) fn from_server(err: &ServerError) -> Self {
        Self::Server {
            number: err.number,
            class: err.class,
            state: err.state,
            message: err.message.clone(),
            server: if err.server.is_empty() {
                None
            } else {
                Some(err.server.clone())
            },
        }
    }

    pub(crate) fn timeout_expired(last: Option<Error>) -> Self {
        Self::TimeoutExpired {
            last: last.map(Box::new),
        }
    }

    /// Classify this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Protocol(e) if e.is_version_error() => ErrorKind::InvalidVersion,
            Self::Protocol(ProtocolError::InvalidRoutingInfo(_)) => ErrorKind::InvalidRoutingInfo,
            Self::Protocol(_) | Self::LoginIncomplete(_) => ErrorKind::ProtocolViolation,
            Self::Authentication(e) if e.is_throttled() => ErrorKind::TokenAcquisitionThrottled,
            Self::Authentication(_) => ErrorKind::AuthenticationFailure,
            Self::Server { number, .. } if AUTH_FAILURE_NUMBERS.contains(number) => {
                ErrorKind::AuthenticationFailure
            }
            Self::Server { number, .. } if TRANSIENT_ERROR_NUMBERS.contains(number) => {
                ErrorKind::TransientServerError
            }
            Self::Server { .. } => ErrorKind::ServerError,
            Self::Io(_) | Self::ConnectTimeout { .. } | Self::ConnectionClosed => {
                ErrorKind::Transport
            }
            Self::TimeoutExpired { .. } => ErrorKind::TimeoutExpired,
            Self::RoutingLimitExceeded { .. } => ErrorKind::RoutingLimitExceeded,
            Self::InvalidPartnerConfiguration(_) => ErrorKind::InvalidPartnerConfiguration,
            Self::SessionNotRecoverable => ErrorKind::SessionNotRecoverable,
            Self::NotReady(_) => ErrorKind::Unavailable,
            Self::Config(_) => ErrorKind::Configuration,
            Self::Lock(_) => ErrorKind::Lock,
        }
    }

    /// Check if this error is transient and the login may succeed on retry.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::TransientServerError | ErrorKind::Transport
        )
    }

    /// Check if this error is an authentication failure that must not be retried.
    #[must_use]
    pub fn is_auth_failure(&self) -> bool {
        self.kind() == ErrorKind::AuthenticationFailure
    }

    /// Check if this error is shaped like a timeout: a client attempt timeout
    /// or the server's timeout error number.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::ConnectTimeout { .. } => true,
            Self::Server { number, .. } => *number == SERVER_TIMEOUT_NUMBER,
            Self::Authentication(e) => e.is_timeout(),
            _ => false,
        }
    }

    /// Check if this error leaves the connection unusable.
    #[must_use]
    pub fn dooms_connection(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::ProtocolViolation | ErrorKind::InvalidVersion | ErrorKind::InvalidRoutingInfo
        )
    }

    /// Check if this is a server error with a specific number.
    #[must_use]
    pub fn is_server_error(&self, number: i32) -> bool {
        matches!(self, Self::Server { number: n, .. } if *n == number)
    }

    /// Get the error class/severity if this is a server error.
    #[must_use]
    pub fn class(&self) -> Option<u8> {
        match self {
            Self::Server { class, .. } => Some(*class),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Io(Arc::new(e))
    }
}

/// Result type for connection operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn server(number: i32) -> Error {
        Error::Server {
            number,
            class: 14,
            state: 1,
            message: "msg".into(),
            server: None,
        }
    }

    #[test]
    fn test_transient_numbers() {
        for number in TRANSIENT_ERROR_NUMBERS {
            assert!(server(*number).is_transient(), "{number} should be transient");
        }
        assert!(!server(208).is_transient());
        assert_eq!(server(208).kind(), ErrorKind::ServerError);
    }

    #[test]
    fn test_auth_failures_are_not_transient() {
        for number in AUTH_FAILURE_NUMBERS {
            let err = server(*number);
            assert!(err.is_auth_failure());
            assert!(!err.is_transient());
        }
    }

    #[test]
    fn test_transport_errors_are_transient() {
        let io: Error = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset").into();
        assert!(io.is_transient());
        assert!(Error::ConnectTimeout { host: "h".into() }.is_transient());
        assert!(Error::ConnectionClosed.is_transient());
    }

    #[test]
    fn test_protocol_classification() {
        let err: Error = ProtocolError::InvalidRoutingInfo("empty server name").into();
        assert_eq!(err.kind(), ErrorKind::InvalidRoutingInfo);
        assert!(err.dooms_connection());

        let err: Error = ProtocolError::InvalidVersion {
            feature: "JSON",
            version: 9,
        }
        .into();
        assert_eq!(err.kind(), ErrorKind::InvalidVersion);

        let err: Error = ProtocolError::UnexpectedEof.into();
        assert_eq!(err.kind(), ErrorKind::ProtocolViolation);
        assert!(!err.is_transient());
    }

    #[test]
    fn test_timeout_shape() {
        assert!(Error::ConnectTimeout { host: "h".into() }.is_timeout());
        assert!(server(SERVER_TIMEOUT_NUMBER).is_timeout());
        assert!(!server(40613).is_timeout());
    }

    #[test]
    fn test_timeout_expired_wraps_last_error() {
        let err = Error::timeout_expired(Some(server(40613)));
        assert_eq!(err.kind(), ErrorKind::TimeoutExpired);
        assert!(err.to_string().contains("40613"));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_throttled_token_acquisition() {
        let err: Error = mssql_auth::AuthError::TokenAcquisitionThrottled {
            authority: "a".into(),
            attempts: 3,
            retry_after: None,
        }
        .into();
        assert_eq!(err.kind(), ErrorKind::TokenAcquisitionThrottled);
    }
}
