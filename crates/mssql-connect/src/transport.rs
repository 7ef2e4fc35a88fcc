//! Boundary to the frame transport.
//!
//! The engine never touches sockets, TLS or packet framing. A [`Connector`]
//! opens a [`Transport`] to one target; the transport carries PRELOGIN and
//! LOGIN7 out and hands back the server's control-plane records one at a
//! time as [`TokenRecord`]s.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tds_protocol::{RequestedFeatures, TdsVersion};

use crate::error::Result;
use crate::server_identity::ServerIdentity;

/// PRELOGIN options sent before the login.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreLoginRequest {
    /// Whether encryption is required.
    pub encrypt: bool,
    /// Whether MARS is requested.
    pub mars: bool,
    /// Whether the login will use federated authentication.
    pub fed_auth_required: bool,
    /// Named instance to validate against.
    pub instance: Option<String>,
}

/// The server's PRELOGIN response, as far as the engine cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HandshakeAck {
    /// Whether the connection is encrypted from here on.
    pub encryption: bool,
    /// Whether the server expects the federated-auth workflow.
    pub fed_auth_required: bool,
}

/// How federated authentication is announced in LOGIN7.
#[derive(Clone, PartialEq, Eq)]
pub enum FedAuthLogin {
    /// Token embedded in the login.
    SecurityToken(String),
    /// Token supplied after the server sends FEDAUTHINFO.
    Library,
}

impl fmt::Debug for FedAuthLogin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SecurityToken(_) => f.write_str("SecurityToken([REDACTED])"),
            Self::Library => f.write_str("Library"),
        }
    }
}

/// Everything the transport needs to build LOGIN7.
#[derive(Clone)]
pub struct LoginRequest {
    /// Requested protocol version.
    pub tds_version: TdsVersion,
    /// Requested packet size.
    pub packet_size: u32,
    /// Client workstation name.
    pub workstation: String,
    /// SQL login name, empty for federated logins.
    pub user: String,
    /// SQL login password, empty for federated logins.
    pub password: String,
    /// Application name.
    pub app_name: String,
    /// Server name as the client addressed it.
    pub server_name: String,
    /// Session language.
    pub language: String,
    /// Database to open.
    pub database: String,
    /// Feature extensions to request.
    pub features: RequestedFeatures,
    /// Federated authentication announcement.
    pub fed_auth: Option<FedAuthLogin>,
    /// Session-recovery feature data for a reconnect.
    pub session_recovery: Option<Bytes>,
    /// Whether the read-only application intent flag is set.
    pub read_only_intent: bool,
}

impl fmt::Debug for LoginRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoginRequest")
            .field("tds_version", &self.tds_version)
            .field("packet_size", &self.packet_size)
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .field("server_name", &self.server_name)
            .field("database", &self.database)
            .field("features", &self.features)
            .field("fed_auth", &self.fed_auth)
            .field("read_only_intent", &self.read_only_intent)
            .finish_non_exhaustive()
    }
}

/// One control-plane record read from the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenRecord {
    /// Token type byte.
    pub token_type: u8,
    /// Token body, without the type byte.
    pub data: Bytes,
}

impl TokenRecord {
    /// Create a record.
    pub fn new(token_type: u8, data: impl Into<Bytes>) -> Self {
        Self {
            token_type,
            data: data.into(),
        }
    }
}

/// Opens transports.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a transport to `target`, giving up after `timeout` if one is set.
    async fn connect(
        &self,
        target: &ServerIdentity,
        timeout: Option<Duration>,
    ) -> Result<Box<dyn Transport>>;
}

/// An open, framed connection to one server.
#[async_trait]
pub trait Transport: Send {
    /// Exchange PRELOGIN.
    async fn send_handshake(&mut self, request: &PreLoginRequest) -> Result<HandshakeAck>;

    /// Send LOGIN7.
    async fn send_login(&mut self, request: &LoginRequest) -> Result<()>;

    /// Read the next record, or `None` if the server closed the stream.
    async fn read_next_record(&mut self) -> Result<Option<TokenRecord>>;

    /// Send a federated-authentication token (UTF-16LE).
    async fn send_fed_auth_token(&mut self, token: &[u8]) -> Result<()>;

    /// Whether the underlying connection still looks usable.
    fn is_alive(&self) -> bool;

    /// Whether unread bytes remain on the wire.
    fn has_pending_data(&self) -> bool;

    /// Close the connection.
    async fn disconnect(&mut self) -> Result<()>;
}
