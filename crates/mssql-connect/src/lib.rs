//! # mssql-connect
//!
//! Connection establishment and session lifecycle for SQL Server.
//!
//! This crate drives everything between "open a socket" and "the session is
//! ready for a query": capability negotiation, login retries with backoff,
//! failover partners, server-issued routing, federated-auth token handling
//! and transparent session recovery. Framing and sockets stay behind the
//! [`Connector`] and [`Transport`] traits.
//!
//! ## Features
//!
//! - **Single time budget**: every attempt, redirect and backoff sleep draws
//!   from the configured connect timeout
//! - **Failover**: alternates between primary and partner with growing slices
//! - **Routing**: follows up to 10 redirects, validating each before connecting
//! - **Federated auth**: tokens cached per pool group with cooperative refresh
//! - **Session recovery**: replays session state on a new connection
//! - **Exclusive access**: a permit-based lock usable from sync and async code
//!
//! ## Login State Machine
//!
//! ```text
//! ResolvingIdentity -> Connecting -> HandshakeNegotiation -> LoggingIn
//!     -> AwaitingFeatureAcks -> Open | Routed | FailedTransient | FailedFatal
//! Routed -> ResolvingIdentity (new target)
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use mssql_connect::{Config, Connection};
//!
//! let config = Config::from_connection_string(
//!     "Server=tcp:db.example.net,1433;Failover Partner=db2.example.net;Database=app;\
//!      User Id=app;Password=secret;Connect Timeout=30;",
//! )?;
//!
//! let connector = Arc::new(MyTlsConnector::new());
//! let mut conn = Connection::connect(config, connector).await?;
//! conn.session().validate_ready_for_execute()?;
//!
//! // Later, after the transport broke:
//! conn.recover().await?;
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod config;
pub mod connection;
pub mod error;
pub mod lock;
pub mod orchestrator;
pub mod pool;
pub mod server_identity;
pub mod session_state;
pub mod timeout;
pub mod transport;

pub use config::{ApplicationIntent, Config, RedirectConfig, RetryPolicy, TimeoutConfig};
pub use connection::{Connection, ConnectionShared, Session};
pub use error::{Error, ErrorKind, Result};
pub use lock::{AccessPermit, ExclusiveAccessLock, LockError, RejectedRelease};
pub use orchestrator::{ConnectionAttempt, ConnectionOrchestrator, EstablishedSession, LoginState};
pub use pool::PoolGroupContext;
pub use server_identity::{DataSource, ServerIdentity, TransportQualifier};
pub use session_state::{SessionSnapshot, SessionState, SessionStateRecord};
pub use timeout::{Backoff, TimeoutBudget};
pub use transport::{
    Connector, FedAuthLogin, HandshakeAck, LoginRequest, PreLoginRequest, TokenRecord, Transport,
};

// Re-export the collaborating crates' public types used in this API.
pub use mssql_auth::{AuthenticationMethod, Credentials, FedAuthToken, ProviderRegistry, TokenCache};
pub use tds_protocol::{CapabilitySet, RequestedFeatures, TdsVersion};
