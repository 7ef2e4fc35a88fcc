//! # mssql-testing
//!
//! Test infrastructure for the connection engine.
//!
//! Logins run against a scripted [`MockConnector`] instead of a server, so
//! retry, failover, routing and recovery paths can be driven
//! deterministically under a paused tokio clock.
//!
//! ## Features
//!
//! - Scripted connect outcomes per host: refuse, hang or respond
//! - Token encoders for every record a login response can carry
//! - A journal of PRELOGIN, LOGIN7 and federated tokens the engine sent
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use mssql_connect::{Config, Connection};
//! use mssql_testing::{MockConnector, MockLogin, tokens};
//!
//! #[tokio::test(start_paused = true)]
//! async fn test_database_change() {
//!     let connector = Arc::new(
//!         MockConnector::new().then(MockLogin::success_with(vec![tokens::database("app", "master")])),
//!     );
//!     let conn = Connection::connect(Config::new(), connector.clone()).await.unwrap();
//!     assert_eq!(conn.session().state().database(), Some("app"));
//! }
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod mock_transport;
pub mod tokens;

pub use mock_transport::{
    ConnectRecord, Journal, MockConnector, MockLogin, MockTransport, MockTransportError,
};
